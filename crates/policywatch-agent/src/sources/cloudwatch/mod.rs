//! CloudWatch Logs poller for EKS audit logs
//!
//! Each tick lists the most recently active streams of the log group and
//! reads the last five minutes of events from each, or runs one group-wide
//! filtered query when a filter pattern is configured. Messages are parsed as
//! Kubernetes audit records and go through the same detection as the audit
//! log tailer.

pub mod client;
pub mod sigv4;

use async_trait::async_trait;
use chrono::Utc;
use policywatch_core::{AuditEvent, Error, Result};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::audit_log::submit_audit_event;
use super::{EventSink, EventSource, ScanStats, SourceContext};
use crate::config::CloudWatchConfig;

pub use client::{HttpLogsClient, LogEvent, LogGroup, LogStream, LogsApi};
pub use sigv4::Credentials;

pub const SOURCE_NAME: &str = "cloudwatch";

const STREAM_LIMIT: u32 = 50;
const RECENT_WINDOW: Duration = Duration::from_secs(5 * 60);
const MAX_CONSECUTIVE_FAILURES: u32 = 5;
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    attempts: u32,
    delay: Duration,
}

const STREAM_RETRY: RetryPolicy = RetryPolicy {
    attempts: 3,
    delay: Duration::from_secs(2),
};

const EVENT_RETRY: RetryPolicy = RetryPolicy {
    attempts: 2,
    delay: Duration::from_secs(1),
};

/// Poll interval that doubles after a run of failed ticks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    current: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(base: Duration) -> Self {
        Self {
            base,
            current: base,
            failures: 0,
        }
    }

    pub fn interval(&self) -> Duration {
        self.current
    }

    pub fn on_success(&mut self) {
        if self.current != self.base {
            info!(interval = ?self.base, "CloudWatch polling recovered, restoring poll interval");
        }
        self.current = self.base;
        self.failures = 0;
    }

    pub fn on_failure(&mut self) {
        self.failures += 1;
        if self.failures >= MAX_CONSECUTIVE_FAILURES {
            self.current = self.base.saturating_mul(2);
            self.failures = 0;
            warn!(
                interval = ?self.current,
                "Too many consecutive CloudWatch failures, backing off"
            );
        }
    }
}

/// Timestamp of the last processed event per stream (or per log group for
/// filtered queries); the next poll starts reading there
#[derive(Debug, Default)]
pub struct StreamCursors {
    positions: HashMap<String, i64>,
}

impl StreamCursors {
    pub fn start_for(&self, stream: &str, window_start: i64) -> i64 {
        self.positions
            .get(stream)
            .map_or(window_start, |&last| last.max(window_start))
    }

    pub fn position(&self, stream: &str) -> Option<i64> {
        self.positions.get(stream).copied()
    }

    fn advance(&mut self, stream: &str, timestamp: i64) {
        let entry = self.positions.entry(stream.to_string()).or_insert(timestamp);
        *entry = (*entry).max(timestamp);
    }

    /// Forget streams whose position fell out of the polling window
    fn prune(&mut self, window_start: i64) {
        self.positions.retain(|_, &mut last| last >= window_start);
    }
}

pub struct CloudWatchPoller {
    config: CloudWatchConfig,
    client: Arc<dyn LogsApi>,
    stop: CancellationToken,
}

impl CloudWatchPoller {
    pub fn new(config: CloudWatchConfig, client: Arc<dyn LogsApi>) -> Self {
        Self {
            config,
            client,
            stop: CancellationToken::new(),
        }
    }

    /// Poller backed by [`HttpLogsClient`] with credentials from the environment
    pub fn from_config(config: CloudWatchConfig) -> Result<Self> {
        let credentials = Credentials::from_env()?;
        let client = HttpLogsClient::new(&config.region, config.endpoint.as_deref(), credentials, HTTP_TIMEOUT)?;
        Ok(Self::new(config, Arc::new(client)))
    }

    pub fn config(&self) -> &CloudWatchConfig {
        &self.config
    }

    async fn probe(&self) {
        match self.client.describe_log_groups(&self.config.log_group, 1).await {
            Ok(groups) if groups.iter().any(|g| g.log_group_name == self.config.log_group) => {
                info!(log_group = %self.config.log_group, "CloudWatch log group reachable");
            }
            Ok(_) => warn!(log_group = %self.config.log_group, "CloudWatch log group not found"),
            Err(e) => warn!(
                log_group = %self.config.log_group,
                error = %e,
                "CloudWatch connectivity check failed, polling anyway"
            ),
        }
    }
}

#[async_trait]
impl EventSource for CloudWatchPoller {
    async fn start(&self, ctx: &SourceContext) -> Result<()> {
        self.probe().await;

        info!(
            log_group = %self.config.log_group,
            region = %self.config.region,
            interval = ?self.config.poll_interval,
            batch_size = self.config.batch_size,
            "Starting CloudWatch poller"
        );

        let client = self.client.clone();
        let config = self.config.clone();
        let sink = ctx.sink.clone();
        let cancel = ctx.cancel.clone();
        let stop = self.stop.clone();

        ctx.tasks.spawn(async move {
            let mut backoff = Backoff::new(config.poll_interval);
            let mut cursors = StreamCursors::default();
            loop {
                match poll_once(client.as_ref(), &config, &sink, &cancel, &stop, &mut cursors).await {
                    Ok(stats) => {
                        debug!(source = SOURCE_NAME, ?stats, "CloudWatch poll complete");
                        backoff.on_success();
                    }
                    Err(e) => {
                        error!(source = SOURCE_NAME, error = %e, "CloudWatch poll failed");
                        backoff.on_failure();
                    }
                }

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(backoff.interval()) => {}
                }
            }
            info!(source = SOURCE_NAME, "CloudWatch poller stopped");
        });
        Ok(())
    }

    fn stop(&self) {
        self.stop.cancel();
    }

    fn name(&self) -> &'static str {
        SOURCE_NAME
    }

    fn enabled(&self) -> bool {
        !self.config.log_group.is_empty()
    }
}

/// One polling pass over the log group.
///
/// Fails only when the stream listing (or the filtered query) fails; a single
/// stream that keeps failing is logged and skipped. Reads resume from
/// `cursors` when they are inside the recent window.
pub async fn poll_once(
    client: &dyn LogsApi,
    config: &CloudWatchConfig,
    sink: &EventSink,
    cancel: &CancellationToken,
    stop: &CancellationToken,
    cursors: &mut StreamCursors,
) -> Result<ScanStats> {
    let window_start = Utc::now().timestamp_millis() - RECENT_WINDOW.as_millis() as i64;
    cursors.prune(window_start);
    let mut budget = MemoryBudget::new(config.max_memory_bytes());
    let mut stats = ScanStats::default();

    if let Some(pattern) = config.filter_pattern.as_deref().filter(|p| !p.is_empty()) {
        let start_ms = cursors.start_for(&config.log_group, window_start);
        let events = with_retry(EVENT_RETRY, cancel, stop, "FilterLogEvents", || {
            client.filter_log_events(&config.log_group, pattern, start_ms, config.batch_size)
        })
        .await?;
        if let Some(last) = process_events(events, sink, &mut budget, &mut stats) {
            cursors.advance(&config.log_group, last);
        }
        return Ok(stats);
    }

    let streams = with_retry(STREAM_RETRY, cancel, stop, "DescribeLogStreams", || {
        client.describe_log_streams(&config.log_group, STREAM_LIMIT)
    })
    .await?;

    for stream in streams {
        match stream.last_ingestion_time {
            Some(ingested) if ingested >= window_start => {}
            _ => {
                debug!(stream = %stream.log_stream_name, "Skipping inactive log stream");
                continue;
            }
        }

        if budget.spent() {
            debug!(stream = %stream.log_stream_name, "Memory budget spent, stream deferred to the next poll");
            continue;
        }

        let start_ms = cursors.start_for(&stream.log_stream_name, window_start);
        let result = with_retry(EVENT_RETRY, cancel, stop, "GetLogEvents", || {
            client.get_log_events(&config.log_group, &stream.log_stream_name, start_ms, config.batch_size)
        })
        .await;

        match result {
            Ok(events) => {
                if let Some(last) = process_events(events, sink, &mut budget, &mut stats) {
                    cursors.advance(&stream.log_stream_name, last);
                }
            }
            Err(e) => error!(
                stream = %stream.log_stream_name,
                error = %e,
                "Failed to read log stream"
            ),
        }
    }

    Ok(stats)
}

/// Returns the newest timestamp among the events that fit in the budget
fn process_events(
    events: Vec<LogEvent>,
    sink: &EventSink,
    budget: &mut MemoryBudget,
    stats: &mut ScanStats,
) -> Option<i64> {
    let mut last_timestamp: Option<i64> = None;
    for event in events {
        if !budget.take(event.message.len()) {
            warn!(
                limit_bytes = budget.limit,
                "CloudWatch memory limit reached, deferring remaining events to the next poll"
            );
            return last_timestamp;
        }
        stats.records += 1;
        if let Some(ts) = event.timestamp {
            last_timestamp = Some(last_timestamp.map_or(ts, |last| last.max(ts)));
        }

        let audit = match AuditEvent::from_json(&event.message) {
            Ok(audit) => audit,
            Err(_) => {
                stats.malformed += 1;
                continue;
            }
        };

        if let Some(submit) = submit_audit_event(&audit, SOURCE_NAME, sink) {
            stats.record(submit);
        }
    }
    last_timestamp
}

struct MemoryBudget {
    limit: usize,
    used: usize,
    exhausted: bool,
}

impl MemoryBudget {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            used: 0,
            exhausted: false,
        }
    }

    /// True once an event had to be deferred
    fn spent(&self) -> bool {
        self.exhausted
    }

    fn take(&mut self, bytes: usize) -> bool {
        let used = self.used.saturating_add(bytes);
        if used > self.limit {
            self.exhausted = true;
            return false;
        }
        self.used = used;
        true
    }
}

async fn with_retry<T, F, Fut>(
    policy: RetryPolicy,
    cancel: &CancellationToken,
    stop: &CancellationToken,
    operation: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        let e = match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => e,
        };

        if attempt >= policy.attempts {
            return Err(Error::retryable(format!(
                "{} failed after {} attempts: {}",
                operation, policy.attempts, e
            )));
        }

        warn!(operation, attempt, max_attempts = policy.attempts, error = %e, "Retrying CloudWatch call");
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::internal(format!("{} cancelled", operation))),
            _ = stop.cancelled() => return Err(Error::internal(format!("{} cancelled", operation))),
            _ = tokio::time::sleep(policy.delay) => {}
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::tests::sink;
    use parking_lot::Mutex;
    use policywatch_core::ViolationCategory;
    use std::collections::VecDeque;

    const VAP_MESSAGE: &str = r#"{"auditID":"cw-vap-1","verb":"create","objectRef":{"resource":"deployments","namespace":"apps","name":"web","apiGroup":"apps","apiVersion":"v1"},"responseStatus":{"code":422,"message":"deployments.apps \"web\" is forbidden: ValidatingAdmissionPolicy 'require-labels' with binding 'require-labels-binding' denied request: missing team label"},"annotations":{}}"#;

    #[derive(Default)]
    struct FakeLogs {
        streams: Mutex<VecDeque<Result<Vec<LogStream>>>>,
        events: Mutex<VecDeque<Result<Vec<LogEvent>>>>,
        stream_calls: Mutex<u32>,
        event_calls: Mutex<Vec<(String, i64)>>,
        filter_calls: Mutex<u32>,
    }

    #[async_trait]
    impl LogsApi for FakeLogs {
        async fn describe_log_groups(&self, prefix: &str, _limit: u32) -> Result<Vec<LogGroup>> {
            Ok(vec![LogGroup {
                log_group_name: prefix.to_string(),
            }])
        }

        async fn describe_log_streams(&self, _log_group: &str, limit: u32) -> Result<Vec<LogStream>> {
            assert_eq!(limit, STREAM_LIMIT);
            *self.stream_calls.lock() += 1;
            self.streams.lock().pop_front().unwrap_or(Ok(Vec::new()))
        }

        async fn get_log_events(&self, _g: &str, stream: &str, start: i64, _limit: u32) -> Result<Vec<LogEvent>> {
            self.event_calls.lock().push((stream.to_string(), start));
            self.events.lock().pop_front().unwrap_or(Ok(Vec::new()))
        }

        async fn filter_log_events(&self, _g: &str, _p: &str, _start: i64, _limit: u32) -> Result<Vec<LogEvent>> {
            *self.filter_calls.lock() += 1;
            self.events.lock().pop_front().unwrap_or(Ok(Vec::new()))
        }
    }

    fn stream(name: &str, ingested_ago: Option<Duration>) -> LogStream {
        LogStream {
            log_stream_name: name.into(),
            last_event_timestamp: None,
            last_ingestion_time: ingested_ago.map(|ago| Utc::now().timestamp_millis() - ago.as_millis() as i64),
        }
    }

    fn message(text: &str) -> LogEvent {
        LogEvent {
            message: text.into(),
            ..Default::default()
        }
    }

    fn config() -> CloudWatchConfig {
        CloudWatchConfig::new("/aws/eks/prod/cluster", "us-east-1")
    }

    async fn poll(fake: &FakeLogs, config: &CloudWatchConfig, sink: &EventSink) -> Result<ScanStats> {
        let mut cursors = StreamCursors::default();
        poll_once(fake, config, sink, &CancellationToken::new(), &CancellationToken::new(), &mut cursors).await
    }

    #[tokio::test]
    async fn test_poll_detects_violation_and_skips_non_json() {
        let fake = FakeLogs::default();
        fake.streams
            .lock()
            .push_back(Ok(vec![stream("kube-apiserver-audit-1", Some(Duration::from_secs(10)))]));
        fake.events
            .lock()
            .push_back(Ok(vec![message("I1103 plain text log line"), message(VAP_MESSAGE)]));
        let (sink, mut rx, _) = sink(8);

        let stats = poll(&fake, &config(), &sink).await.unwrap();
        assert_eq!(stats.records, 2);
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.queued, 1);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.category, Some(ViolationCategory::ValidatingAdmissionPolicy));
        assert_eq!(event.event_source, "cloudwatch");
    }

    #[tokio::test]
    async fn test_inactive_streams_are_skipped() {
        let fake = FakeLogs::default();
        fake.streams.lock().push_back(Ok(vec![
            stream("stale", Some(Duration::from_secs(600))),
            stream("never", None),
            stream("fresh", Some(Duration::from_secs(1))),
        ]));
        let (sink, _rx, _) = sink(8);

        poll(&fake, &config(), &sink).await.unwrap();
        let calls = fake.event_calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "fresh");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_listing_retries_then_fails() {
        let fake = FakeLogs::default();
        for _ in 0..3 {
            fake.streams
                .lock()
                .push_back(Err(Error::retryable("ThrottlingException: Rate exceeded")));
        }
        let (sink, _rx, _) = sink(8);

        let err = poll(&fake, &config(), &sink)
            .await
            .unwrap_err();
        assert_eq!(*fake.stream_calls.lock(), 3);
        assert!(err.to_string().contains("after 3 attempts"));
    }

    #[tokio::test]
    async fn test_non_retryable_listing_fails_fast() {
        let fake = FakeLogs::default();
        fake.streams
            .lock()
            .push_back(Err(Error::non_retryable("ResourceNotFoundException")));
        let (sink, _rx, _) = sink(8);

        assert!(poll(&fake, &config(), &sink).await.is_err());
        assert_eq!(*fake.stream_calls.lock(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_stream_does_not_fail_tick() {
        let fake = FakeLogs::default();
        fake.streams.lock().push_back(Ok(vec![
            stream("broken", Some(Duration::from_secs(1))),
            stream("healthy", Some(Duration::from_secs(1))),
        ]));
        {
            let mut events = fake.events.lock();
            events.push_back(Err(Error::retryable("connection reset")));
            events.push_back(Err(Error::retryable("connection reset")));
            events.push_back(Ok(vec![message(VAP_MESSAGE)]));
        }
        let (sink, mut rx, _) = sink(8);

        let stats = poll(&fake, &config(), &sink).await.unwrap();
        assert_eq!(stats.queued, 1);
        assert_eq!(fake.event_calls.lock().len(), 3);
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_filter_pattern_queries_group_once() {
        let fake = FakeLogs::default();
        fake.events.lock().push_back(Ok(vec![message(VAP_MESSAGE)]));
        let mut config = config();
        config.filter_pattern = Some("{ $.responseStatus.code = 422 }".into());
        let (sink, _rx, _) = sink(8);

        let stats = poll(&fake, &config, &sink).await.unwrap();
        assert_eq!(stats.queued, 1);
        assert_eq!(*fake.filter_calls.lock(), 1);
        assert_eq!(*fake.stream_calls.lock(), 0);
    }

    #[tokio::test]
    async fn test_memory_budget_stops_processing() {
        let fake = FakeLogs::default();
        fake.streams
            .lock()
            .push_back(Ok(vec![stream("s", Some(Duration::from_secs(1)))]));
        fake.events
            .lock()
            .push_back(Ok(vec![message(VAP_MESSAGE), message(VAP_MESSAGE)]));
        let (sink, _rx, _) = sink(8);

        let mut budget = MemoryBudget::new(VAP_MESSAGE.len());
        let mut stats = ScanStats::default();
        let events = fake.get_log_events("g", "s", 0, 10).await.unwrap();
        process_events(events, &sink, &mut budget, &mut stats);
        assert_eq!(stats.records, 1);
        assert!(budget.spent());
    }

    #[tokio::test]
    async fn test_deferred_stream_resumes_from_cursor() {
        let now = Utc::now().timestamp_millis();
        let (first_ts, second_ts) = (now - 2_000, now - 1_000);
        let large = "x".repeat(700 * 1024);
        let event = |ts: i64| LogEvent {
            timestamp: Some(ts),
            message: large.clone(),
            ..Default::default()
        };

        let fake = FakeLogs::default();
        for _ in 0..2 {
            fake.streams.lock().push_back(Ok(vec![
                stream("busy", Some(Duration::from_secs(1))),
                stream("quiet", Some(Duration::from_secs(1))),
            ]));
        }
        {
            let mut events = fake.events.lock();
            // First poll: budget runs out after one event and "quiet" is deferred
            events.push_back(Ok(vec![event(first_ts), event(second_ts)]));
            // Second poll
            events.push_back(Ok(vec![event(second_ts)]));
            events.push_back(Ok(Vec::new()));
        }
        let mut config = config();
        config.max_memory = 1;
        let (sink, _rx, _) = sink(8);
        let (cancel, stop) = (CancellationToken::new(), CancellationToken::new());
        let mut cursors = StreamCursors::default();

        let stats = poll_once(&fake, &config, &sink, &cancel, &stop, &mut cursors).await.unwrap();
        assert_eq!(stats.records, 1);
        assert_eq!(cursors.position("busy"), Some(first_ts));
        assert_eq!(fake.event_calls.lock().len(), 1);

        let stats = poll_once(&fake, &config, &sink, &cancel, &stop, &mut cursors).await.unwrap();
        assert_eq!(stats.records, 1);
        assert_eq!(cursors.position("busy"), Some(second_ts));

        let calls = fake.event_calls.lock();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[1], ("busy".to_string(), first_ts));
        assert_eq!(calls[2].0, "quiet");
        assert!(calls[2].1 < first_ts);
    }

    #[test]
    fn test_cursors_clamp_to_window_and_prune() {
        let mut cursors = StreamCursors::default();
        assert_eq!(cursors.start_for("s", 100), 100);

        cursors.advance("s", 150);
        cursors.advance("s", 120);
        assert_eq!(cursors.start_for("s", 100), 150);
        assert_eq!(cursors.start_for("s", 200), 200);

        cursors.prune(200);
        assert_eq!(cursors.position("s"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_interrupts_retry_delay() {
        let fake = FakeLogs::default();
        for _ in 0..3 {
            fake.streams
                .lock()
                .push_back(Err(Error::retryable("ThrottlingException: Rate exceeded")));
        }
        let (sink, _rx, _) = sink(8);
        let stop = CancellationToken::new();
        stop.cancel();
        let mut cursors = StreamCursors::default();

        let started = tokio::time::Instant::now();
        let err = poll_once(&fake, &config(), &sink, &CancellationToken::new(), &stop, &mut cursors)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cancelled"));
        assert_eq!(*fake.stream_calls.lock(), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[test]
    fn test_backoff_doubles_after_five_failures() {
        let base = Duration::from_secs(30);
        let mut backoff = Backoff::new(base);
        for _ in 0..4 {
            backoff.on_failure();
            assert_eq!(backoff.interval(), base);
        }
        backoff.on_failure();
        assert_eq!(backoff.interval(), base * 2);

        backoff.on_success();
        assert_eq!(backoff.interval(), base);
    }

    #[tokio::test]
    async fn test_stop_ends_poller() {
        let fake = Arc::new(FakeLogs::default());
        let poller = CloudWatchPoller::new(config(), fake.clone());
        assert!(poller.enabled());
        assert_eq!(poller.name(), "cloudwatch");

        let (sink, _rx, _) = sink(8);
        let ctx = SourceContext {
            sink,
            cancel: CancellationToken::new(),
            tasks: tokio_util::task::TaskTracker::new(),
        };
        poller.start(&ctx).await.unwrap();
        poller.stop();
        ctx.tasks.close();
        ctx.tasks.wait().await;
        assert!(*fake.stream_calls.lock() >= 1);
    }
}
