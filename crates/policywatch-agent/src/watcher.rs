//! Watcher orchestrator
//!
//! Owns the event channel, the dedup cache, metrics, health state, the
//! dispatcher and every event source. Sources push into the channel through a
//! shared [`EventSink`]; a single consumer drains it in FIFO order and hands
//! each event to the dispatcher.

use metrics_exporter_prometheus::PrometheusHandle;
use parking_lot::Mutex;
use policywatch_core::dedup::{DEFAULT_MAX_BYTES, DEFAULT_TTL};
use policywatch_core::{DedupCache, Error, Result, WatchedEvent};
use policywatch_dispatch::{DispatchOutcome, Dispatcher, HandleOutcome, WATCHER_VERSION};
use policywatch_telemetry::{HealthState, HealthStatus, WatcherChecker, WatcherMetrics};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::WatcherConfig;
use crate::server::{self, AppState};
use crate::sources::{
    AuditLogTailer, CloudWatchPoller, EventSink, EventSource, KubernetesEventSource, SourceContext,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Running,
    Stopped,
}

pub struct Watcher {
    config: WatcherConfig,
    metrics: WatcherMetrics,
    health: HealthState,
    dispatcher: Arc<Dispatcher>,
    sources: Vec<Arc<dyn EventSource>>,
    sink: EventSink,
    receiver: Mutex<Option<mpsc::Receiver<WatchedEvent>>>,
    health_addr: Option<SocketAddr>,
    prometheus: Option<PrometheusHandle>,
    cancel: CancellationToken,
    tasks: TaskTracker,
    lifecycle: Mutex<Lifecycle>,
}

impl Watcher {
    /// Watcher with no sources; add them with [`Watcher::add_source`]
    pub fn new(config: WatcherConfig, dispatcher: Dispatcher) -> Self {
        let (tx, rx) = mpsc::channel(config.buffer_size.max(1));
        let metrics = WatcherMetrics::new(config.buffer_size);
        let dedup = DedupCache::new(DEFAULT_TTL, DEFAULT_MAX_BYTES);

        let health = HealthState::new(WATCHER_VERSION);
        health.register_checker(Arc::new(WatcherChecker::new(metrics.clone())));

        Self {
            health_addr: Some(SocketAddr::from(([0, 0, 0, 0], config.health_port))),
            sink: EventSink::new(tx, dedup, metrics.clone()),
            receiver: Mutex::new(Some(rx)),
            config,
            metrics,
            health,
            dispatcher: Arc::new(dispatcher),
            sources: Vec::new(),
            prometheus: None,
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
            lifecycle: Mutex::new(Lifecycle::Created),
        }
    }

    /// Watcher with every source the configuration enables.
    ///
    /// A source that cannot be constructed (missing credentials, not running
    /// in a cluster) is logged and left out.
    pub fn from_config(config: WatcherConfig, dispatcher: Dispatcher) -> Self {
        let mut watcher = Self::new(config, dispatcher);

        if let Some(path) = watcher.config.audit_log_path.clone() {
            watcher.add_source(Arc::new(AuditLogTailer::new(Some(path))));
        }

        if let Some(cw) = watcher.config.cloudwatch.clone() {
            match CloudWatchPoller::from_config(cw) {
                Ok(poller) => watcher.add_source(Arc::new(poller)),
                Err(e) => error!(error = %e, "Failed to create CloudWatch poller, source disabled"),
            }
        }

        if watcher.config.kubernetes.enabled {
            match KubernetesEventSource::in_cluster(watcher.config.kubernetes.poll_interval) {
                Ok(source) => watcher.add_source(Arc::new(source)),
                Err(e) => error!(error = %e, "Failed to create Kubernetes event source, source disabled"),
            }
        }

        watcher
    }

    pub fn add_source(&mut self, source: Arc<dyn EventSource>) {
        self.sources.push(source);
    }

    pub fn with_prometheus(mut self, handle: PrometheusHandle) -> Self {
        self.prometheus = Some(handle);
        self
    }

    /// Do not bind the health server
    pub fn without_health_server(mut self) -> Self {
        self.health_addr = None;
        self
    }

    pub fn metrics(&self) -> &WatcherMetrics {
        &self.metrics
    }

    pub fn health(&self) -> &HealthState {
        &self.health
    }

    pub fn sink(&self) -> &EventSink {
        &self.sink
    }

    pub fn source_names(&self) -> Vec<&'static str> {
        self.sources.iter().map(|s| s.name()).collect()
    }

    /// Start the health server, the consumer, every enabled source and the
    /// metrics logger. Returns once everything is spawned.
    pub async fn start(&self) -> Result<()> {
        {
            let mut lifecycle = self.lifecycle.lock();
            if *lifecycle != Lifecycle::Created {
                return Err(Error::internal("watcher can only be started once"));
            }
            *lifecycle = Lifecycle::Running;
        }
        let Some(receiver) = self.receiver.lock().take() else {
            return Err(Error::internal("event channel receiver already taken"));
        };

        info!(
            buffer_size = self.config.buffer_size,
            rate_limit = self.config.rate_limit,
            console = self.config.console,
            "Starting policy watcher"
        );

        if let Some(addr) = self.health_addr {
            let state = AppState {
                health: self.health.clone(),
                prometheus: self.prometheus.clone(),
            };
            let cancel = self.cancel.clone();
            self.tasks.spawn(async move {
                if let Err(e) = server::serve(addr, state, cancel).await {
                    error!(%addr, error = %e, "Health server failed");
                }
            });
        }

        self.tasks.spawn(consume(
            receiver,
            self.dispatcher.clone(),
            self.metrics.clone(),
            self.cancel.clone(),
        ));

        let ctx = SourceContext {
            sink: self.sink.clone(),
            cancel: self.cancel.clone(),
            tasks: self.tasks.clone(),
        };
        for source in &self.sources {
            if !source.enabled() {
                debug!(source = source.name(), "Source disabled, not starting");
                continue;
            }
            match source.start(&ctx).await {
                Ok(()) => info!(source = source.name(), "Source started"),
                Err(e) => error!(source = source.name(), error = %e, "Failed to start source"),
            }
        }

        if !self.config.metrics_log_interval.is_zero() {
            self.tasks.spawn(log_metrics(
                self.metrics.clone(),
                self.config.metrics_log_interval,
                self.cancel.clone(),
            ));
        }

        self.health.set_status(HealthStatus::Healthy);
        info!(sources = ?self.source_names(), "Policy watcher started");
        Ok(())
    }

    /// Stop every loop and wait for them to exit. Safe to call more than once.
    pub async fn stop(&self) {
        {
            let mut lifecycle = self.lifecycle.lock();
            if *lifecycle == Lifecycle::Stopped {
                return;
            }
            *lifecycle = Lifecycle::Stopped;
        }

        info!("Stopping policy watcher");
        self.health.set_status(HealthStatus::Stopping);

        for source in &self.sources {
            source.stop();
        }
        self.cancel.cancel();

        self.tasks.close();
        self.tasks.wait().await;

        // Never started: events submitted before start are still queued here
        if let Some(mut receiver) = self.receiver.lock().take() {
            discard_queued(&mut receiver, &self.metrics);
        }

        self.metrics.log_metrics();
        info!("Policy watcher stopped");
    }

    /// Run until `shutdown` resolves, then stop
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        self.start().await?;
        shutdown.await;
        self.stop().await;
        Ok(())
    }
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("sources", &self.source_names())
            .field("lifecycle", &*self.lifecycle.lock())
            .field("health", &self.health)
            .finish()
    }
}

async fn consume(
    mut receiver: mpsc::Receiver<WatchedEvent>,
    dispatcher: Arc<Dispatcher>,
    metrics: WatcherMetrics,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = receiver.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        metrics.record_out_of_channel();

        let started = Instant::now();
        let result = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(name = %event.name, "Shutdown during dispatch, abandoning event");
                metrics.record_dropped();
                break;
            }
            result = dispatcher.dispatch(&event) => result,
        };

        match result {
            Ok(DispatchOutcome::Handled(_, HandleOutcome::Delivered)) => metrics.record_delivered(),
            Ok(DispatchOutcome::Handled(_, HandleOutcome::Filtered(_))) | Ok(DispatchOutcome::Unrouted) => {
                metrics.record_filtered()
            }
            Err(e @ (Error::MissingField(_) | Error::InvalidFieldType(_))) => {
                metrics.record_handler_error();
                warn!(name = %event.name, error = %e, "Dropping event that failed handler checks");
            }
            Err(e) => {
                metrics.record_handler_error();
                error!(
                    name = %event.name,
                    namespace = %event.namespace,
                    uid = %event.uid,
                    source = %event.event_source,
                    error = %e,
                    "Failed to process event"
                );
            }
        }

        metrics.record_processing_duration(started.elapsed());
        metrics.record_processed();
    }
    discard_queued(&mut receiver, &metrics);
    debug!("Event consumer stopped");
}

/// Close the channel and count whatever is still queued as dropped
fn discard_queued(receiver: &mut mpsc::Receiver<WatchedEvent>, metrics: &WatcherMetrics) {
    receiver.close();
    let mut discarded = 0u64;
    while receiver.try_recv().is_ok() {
        metrics.record_out_of_channel();
        metrics.record_dropped();
        discarded += 1;
    }
    if discarded > 0 {
        warn!(discarded, "Discarded queued events at shutdown");
    }
}

async fn log_metrics(metrics: WatcherMetrics, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    // First tick fires immediately
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => metrics.log_metrics(),
        }
    }
}
