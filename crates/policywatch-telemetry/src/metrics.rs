//! Watcher pipeline metrics
//!
//! Counters are kept in atomics so adapters, the consumer loop and the health
//! checker can share one [`WatcherMetrics`] without locking. Every update is
//! mirrored to the `metrics` facade for Prometheus export.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

pub const EVENTS_PROCESSED: &str = "policywatch_events_processed_total";
pub const EVENTS_DROPPED: &str = "policywatch_events_dropped_total";
pub const DELIVERIES: &str = "policywatch_deliveries_total";
pub const PROCESSING_DURATION: &str = "policywatch_processing_duration_seconds";
pub const CHANNEL_DEPTH: &str = "policywatch_channel_depth";

/// Register descriptions with the installed recorder
pub fn describe() {
    metrics::describe_counter!(EVENTS_PROCESSED, "Events drained from the channel and dispatched");
    metrics::describe_counter!(EVENTS_DROPPED, "Events dropped because the channel was full");
    metrics::describe_counter!(DELIVERIES, "Handler results by category and outcome");
    metrics::describe_histogram!(PROCESSING_DURATION, "Time spent dispatching one event");
    metrics::describe_gauge!(CHANNEL_DEPTH, "Events currently buffered in the channel");
}

/// Metrics collector for the watcher pipeline
#[derive(Clone)]
pub struct WatcherMetrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    events_processed: AtomicU64,
    events_dropped: AtomicU64,
    events_in_channel: AtomicU64,
    events_delivered: AtomicU64,
    events_filtered: AtomicU64,
    handler_errors: AtomicU64,
    processing_time_us: AtomicU64,
    channel_capacity: u64,
    started: Mutex<Instant>,
}

impl WatcherMetrics {
    /// Create a collector for a channel of `channel_capacity` slots
    pub fn new(channel_capacity: usize) -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                events_processed: AtomicU64::new(0),
                events_dropped: AtomicU64::new(0),
                events_in_channel: AtomicU64::new(0),
                events_delivered: AtomicU64::new(0),
                events_filtered: AtomicU64::new(0),
                handler_errors: AtomicU64::new(0),
                processing_time_us: AtomicU64::new(0),
                channel_capacity: channel_capacity as u64,
                started: Mutex::new(Instant::now()),
            }),
        }
    }

    /// An event was drained and dispatched
    pub fn record_processed(&self) {
        self.inner.events_processed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(EVENTS_PROCESSED).increment(1);
    }

    /// An event was rejected because the channel was full
    pub fn record_dropped(&self) {
        self.inner.events_dropped.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(EVENTS_DROPPED).increment(1);
    }

    /// An event entered the channel
    pub fn record_in_channel(&self) {
        let depth = self.inner.events_in_channel.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::gauge!(CHANNEL_DEPTH).set(depth as f64);
    }

    /// An event left the channel
    pub fn record_out_of_channel(&self) {
        let previous = self
            .inner
            .events_in_channel
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |depth| {
                Some(depth.saturating_sub(1))
            })
            .unwrap_or(0);
        metrics::gauge!(CHANNEL_DEPTH).set(previous.saturating_sub(1) as f64);
    }

    pub fn record_delivered(&self) {
        self.inner.events_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_filtered(&self) {
        self.inner.events_filtered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handler_error(&self) {
        self.inner.handler_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Time spent dispatching one event
    pub fn record_processing_duration(&self, duration: Duration) {
        self.inner
            .processing_time_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
        metrics::histogram!(PROCESSING_DURATION).record(duration.as_secs_f64());
    }

    pub fn channel_capacity(&self) -> u64 {
        self.inner.channel_capacity
    }

    pub fn uptime(&self) -> Duration {
        self.inner.started.lock().elapsed()
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events_processed: self.inner.events_processed.load(Ordering::Relaxed),
            events_dropped: self.inner.events_dropped.load(Ordering::Relaxed),
            events_in_channel: self.inner.events_in_channel.load(Ordering::Relaxed),
            events_delivered: self.inner.events_delivered.load(Ordering::Relaxed),
            events_filtered: self.inner.events_filtered.load(Ordering::Relaxed),
            handler_errors: self.inner.handler_errors.load(Ordering::Relaxed),
            processing_time_us: self.inner.processing_time_us.load(Ordering::Relaxed),
            channel_capacity: self.inner.channel_capacity,
            uptime: self.uptime(),
        }
    }

    /// Zero every counter and restart the uptime clock
    pub fn reset(&self) {
        for counter in [
            &self.inner.events_processed,
            &self.inner.events_dropped,
            &self.inner.events_in_channel,
            &self.inner.events_delivered,
            &self.inner.events_filtered,
            &self.inner.handler_errors,
            &self.inner.processing_time_us,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        *self.inner.started.lock() = Instant::now();
    }

    /// Write one summary line at info level
    pub fn log_metrics(&self) {
        let s = self.snapshot();
        info!(
            events_processed = s.events_processed,
            events_dropped = s.events_dropped,
            events_in_channel = s.events_in_channel,
            channel_capacity = s.channel_capacity,
            channel_utilization = format!("{:.2}", s.channel_utilization()),
            events_delivered = s.events_delivered,
            events_filtered = s.events_filtered,
            handler_errors = s.handler_errors,
            events_per_second = format!("{:.3}", s.events_per_second()),
            processing_rate = format!("{:.3}", s.processing_rate()),
            dropped_events_rate = format!("{:.3}", s.dropped_rate()),
            uptime = ?s.uptime,
            "Watcher metrics"
        );
    }
}

impl Default for WatcherMetrics {
    fn default() -> Self {
        Self::new(0)
    }
}

impl std::fmt::Debug for WatcherMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("WatcherMetrics").field(&self.snapshot()).finish()
    }
}

/// Snapshot of current metrics
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub events_processed: u64,
    pub events_dropped: u64,
    pub events_in_channel: u64,
    pub events_delivered: u64,
    pub events_filtered: u64,
    pub handler_errors: u64,
    pub processing_time_us: u64,
    pub channel_capacity: u64,
    pub uptime: Duration,
}

impl MetricsSnapshot {
    /// Channel fill level as a percentage of capacity
    pub fn channel_utilization(&self) -> f64 {
        if self.channel_capacity == 0 {
            0.0
        } else {
            self.events_in_channel as f64 / self.channel_capacity as f64 * 100.0
        }
    }

    /// Processed plus dropped events per second of uptime
    pub fn events_per_second(&self) -> f64 {
        per_second(self.events_processed + self.events_dropped, self.uptime)
    }

    /// Events per second of time actually spent dispatching
    pub fn processing_rate(&self) -> f64 {
        per_second(self.events_processed, Duration::from_micros(self.processing_time_us))
    }

    /// Dropped events per second of uptime
    pub fn dropped_rate(&self) -> f64 {
        per_second(self.events_dropped, self.uptime)
    }

    /// Share of all events that were dropped, as a percentage
    pub fn drop_percentage(&self) -> f64 {
        let total = self.events_processed + self.events_dropped;
        if total == 0 {
            0.0
        } else {
            self.events_dropped as f64 / total as f64 * 100.0
        }
    }

    pub fn avg_processing_time(&self) -> Duration {
        if self.events_processed == 0 {
            Duration::ZERO
        } else {
            Duration::from_micros(self.processing_time_us / self.events_processed)
        }
    }
}

fn per_second(count: u64, over: Duration) -> f64 {
    let secs = over.as_secs_f64();
    if secs <= 0.0 {
        0.0
    } else {
        count as f64 / secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_collection() {
        let metrics = WatcherMetrics::new(10);

        metrics.record_in_channel();
        metrics.record_in_channel();
        metrics.record_out_of_channel();
        metrics.record_processed();
        metrics.record_delivered();
        metrics.record_dropped();
        metrics.record_processing_duration(Duration::from_millis(5));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.events_processed, 1);
        assert_eq!(snapshot.events_dropped, 1);
        assert_eq!(snapshot.events_in_channel, 1);
        assert_eq!(snapshot.events_delivered, 1);
        assert_eq!(snapshot.channel_utilization(), 10.0);
        assert_eq!(snapshot.drop_percentage(), 50.0);
        assert_eq!(snapshot.avg_processing_time(), Duration::from_millis(5));
        assert!((snapshot.processing_rate() - 200.0).abs() < 1e-6);
    }

    #[test]
    fn test_out_of_channel_saturates() {
        let metrics = WatcherMetrics::new(10);
        metrics.record_out_of_channel();
        assert_eq!(metrics.snapshot().events_in_channel, 0);
    }

    #[test]
    fn test_zero_capacity_and_empty_rates() {
        let snapshot = WatcherMetrics::default().snapshot();
        assert_eq!(snapshot.channel_utilization(), 0.0);
        assert_eq!(snapshot.drop_percentage(), 0.0);
        assert_eq!(snapshot.processing_rate(), 0.0);
        assert_eq!(snapshot.avg_processing_time(), Duration::ZERO);
    }

    #[test]
    fn test_reset() {
        let metrics = WatcherMetrics::new(4);
        let shared = metrics.clone();
        shared.record_processed();
        shared.record_dropped();
        shared.record_in_channel();
        std::thread::sleep(Duration::from_millis(20));

        metrics.reset();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.events_processed, 0);
        assert_eq!(snapshot.events_dropped, 0);
        assert_eq!(snapshot.events_in_channel, 0);
        assert!(snapshot.uptime < Duration::from_millis(20));
    }
}
