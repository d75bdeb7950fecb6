//! Event sources
//!
//! Each source runs its own polling loop, detects violations, normalizes them
//! and hands them to the shared [`EventSink`]. The sink is the dedup gate and
//! the only producer side of the event channel.

pub mod audit_log;
pub mod cloudwatch;
pub mod kubernetes;

use async_trait::async_trait;
use policywatch_core::{DedupCache, Result, WatchedEvent};
use policywatch_telemetry::WatcherMetrics;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

pub use audit_log::AuditLogTailer;
pub use cloudwatch::CloudWatchPoller;
pub use kubernetes::KubernetesEventSource;

/// What the sink did with a submitted event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submit {
    Queued,
    /// Correlation ID already seen within the dedup TTL
    Duplicate,
    /// Channel full; the event was dropped
    Dropped,
    /// Channel closed; the watcher is stopping
    Closed,
}

/// Producer handle onto the event channel, gated by the dedup cache
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<WatchedEvent>,
    dedup: DedupCache,
    metrics: WatcherMetrics,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<WatchedEvent>, dedup: DedupCache, metrics: WatcherMetrics) -> Self {
        Self { tx, dedup, metrics }
    }

    /// Queue `event` unless `correlation_id` was already seen.
    ///
    /// Never blocks: a full channel drops the event and counts it.
    pub fn submit(&self, correlation_id: &str, event: WatchedEvent) -> Submit {
        if !self.dedup.check_and_insert(correlation_id) {
            debug!(correlation_id, "Already processed, skipping");
            return Submit::Duplicate;
        }

        self.metrics.record_in_channel();
        match self.tx.try_send(event) {
            Ok(()) => Submit::Queued,
            Err(TrySendError::Full(event)) => {
                self.metrics.record_out_of_channel();
                self.metrics.record_dropped();
                warn!(correlation_id, name = %event.name, "Event channel full, dropping event");
                Submit::Dropped
            }
            Err(TrySendError::Closed(_)) => {
                self.metrics.record_out_of_channel();
                debug!(correlation_id, "Event channel closed, discarding event");
                Submit::Closed
            }
        }
    }

    pub fn dedup(&self) -> &DedupCache {
        &self.dedup
    }
}

/// Shared handles a source needs to run
#[derive(Clone)]
pub struct SourceContext {
    pub sink: EventSink,
    /// Watcher-wide cancellation
    pub cancel: CancellationToken,
    /// Tracks spawned source loops so the watcher can wait for them
    pub tasks: TaskTracker,
}

/// Counts from one pass over a source
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub records: usize,
    pub malformed: usize,
    pub violations: usize,
    pub queued: usize,
    pub duplicates: usize,
    pub dropped: usize,
}

impl ScanStats {
    pub fn record(&mut self, submit: Submit) {
        self.violations += 1;
        match submit {
            Submit::Queued => self.queued += 1,
            Submit::Duplicate => self.duplicates += 1,
            Submit::Dropped | Submit::Closed => self.dropped += 1,
        }
    }
}

/// A producer of watched events
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Begin background polling; returns once the loop is spawned.
    ///
    /// A startup problem is returned as an error but never stops the process.
    /// Disabled sources return `Ok` without spawning anything.
    async fn start(&self, ctx: &SourceContext) -> Result<()>;

    /// Stop the polling loop. Safe to call more than once.
    fn stop(&self);

    fn name(&self) -> &'static str;

    fn enabled(&self) -> bool;
}
