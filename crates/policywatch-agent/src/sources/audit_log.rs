//! Kubernetes audit log tailer
//!
//! Rescans the whole file on every tick. Repeated records are absorbed by the
//! dedup gate in [`EventSink`].

use async_trait::async_trait;
use policywatch_classifiers::detect_audit;
use policywatch_core::{normalize, AuditEvent, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{EventSink, EventSource, ScanStats, SourceContext};

pub const SOURCE_NAME: &str = "audit-log";
pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(5);

pub struct AuditLogTailer {
    path: Option<PathBuf>,
    interval: Duration,
    stop: CancellationToken,
}

impl AuditLogTailer {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self::with_interval(path, DEFAULT_SCAN_INTERVAL)
    }

    pub fn with_interval(path: Option<PathBuf>, interval: Duration) -> Self {
        Self {
            path: path.filter(|p| !p.as_os_str().is_empty()),
            interval,
            stop: CancellationToken::new(),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

#[async_trait]
impl EventSource for AuditLogTailer {
    async fn start(&self, ctx: &SourceContext) -> Result<()> {
        let Some(path) = self.path.clone() else {
            return Ok(());
        };

        if tokio::fs::metadata(&path).await.is_err() {
            warn!(path = %path.display(), "Audit log file does not exist, audit log source stays idle");
            return Ok(());
        }

        info!(path = %path.display(), interval = ?self.interval, "Starting audit log tailer");
        let sink = ctx.sink.clone();
        let cancel = ctx.cancel.clone();
        let stop = self.stop.clone();
        let interval = self.interval;

        ctx.tasks.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        match scan_file(&path, &sink).await {
                            Ok(stats) if stats.violations > 0 => {
                                debug!(source = SOURCE_NAME, ?stats, "Audit log scan complete");
                            }
                            Ok(_) => {}
                            Err(e) => error!(source = SOURCE_NAME, error = %e, "Failed to scan audit log"),
                        }
                    }
                }
            }
            info!(source = SOURCE_NAME, "Audit log tailer stopped");
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
        self.path.is_some()
    }
}

/// Read every line of `path` and submit detected violations
pub async fn scan_file(path: &Path, sink: &EventSink) -> Result<ScanStats> {
    let file = File::open(path).await?;
    let mut lines = BufReader::new(file).split(b'\n');
    let mut stats = ScanStats::default();

    while let Some(raw) = lines.next_segment().await? {
        let Ok(line) = std::str::from_utf8(&raw) else {
            stats.records += 1;
            stats.malformed += 1;
            debug!(source = SOURCE_NAME, "Skipping audit log line that is not valid UTF-8");
            continue;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        stats.records += 1;

        let audit = match AuditEvent::from_json(line) {
            Ok(audit) => audit,
            Err(e) => {
                stats.malformed += 1;
                debug!(source = SOURCE_NAME, error = %e, "Skipping malformed audit log line");
                continue;
            }
        };

        if let Some(submit) = submit_audit_event(&audit, SOURCE_NAME, sink) {
            stats.record(submit);
        }
    }

    Ok(stats)
}

/// Detect, normalize and submit one audit record; `None` when it is not a violation
pub(crate) fn submit_audit_event(audit: &AuditEvent, source: &str, sink: &EventSink) -> Option<super::Submit> {
    let category = detect_audit(audit)?;
    if audit.audit_id.is_empty() {
        debug!(source, category = %category, "Violation without audit ID, skipping");
        return None;
    }

    let event = normalize::from_audit_event(audit, category, source);
    debug!(
        source,
        audit_id = %audit.audit_id,
        category = %category,
        name = %event.name,
        "Detected policy violation"
    );
    Some(sink.submit(&audit.audit_id, event))
}
