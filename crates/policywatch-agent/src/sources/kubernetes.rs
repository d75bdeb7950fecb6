//! Kyverno audit-mode policy events from the Kubernetes API
//!
//! Polls `PolicyViolation` core/v1 Events and forwards the ones Kyverno emits
//! for ClusterPolicies and Policies running in Audit mode.

use async_trait::async_trait;
use policywatch_classifiers::detect::POLICY_VIOLATION_FIELD_SELECTOR;
use policywatch_classifiers::is_audit_only_cluster_policy;
use policywatch_core::{normalize, Error, Result};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{EventSink, EventSource, ScanStats, SourceContext};

pub const SOURCE_NAME: &str = "kubernetes";

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Lists Kyverno policy events cluster-wide
#[async_trait]
pub trait PolicyEventLister: Send + Sync {
    async fn list_policy_events(&self) -> Result<Vec<Value>>;
}

#[derive(Deserialize)]
struct EventList {
    #[serde(default)]
    items: Vec<Value>,
}

/// Minimal Kubernetes API client authenticated with a bearer token
#[derive(Debug, Clone)]
pub struct ApiServerClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl ApiServerClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self::with_client(http, base_url, token))
    }

    fn with_client(http: reqwest::Client, base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    /// Service account credentials mounted into the pod
    pub fn in_cluster() -> Result<Self> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .map_err(|_| Error::config("KUBERNETES_SERVICE_HOST is not set; not running in a cluster"))?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());

        let dir = Path::new(SERVICE_ACCOUNT_DIR);
        let token = std::fs::read_to_string(dir.join("token"))
            .map_err(|e| Error::config(format!("failed to read service account token: {}", e)))?;
        let ca = std::fs::read(dir.join("ca.crt"))
            .map_err(|e| Error::config(format!("failed to read cluster CA: {}", e)))?;
        let ca = reqwest::Certificate::from_pem(&ca)
            .map_err(|e| Error::config(format!("invalid cluster CA: {}", e)))?;

        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .add_root_certificate(ca)
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {}", e)))?;

        let host = if host.contains(':') { format!("[{}]", host) } else { host };
        Ok(Self::with_client(
            http,
            format!("https://{}:{}", host, port),
            Some(token.trim().to_string()),
        ))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl PolicyEventLister for ApiServerClient {
    async fn list_policy_events(&self) -> Result<Vec<Value>> {
        let url = format!("{}/api/v1/events", self.base_url);
        let mut request = self
            .http
            .get(&url)
            .query(&[("fieldSelector", POLICY_VIOLATION_FIELD_SELECTOR)]);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::retryable(format!("failed to list events: {}", e)))?;
        let status = response.status();
        if !status.is_success() {
            let message = format!("listing events returned status {}", status.as_u16());
            return Err(if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                Error::retryable(message)
            } else {
                Error::non_retryable(message)
            });
        }

        let list: EventList = response
            .json()
            .await
            .map_err(|e| Error::parse(format!("invalid event list: {}", e)))?;
        Ok(list.items)
    }
}

/// `resourceVersion` of every policy event already submitted, keyed by event
/// uid. Entries for events that left the listing are dropped on each poll.
#[derive(Debug, Default)]
pub struct SeenVersions {
    versions: HashMap<String, String>,
}

impl SeenVersions {
    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    /// Records the version; false when this exact version was already seen
    fn observe(&mut self, uid: &str, version: &str) -> bool {
        match self.versions.get(uid) {
            Some(seen) if seen == version => false,
            _ => {
                self.versions.insert(uid.to_string(), version.to_string());
                true
            }
        }
    }

    fn retain_listed(&mut self, listed: &[String]) {
        self.versions.retain(|uid, _| listed.iter().any(|l| l == uid));
    }
}

pub struct KubernetesEventSource {
    lister: Arc<dyn PolicyEventLister>,
    interval: Duration,
    stop: CancellationToken,
}

impl KubernetesEventSource {
    pub fn new(lister: Arc<dyn PolicyEventLister>, interval: Duration) -> Self {
        Self {
            lister,
            interval,
            stop: CancellationToken::new(),
        }
    }

    pub fn in_cluster(interval: Duration) -> Result<Self> {
        Ok(Self::new(Arc::new(ApiServerClient::in_cluster()?), interval))
    }
}

#[async_trait]
impl EventSource for KubernetesEventSource {
    async fn start(&self, ctx: &SourceContext) -> Result<()> {
        info!(interval = ?self.interval, "Starting Kubernetes policy event poller");

        let lister = self.lister.clone();
        let sink = ctx.sink.clone();
        let cancel = ctx.cancel.clone();
        let stop = self.stop.clone();
        let interval = self.interval;

        ctx.tasks.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut seen = SeenVersions::default();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        match poll_once(lister.as_ref(), &sink, &mut seen).await {
                            Ok(stats) => debug!(source = SOURCE_NAME, ?stats, "Policy event poll complete"),
                            Err(e) => error!(source = SOURCE_NAME, error = %e, "Failed to list policy events"),
                        }
                    }
                }
            }
            info!(source = SOURCE_NAME, "Kubernetes policy event poller stopped");
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
        true
    }
}

fn text_at<'a>(event: &'a Value, pointer: &str) -> &'a str {
    event.pointer(pointer).and_then(Value::as_str).unwrap_or_default()
}

/// Correlation key for a policy event: `namespace-name-kind-uid`
pub fn event_key(event: &Value) -> String {
    format!(
        "{}-{}-{}-{}",
        text_at(event, "/involvedObject/namespace"),
        text_at(event, "/involvedObject/name"),
        text_at(event, "/involvedObject/kind"),
        text_at(event, "/metadata/uid")
    )
}

/// List once and submit every audit-mode policy event not already seen at
/// its current `resourceVersion`
pub async fn poll_once(lister: &dyn PolicyEventLister, sink: &EventSink, seen: &mut SeenVersions) -> Result<ScanStats> {
    let mut stats = ScanStats::default();
    let items = lister.list_policy_events().await?;
    let listed: Vec<String> = items.iter().map(|item| text_at(item, "/metadata/uid").to_string()).collect();
    seen.retain_listed(&listed);

    for item in items {
        stats.records += 1;
        if !is_audit_only_cluster_policy(&item) {
            continue;
        }

        let key = event_key(&item);
        if !seen.observe(text_at(&item, "/metadata/uid"), text_at(&item, "/metadata/resourceVersion")) {
            stats.duplicates += 1;
            continue;
        }
        match normalize::from_policy_event(item) {
            Ok(event) => {
                debug!(key = %key, name = %event.name, "Detected audit-mode policy event");
                stats.record(sink.submit(&key, event));
            }
            Err(e) => {
                stats.malformed += 1;
                warn!(key = %key, error = %e, "Skipping malformed policy event");
            }
        }
    }

    Ok(stats)
}
