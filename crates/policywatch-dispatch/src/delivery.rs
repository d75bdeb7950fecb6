//! Delivery of policy violation events
//!
//! Two sinks exist:
//! - [`InsightsClient`] posts each event to the Insights reporting API
//! - [`ConsoleSink`] renders each event to stdout for local testing

use async_trait::async_trait;
use policywatch_core::{Error, PolicyViolationEvent, Result};
use std::io::Write;
use std::time::Duration;
use tracing::debug;

/// Header carrying the watcher version on every API call
pub const VERSION_HEADER: &str = "X-Fairwinds-Watcher-Version";

/// Version reported in [`VERSION_HEADER`]
pub const WATCHER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default Insights host
pub const DEFAULT_HOSTNAME: &str = "https://insights.fairwinds.com";

/// Destination for built violation events
#[async_trait]
pub trait Sink: Send + Sync {
    /// Deliver one event. Failures are terminal for that event.
    async fn deliver(&self, event: &PolicyViolationEvent) -> Result<()>;

    /// Short name for logs
    fn name(&self) -> &'static str;
}

/// Connection settings for the Insights API
#[derive(Debug, Clone)]
pub struct InsightsConfig {
    pub hostname: String,
    pub organization: String,
    pub cluster: String,
    pub token: String,
    pub timeout: Duration,
}

impl InsightsConfig {
    /// Policy violation endpoint for this organization and cluster
    pub fn endpoint(&self) -> String {
        format!(
            "{}/v0/organizations/{}/clusters/{}/data/watcher/policy-violations",
            self.hostname.trim_end_matches('/'),
            self.organization,
            self.cluster
        )
    }
}

/// HTTP client for the Insights policy violation endpoint
#[derive(Debug, Clone)]
pub struct InsightsClient {
    http: reqwest::Client,
    url: String,
    token: String,
}

impl InsightsClient {
    pub fn new(config: &InsightsConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            url: config.endpoint(),
            token: config.token.clone(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Sink for InsightsClient {
    async fn deliver(&self, event: &PolicyViolationEvent) -> Result<()> {
        let response = self
            .http
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(reqwest::header::AUTHORIZATION, format!("Bearer {}", self.token))
            .header(VERSION_HEADER, WATCHER_VERSION)
            .json(event)
            .send()
            .await
            .map_err(|e| Error::delivery(format!("failed to send request: {}", e)))?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(Error::delivery(format!(
                "insights API returned status {}",
                status.as_u16()
            )));
        }

        debug!(url = %self.url, name = %event.name, "Delivered policy violation");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "insights"
    }
}

/// Writes a readable rendering of each event to stdout
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleSink;

impl ConsoleSink {
    /// Multi-line rendering used by [`Sink::deliver`]
    pub fn render(event: &PolicyViolationEvent) -> String {
        let mut out = String::new();
        out.push_str("=== Policy Violation ===\n");
        out.push_str(&format!("Resource:  {} {}/{}\n", event.resource_type, event.namespace, event.name));
        out.push_str(&format!("Event:     {} at {}\n", event.event_type, event.event_time));
        out.push_str(&format!(
            "Outcome:   blocked={} success={} policyResult={}\n",
            event.blocked, event.success, event.policy_result
        ));
        out.push_str(&format!("Policies:  {}\n", event.policy_names()));
        for (policy, rules) in &event.policies {
            for (rule, detail) in rules {
                out.push_str(&format!("  {}/{}: {}\n", policy, rule, detail.trim()));
            }
        }
        out.push_str(&format!("Message:   {}\n", event.message.trim()));
        out
    }
}

#[async_trait]
impl Sink for ConsoleSink {
    async fn deliver(&self, event: &PolicyViolationEvent) -> Result<()> {
        let rendered = Self::render(event);
        let mut stdout = std::io::stdout().lock();
        stdout.write_all(rendered.as_bytes())?;
        stdout.flush()?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "console"
    }
}
