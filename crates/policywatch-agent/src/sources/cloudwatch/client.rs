//! CloudWatch Logs JSON API client

use async_trait::async_trait;
use chrono::Utc;
use policywatch_core::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use super::sigv4::{Credentials, Signer};

const CONTENT_TYPE: &str = "application/x-amz-json-1.1";
const TARGET_PREFIX: &str = "Logs_20140328";
const SERVICE: &str = "logs";

/// Error text fragments that mark a failure as transient
const RETRYABLE_MARKERS: &[&str] = &[
    "timeout",
    "connection",
    "network",
    "dial",
    "ThrottlingException",
    "ServiceUnavailable",
    "InternalServerError",
    "TooManyRequestsException",
    "rate limit",
    "RateExceeded",
];

/// Whether an error message describes a transient CloudWatch failure
pub fn is_retryable_message(message: &str) -> bool {
    RETRYABLE_MARKERS.iter().any(|marker| message.contains(marker))
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogGroup {
    pub log_group_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogStream {
    pub log_stream_name: String,
    pub last_event_timestamp: Option<i64>,
    /// Milliseconds since the epoch
    pub last_ingestion_time: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogEvent {
    pub timestamp: Option<i64>,
    pub ingestion_time: Option<i64>,
    pub log_stream_name: Option<String>,
    pub message: String,
}

/// The CloudWatch Logs operations the poller uses
#[async_trait]
pub trait LogsApi: Send + Sync {
    async fn describe_log_groups(&self, prefix: &str, limit: u32) -> Result<Vec<LogGroup>>;

    /// Streams ordered by last event time, newest first
    async fn describe_log_streams(&self, log_group: &str, limit: u32) -> Result<Vec<LogStream>>;

    async fn get_log_events(
        &self,
        log_group: &str,
        log_stream: &str,
        start_time_ms: i64,
        limit: u32,
    ) -> Result<Vec<LogEvent>>;

    async fn filter_log_events(
        &self,
        log_group: &str,
        filter_pattern: &str,
        start_time_ms: i64,
        limit: u32,
    ) -> Result<Vec<LogEvent>>;
}

#[derive(Deserialize)]
struct LogGroupsResponse {
    #[serde(default, rename = "logGroups")]
    log_groups: Vec<LogGroup>,
}

#[derive(Deserialize)]
struct LogStreamsResponse {
    #[serde(default, rename = "logStreams")]
    log_streams: Vec<LogStream>,
}

#[derive(Deserialize)]
struct LogEventsResponse {
    #[serde(default)]
    events: Vec<LogEvent>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct ApiError {
    #[serde(rename = "__type")]
    error_type: String,
    #[serde(alias = "Message")]
    message: String,
}

/// SigV4-signed client for the CloudWatch Logs JSON protocol
#[derive(Debug, Clone)]
pub struct HttpLogsClient {
    http: reqwest::Client,
    endpoint: String,
    host: String,
    signer: Signer,
}

impl HttpLogsClient {
    /// Client for `region`, or for `endpoint` when one is given
    pub fn new(region: &str, endpoint: Option<&str>, credentials: Credentials, timeout: Duration) -> Result<Self> {
        let endpoint = match endpoint {
            Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
            None => format!("https://logs.{}.amazonaws.com", region),
        };
        let url = reqwest::Url::parse(&endpoint)
            .map_err(|e| Error::config(format!("invalid CloudWatch endpoint {}: {}", endpoint, e)))?;
        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => return Err(Error::config(format!("CloudWatch endpoint {} has no host", endpoint))),
        };

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            endpoint: format!("{}/", endpoint),
            host,
            signer: Signer::new(credentials, region, SERVICE),
        })
    }

    async fn call<T: DeserializeOwned>(&self, operation: &str, body: Value) -> Result<T> {
        let payload = serde_json::to_vec(&body)?;
        let target = format!("{}.{}", TARGET_PREFIX, operation);
        let signed = self.signer.sign(
            "POST",
            &self.host,
            "/",
            &[("content-type", CONTENT_TYPE), ("x-amz-target", &target)],
            &payload,
            Utc::now(),
        );

        let mut request = self
            .http
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE)
            .header("X-Amz-Target", &target)
            .header("X-Amz-Date", &signed.amz_date)
            .header(reqwest::header::AUTHORIZATION, &signed.authorization);
        if let Some(token) = &signed.security_token {
            request = request.header("X-Amz-Security-Token", token);
        }

        let response = request
            .body(payload)
            .send()
            .await
            .map_err(|e| transport_error(operation, e))?;
        let status = response.status();
        let bytes = response.bytes().await.map_err(|e| transport_error(operation, e))?;

        if !status.is_success() {
            return Err(api_error(operation, status, &bytes));
        }

        serde_json::from_slice(&bytes)
            .map_err(|e| Error::non_retryable(format!("{}: invalid response body: {}", operation, e)))
    }
}

#[async_trait]
impl LogsApi for HttpLogsClient {
    async fn describe_log_groups(&self, prefix: &str, limit: u32) -> Result<Vec<LogGroup>> {
        let response: LogGroupsResponse = self
            .call("DescribeLogGroups", json!({ "logGroupNamePrefix": prefix, "limit": limit }))
            .await?;
        Ok(response.log_groups)
    }

    async fn describe_log_streams(&self, log_group: &str, limit: u32) -> Result<Vec<LogStream>> {
        let response: LogStreamsResponse = self
            .call(
                "DescribeLogStreams",
                json!({
                    "logGroupName": log_group,
                    "orderBy": "LastEventTime",
                    "descending": true,
                    "limit": limit,
                }),
            )
            .await?;
        Ok(response.log_streams)
    }

    async fn get_log_events(
        &self,
        log_group: &str,
        log_stream: &str,
        start_time_ms: i64,
        limit: u32,
    ) -> Result<Vec<LogEvent>> {
        let response: LogEventsResponse = self
            .call(
                "GetLogEvents",
                json!({
                    "logGroupName": log_group,
                    "logStreamName": log_stream,
                    "startTime": start_time_ms,
                    "startFromHead": true,
                    "limit": limit,
                }),
            )
            .await?;
        Ok(response.events)
    }

    async fn filter_log_events(
        &self,
        log_group: &str,
        filter_pattern: &str,
        start_time_ms: i64,
        limit: u32,
    ) -> Result<Vec<LogEvent>> {
        let response: LogEventsResponse = self
            .call(
                "FilterLogEvents",
                json!({
                    "logGroupName": log_group,
                    "filterPattern": filter_pattern,
                    "startTime": start_time_ms,
                    "limit": limit,
                }),
            )
            .await?;
        Ok(response.events)
    }
}

fn transport_error(operation: &str, e: reqwest::Error) -> Error {
    let kind = if e.is_timeout() {
        "timeout"
    } else if e.is_connect() {
        "connection error"
    } else {
        "network error"
    };
    Error::retryable(format!("{}: {}: {}", operation, kind, e))
}

fn api_error(operation: &str, status: reqwest::StatusCode, body: &[u8]) -> Error {
    let parsed: ApiError = serde_json::from_slice(body).unwrap_or_default();
    // __type may be namespaced, e.g. "com.amazonaws.logs#ThrottlingException"
    let error_type = parsed
        .error_type
        .rsplit('#')
        .next()
        .unwrap_or_default()
        .to_string();
    let message = format!(
        "{} failed with status {}: {}: {}",
        operation,
        status.as_u16(),
        error_type,
        parsed.message
    );

    if is_retryable_message(&message) || status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        Error::retryable(message)
    } else {
        Error::non_retryable(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client(server: &MockServer) -> HttpLogsClient {
        HttpLogsClient::new(
            "us-east-1",
            Some(&server.uri()),
            Credentials::new("AKIDEXAMPLE", "secret"),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn test_retryable_markers() {
        assert!(is_retryable_message("dial tcp 10.0.0.1:443: i/o timeout"));
        assert!(is_retryable_message("ThrottlingException: Rate exceeded"));
        assert!(is_retryable_message("request failed: rate limit"));
        assert!(!is_retryable_message("ResourceNotFoundException: The specified log group does not exist"));
        assert!(!is_retryable_message("AccessDeniedException"));
    }

    #[test]
    fn test_default_endpoint_host() {
        let client =
            HttpLogsClient::new("eu-west-1", None, Credentials::new("a", "b"), Duration::from_secs(1)).unwrap();
        assert_eq!(client.host, "logs.eu-west-1.amazonaws.com");
        assert_eq!(client.endpoint, "https://logs.eu-west-1.amazonaws.com/");
    }

    #[tokio::test]
    async fn test_describe_log_streams_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .and(header("X-Amz-Target", "Logs_20140328.DescribeLogStreams"))
            .and(header("Content-Type", CONTENT_TYPE))
            .and(header_exists("Authorization"))
            .and(header_exists("X-Amz-Date"))
            .and(body_partial_json(json!({
                "logGroupName": "/aws/eks/prod/cluster",
                "orderBy": "LastEventTime",
                "descending": true,
                "limit": 50
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "logStreams": [
                    { "logStreamName": "kube-apiserver-audit-1", "lastIngestionTime": 1700000000000i64 },
                    { "logStreamName": "kube-apiserver-audit-2" }
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let streams = client(&server)
            .await
            .describe_log_streams("/aws/eks/prod/cluster", 50)
            .await
            .unwrap();
        assert_eq!(streams.len(), 2);
        assert_eq!(streams[0].last_ingestion_time, Some(1_700_000_000_000));
        assert_eq!(streams[1].last_ingestion_time, None);
    }

    #[tokio::test]
    async fn test_throttling_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "__type": "com.amazonaws.logs#ThrottlingException",
                "message": "Rate exceeded"
            })))
            .mount(&server)
            .await;

        let err = client(&server).await.get_log_events("g", "s", 0, 10).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("ThrottlingException"));
    }

    #[tokio::test]
    async fn test_not_found_is_not_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "__type": "ResourceNotFoundException",
                "message": "The specified log group does not exist."
            })))
            .mount(&server)
            .await;

        let err = client(&server).await.filter_log_events("g", "p", 0, 10).await.unwrap_err();
        assert!(!err.is_retryable());
        assert!(matches!(err, Error::NonRetryableSource(_)));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_retryable() {
        let client = HttpLogsClient::new(
            "us-east-1",
            Some("http://127.0.0.1:1"),
            Credentials::new("a", "b"),
            Duration::from_secs(1),
        )
        .unwrap();
        let err = client.describe_log_groups("/aws/eks", 1).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
