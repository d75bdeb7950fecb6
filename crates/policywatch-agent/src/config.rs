//! Watcher configuration
//!
//! Values come from three layers, lowest precedence first: built-in defaults,
//! an optional YAML file, then command-line flags and their environment
//! variables.

use clap::{Args, Parser, Subcommand, ValueEnum};
use policywatch_core::{Error, Result};
use policywatch_dispatch::{InsightsConfig, DEFAULT_HOSTNAME};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "policywatch")]
#[command(version, about = "Watches Kubernetes policy violations and reports them to Insights", long_about = None)]
pub struct Cli {
    /// YAML configuration file
    #[arg(short, long, env = "POLICYWATCH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Event channel capacity
    #[arg(long)]
    pub buffer_size: Option<usize>,

    /// Insights API request timeout in seconds
    #[arg(long)]
    pub http_timeout: Option<u64>,

    /// Deliveries per minute per violation category
    #[arg(long)]
    pub rate_limit: Option<u32>,

    /// Print violations to stdout instead of calling the Insights API
    #[arg(long)]
    pub console: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log output format
    #[arg(long, value_enum)]
    pub log_format: Option<LogFormat>,

    /// Port for the health and metrics server
    #[arg(long)]
    pub health_port: Option<u16>,

    /// How often to log pipeline metrics (0s disables)
    #[arg(long, value_parser = parse_duration)]
    pub metrics_log_interval: Option<Duration>,

    /// Also watch Kyverno audit-mode policy events through the Kubernetes API
    #[arg(long)]
    pub kubernetes_events: bool,

    /// Poll interval for Kubernetes policy events
    #[arg(long, value_parser = parse_duration)]
    pub event_poll_interval: Option<Duration>,

    /// Insights host
    #[arg(long, env = "FAIRWINDS_HOSTNAME")]
    pub hostname: Option<String>,

    /// Insights organization
    #[arg(long, env = "FAIRWINDS_ORGANIZATION")]
    pub organization: Option<String>,

    /// Insights cluster name
    #[arg(long, env = "FAIRWINDS_CLUSTER")]
    pub cluster: Option<String>,

    /// Insights API token
    #[arg(long, env = "FAIRWINDS_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Tail a local Kubernetes audit log file
    Audit {
        /// Path to the audit log
        #[arg(long)]
        log_path: PathBuf,
    },

    /// Poll an EKS audit log group in CloudWatch Logs
    Cloudwatch(CloudWatchArgs),
}

#[derive(Args, Debug, Clone, Default)]
pub struct CloudWatchArgs {
    /// Log group name, e.g. /aws/eks/<cluster>/cluster
    #[arg(long)]
    pub log_group: String,

    /// AWS region
    #[arg(long, env = "AWS_REGION")]
    pub region: String,

    /// CloudWatch filter pattern
    #[arg(long)]
    pub filter_pattern: Option<String>,

    /// Maximum events fetched per request
    #[arg(long)]
    pub batch_size: Option<u32>,

    /// Poll interval
    #[arg(long, value_parser = parse_duration)]
    pub poll_interval: Option<Duration>,

    /// Cap on log message bytes retained per poll, in MiB
    #[arg(long)]
    pub max_memory: Option<u64>,

    /// Override the CloudWatch Logs endpoint
    #[arg(long, env = "AWS_ENDPOINT_URL_CLOUDWATCH_LOGS")]
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

const WORKSPACE_CRATES: [&str; 5] = [
    "policywatch_agent",
    "policywatch_core",
    "policywatch_classifiers",
    "policywatch_dispatch",
    "policywatch_telemetry",
];

/// Default `EnvFilter` directives when `RUST_LOG` is unset
pub fn default_log_filter(verbose: bool) -> String {
    let level = if verbose { "debug" } else { "info" };
    let mut directives: Vec<String> = std::iter::once("policywatch")
        .chain(WORKSPACE_CRATES)
        .map(|target| format!("{}={}", target, level))
        .collect();
    if verbose {
        directives.push("tower_http=debug".to_string());
    }
    directives.join(",")
}

/// Contents of the YAML configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    #[serde(default = "default_http_timeout", with = "duration_serde")]
    pub http_timeout: Duration,

    #[serde(default = "default_rate_limit")]
    pub rate_limit: u32,

    #[serde(default)]
    pub console: bool,

    #[serde(default)]
    pub log_format: LogFormat,

    #[serde(default = "default_health_port")]
    pub health_port: u16,

    #[serde(default = "default_metrics_log_interval", with = "duration_serde")]
    pub metrics_log_interval: Duration,

    #[serde(default)]
    pub insights: InsightsFileConfig,

    #[serde(default)]
    pub audit_log_path: Option<PathBuf>,

    #[serde(default)]
    pub kubernetes_events: KubernetesConfig,

    #[serde(default)]
    pub cloudwatch: Option<CloudWatchConfig>,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            http_timeout: default_http_timeout(),
            rate_limit: default_rate_limit(),
            console: false,
            log_format: LogFormat::default(),
            health_port: default_health_port(),
            metrics_log_interval: default_metrics_log_interval(),
            insights: InsightsFileConfig::default(),
            audit_log_path: None,
            kubernetes_events: KubernetesConfig::default(),
            cloudwatch: None,
        }
    }
}

impl FileConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_yaml(&content)
            .map_err(|e| Error::config(format!("parse error in {}: {}", path.display(), e)))
    }

    pub fn from_yaml(content: &str) -> std::result::Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(content)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InsightsFileConfig {
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub organization: Option<String>,
    #[serde(default)]
    pub cluster: Option<String>,
}

/// Kubernetes policy event polling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KubernetesConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_poll_interval", with = "duration_serde")]
    pub poll_interval: Duration,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            poll_interval: default_poll_interval(),
        }
    }
}

/// CloudWatch Logs polling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudWatchConfig {
    pub log_group: String,
    pub region: String,

    #[serde(default)]
    pub filter_pattern: Option<String>,

    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    #[serde(default = "default_poll_interval", with = "duration_serde")]
    pub poll_interval: Duration,

    /// MiB of log messages retained per poll
    #[serde(default = "default_max_memory")]
    pub max_memory: u64,

    #[serde(default)]
    pub endpoint: Option<String>,
}

impl CloudWatchConfig {
    pub fn new(log_group: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            log_group: log_group.into(),
            region: region.into(),
            filter_pattern: None,
            batch_size: default_batch_size(),
            poll_interval: default_poll_interval(),
            max_memory: default_max_memory(),
            endpoint: None,
        }
    }

    pub fn max_memory_bytes(&self) -> usize {
        usize::try_from(self.max_memory.saturating_mul(1024 * 1024)).unwrap_or(usize::MAX)
    }
}

/// Fully resolved and validated watcher settings
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub buffer_size: usize,
    pub rate_limit: u32,
    pub console: bool,
    pub verbose: bool,
    pub log_format: LogFormat,
    pub health_port: u16,
    /// `Duration::ZERO` disables the periodic metrics log
    pub metrics_log_interval: Duration,
    pub insights: InsightsConfig,
    pub audit_log_path: Option<PathBuf>,
    pub kubernetes: KubernetesConfig,
    pub cloudwatch: Option<CloudWatchConfig>,
}

impl WatcherConfig {
    /// Merge the YAML file named by `--config` (if any) with the CLI, then validate
    pub fn load(cli: &Cli) -> Result<Self> {
        let file = match &cli.config {
            Some(path) => FileConfig::from_file(path)?,
            None => FileConfig::default(),
        };
        let config = Self::merge(file, cli);
        config.validate()?;
        Ok(config)
    }

    /// Apply CLI overrides on top of file values
    pub fn merge(file: FileConfig, cli: &Cli) -> Self {
        let mut kubernetes = file.kubernetes_events;
        kubernetes.enabled |= cli.kubernetes_events;
        if let Some(interval) = cli.event_poll_interval {
            kubernetes.poll_interval = interval;
        }

        let mut audit_log_path = file.audit_log_path;
        let mut cloudwatch = file.cloudwatch;
        match &cli.command {
            Some(Command::Audit { log_path }) => audit_log_path = Some(log_path.clone()),
            Some(Command::Cloudwatch(args)) => {
                let mut cw = cloudwatch.unwrap_or_else(|| CloudWatchConfig::new("", ""));
                cw.log_group = args.log_group.clone();
                cw.region = args.region.clone();
                if args.filter_pattern.is_some() {
                    cw.filter_pattern = args.filter_pattern.clone();
                }
                if let Some(batch_size) = args.batch_size {
                    cw.batch_size = batch_size;
                }
                if let Some(interval) = args.poll_interval {
                    cw.poll_interval = interval;
                }
                if let Some(max_memory) = args.max_memory {
                    cw.max_memory = max_memory;
                }
                if args.endpoint.is_some() {
                    cw.endpoint = args.endpoint.clone();
                }
                cloudwatch = Some(cw);
            }
            None => {}
        }

        let insights = InsightsConfig {
            hostname: cli
                .hostname
                .clone()
                .or(file.insights.hostname)
                .unwrap_or_else(|| DEFAULT_HOSTNAME.to_string()),
            organization: cli.organization.clone().or(file.insights.organization).unwrap_or_default(),
            cluster: cli.cluster.clone().or(file.insights.cluster).unwrap_or_default(),
            token: cli.token.clone().unwrap_or_default(),
            timeout: cli.http_timeout.map(Duration::from_secs).unwrap_or(file.http_timeout),
        };

        Self {
            buffer_size: cli.buffer_size.unwrap_or(file.buffer_size),
            rate_limit: cli.rate_limit.unwrap_or(file.rate_limit),
            console: cli.console || file.console,
            verbose: cli.verbose,
            log_format: cli.log_format.unwrap_or(file.log_format),
            health_port: cli.health_port.unwrap_or(file.health_port),
            metrics_log_interval: cli.metrics_log_interval.unwrap_or(file.metrics_log_interval),
            insights,
            audit_log_path: audit_log_path.filter(|p| !p.as_os_str().is_empty()),
            kubernetes,
            cloudwatch,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(Error::config("buffer size must be greater than 0"));
        }
        if self.rate_limit == 0 {
            return Err(Error::config("rate limit must be greater than 0"));
        }
        if self.insights.timeout.is_zero() {
            return Err(Error::config("HTTP timeout must be greater than 0"));
        }
        if self.insights.organization.trim().is_empty() {
            return Err(Error::config("organization is required (FAIRWINDS_ORGANIZATION)"));
        }
        if self.insights.cluster.trim().is_empty() {
            return Err(Error::config("cluster is required (FAIRWINDS_CLUSTER)"));
        }
        if !self.console && self.insights.token.trim().is_empty() {
            return Err(Error::config("token is required unless --console is set (FAIRWINDS_TOKEN)"));
        }
        if self.kubernetes.enabled && self.kubernetes.poll_interval.is_zero() {
            return Err(Error::config("event poll interval must be greater than 0"));
        }
        if let Some(cw) = &self.cloudwatch {
            if cw.log_group.trim().is_empty() {
                return Err(Error::config("CloudWatch log group is required"));
            }
            if cw.region.trim().is_empty() {
                return Err(Error::config("CloudWatch region is required"));
            }
            if !(1..=10_000).contains(&cw.batch_size) {
                return Err(Error::config("CloudWatch batch size must be between 1 and 10000"));
            }
            if cw.poll_interval.is_zero() {
                return Err(Error::config("CloudWatch poll interval must be greater than 0"));
            }
            if cw.max_memory == 0 {
                return Err(Error::config("CloudWatch max memory must be greater than 0"));
            }
        }
        if self.audit_log_path.is_none() && self.cloudwatch.is_none() && !self.kubernetes.enabled {
            return Err(Error::config(
                "no event source configured: use `audit`, `cloudwatch` or --kubernetes-events",
            ));
        }
        Ok(())
    }
}

fn default_buffer_size() -> usize {
    1000
}

fn default_http_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_rate_limit() -> u32 {
    60
}

fn default_health_port() -> u16 {
    8080
}

fn default_metrics_log_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_batch_size() -> u32 {
    100
}

fn default_max_memory() -> u64 {
    512
}

/// Parse `500ms`, `30s`, `5m` or `1h`
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    let (value, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => s.split_at(idx),
        None => return Err(format!("missing unit in duration '{s}' (use '500ms', '30s', '5m' or '1h')")),
    };
    let value: u64 = value
        .parse()
        .map_err(|e| format!("invalid duration '{s}': {e}"))?;

    match unit.trim() {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value.saturating_mul(60))),
        "h" => Ok(Duration::from_secs(value.saturating_mul(3600))),
        _ => Err(format!("unknown duration format: '{s}' (use '500ms', '30s', '5m' or '1h')")),
    }
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(d)?;
        super::parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub fn serialize<S: Serializer>(duration: &Duration, s: S) -> Result<S::Ok, S::Error> {
        if duration.subsec_millis() != 0 {
            s.serialize_str(&format!("{}ms", duration.as_millis()))
        } else {
            s.serialize_str(&format!("{}s", duration.as_secs()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["policywatch"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_default_log_filter_covers_every_crate() {
        let quiet = default_log_filter(false);
        for target in WORKSPACE_CRATES {
            assert!(quiet.contains(&format!("{}=info", target)), "{} missing from {}", target, quiet);
        }
        assert!(!quiet.contains("tower_http"));

        let verbose = default_log_filter(true);
        assert!(verbose.contains("policywatch_classifiers=debug"));
        assert!(verbose.contains("policywatch_core=debug"));
        assert!(verbose.contains("tower_http=debug"));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("0s").unwrap(), Duration::ZERO);
        assert!(parse_duration("30").is_err());
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("10d").is_err());
    }

    #[test]
    fn test_defaults() {
        let config = WatcherConfig::merge(
            FileConfig::default(),
            &cli(&["--console", "--organization", "acme", "--cluster", "prod", "audit", "--log-path", "/var/log/audit.log"]),
        );
        config.validate().unwrap();

        assert_eq!(config.buffer_size, 1000);
        assert_eq!(config.rate_limit, 60);
        assert_eq!(config.health_port, 8080);
        assert_eq!(config.metrics_log_interval, Duration::from_secs(30));
        assert_eq!(config.insights.timeout, Duration::from_secs(30));
        assert_eq!(config.insights.hostname, DEFAULT_HOSTNAME);
        assert_eq!(config.audit_log_path, Some(PathBuf::from("/var/log/audit.log")));
        assert!(config.cloudwatch.is_none());
        assert!(!config.kubernetes.enabled);
    }

    #[test]
    fn test_cloudwatch_subcommand() {
        let config = WatcherConfig::merge(
            FileConfig::default(),
            &cli(&[
                "--token", "t", "--organization", "acme", "--cluster", "prod",
                "cloudwatch", "--log-group", "/aws/eks/prod/cluster", "--region", "us-east-1",
                "--filter-pattern", "{ $.responseStatus.code >= 400 }", "--poll-interval", "1m",
            ]),
        );
        config.validate().unwrap();

        let cw = config.cloudwatch.unwrap();
        assert_eq!(cw.log_group, "/aws/eks/prod/cluster");
        assert_eq!(cw.batch_size, 100);
        assert_eq!(cw.max_memory, 512);
        assert_eq!(cw.poll_interval, Duration::from_secs(60));
        assert_eq!(cw.filter_pattern.as_deref(), Some("{ $.responseStatus.code >= 400 }"));
    }

    #[test]
    fn test_yaml_file_with_cli_override() {
        let file = FileConfig::from_yaml(
            r#"
buffer_size: 50
rate_limit: 10
http_timeout: 5s
insights:
  organization: from-file
  cluster: file-cluster
kubernetes_events:
  enabled: true
  poll_interval: 10s
"#,
        )
        .unwrap();

        let config = WatcherConfig::merge(file, &cli(&["--rate-limit", "120", "--token", "t"]));
        config.validate().unwrap();
        assert_eq!(config.buffer_size, 50);
        assert_eq!(config.rate_limit, 120);
        assert_eq!(config.insights.timeout, Duration::from_secs(5));
        assert_eq!(config.insights.organization, "from-file");
        assert!(config.kubernetes.enabled);
        assert_eq!(config.kubernetes.poll_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_validation_errors() {
        let base = || {
            WatcherConfig::merge(
                FileConfig::default(),
                &cli(&["--token", "t", "--organization", "acme", "--cluster", "prod", "--kubernetes-events"]),
            )
        };
        base().validate().unwrap();

        let mut config = base();
        config.buffer_size = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = base();
        config.insights.token.clear();
        assert!(config.validate().unwrap_err().to_string().contains("token is required"));
        config.console = true;
        config.validate().unwrap();

        let mut config = base();
        config.insights.organization.clear();
        assert!(config.validate().is_err());

        let mut config = base();
        config.kubernetes.enabled = false;
        assert!(config.validate().unwrap_err().to_string().contains("no event source"));

        let mut config = base();
        let mut cw = CloudWatchConfig::new("/aws/eks/prod/cluster", "us-east-1");
        cw.batch_size = 0;
        config.cloudwatch = Some(cw);
        assert!(config.validate().unwrap_err().to_string().contains("batch size"));
    }
}
