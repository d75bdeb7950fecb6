//! PolicyWatch
//!
//! Watches Kubernetes admission policy violations from audit logs, CloudWatch
//! Logs or Kyverno policy events and reports them to Fairwinds Insights.

use anyhow::{Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusHandle;
use policywatch_agent::config::default_log_filter;
use policywatch_agent::{Cli, LogFormat, Watcher, WatcherConfig};
use policywatch_dispatch::{Dispatcher, WATCHER_VERSION};
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = WatcherConfig::load(&cli).context("invalid configuration")?;
    init_tracing(config.verbose, config.log_format);

    info!(version = WATCHER_VERSION, "Starting PolicyWatch");
    info!(
        organization = %config.insights.organization,
        cluster = %config.insights.cluster,
        console = config.console,
        "Configuration loaded"
    );

    let metrics_handle = init_metrics()?;

    let dispatcher = if config.console {
        info!("Console mode: violations are printed to stdout");
        Dispatcher::console(config.rate_limit)
    } else {
        info!(endpoint = %config.insights.endpoint(), "Delivering violations to Insights");
        Dispatcher::insights(&config.insights, config.rate_limit).context("failed to create Insights client")?
    };

    let watcher = Watcher::from_config(config, dispatcher).with_prometheus(metrics_handle);
    if watcher.source_names().is_empty() {
        warn!("No event source could be started");
    }

    watcher
        .run_until(async {
            shutdown_signal().await;
            warn!("Shutdown signal received, stopping watcher...");
        })
        .await
        .context("watcher failed")?;

    info!("Shutdown complete");
    Ok(())
}

/// Listen for shutdown signals (SIGTERM, SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Initialize tracing/logging
fn init_tracing(verbose: bool, format: LogFormat) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_log_filter(verbose)));

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Initialize metrics exporter and return handle for rendering
fn init_metrics() -> Result<PrometheusHandle> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install metrics: {}", e))?;

    policywatch_telemetry::metrics::describe();

    info!("Metrics exporter initialized");
    Ok(handle)
}
