//! Telemetry setup for the randomness server.
//!
//! This module centralizes configuration and initialization of observability:
//!
//! * Reading the metrics exporter settings from environment variables into
//!   [`MetricsConfig`] and related structs.
//! * Setting up logging with a `tracing-subscriber` registry and a panic hook
//!   that logs panics on a single line.
//! * Installing the Prometheus metrics exporter (scrape or push mode).
//!
//! Call [`initialize_tracing`] once at startup to configure tracing and metrics.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use std::{backtrace::Backtrace, panic};

use eyre::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Metrics exporter configuration.
#[derive(Debug, Clone)]
pub enum MetricsConfig {
    /// Prometheus config
    Prometheus(PrometheusMetricsConfig),
}

impl MetricsConfig {
    /// Build a [`MetricsConfig`] from environment variables.
    ///
    /// Reads `METRICS_EXPORTER` to decide the backend. Returns `None` if the
    /// variable is not set.
    pub fn try_from_env() -> eyre::Result<Option<Self>> {
        match std::env::var("METRICS_EXPORTER") {
            Ok(choice) => match choice.trim().to_lowercase().as_str() {
                "prometheus" => Ok(Some(Self::Prometheus(
                    PrometheusMetricsConfig::try_from_env().context(
                        "during constructing Prometheus metrics exporter from environment",
                    )?,
                ))),
                _ => eyre::bail!(
                    "environment: METRICS_EXPORTER must be \"prometheus\", not \"{}\"",
                    choice
                ),
            },
            Err(std::env::VarError::NotPresent) => Ok(None),
            Err(e) => {
                eyre::bail!("Failed to read METRICS_EXPORTER from environment: {}", e);
            }
        }
    }
}

/// Prometheus metrics exporter configuration.
#[derive(Debug, Clone)]
pub enum PrometheusMetricsConfig {
    /// Prometheus scrape endpoint (the service exposes metrics over HTTP).
    Scrape(ScrapePrometheusMetricsConfig),
    /// Push mode (service pushes metrics to a gateway).
    Push(PushPrometheusMetricsConfig),
}

impl PrometheusMetricsConfig {
    /// Build a [`PrometheusMetricsConfig`] from environment variables:
    /// * `METRICS_PROMETHEUS_MODE` (must be `scrape` or `push`)
    ///
    /// plus mode-specific variables.
    pub fn try_from_env() -> eyre::Result<Self> {
        match std::env::var("METRICS_PROMETHEUS_MODE") {
            Ok(choice) => match choice.trim().to_lowercase().as_str() {
                "scrape" => Ok(Self::Scrape(ScrapePrometheusMetricsConfig::try_from_env()?)),
                "push" => Ok(Self::Push(PushPrometheusMetricsConfig::try_from_env()?)),
                _ => eyre::bail!(
                    "environment: METRICS_PROMETHEUS_MODE must be \"scrape\" or \"push\", not \"{}\"",
                    choice
                ),
            },
            Err(e) => {
                eyre::bail!(
                    "Failed to read METRICS_PROMETHEUS_MODE from environment: {}",
                    e
                );
            }
        }
    }
}

/// Scrape mode Prometheus metrics configuration.
#[derive(Debug, Clone)]
pub struct ScrapePrometheusMetricsConfig {
    pub(crate) bind_addr: Option<SocketAddr>,
}

impl ScrapePrometheusMetricsConfig {
    /// Build a [`ScrapePrometheusMetricsConfig`] from environment variable
    /// `METRICS_PROMETHEUS_BIND_ADDR` (optional).
    pub fn try_from_env() -> eyre::Result<Self> {
        match std::env::var("METRICS_PROMETHEUS_BIND_ADDR") {
            Ok(bind_addr) => Ok(ScrapePrometheusMetricsConfig {
                bind_addr: Some(
                    bind_addr
                        .parse()
                        .context("during reading METRICS_PROMETHEUS_BIND_ADDR from environment")?,
                ),
            }),
            Err(std::env::VarError::NotPresent) => {
                Ok(ScrapePrometheusMetricsConfig { bind_addr: None })
            }
            Err(e) => {
                eyre::bail!(
                    "Failed to read METRICS_PROMETHEUS_BIND_ADDR from environment: {}",
                    e
                );
            }
        }
    }
}

/// Push mode Prometheus metrics configuration.
#[derive(Debug, Clone)]
pub struct PushPrometheusMetricsConfig {
    pub(crate) endpoint: String,
    pub(crate) interval: Duration,
    pub(crate) username: Option<String>,
    pub(crate) password: Option<String>,
    pub(crate) use_http_post_method: bool,
}

impl PushPrometheusMetricsConfig {
    /// Build a [`PushPrometheusMetricsConfig`] from environment variables:
    /// `METRICS_PROMETHEUS_ENDPOINT`, `INTERVAL`, `USERNAME`, `PASSWORD`,
    /// `USE_HTTP_POST_METHOD`.
    pub fn try_from_env() -> eyre::Result<Self> {
        let endpoint = std::env::var("METRICS_PROMETHEUS_ENDPOINT")
            .context("Failed to read METRICS_PROMETHEUS_ENDPOINT from environment")?;
        let interval = std::env::var("METRICS_PROMETHEUS_INTERVAL")
            .context("Failed to read METRICS_PROMETHEUS_INTERVAL from environment")?;
        let interval = Duration::from(humantime::Duration::from_str(&interval).context(
            "During parsing METRICS_PROMETHEUS_INTERVAL from env: \
                      Expecting a duration string such as \"1h 24min\", \"29s\", ..",
        )?);
        let username = optional_env("METRICS_PROMETHEUS_USERNAME")?;
        let password = optional_env("METRICS_PROMETHEUS_PASSWORD")?;
        let use_http_post_method = match optional_env("METRICS_PROMETHEUS_USE_HTTP_POST_METHOD")? {
            Some(use_http_post_method) => use_http_post_method.parse().context(
                "during reading METRICS_PROMETHEUS_USE_HTTP_POST_METHOD from environment (expecting bool)",
            )?,
            None => false,
        };
        Ok(PushPrometheusMetricsConfig {
            endpoint,
            interval,
            username,
            password,
            use_http_post_method,
        })
    }
}

fn optional_env(key: &str) -> eyre::Result<Option<String>> {
    match std::env::var(key) {
        Ok(value) => Ok(Some(value)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => eyre::bail!("Failed to read {key} from environment: {e}"),
    }
}

/// Initialize metrics exporter according to [`MetricsConfig`].
///
/// Called internally by [`initialize_tracing`] once configuration is loaded.
pub fn initialize_metrics(config: &MetricsConfig) -> eyre::Result<()> {
    match config {
        MetricsConfig::Prometheus(PrometheusMetricsConfig::Scrape(scrape_conf)) => {
            tracing::debug!("Setting up Prometheus scrape metrics exporter ..");
            let builder = if let Some(bind_addr) = scrape_conf.bind_addr {
                metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(bind_addr)
            } else {
                metrics_exporter_prometheus::PrometheusBuilder::new()
            };
            builder
                .install()
                .context("during installing Prometheus scrape metrics exporter as global recorder")?;
        }
        MetricsConfig::Prometheus(PrometheusMetricsConfig::Push(push_conf)) => {
            tracing::debug!("Setting up Prometheus push metrics exporter ..");
            metrics_exporter_prometheus::PrometheusBuilder::new()
                .with_push_gateway(
                    &push_conf.endpoint,
                    push_conf.interval,
                    push_conf.username.to_owned(),
                    push_conf.password.to_owned(),
                    push_conf.use_http_post_method,
                )
                .context("during building Prometheus push metrics exporter")?
                .install()
                .context("during installing Prometheus push metrics exporter as global recorder")?;
        }
    };
    Ok(())
}

/// Initializes structured logging/tracing for the service.
///
/// Installs a `tracing-subscriber` registry with human-readable formatting and
/// an environment-based filter (default `randsrv_service=info,warn`), and a
/// panic hook that logs panic messages and their backtraces as a single line
/// to make them easier to ingest by log aggregators.
///
/// If `metrics` is set, [`initialize_metrics`] is called afterwards.
///
/// This is intended as a one-time setup call during service startup.
pub fn initialize_tracing(metrics: Option<&MetricsConfig>) -> eyre::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_line_number(false),
        )
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "randsrv_service=info,star_randsrv=info,warn".into()),
        )
        .try_init()
        .context("while installing tracing subscriber")?;

    // Set a custom panic hook to print backtraces on one line
    panic::set_hook(Box::new(|panic_info| {
        let message = match panic_info.payload().downcast_ref::<&str>() {
            Some(s) => *s,
            None => match panic_info.payload().downcast_ref::<String>() {
                Some(s) => s.as_str(),
                None => "Unknown panic message",
            },
        };
        let location = if let Some(location) = panic_info.location() {
            format!(
                "{}:{}:{}",
                location.file(),
                location.line(),
                location.column()
            )
        } else {
            "Unknown location".to_string()
        };

        let backtrace_single_line = format!("{:?}", Backtrace::capture()).replace('\n', " | ");

        tracing::error!(
            { backtrace = %backtrace_single_line, location = %location},
            "Panic occurred with message: {}",
            message
        );
    }));

    if let Some(metrics_conf) = metrics {
        initialize_metrics(metrics_conf)?;
    }
    Ok(())
}
