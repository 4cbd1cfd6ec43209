//! STAR Randomness Server Binary
//!
//! This is the main entry point for the randomness server.
//! It initializes tracing, metrics, and starts the service with configuration
//! from command-line arguments or environment variables.

use std::process::ExitCode;

use clap::Parser;
use randsrv_service::{config::RandsrvConfig, telemetry};

#[tokio::main]
async fn main() -> eyre::Result<ExitCode> {
    let metrics_config = telemetry::MetricsConfig::try_from_env()?;
    telemetry::initialize_tracing(metrics_config.as_ref())?;
    randsrv_service::metrics::describe_metrics();
    tracing::info!("{}", randsrv_service::version_info());

    let config = RandsrvConfig::parse();
    let result = randsrv_service::start(config, randsrv_service::default_shutdown_signal()).await;
    match result {
        Ok(()) => {
            tracing::info!("good night!");
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            // we don't want to double print the error therefore we just return FAILURE
            tracing::error!("{err:?}");
            Ok(ExitCode::FAILURE)
        }
    }
}
