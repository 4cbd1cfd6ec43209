#![deny(missing_docs)]
//! This crate implements the STAR randomness server.
//!
//! Clients send blinded Ristretto points and receive them evaluated with a
//! puncturable partially-oblivious PRF (PPOPRF) keyed per *epoch*. The server
//! never learns anything about the points besides their count.
//!
//! The main entry point is [`start`]. It builds the configured OPRF instances,
//! acquires a key for each of them, spawns one epoch driver per instance and
//! serves the HTTP API until the shutdown signal fires.
//!
//! The lifecycle of an instance key is as follows:
//! 1) At startup a key is acquired for the current epoch of the instance's schedule.
//!    - standalone and leader servers generate the key locally,
//!    - followers fetch the leader's key state from its internal listener.
//! 2) At every epoch boundary the epoch driver punctures the epoch that ended.
//!    Evaluations in punctured epochs are impossible afterwards.
//! 3) When the last epoch of a key is punctured, the driver acquires a new key and
//!    swaps it in. Clients observe a new public key but no interruption.
//!
//! If acquiring a key fails, the service shuts down.
use std::sync::Arc;

use axum::{Router, extract::FromRef};
use eyre::Context as _;
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::{
    config::{KeySyncRole, RandsrvConfig},
    services::{
        epoch_driver::epoch_driver_task,
        instance_registry::InstanceRegistry,
        key_source::{KeySourceService, LeaderKeySource, LocalKeySource},
        randomness::RandomnessService,
    },
};

pub(crate) mod api;
pub mod config;
pub mod metrics;
pub(crate) mod services;
pub mod telemetry;

pub use services::epoch_clock::{CalendarSpan, EpochClockError, EpochDuration};

#[derive(Clone)]
pub(crate) struct AppState {
    registry: InstanceRegistry,
    randomness_service: RandomnessService,
}

impl FromRef<AppState> for InstanceRegistry {
    fn from_ref(input: &AppState) -> Self {
        input.registry.clone()
    }
}

impl FromRef<AppState> for RandomnessService {
    fn from_ref(input: &AppState) -> Self {
        input.randomness_service.clone()
    }
}

/// Returns cargo package name, cargo package version, and the git hash of the repository that was used to build the binary.
pub fn version_info() -> String {
    format!(
        "{} {} ({})",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        option_env!("GIT_HASH").unwrap_or(git_version::git_version!(fallback = "UNKNOWN"))
    )
}

/// Starts the randomness server and runs until `shutdown_signal` resolves
/// or a service task fails.
pub async fn start(
    config: RandsrvConfig,
    shutdown_signal: impl std::future::Future<Output = ()> + Send + 'static,
) -> eyre::Result<()> {
    tracing::info!("starting star-randsrv with config: {config:#?}");
    let now = OffsetDateTime::now_utc();
    let base_time = match config.epoch_base_time {
        Some(base_time) => base_time,
        None if config.key_sync_role != KeySyncRole::Standalone => {
            eyre::bail!("{:?} role requires an epoch base time", config.key_sync_role)
        }
        None => now
            .replace_nanosecond(0)
            .context("while truncating epoch base time")?,
    };
    tracing::info!("epoch base time: {base_time}");
    let registry = InstanceRegistry::from_config(
        &config.instance_names,
        &config.epoch_durations,
        base_time,
        config.first_epoch,
        config.last_epoch,
        now,
    )
    .context("while building OPRF instances")?;

    let key_source: KeySourceService = match config.key_sync_role {
        KeySyncRole::Standalone | KeySyncRole::Leader => Arc::new(LocalKeySource),
        KeySyncRole::Follower => {
            let leader_url = config
                .leader_url
                .clone()
                .ok_or_else(|| eyre::eyre!("follower role requires a leader url"))?;
            tracing::info!("syncing keys from leader at {leader_url}");
            Arc::new(LeaderKeySource::new(
                leader_url,
                config.sync_retries,
                config.sync_retry_interval,
                config.sync_request_timeout,
            )?)
        }
    };

    let cancellation_token = spawn_shutdown_task(shutdown_signal);

    tracing::info!("acquiring keys for instances {:?}..", registry.names());
    tokio::select! {
        initialized = registry.initialize(&key_source, OffsetDateTime::now_utc()) => {
            initialized.context("while acquiring initial keys")?;
        }
        _ = cancellation_token.cancelled() => {
            tracing::info!("shutdown before keys were acquired");
            return Ok(());
        }
    }

    tracing::info!("spawning epoch drivers..");
    let mut tasks = registry
        .instances()
        .map(|instance| {
            tokio::spawn(epoch_driver_task(
                Arc::clone(instance),
                Arc::clone(&key_source),
                cancellation_token.clone(),
            ))
        })
        .collect::<Vec<_>>();

    let app_state = AppState {
        registry: registry.clone(),
        randomness_service: RandomnessService::new(
            registry.clone(),
            config.max_points,
            config.max_future_epochs,
        ),
    };
    let listener = TcpListener::bind(config.bind_addr)
        .await
        .context("while binding tcp listener")?;
    tasks.push(tokio::spawn(serve(
        listener,
        api::routes(app_state),
        cancellation_token.clone(),
    )));

    if config.key_sync_role == KeySyncRole::Leader {
        let internal_listener = TcpListener::bind(config.internal_bind_addr)
            .await
            .context("while binding internal tcp listener")?;
        tasks.push(tokio::spawn(serve(
            internal_listener,
            api::internal_routes(registry.clone()),
            cancellation_token.clone(),
        )));
    }

    tracing::info!("everything started successfully - now waiting for shutdown...");
    cancellation_token.cancelled().await;

    tracing::info!(
        "waiting for shutdown of services (max wait time {:?})..",
        config.max_wait_time_shutdown
    );
    let shutdown = async {
        let mut failed = false;
        for task in tasks {
            match task.await {
                Ok(Ok(())) => {}
                // the task logged its error already
                Ok(Err(_)) => failed = true,
                Err(err) => {
                    tracing::error!("service task panicked: {err:?}");
                    failed = true;
                }
            }
        }
        failed
    };
    let failed = match tokio::time::timeout(config.max_wait_time_shutdown, shutdown).await {
        Ok(failed) => {
            tracing::info!("successfully finished shutdown in time");
            failed
        }
        Err(_) => {
            tracing::warn!("could not finish shutdown in time");
            false
        }
    };
    registry.release_all();
    if failed {
        eyre::bail!("a service task failed, see logs above");
    }
    Ok(())
}

async fn serve(
    listener: TcpListener,
    router: Router,
    cancellation_token: CancellationToken,
) -> eyre::Result<()> {
    // shutdown service if the server stops unexpectedly
    let _drop_guard = cancellation_token.drop_guard_ref();
    tracing::info!(
        "starting axum server on {}",
        listener
            .local_addr()
            .map(|x| x.to_string())
            .unwrap_or(String::from("invalid addr"))
    );
    let shutdown_token = cancellation_token.clone();
    let axum_result = axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown_token.cancelled().await })
        .await;
    tracing::info!("axum server shutdown");
    if let Err(err) = axum_result {
        tracing::error!("got error from axum: {err:?}");
        return Err(err.into());
    }
    Ok(())
}

fn spawn_shutdown_task(
    shutdown_signal: impl std::future::Future<Output = ()> + Send + 'static,
) -> CancellationToken {
    let cancellation_token = CancellationToken::new();
    let task_token = cancellation_token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown_signal => {
                tracing::info!("Received EXTERNAL shutdown");
                task_token.cancel();
            }
            _ = task_token.cancelled() => {
                tracing::info!("Received INTERNAL shutdown");
            }
        }
    });
    cancellation_token
}

/// The default shutdown signal for the randomness server. Triggered when pressing CTRL+C on most systems or on SIGTERM.
pub async fn default_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
