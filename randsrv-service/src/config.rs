//! Configuration types and CLI/environment parsing for the randomness server.
//!
//! Every option can be given as command line argument or as `RANDSRV_*`
//! environment variable.

use std::{net::SocketAddr, time::Duration};

use clap::{Parser, ValueEnum};
use reqwest::Url;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};

use crate::services::epoch_clock::EpochDuration;

/// How an instance obtains its keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum KeySyncRole {
    /// Generates keys locally and shares them with nobody.
    Standalone,
    /// Generates keys locally and serves them to followers on the internal listener.
    Leader,
    /// Fetches keys from the leader.
    Follower,
}

/// The configuration of the randomness server.
///
/// It can be configured via environment variables or command line arguments using `clap`.
#[derive(Parser, Debug, Clone)]
#[clap(version, about)]
pub struct RandsrvConfig {
    /// The bind addr of the public AXUM server
    #[clap(long, env = "RANDSRV_BIND_ADDR", default_value = "127.0.0.1:8080")]
    pub bind_addr: SocketAddr,

    /// The bind addr of the internal key sync server (leader only)
    #[clap(
        long,
        env = "RANDSRV_INTERNAL_BIND_ADDR",
        default_value = "127.0.0.1:8081"
    )]
    pub internal_bind_addr: SocketAddr,

    /// Comma separated OPRF instance names. The first one is the default instance.
    #[clap(
        long,
        env = "RANDSRV_INSTANCE_NAMES",
        value_delimiter = ',',
        default_value = "main"
    )]
    pub instance_names: Vec<String>,

    /// Comma separated epoch durations, either one for all instances or one per instance.
    ///
    /// Accepts calendar units (`1d`, `1w`, `1mon`) or fixed durations (`1ms`, `30s`, `2h`).
    #[clap(
        long,
        env = "RANDSRV_EPOCH_DURATIONS",
        value_delimiter = ',',
        default_value = "1w"
    )]
    pub epoch_durations: Vec<EpochDuration>,

    /// RFC 3339 timestamp all epochs are counted from.
    ///
    /// Defaults to the startup time truncated to the second. Leaders and
    /// followers must set it, all replicas share one schedule.
    #[clap(
        long,
        env = "RANDSRV_EPOCH_BASE_TIME",
        value_parser = parse_rfc3339,
        required_if_eq_any([("key_sync_role", "leader"), ("key_sync_role", "follower")])
    )]
    pub epoch_base_time: Option<OffsetDateTime>,

    /// First epoch of a key
    #[clap(long, env = "RANDSRV_FIRST_EPOCH", default_value = "0")]
    pub first_epoch: u8,

    /// Last epoch of a key. The key is replaced after this epoch.
    #[clap(long, env = "RANDSRV_LAST_EPOCH", default_value = "255")]
    pub last_epoch: u8,

    /// Max number of points in a single randomness request
    #[clap(long, env = "RANDSRV_MAX_POINTS", default_value = "1024")]
    pub max_points: usize,

    /// How many epochs ahead of the current epoch a request may ask for. Unbounded if unset.
    #[clap(long, env = "RANDSRV_MAX_FUTURE_EPOCHS")]
    pub max_future_epochs: Option<u8>,

    /// The key sync role of this server
    #[clap(long, env = "RANDSRV_KEY_SYNC_ROLE", default_value = "standalone")]
    pub key_sync_role: KeySyncRole,

    /// Base URL of the leader's internal listener (follower only)
    #[clap(long, env = "RANDSRV_LEADER_URL", required_if_eq("key_sync_role", "follower"))]
    pub leader_url: Option<Url>,

    /// Max attempts to fetch a usable key state from the leader
    #[clap(long, env = "RANDSRV_SYNC_RETRIES", default_value = "10")]
    pub sync_retries: usize,

    /// Wait time between two attempts to fetch the key state
    #[clap(
        long,
        env = "RANDSRV_SYNC_RETRY_INTERVAL",
        default_value = "1s",
        value_parser = humantime::parse_duration
    )]
    pub sync_retry_interval: Duration,

    /// Timeout of a single request to the leader
    #[clap(
        long,
        env = "RANDSRV_SYNC_REQUEST_TIMEOUT",
        default_value = "5s",
        value_parser = humantime::parse_duration
    )]
    pub sync_request_timeout: Duration,

    /// Max wait time the service waits for its tasks during shutdown.
    #[clap(
        long,
        env = "RANDSRV_MAX_WAIT_TIME_SHUTDOWN",
        default_value = "10s",
        value_parser = humantime::parse_duration
    )]
    pub max_wait_time_shutdown: Duration,
}

fn parse_rfc3339(s: &str) -> Result<OffsetDateTime, time::error::Parse> {
    OffsetDateTime::parse(s, &Rfc3339)
}
