//! Follower side of the key sync.
//!
//! [`LeaderKeySource`] fetches the bincode encoded [`SyncState`] of an
//! instance from the internal listener of the leader. The state carries the
//! leader's schedule, which must equal ours, and the position it belongs to.
//! A state is accepted if it matches the follower's position, or if it is
//! older but the leader's key still covers the follower's epoch, in which case
//! the imported key is punctured forward. Stale states and transport errors
//! are retried until the retries run out.

use std::time::Duration;

use async_trait::async_trait;
use eyre::Context as _;
use reqwest::Url;
use time::OffsetDateTime;
use tracing::instrument;

use crate::{
    metrics::{METRICS_KEY_SYNC_FAILURES, METRICS_LABEL_INSTANCE},
    services::{
        epoch_clock::EpochPosition,
        instance::{LiveKey, OprfInstance},
        key_handle::{KeyHandle, KeyHandleError, SyncState},
        key_source::{KeySource, KeySourceError},
    },
};

/// Fetches keys from the leader.
pub(crate) struct LeaderKeySource {
    client: reqwest::Client,
    leader_url: Url,
    retries: usize,
    retry_interval: Duration,
}

enum Attempt {
    Ready(LiveKey),
    Retry(String),
}

impl LeaderKeySource {
    pub(crate) fn new(
        leader_url: Url,
        retries: usize,
        retry_interval: Duration,
        request_timeout: Duration,
    ) -> eyre::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("while building http client")?;
        Ok(Self {
            client,
            leader_url,
            retries: retries.max(1),
            retry_interval,
        })
    }

    fn state_url(&self, instance: &str) -> String {
        format!(
            "{}/sync/instances/{instance}/state",
            self.leader_url.as_str().trim_end_matches('/')
        )
    }

    async fn fetch(&self, instance: &str) -> Result<Vec<u8>, String> {
        let response = self
            .client
            .get(self.state_url(instance))
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|err| err.to_string())?;
        let body = response.bytes().await.map_err(|err| err.to_string())?;
        Ok(body.to_vec())
    }

    async fn try_sync(
        &self,
        instance: &OprfInstance,
        position: &EpochPosition,
    ) -> Result<Attempt, KeySourceError> {
        let bytes = match self.fetch(instance.name()).await {
            Ok(bytes) => bytes,
            Err(err) => return Ok(Attempt::Retry(err)),
        };
        let state: SyncState = bincode::deserialize(&bytes)
            .map_err(|err| KeySourceError::MalformedState(err.to_string()))?;
        let schedule = *instance.schedule();
        let duration = schedule.duration().to_string();
        if state.base_time != schedule.base_time() || state.duration != duration {
            return Err(KeySourceError::ScheduleMismatch(format!(
                "leader uses base time {} and duration {}, we use {} and {duration}",
                state.base_time,
                state.duration,
                schedule.base_time()
            )));
        }
        if !(schedule.first_epoch()..=schedule.last_epoch()).contains(&state.epoch)
            || state.epoch != schedule.epoch_at_elapsed(state.elapsed)
        {
            return Err(KeySourceError::MalformedState(format!(
                "epoch {} does not match the schedule at position {}",
                state.epoch, state.elapsed
            )));
        }
        if state.elapsed > position.elapsed {
            return Ok(Attempt::Retry(format!(
                "leader is ahead at position {}, we are at {}",
                state.elapsed, position.elapsed
            )));
        }
        let delta = position.elapsed - state.elapsed;
        if delta > u64::from(schedule.last_epoch() - state.epoch) {
            return Ok(Attempt::Retry(format!(
                "leader key at position {} does not cover position {}",
                state.elapsed, position.elapsed
            )));
        }
        // delta fits because the key covers the position
        let target = state.epoch + delta as u8;
        let handle = tokio::task::spawn_blocking(move || {
            let mut handle =
                KeyHandle::import(schedule.first_epoch(), schedule.last_epoch(), state)?;
            handle.skip_to(target)?;
            Ok::<_, KeyHandleError>(handle)
        })
        .await?
        .map_err(|err| KeySourceError::MalformedState(err.to_string()))?;
        Ok(Attempt::Ready(LiveKey::at(handle, position)))
    }
}

#[async_trait]
impl KeySource for LeaderKeySource {
    #[instrument(level = "debug", skip_all, fields(instance = instance.name()))]
    async fn acquire(
        &self,
        instance: &OprfInstance,
        position: &EpochPosition,
    ) -> Result<LiveKey, KeySourceError> {
        let mut position = *position;
        let mut last_error = String::new();
        for attempt in 1..=self.retries {
            if attempt > 1 {
                tokio::time::sleep(self.retry_interval).await;
                position = instance
                    .schedule()
                    .position_at(OffsetDateTime::now_utc())?;
            }
            match self.try_sync(instance, &position).await? {
                Attempt::Ready(live) => {
                    tracing::info!(
                        "synced key of instance {} from leader at epoch {}",
                        instance.name(),
                        live.handle.epoch()
                    );
                    return Ok(live);
                }
                Attempt::Retry(reason) => {
                    tracing::warn!(
                        "sync attempt {attempt}/{} for instance {} failed: {reason}",
                        self.retries,
                        instance.name()
                    );
                    metrics::counter!(METRICS_KEY_SYNC_FAILURES, METRICS_LABEL_INSTANCE => instance.name().to_owned())
                        .increment(1);
                    last_error = reason;
                }
            }
        }
        Err(KeySourceError::SyncUnavailable(format!(
            "giving up after {} attempts: {last_error}",
            self.retries
        )))
    }
}
