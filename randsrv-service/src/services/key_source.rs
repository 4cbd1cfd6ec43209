//! Key acquisition for OPRF instances.
//!
//! This module defines the [`KeySource`] trait, which is used by the registry
//! at startup and by the epoch drivers whenever a key is exhausted.
//!
//! Current `KeySource` implementations:
//! - [`LocalKeySource`] generates a fresh key (standalone and leader role)
//! - [`LeaderKeySource`] fetches the key state from a leader (follower role)

use std::{sync::Arc, time::Instant};

use async_trait::async_trait;

use crate::services::{
    epoch_clock::{EpochClockError, EpochPosition},
    instance::{LiveKey, OprfInstance},
    key_handle::{KeyHandle, KeyHandleError},
};

pub(crate) mod leader;

pub(crate) use leader::LeaderKeySource;

/// Dynamic trait object for the key source.
///
/// Must be `Send + Sync` to be shared with the epoch drivers.
pub type KeySourceService = Arc<dyn KeySource + Send + Sync>;

/// Errors returned by a [`KeySource`].
#[derive(Debug, thiserror::Error)]
pub enum KeySourceError {
    /// A local key could not be created.
    #[error("cannot create key: {0}")]
    KeyCreation(#[from] KeyHandleError),
    /// The leader did not provide a usable key state in time.
    #[error("leader key state unavailable: {0}")]
    SyncUnavailable(String),
    /// The leader sent a key state that cannot be used.
    #[error("malformed leader key state: {0}")]
    MalformedState(String),
    /// The leader runs a different schedule.
    #[error("leader schedule differs: {0}")]
    ScheduleMismatch(String),
    /// The schedule cannot place the current time.
    #[error(transparent)]
    Schedule(#[from] EpochClockError),
    /// The blocking key task panicked or was cancelled.
    #[error("key task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Source of keys for an [`OprfInstance`].
#[async_trait]
pub trait KeySource {
    /// Acquires a key that covers `position` of the instance's schedule.
    async fn acquire(
        &self,
        instance: &OprfInstance,
        position: &EpochPosition,
    ) -> Result<LiveKey, KeySourceError>;
}

/// Generates a new key for every acquisition.
pub struct LocalKeySource;

#[async_trait]
impl KeySource for LocalKeySource {
    async fn acquire(
        &self,
        instance: &OprfInstance,
        position: &EpochPosition,
    ) -> Result<LiveKey, KeySourceError> {
        let schedule = *instance.schedule();
        tracing::debug!("generating key for instance {}", instance.name());
        // key generation and puncturing take a while, keep them off the runtime
        let started = Instant::now();
        let handle = tokio::task::spawn_blocking(move || {
            KeyHandle::create(schedule.first_epoch(), schedule.last_epoch())
        })
        .await??;
        // on short epochs the schedule moves on while the key is created
        let reference = schedule.boundary(position.elapsed)? + started.elapsed();
        let position = schedule.position_at(reference)?;
        let epoch = position.epoch;
        let handle = tokio::task::spawn_blocking(move || {
            let mut handle = handle;
            handle.skip_to(epoch)?;
            Ok::<_, KeyHandleError>(handle)
        })
        .await??;
        Ok(LiveKey::at(handle, &position))
    }
}
