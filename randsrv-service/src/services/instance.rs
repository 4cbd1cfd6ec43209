//! A named OPRF instance: an [`EpochSchedule`] and the live [`KeyHandle`].
//!
//! The live key sits behind a `parking_lot::RwLock`. Evaluations and
//! snapshots take the read lock, puncture and replacement take the write lock.
//! None of the methods in here hold the lock across an `.await`.

use parking_lot::{MappedRwLockReadGuard, RwLock, RwLockReadGuard};
use time::OffsetDateTime;
use tracing::instrument;

use crate::{
    metrics::{
        METRICS_KEY_EPOCH_CURRENT, METRICS_KEY_EPOCH_PUNCTURES, METRICS_KEY_KEY_LIVE,
        METRICS_KEY_KEY_ROTATIONS, METRICS_LABEL_INSTANCE,
    },
    services::{
        epoch_clock::{EpochPosition, EpochSchedule},
        key_handle::{KeyHandle, KeyHandleError},
    },
};

/// Errors returned by [`OprfInstance`].
#[derive(Debug, thiserror::Error)]
pub enum InstanceError {
    /// There is no live key.
    #[error("instance '{0}' has no live key")]
    NotReady(String),
    #[error(transparent)]
    KeyHandle(#[from] KeyHandleError),
}

/// The key currently serving an instance.
pub struct LiveKey {
    /// The key.
    pub handle: KeyHandle,
    /// Schedule position the key's counter belongs to.
    pub elapsed: u64,
    /// Next epoch boundary of the schedule.
    pub next_epoch_time: OffsetDateTime,
}

/// Consistent copy of the public state of an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSnapshot {
    /// Bincode serialized public key.
    pub public_key: Vec<u8>,
    /// The current epoch.
    pub epoch: u8,
    /// Next epoch boundary.
    pub next_epoch_time: OffsetDateTime,
}

/// Result of [`OprfInstance::advance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// The key already matches the position.
    Current,
    /// Epochs `from..to` were punctured.
    Punctured {
        /// First punctured epoch.
        from: u8,
        /// The new current epoch.
        to: u8,
    },
    /// The key cannot reach the position and must be replaced.
    Exhausted,
}

pub struct OprfInstance {
    name: String,
    schedule: EpochSchedule,
    live: RwLock<Option<LiveKey>>,
    replace_lock: tokio::sync::Mutex<()>,
}

impl LiveKey {
    /// Wraps a handle created at `position`.
    pub fn at(handle: KeyHandle, position: &EpochPosition) -> Self {
        Self {
            handle,
            elapsed: position.elapsed,
            next_epoch_time: position.next_boundary,
        }
    }

    /// Punctures the key through its last epoch and releases it.
    pub fn retire(self) -> Result<(), KeyHandleError> {
        let mut handle = self.handle;
        let last_epoch = handle.last_epoch();
        match handle.puncture(last_epoch) {
            Ok(()) | Err(KeyHandleError::EpochExhausted) => {}
            Err(err) => return Err(err),
        }
        handle.release();
        Ok(())
    }
}

impl OprfInstance {
    /// Creates an instance without a live key.
    pub fn new(name: impl Into<String>, schedule: EpochSchedule) -> Self {
        Self {
            name: name.into(),
            schedule,
            live: RwLock::new(None),
            replace_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schedule(&self) -> &EpochSchedule {
        &self.schedule
    }

    /// Returns `true` if the instance has a live key.
    pub fn is_live(&self) -> bool {
        self.live.read().is_some()
    }

    /// Public key, current epoch and next boundary read under one lock.
    pub fn snapshot(&self) -> Option<InstanceSnapshot> {
        self.live.read().as_ref().map(|live| InstanceSnapshot {
            public_key: live.handle.public_key().to_vec(),
            epoch: live.handle.epoch(),
            next_epoch_time: live.next_epoch_time,
        })
    }

    /// Next boundary of the live key.
    pub fn next_epoch_time(&self) -> Option<OffsetDateTime> {
        self.live.read().as_ref().map(|live| live.next_epoch_time)
    }

    /// Shared access to the live key.
    ///
    /// Puncture and replacement wait until the guard is dropped.
    pub fn read_key(&self) -> Option<MappedRwLockReadGuard<'_, LiveKey>> {
        RwLockReadGuard::try_map(self.live.read(), Option::as_ref).ok()
    }

    /// Serializes replacements of the live key.
    pub async fn lock_replacement(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.replace_lock.lock().await
    }

    /// Punctures the live key up to the epoch of `position`.
    #[instrument(level = "debug", skip_all, fields(instance = %self.name))]
    pub fn advance(&self, position: &EpochPosition) -> Result<Advance, InstanceError> {
        let mut guard = self.live.write();
        let live = guard
            .as_mut()
            .ok_or_else(|| InstanceError::NotReady(self.name.clone()))?;
        if position.elapsed <= live.elapsed {
            return Ok(Advance::Current);
        }
        let delta = position.elapsed - live.elapsed;
        let from = live.handle.epoch();
        if delta > u64::from(live.handle.last_epoch() - from) {
            return Ok(Advance::Exhausted);
        }
        // delta is at most last_epoch - from
        let to = from + delta as u8;
        live.handle.puncture(to - 1)?;
        live.elapsed = position.elapsed;
        live.next_epoch_time = position.next_boundary;
        metrics::counter!(METRICS_KEY_EPOCH_PUNCTURES, METRICS_LABEL_INSTANCE => self.name.clone())
            .increment(delta);
        metrics::gauge!(METRICS_KEY_EPOCH_CURRENT, METRICS_LABEL_INSTANCE => self.name.clone())
            .set(f64::from(to));
        Ok(Advance::Punctured { from, to })
    }

    /// Publishes a key on an instance without a live key.
    pub fn publish(&self, live: LiveKey) {
        let epoch = live.handle.epoch();
        let old = self.live.write().replace(live);
        drop(old);
        metrics::gauge!(METRICS_KEY_KEY_LIVE, METRICS_LABEL_INSTANCE => self.name.clone()).set(1.0);
        metrics::gauge!(METRICS_KEY_EPOCH_CURRENT, METRICS_LABEL_INSTANCE => self.name.clone())
            .set(f64::from(epoch));
    }

    /// Replaces the live key and returns the old one.
    ///
    /// Only the swap happens under the write lock. The caller retires the
    /// returned key with [`LiveKey::retire`].
    #[instrument(level = "debug", skip_all, fields(instance = %self.name))]
    pub fn rotate(&self, live: LiveKey) -> Option<LiveKey> {
        let epoch = live.handle.epoch();
        let old = self.live.write().replace(live);
        metrics::counter!(METRICS_KEY_KEY_ROTATIONS, METRICS_LABEL_INSTANCE => self.name.clone())
            .increment(1);
        metrics::gauge!(METRICS_KEY_KEY_LIVE, METRICS_LABEL_INSTANCE => self.name.clone()).set(1.0);
        metrics::gauge!(METRICS_KEY_EPOCH_CURRENT, METRICS_LABEL_INSTANCE => self.name.clone())
            .set(f64::from(epoch));
        old
    }

    /// Drops the live key.
    pub fn release(&self) {
        if let Some(live) = self.live.write().take() {
            tracing::info!("releasing key of instance {}", self.name);
            live.handle.release();
        }
        metrics::gauge!(METRICS_KEY_KEY_LIVE, METRICS_LABEL_INSTANCE => self.name.clone()).set(0.0);
    }
}
