//! This module provides [`KeyHandle`], the sole owner of one PPOPRF server
//! and its secret key material.
//!
//! A handle covers the epochs `first_epoch..=last_epoch`. Its counter points at
//! the lowest epoch that is not punctured yet and only moves forward. Once the
//! last epoch is punctured the handle is exhausted and must be replaced.
//!
//! The handle is intentionally not `Clone`. The secret key leaves the handle
//! only through [`KeyHandle::export`], which the leader uses to serve its key
//! to followers.

use ppoprf::PPRFError;
use ppoprf::ppoprf::{Evaluation, Point, Server, ServerKeyState, ServerKeyStateRef};
use randsrv_types::COMPRESSED_POINT_LEN;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::instrument;

use crate::services::epoch_clock::EpochSchedule;

/// Errors returned by the [`KeyHandle`].
#[derive(Debug, thiserror::Error)]
pub enum KeyHandleError {
    /// The PPOPRF server could not be created.
    #[error("cannot create PPOPRF key: {0}")]
    KeyCreationFailed(#[source] PPRFError),
    /// The last epoch of the key is punctured.
    #[error("all epochs of the key are punctured")]
    EpochExhausted,
    /// The epoch was punctured before.
    #[error("epoch {0} is already punctured")]
    EpochAlreadyPunctured(u8),
    /// The epoch is outside of the key's range.
    #[error("epoch {0} is outside of the key range")]
    EpochOutOfRange(u8),
    /// The key cannot evaluate in the requested epoch.
    #[error("epoch {0} is not available for evaluation")]
    EpochUnavailable(u8),
    /// The point is not a compressed point.
    #[error("expected {COMPRESSED_POINT_LEN} bytes for a point, got {0}")]
    BadPointLength(usize),
    /// The PPOPRF evaluation failed.
    #[error("evaluation failed: {0}")]
    EvalFailed(#[source] PPRFError),
    /// The PPOPRF server refused to puncture.
    #[error("cannot puncture epoch {epoch}: {source}")]
    Puncture {
        /// The epoch that failed.
        epoch: u8,
        /// Error of the PPOPRF server.
        source: PPRFError,
    },
    /// The public key cannot be serialized.
    #[error("cannot serialize public key: {0}")]
    Serialization(#[source] PPRFError),
}

/// Key state exchanged between leader and followers.
///
/// `elapsed` is the schedule position the key state belongs to and serves as
/// its version. It is only meaningful for a follower running the same
/// schedule, so the state carries the leader's base time and duration.
#[derive(Deserialize)]
pub struct SyncState {
    /// Secret key state of the PPOPRF server.
    pub key_state: ServerKeyState,
    /// Lowest unpunctured epoch of the key.
    pub epoch: u8,
    /// Boundaries crossed since the schedule base time.
    pub elapsed: u64,
    /// Base time of the leader's schedule.
    pub base_time: OffsetDateTime,
    /// Epoch duration of the leader's schedule.
    pub duration: String,
}

/// Borrowed counterpart of [`SyncState`] for serialization.
#[derive(Serialize)]
pub struct SyncStateRef<'a> {
    /// Secret key state of the PPOPRF server.
    pub key_state: ServerKeyStateRef<'a>,
    /// Lowest unpunctured epoch of the key.
    pub epoch: u8,
    /// Boundaries crossed since the schedule base time.
    pub elapsed: u64,
    /// Base time of the leader's schedule.
    pub base_time: OffsetDateTime,
    /// Epoch duration of the leader's schedule.
    pub duration: String,
}

/// Owner of a PPOPRF server.
pub struct KeyHandle {
    server: Server,
    epoch: u8,
    first_epoch: u8,
    last_epoch: u8,
    exhausted: bool,
    public_key: Vec<u8>,
}

impl KeyHandle {
    /// Creates a fresh key covering `first_epoch..=last_epoch`.
    pub fn create(first_epoch: u8, last_epoch: u8) -> Result<Self, KeyHandleError> {
        if first_epoch > last_epoch {
            return Err(KeyHandleError::EpochOutOfRange(first_epoch));
        }
        let server = Server::new((first_epoch..=last_epoch).collect())
            .map_err(KeyHandleError::KeyCreationFailed)?;
        Self::from_server(server, first_epoch, first_epoch, last_epoch)
    }

    /// Punctures all epochs before `epoch`.
    ///
    /// Used when a key is placed in the middle of a schedule, so it cannot
    /// evaluate in epochs that already passed.
    #[instrument(level = "debug", skip(self))]
    pub fn skip_to(&mut self, epoch: u8) -> Result<(), KeyHandleError> {
        if !(self.first_epoch..=self.last_epoch).contains(&epoch) {
            return Err(KeyHandleError::EpochOutOfRange(epoch));
        }
        if epoch < self.epoch {
            return Err(KeyHandleError::EpochAlreadyPunctured(epoch));
        }
        if epoch > self.epoch {
            tracing::debug!("puncturing obsolete epochs {}..{epoch}", self.epoch);
            self.puncture(epoch - 1)?;
        }
        Ok(())
    }

    /// Restores a key from the [`SyncState`] of a leader.
    pub fn import(
        first_epoch: u8,
        last_epoch: u8,
        state: SyncState,
    ) -> Result<Self, KeyHandleError> {
        if !(first_epoch..=last_epoch).contains(&state.epoch) {
            return Err(KeyHandleError::EpochOutOfRange(state.epoch));
        }
        let mut server = Server::new((first_epoch..=last_epoch).collect())
            .map_err(KeyHandleError::KeyCreationFailed)?;
        server.set_private_key(state.key_state);
        Self::from_server(server, state.epoch, first_epoch, last_epoch)
    }

    fn from_server(
        server: Server,
        epoch: u8,
        first_epoch: u8,
        last_epoch: u8,
    ) -> Result<Self, KeyHandleError> {
        let public_key = server
            .get_public_key()
            .serialize_to_bincode()
            .map_err(KeyHandleError::Serialization)?;
        Ok(Self {
            server,
            epoch,
            first_epoch,
            last_epoch,
            exhausted: false,
            public_key,
        })
    }

    /// Borrows the key state for a follower.
    ///
    /// `elapsed` is the position of `schedule` the key is at.
    pub fn export(&self, schedule: &EpochSchedule, elapsed: u64) -> SyncStateRef<'_> {
        SyncStateRef {
            key_state: self.server.get_private_key(),
            epoch: self.epoch,
            elapsed,
            base_time: schedule.base_time(),
            duration: schedule.duration().to_string(),
        }
    }

    /// Punctures every unpunctured epoch up to and including `epoch`.
    ///
    /// Puncturing the last epoch of the range returns
    /// [`KeyHandleError::EpochExhausted`] and leaves the handle unusable.
    pub fn puncture(&mut self, epoch: u8) -> Result<(), KeyHandleError> {
        if self.exhausted {
            return Err(KeyHandleError::EpochExhausted);
        }
        if !(self.first_epoch..=self.last_epoch).contains(&epoch) {
            return Err(KeyHandleError::EpochOutOfRange(epoch));
        }
        if epoch < self.epoch {
            return Err(KeyHandleError::EpochAlreadyPunctured(epoch));
        }
        for md in self.epoch..=epoch {
            self.server
                .puncture(md)
                .map_err(|source| KeyHandleError::Puncture { epoch: md, source })?;
        }
        if epoch == self.last_epoch {
            self.exhausted = true;
            return Err(KeyHandleError::EpochExhausted);
        }
        self.epoch = epoch + 1;
        Ok(())
    }

    /// Evaluates a compressed point in `epoch`.
    pub fn evaluate(
        &self,
        point: &[u8],
        epoch: u8,
        verifiable: bool,
    ) -> Result<Evaluation, KeyHandleError> {
        if !self.covers(epoch) {
            return Err(KeyHandleError::EpochUnavailable(epoch));
        }
        if point.len() != COMPRESSED_POINT_LEN {
            return Err(KeyHandleError::BadPointLength(point.len()));
        }
        self.server
            .eval(&Point::from(point), epoch, verifiable)
            .map_err(KeyHandleError::EvalFailed)
    }

    /// Returns `true` if the key can still evaluate in `epoch`.
    pub fn covers(&self, epoch: u8) -> bool {
        !self.exhausted && epoch >= self.epoch && epoch <= self.last_epoch
    }

    /// The bincode serialized public key.
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// The lowest unpunctured epoch.
    pub fn epoch(&self) -> u8 {
        self.epoch
    }

    /// The last epoch the key was created for.
    pub fn last_epoch(&self) -> u8 {
        self.last_epoch
    }

    /// Returns `true` once the last epoch is punctured.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Releases the key material.
    pub fn release(self) {
        drop(self)
    }
}

impl Drop for KeyHandle {
    fn drop(&mut self) {
        tracing::debug!("releasing key material (epoch {})", self.epoch);
    }
}
