//! This module provides [`InstanceRegistry`], the set of named OPRF instances
//! a server runs.
//!
//! The registry is built once from the configuration and shared with the
//! request handlers and the epoch drivers. Cloning the registry is cheap.

use std::{collections::BTreeMap, sync::Arc};

use time::OffsetDateTime;
use tracing::instrument;

use crate::services::{
    epoch_clock::{EpochClockError, EpochDuration, EpochSchedule},
    instance::OprfInstance,
    key_source::{KeySourceError, KeySourceService},
};

/// Errors returned when building an [`InstanceRegistry`].
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// No instance name was configured.
    #[error("at least one instance name is required")]
    NoInstances,
    /// An instance name appears more than once.
    #[error("duplicate instance name '{0}'")]
    DuplicateInstance(String),
    /// Durations must be a single value or one per instance.
    #[error("got {durations} epoch durations for {instances} instances")]
    DurationCountMismatch {
        /// Number of instance names.
        instances: usize,
        /// Number of durations.
        durations: usize,
    },
    /// The schedule of an instance is invalid.
    #[error("instance '{instance}': {source}")]
    InvalidSchedule {
        /// The instance name.
        instance: String,
        /// Cause.
        source: EpochClockError,
    },
}

/// Named OPRF instances of this server.
#[derive(Clone)]
pub struct InstanceRegistry(Arc<RegistryInner>);

struct RegistryInner {
    instances: BTreeMap<String, Arc<OprfInstance>>,
    names: Vec<String>,
}

impl InstanceRegistry {
    /// Builds the instances from their names and epoch durations.
    ///
    /// `durations` either holds one duration shared by all instances or one
    /// duration per instance name. All instances share `base_time` and the
    /// epoch range. The base time must not lie after `now`.
    pub fn from_config(
        names: &[String],
        durations: &[EpochDuration],
        base_time: OffsetDateTime,
        first_epoch: u8,
        last_epoch: u8,
        now: OffsetDateTime,
    ) -> Result<Self, RegistryError> {
        if names.is_empty() {
            return Err(RegistryError::NoInstances);
        }
        if durations.len() != 1 && durations.len() != names.len() {
            return Err(RegistryError::DurationCountMismatch {
                instances: names.len(),
                durations: durations.len(),
            });
        }
        let mut instances = BTreeMap::new();
        for (idx, name) in names.iter().enumerate() {
            let duration = durations.get(idx).unwrap_or(&durations[0]);
            let schedule = EpochSchedule::new(base_time, *duration, first_epoch, last_epoch)
                .and_then(|schedule| schedule.position_at(now).map(|_| schedule))
                .map_err(|source| RegistryError::InvalidSchedule {
                    instance: name.to_owned(),
                    source,
                })?;
            let instance = Arc::new(OprfInstance::new(name.to_owned(), schedule));
            if instances.insert(name.to_owned(), instance).is_some() {
                return Err(RegistryError::DuplicateInstance(name.to_owned()));
            }
        }
        Ok(Self(Arc::new(RegistryInner {
            instances,
            names: names.to_vec(),
        })))
    }

    /// Looks up an instance by name.
    pub fn get(&self, name: &str) -> Option<Arc<OprfInstance>> {
        self.0.instances.get(name).cloned()
    }

    /// The instance behind `/info` and `/randomness`: the first configured name.
    pub fn default_instance(&self) -> &str {
        &self.0.names[0]
    }

    /// Instance names in configuration order.
    pub fn names(&self) -> &[String] {
        &self.0.names
    }

    pub fn instances(&self) -> impl Iterator<Item = &Arc<OprfInstance>> {
        self.0.instances.values()
    }

    /// Acquires a key for every instance.
    #[instrument(level = "info", skip_all)]
    pub async fn initialize(
        &self,
        key_source: &KeySourceService,
        now: OffsetDateTime,
    ) -> Result<(), KeySourceError> {
        for instance in self.instances() {
            let position = instance.schedule().position_at(now)?;
            let live = key_source.acquire(instance, &position).await?;
            tracing::info!(
                "instance {}: epoch now {}, next rotation = {}",
                instance.name(),
                live.handle.epoch(),
                live.next_epoch_time
            );
            instance.publish(live);
        }
        Ok(())
    }

    /// Returns `true` if every instance has a live key.
    pub fn is_ready(&self) -> bool {
        self.instances().all(|instance| instance.is_live())
    }

    /// Drops every live key.
    pub fn release_all(&self) {
        for instance in self.instances() {
            instance.release();
        }
    }
}
