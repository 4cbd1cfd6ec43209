//! Core services of the randomness server.
//!
//! # Services overview
//!
//! - [`epoch_clock`] – maps wall-clock time to epochs.
//! - [`key_handle`] – owns a single PPOPRF key and its puncture state.
//! - [`instance`] – a named schedule plus its live key behind a lock.
//! - [`instance_registry`] – all instances of the server.
//! - [`epoch_driver`] – background task that punctures and rotates keys.
//! - [`key_source`] – where new keys come from (local generation or the leader).
//! - [`randomness`] – validates and evaluates randomness requests.
pub(crate) mod epoch_clock;
pub(crate) mod epoch_driver;
pub(crate) mod instance;
pub(crate) mod instance_registry;
pub(crate) mod key_handle;
pub(crate) mod key_source;
pub(crate) mod randomness;
