//! Epoch rotation of an OPRF instance.
//!
//! This module provides [`epoch_driver_task`], a task that is spawned once per
//! instance. It sleeps until the next epoch boundary, punctures the epochs
//! that ended and replaces the key when it runs out of epochs.

use std::sync::Arc;

use eyre::Context as _;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use crate::services::{
    instance::{Advance, OprfInstance},
    key_source::KeySourceService,
};

/// Background task that advances the epochs of `instance`.
///
/// Returns an error if the instance cannot be advanced or no replacement key
/// can be acquired. In both cases the task cancels the `cancellation_token`,
/// which shuts down the service. The live key is released when the task stops.
pub(crate) async fn epoch_driver_task(
    instance: Arc<OprfInstance>,
    key_source: KeySourceService,
    cancellation_token: CancellationToken,
) -> eyre::Result<()> {
    // shutdown service if the driver encounters an error and drops this guard
    let _drop_guard = cancellation_token.drop_guard_ref();
    tracing::info!("starting epoch driver for instance {}", instance.name());
    let result = drive(&instance, &key_source, &cancellation_token).await;
    instance.release();
    match result {
        Ok(()) => {
            tracing::info!("stopped epoch driver for instance {}", instance.name());
            Ok(())
        }
        Err(err) => {
            tracing::error!(
                "epoch driver for instance {} encountered an error: {err:?}",
                instance.name()
            );
            Err(err)
        }
    }
}

async fn drive(
    instance: &OprfInstance,
    key_source: &KeySourceService,
    cancellation_token: &CancellationToken,
) -> eyre::Result<()> {
    loop {
        let next_epoch_time = instance
            .next_epoch_time()
            .ok_or_else(|| eyre::eyre!("instance {} has no live key", instance.name()))?;
        let sleep_duration = next_epoch_time - OffsetDateTime::now_utc();
        // negative durations mean we are behind
        if sleep_duration.is_positive() {
            tokio::select! {
                _ = tokio::time::sleep(sleep_duration.unsigned_abs()) => {}
                _ = cancellation_token.cancelled() => break,
            }
        } else {
            // behind schedule, let other tasks run before catching up
            tokio::task::yield_now().await;
            if cancellation_token.is_cancelled() {
                break;
            }
        }

        let position = instance
            .schedule()
            .position_at(OffsetDateTime::now_utc())
            .context("while computing epoch position")?;
        match instance
            .advance(&position)
            .context("while puncturing epoch")?
        {
            Advance::Current => {}
            Advance::Punctured { from, to } => {
                if to > from + 1 {
                    tracing::info!(
                        "instance {}: fell behind, punctured epochs {from}..{to}",
                        instance.name()
                    );
                }
                tracing::debug!(
                    "instance {}: epoch now {to}, next rotation = {}",
                    instance.name(),
                    position.next_boundary
                );
            }
            Advance::Exhausted => {
                let _replacing = instance.lock_replacement().await;
                tracing::info!("instance {}: epochs exhausted, rotating key", instance.name());
                let live = tokio::select! {
                    live = key_source.acquire(instance, &position) => {
                        live.context("while acquiring replacement key")?
                    }
                    _ = cancellation_token.cancelled() => break,
                };
                tracing::info!(
                    "instance {}: new key at epoch {}, next rotation = {}",
                    instance.name(),
                    live.handle.epoch(),
                    live.next_epoch_time
                );
                if let Some(old) = instance.rotate(live) {
                    tokio::task::spawn_blocking(move || old.retire())
                        .await
                        .context("while joining key retirement")?
                        .context("while retiring old key")?;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::services::{
        epoch_clock::{EpochDuration, EpochSchedule},
        instance::LiveKey,
        key_handle::KeyHandle,
        key_source::LocalKeySource,
    };

    fn instance(duration: Duration, first: u8, last: u8) -> Arc<OprfInstance> {
        let schedule = EpochSchedule::new(
            OffsetDateTime::now_utc(),
            EpochDuration::Fixed(duration),
            first,
            last,
        )
        .expect("valid schedule");
        Arc::new(OprfInstance::new("test", schedule))
    }

    async fn initialize(instance: &OprfInstance, key_source: &KeySourceService) {
        let position = instance
            .schedule()
            .position_at(OffsetDateTime::now_utc())
            .expect("after base");
        let live = key_source
            .acquire(instance, &position)
            .await
            .expect("can create key");
        instance.publish(live);
    }

    #[tokio::test]
    async fn advances_epochs() {
        let instance = instance(Duration::from_millis(1), 0, 255);
        let key_source: KeySourceService = Arc::new(LocalKeySource);
        initialize(&instance, &key_source).await;
        let start = instance.snapshot().expect("is live").epoch;

        let cancellation_token = CancellationToken::new();
        let driver = tokio::spawn(epoch_driver_task(
            Arc::clone(&instance),
            key_source,
            cancellation_token.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(10)).await;
        let snapshot = instance.snapshot().expect("is live");
        assert_ne!(snapshot.epoch, start);

        cancellation_token.cancel();
        driver
            .await
            .expect("driver does not panic")
            .expect("driver stops cleanly");
        assert!(!instance.is_live());
    }

    #[tokio::test]
    async fn driver_behind_schedule_yields() {
        let schedule = EpochSchedule::new(
            OffsetDateTime::now_utc() - Duration::from_millis(200),
            EpochDuration::Fixed(Duration::from_millis(1)),
            0,
            255,
        )
        .expect("valid schedule");
        let instance = Arc::new(OprfInstance::new("test", schedule));
        // the key starts at the base, 200 epochs behind
        let position = schedule
            .position_at(schedule.base_time())
            .expect("after base");
        let handle = KeyHandle::create(0, 255).expect("can create key");
        instance.publish(LiveKey::at(handle, &position));

        let cancellation_token = CancellationToken::new();
        let driver = tokio::spawn(epoch_driver_task(
            Arc::clone(&instance),
            Arc::new(LocalKeySource),
            cancellation_token.clone(),
        ));
        // single threaded runtime, every resumption needs the driver to yield
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        let snapshot = instance.snapshot().expect("is live");
        assert!(snapshot.epoch > 0, "driver never caught up");

        cancellation_token.cancel();
        driver
            .await
            .expect("driver does not panic")
            .expect("driver stops cleanly");
        assert!(!instance.is_live());
    }

    #[tokio::test]
    async fn rotates_exhausted_keys() {
        let instance = instance(Duration::from_millis(5), 0, 1);
        let key_source: KeySourceService = Arc::new(LocalKeySource);
        initialize(&instance, &key_source).await;
        let first_key = instance.snapshot().expect("is live").public_key;

        let cancellation_token = CancellationToken::new();
        let driver = tokio::spawn(epoch_driver_task(
            Arc::clone(&instance),
            key_source,
            cancellation_token.clone(),
        ));
        let mut rotated = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            if instance.snapshot().expect("is live").public_key != first_key {
                rotated = true;
                break;
            }
        }
        assert!(rotated, "key was never rotated");
        assert!(!cancellation_token.is_cancelled());

        cancellation_token.cancel();
        driver
            .await
            .expect("driver does not panic")
            .expect("driver stops cleanly");
    }
}
