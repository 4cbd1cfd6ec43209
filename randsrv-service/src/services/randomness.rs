//! Randomness evaluation service.
//!
//! Validates randomness requests and evaluates their points with the live key
//! of an instance. All points of a request are evaluated under a single read
//! guard, so a request never observes two different keys or epochs.

use base64::prelude::{BASE64_STANDARD, Engine as _};
use curve25519_dalek::ristretto::CompressedRistretto;
use eyre::Context as _;
use randsrv_types::{
    PointEncoding,
    api::{InfoResponse, ListInstancesResponse, RandomnessRequest, RandomnessResponse},
};
use tracing::instrument;

use crate::{
    metrics::{METRICS_KEY_POINTS_EVALUATED, METRICS_LABEL_INSTANCE},
    services::instance_registry::InstanceRegistry,
};

/// Default for the maximum number of points per request.
pub const DEFAULT_MAX_POINTS: usize = 1024;

/// Errors returned by the [`RandomnessService`].
///
/// This error type is mostly used in API contexts, meaning it should be digested by the
/// [`crate::api::errors`] module.
#[derive(Debug, thiserror::Error)]
pub(crate) enum RandomnessServiceError {
    #[error("instance '{0}' not found")]
    InstanceNotFound(String),
    #[error("instance '{0}' is not ready")]
    NotReady(String),
    #[error("no request body")]
    EmptyBody,
    #[error("failed to decode JSON")]
    BadJson,
    #[error("no EC points in request body")]
    NoPoints,
    #[error("too many points for a single request: {count} > {max}")]
    TooManyPoints { count: usize, max: usize },
    #[error("failed to decode EC point")]
    DecodePoint,
    #[error("failed to parse EC point")]
    ParsePoint,
    #[error("invalid epoch {0}")]
    BadEpoch(u8),
    #[error(transparent)]
    InternalServerError(#[from] eyre::Report),
}

/// Evaluates randomness requests against an [`InstanceRegistry`].
#[derive(Clone)]
pub(crate) struct RandomnessService {
    registry: InstanceRegistry,
    max_points: usize,
    max_future_epochs: Option<u8>,
}

impl RandomnessService {
    pub(crate) fn new(
        registry: InstanceRegistry,
        max_points: usize,
        max_future_epochs: Option<u8>,
    ) -> Self {
        Self {
            registry,
            max_points,
            max_future_epochs,
        }
    }

    pub(crate) fn default_instance(&self) -> &str {
        self.registry.default_instance()
    }

    /// Parses and evaluates a raw request body for `instance`.
    #[instrument(level = "debug", skip(self, body))]
    pub(crate) fn evaluate(
        &self,
        instance: &str,
        body: &[u8],
        encoding: PointEncoding,
    ) -> Result<RandomnessResponse, RandomnessServiceError> {
        let oprf_instance = self
            .registry
            .get(instance)
            .ok_or_else(|| RandomnessServiceError::InstanceNotFound(instance.to_owned()))?;
        if body.is_empty() {
            return Err(RandomnessServiceError::EmptyBody);
        }
        let request: RandomnessRequest =
            serde_json::from_slice(body).map_err(|_| RandomnessServiceError::BadJson)?;
        if request.points.is_empty() {
            return Err(RandomnessServiceError::NoPoints);
        }
        if request.points.len() > self.max_points {
            return Err(RandomnessServiceError::TooManyPoints {
                count: request.points.len(),
                max: self.max_points,
            });
        }
        tracing::debug!("evaluating {} points", request.points.len());
        let points = request
            .points
            .iter()
            .map(|point| {
                let bytes = encoding
                    .decode(point)
                    .map_err(|_| RandomnessServiceError::DecodePoint)?;
                CompressedRistretto::from_slice(&bytes)
                    .ok()
                    .and_then(|compressed| compressed.decompress())
                    .ok_or(RandomnessServiceError::ParsePoint)?;
                Ok(bytes)
            })
            .collect::<Result<Vec<_>, RandomnessServiceError>>()?;

        let live = oprf_instance
            .read_key()
            .ok_or_else(|| RandomnessServiceError::NotReady(instance.to_owned()))?;
        let current = live.handle.epoch();
        let epoch = request.epoch.unwrap_or(current);
        if !live.handle.covers(epoch)
            || self
                .max_future_epochs
                .is_some_and(|max| epoch - current > max)
        {
            return Err(RandomnessServiceError::BadEpoch(epoch));
        }
        let points = points
            .iter()
            .map(|point| {
                let evaluation = live
                    .handle
                    .evaluate(point, epoch, false)
                    .context("while evaluating point")?;
                Ok(encoding.encode(evaluation.output.as_bytes()))
            })
            .collect::<eyre::Result<Vec<_>>>()?;
        drop(live);

        metrics::counter!(METRICS_KEY_POINTS_EVALUATED, METRICS_LABEL_INSTANCE => instance.to_owned())
            .increment(points.len() as u64);
        Ok(RandomnessResponse { points, epoch })
    }

    /// Public key and epoch information of `instance`.
    pub(crate) fn info(&self, instance: &str) -> Result<InfoResponse, RandomnessServiceError> {
        let snapshot = self
            .registry
            .get(instance)
            .ok_or_else(|| RandomnessServiceError::InstanceNotFound(instance.to_owned()))?
            .snapshot()
            .ok_or_else(|| RandomnessServiceError::NotReady(instance.to_owned()))?;
        Ok(InfoResponse {
            public_key: BASE64_STANDARD.encode(snapshot.public_key),
            current_epoch: snapshot.epoch,
            next_epoch_time: snapshot.next_epoch_time,
            max_points: self.max_points,
        })
    }

    pub(crate) fn list_instances(&self) -> ListInstancesResponse {
        ListInstancesResponse {
            instances: self.registry.names().to_vec(),
            default_instance: self.registry.default_instance().to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use curve25519_dalek::ristretto::RistrettoPoint;
    use rand::rngs::OsRng;
    use time::OffsetDateTime;

    use super::*;
    use crate::services::{
        epoch_clock::EpochDuration,
        key_source::{KeySourceService, LocalKeySource},
    };

    async fn service(max_points: usize, max_future_epochs: Option<u8>) -> RandomnessService {
        let now = OffsetDateTime::now_utc();
        let registry = InstanceRegistry::from_config(
            &[String::from("main")],
            &["1w".parse::<EpochDuration>().expect("valid")],
            now,
            0,
            255,
            now,
        )
        .expect("valid config");
        let key_source: KeySourceService = Arc::new(LocalKeySource);
        registry
            .initialize(&key_source, now)
            .await
            .expect("can initialize");
        RandomnessService::new(registry, max_points, max_future_epochs)
    }

    fn body(count: usize, epoch: Option<u8>) -> (Vec<[u8; 32]>, Vec<u8>) {
        let points = (0..count)
            .map(|_| RistrettoPoint::random(&mut OsRng).compress().to_bytes())
            .collect::<Vec<_>>();
        let request = RandomnessRequest::from_raw_points(&points, epoch, PointEncoding::Base64);
        let body = serde_json::to_vec(&request).expect("can serialize");
        (points, body)
    }

    #[tokio::test]
    async fn preserves_order() {
        let service = service(DEFAULT_MAX_POINTS, None).await;
        let (points, body) = body(16, None);
        let response = service
            .evaluate("main", &body, PointEncoding::Base64)
            .expect("can evaluate");
        assert_eq!(response.epoch, 0);
        assert_eq!(response.points.len(), points.len());
        let instance = service.registry.get("main").expect("exists");
        let live = instance.read_key().expect("is live");
        for (point, evaluated) in points.iter().zip(response.points) {
            let expected = live.handle.evaluate(point, 0, false).expect("can evaluate");
            assert_eq!(
                PointEncoding::Base64.encode(expected.output.as_bytes()),
                evaluated
            );
        }
    }

    #[tokio::test]
    async fn epoch_policy() {
        let service = service(DEFAULT_MAX_POINTS, Some(3)).await;
        let (_, future) = body(1, Some(3));
        assert_eq!(
            service
                .evaluate("main", &future, PointEncoding::Base64)
                .expect("future epoch within bound")
                .epoch,
            3
        );
        let (_, too_far) = body(1, Some(4));
        assert!(matches!(
            service.evaluate("main", &too_far, PointEncoding::Base64),
            Err(RandomnessServiceError::BadEpoch(4))
        ));

        let unbounded = self::service(DEFAULT_MAX_POINTS, None).await;
        let (_, last) = body(1, Some(255));
        unbounded
            .evaluate("main", &last, PointEncoding::Base64)
            .expect("last epoch is available");

        let instance = unbounded.registry.get("main").expect("exists");
        let position = instance
            .schedule()
            .position_at(OffsetDateTime::now_utc() + time::Duration::weeks(2))
            .expect("after base");
        instance.advance(&position).expect("can advance");
        let (_, past) = body(1, Some(1));
        assert!(matches!(
            unbounded.evaluate("main", &past, PointEncoding::Base64),
            Err(RandomnessServiceError::BadEpoch(1))
        ));
    }

    #[tokio::test]
    async fn too_many_points() {
        let service = service(2, None).await;
        let (_, body) = body(3, None);
        assert!(matches!(
            service.evaluate("main", &body, PointEncoding::Base64),
            Err(RandomnessServiceError::TooManyPoints { count: 3, max: 2 })
        ));
        assert!(matches!(
            service.evaluate("other", &body, PointEncoding::Base64),
            Err(RandomnessServiceError::InstanceNotFound(_))
        ));
    }
}
