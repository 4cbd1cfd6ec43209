//! # API types
//!
//! Data transfer objects for the public randomness API.
//!
//! Field names of the info payload are camelCase so existing clients keep
//! working.
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::PointEncoding;

/// A request to evaluate a batch of points.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RandomnessRequest {
    /// Encoded, compressed Ristretto points to evaluate.
    pub points: Vec<String>,
    /// Optional epoch to evaluate in. Defaults to the current epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch: Option<u8>,
}

/// Server response to a [`RandomnessRequest`].
///
/// The points are in one-to-one correspondence with the request points.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RandomnessResponse {
    /// Encoded, compressed evaluated points.
    pub points: Vec<String>,
    /// The epoch used for the evaluation.
    pub epoch: u8,
}

/// Query parameters accepted by the randomness endpoints.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct EncodingQuery {
    /// Encoding of the request and response points.
    #[serde(default)]
    pub encoding: PointEncoding,
}

/// Epoch and key metadata of an instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InfoResponse {
    /// Base64 encoded, bincode serialized public key of the server.
    pub public_key: String,
    /// The currently active epoch.
    pub current_epoch: u8,
    /// Time of the next epoch rotation.
    #[serde(with = "time::serde::rfc3339")]
    pub next_epoch_time: OffsetDateTime,
    /// Maximum number of points accepted in a single request.
    pub max_points: usize,
}

/// Available instances of a server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListInstancesResponse {
    /// Names of all instances.
    pub instances: Vec<String>,
    /// The instance that serves `/info` and `/randomness`.
    pub default_instance: String,
}

impl RandomnessRequest {
    /// Encodes raw points with the given encoding into a request.
    pub fn from_raw_points<P: AsRef<[u8]>>(
        points: impl IntoIterator<Item = P>,
        epoch: Option<u8>,
        encoding: PointEncoding,
    ) -> Self {
        Self {
            points: points.into_iter().map(|p| encoding.encode(p)).collect(),
            epoch,
        }
    }
}
