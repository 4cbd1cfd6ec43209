#![deny(missing_docs)]
//! Core type definitions for the STAR randomness service and its clients.
//!
//! This crate groups together the message structures exchanged with the
//! randomness service. It provides:
//!
//! * The request and response payloads of the public HTTP API (see [`api`] module).
//! * The supported wire encodings for curve points (see [`PointEncoding`]).
//!
//! Points are always transferred as the 32-byte compressed encoding of a
//! Ristretto group element. How those bytes are written into JSON strings is
//! decided by the [`PointEncoding`] the client asks for.

use std::fmt;

use base64::prelude::{BASE64_STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

pub mod api;

/// Length in bytes of a compressed Ristretto point.
pub const COMPRESSED_POINT_LEN: usize = 32;

/// The string encoding of points in requests and responses.
///
/// `base64` (standard alphabet, padded) is the default. `hex` is the encoding
/// used by the first generation of the service and is only used when a client
/// asks for it explicitly.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PointEncoding {
    /// Standard base64 with padding.
    #[default]
    Base64,
    /// Lowercase hexadecimal.
    Hex,
}

/// Error returned when a point string cannot be decoded.
#[derive(Debug, thiserror::Error)]
pub enum PointDecodeError {
    /// The string is not valid base64.
    #[error(transparent)]
    Base64(#[from] base64::DecodeError),
    /// The string is not valid hex.
    #[error(transparent)]
    Hex(#[from] hex::FromHexError),
}

impl PointEncoding {
    /// Decodes a single point string into its raw bytes.
    ///
    /// This only removes the string encoding. Whether the bytes describe a
    /// valid curve point is checked by the service.
    pub fn decode(&self, encoded: &str) -> Result<Vec<u8>, PointDecodeError> {
        match self {
            PointEncoding::Base64 => Ok(BASE64_STANDARD.decode(encoded)?),
            PointEncoding::Hex => Ok(hex::decode(encoded)?),
        }
    }

    /// Encodes raw point bytes.
    pub fn encode(&self, raw: impl AsRef<[u8]>) -> String {
        match self {
            PointEncoding::Base64 => BASE64_STANDARD.encode(raw),
            PointEncoding::Hex => hex::encode(raw),
        }
    }
}

impl fmt::Display for PointEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PointEncoding::Base64 => f.write_str("base64"),
            PointEncoding::Hex => f.write_str("hex"),
        }
    }
}
