//! HMAC-SHA256 metric signatures
//!
//! The signed message is `<id>:<kind>:<value>` with gauges printed to six
//! decimals, e.g. `PollCount:counter:5` or `Sys:gauge:13220880.000000`.
//! Agent and server must agree on this byte-for-byte.

use crate::metric::{MetricDto, MetricError, MetricValue};
use ring::hmac;
use std::fmt;

/// Shared-secret signer. Cheap to clone.
#[derive(Clone)]
pub struct Signer {
    key: hmac::Key,
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer").finish_non_exhaustive()
    }
}

fn message(name: &str, value: &MetricValue) -> String {
    format!("{}:{}", name, value.canonical())
}

impl Signer {
    pub fn new(secret: &str) -> Self {
        Signer {
            key: hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes()),
        }
    }

    /// `None` when no secret is configured, which disables signing
    pub fn from_secret(secret: Option<&str>) -> Option<Self> {
        secret.filter(|s| !s.is_empty()).map(Signer::new)
    }

    /// Hex-encoded HMAC of the canonical metric string
    pub fn sign(&self, name: &str, value: &MetricValue) -> String {
        let tag = hmac::sign(&self.key, message(name, value).as_bytes());
        hex::encode(tag.as_ref())
    }

    /// Constant-time check of a hex signature
    pub fn verify(&self, name: &str, value: &MetricValue, hash: &str) -> Result<(), MetricError> {
        let tag = hex::decode(hash).map_err(|_| MetricError::HashCheckFailed(name.to_string()))?;
        hmac::verify(&self.key, message(name, value).as_bytes(), &tag)
            .map_err(|_| MetricError::HashCheckFailed(name.to_string()))
    }

    /// Wire form with `hash` filled in
    pub fn signed_dto(&self, name: &str, value: &MetricValue) -> MetricDto {
        MetricDto::new(name, value).with_hash(self.sign(name, value))
    }

    /// Verify a decoded DTO. A missing hash is a mismatch.
    pub fn verify_dto(&self, dto: &MetricDto, value: &MetricValue) -> Result<(), MetricError> {
        match dto.hash.as_deref() {
            Some(hash) => self.verify(&dto.id, value, hash),
            None => Err(MetricError::HashCheckFailed(dto.id.clone())),
        }
    }
}

/// Wire form of a value, signed when a signer is present
pub fn to_dto(signer: Option<&Signer>, name: &str, value: &MetricValue) -> MetricDto {
    match signer {
        Some(signer) => signer.signed_dto(name, value),
        None => MetricDto::new(name, value),
    }
}
