//! Versioned, checksummed envelope for everything the core persists.
//!
//! Snapshots are CBOR-encoded, wrapped with magic bytes, a schema version and
//! a blake3 checksum of the payload, and the envelope itself is CBOR again.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

use crate::ErrorClass;

pub const CURRENT_SCHEMA_VERSION: u32 = 1;
const MAX_STORE_BYTES: usize = 16 * 1024 * 1024;
const STORE_MAGIC: &[u8; 4] = b"SFCR";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupted store: {reason}")]
    Corrupted { reason: &'static str },

    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityCheckFailed { expected: String, actual: String },

    #[error("schema version {found} is newer than supported {max}")]
    FutureSchema { found: u32, max: u32 },

    #[error("store too large: {size} bytes, max {max}")]
    StoreTooLarge { size: usize, max: usize },
}

impl StoreError {
    #[must_use]
    pub const fn error_class(&self) -> ErrorClass {
        ErrorClass::LocalResource
    }
}

impl From<ciborium::de::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

#[derive(Serialize, Deserialize, Debug)]
struct StoreEnvelope {
    magic: [u8; 4],
    schema_version: u32,
    checksum: [u8; 32],
    #[serde(with = "serde_bytes")]
    payload: Vec<u8>,
}

/// Encode `value` into a sealed envelope.
pub fn seal<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    let mut payload = Vec::new();
    ciborium::into_writer(value, &mut payload)?;

    let checksum = blake3::hash(&payload);

    let envelope = StoreEnvelope {
        magic: *STORE_MAGIC,
        schema_version: CURRENT_SCHEMA_VERSION,
        checksum: *checksum.as_bytes(),
        payload,
    };

    let mut bytes = Vec::new();
    ciborium::into_writer(&envelope, &mut bytes)?;

    if bytes.len() > MAX_STORE_BYTES {
        return Err(StoreError::StoreTooLarge {
            size: bytes.len(),
            max: MAX_STORE_BYTES,
        });
    }

    Ok(bytes)
}

/// Verify and decode an envelope produced by [`seal`].
pub fn open<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    if bytes.is_empty() {
        return Err(StoreError::Corrupted {
            reason: "empty value",
        });
    }

    if bytes.len() > MAX_STORE_BYTES {
        return Err(StoreError::StoreTooLarge {
            size: bytes.len(),
            max: MAX_STORE_BYTES,
        });
    }

    let envelope: StoreEnvelope = ciborium::from_reader(bytes)?;

    if envelope.magic != *STORE_MAGIC {
        return Err(StoreError::Corrupted {
            reason: "invalid magic bytes",
        });
    }

    if envelope.schema_version > CURRENT_SCHEMA_VERSION {
        return Err(StoreError::FutureSchema {
            found: envelope.schema_version,
            max: CURRENT_SCHEMA_VERSION,
        });
    }

    let actual_checksum = blake3::hash(&envelope.payload);
    if actual_checksum.as_bytes() != &envelope.checksum {
        return Err(StoreError::IntegrityCheckFailed {
            expected: hex::encode(envelope.checksum),
            actual: hex::encode(actual_checksum.as_bytes()),
        });
    }

    Ok(ciborium::from_reader(&envelope.payload[..])?)
}
