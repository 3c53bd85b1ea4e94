use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::{Coordinate, ErrorClass, UnixTimeMs};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    #[serde(flatten)]
    pub coordinate: Coordinate,
    /// Meters, if the platform reports it.
    #[serde(rename = "accuracy")]
    pub accuracy_m: Option<f64>,
    pub timestamp: UnixTimeMs,
}

impl Position {
    #[must_use]
    pub fn new(coordinate: Coordinate, accuracy_m: Option<f64>, timestamp: UnixTimeMs) -> Self {
        Self {
            coordinate,
            accuracy_m,
            timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LocationError {
    #[error("location permission denied")]
    PermissionDenied,

    #[error("location unavailable: {0}")]
    Unavailable(String),

    #[error("location timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

impl LocationError {
    #[must_use]
    pub const fn error_class(&self) -> ErrorClass {
        ErrorClass::LocalResource
    }
}

/// Opaque handle returned by [`GeolocationProvider::watch_position`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WatchHandle(pub u64);

#[async_trait]
pub trait GeolocationProvider: Send + Sync {
    async fn current_position(&self, timeout: Duration) -> Result<Position, LocationError>;

    /// Start delivering position updates into `sink` until cleared.
    fn watch_position(&self, sink: mpsc::Sender<Position>) -> Result<WatchHandle, LocationError>;

    fn clear_watch(&self, handle: WatchHandle);
}
