use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::outbox::Endpoint;
use crate::ErrorClass;

pub const MAX_URL_LENGTH: usize = 2048;

/// Acknowledged delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Option<Value>,
}

impl ApiResponse {
    #[must_use]
    pub fn ok() -> Self {
        Self {
            status: 200,
            body: None,
        }
    }

    #[must_use]
    pub fn with_body(body: Value) -> Self {
        Self {
            status: 200,
            body: Some(body),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("network error: {message}")]
    Network { message: String },

    #[error("timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("HTTP error {status}: {message}")]
    Status { status: u16, message: String },

    #[error("invalid response: {reason}")]
    InvalidResponse { reason: String },

    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
}

impl ApiError {
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        ApiError::Status {
            status,
            message: message.into(),
        }
    }

    #[must_use]
    pub const fn error_class(&self) -> ErrorClass {
        match self {
            ApiError::Network { .. } | ApiError::Timeout { .. } => ErrorClass::Transient,
            ApiError::Status { status, .. } => match *status {
                408 | 429 | 500..=599 => ErrorClass::Transient,
                _ => ErrorClass::Permanent,
            },
            ApiError::InvalidResponse { .. } | ApiError::InvalidUrl { .. } => {
                ErrorClass::Permanent
            }
        }
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.error_class().is_retryable()
    }
}

/// Delivers one outbox entry to the backend.
///
/// `Ok` means the remote acknowledged the operation; the entry is removed.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn send(&self, endpoint: &Endpoint, payload: &Value) -> Result<ApiResponse, ApiError>;
}

/// Maps logical endpoints onto backend REST paths for shell HTTP adapters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiRoutes {
    base: Url,
    user_id: String,
}

impl ApiRoutes {
    pub fn new(base: &str, user_id: impl Into<String>) -> Result<Self, ApiError> {
        let invalid = |reason: String| ApiError::InvalidUrl {
            url: base.chars().take(100).collect(),
            reason,
        };

        if base.trim().is_empty() {
            return Err(invalid("URL cannot be empty".to_string()));
        }
        if base.len() > MAX_URL_LENGTH {
            return Err(invalid(format!(
                "URL exceeds maximum length of {MAX_URL_LENGTH} bytes"
            )));
        }

        let mut parsed = Url::parse(base).map_err(|e| invalid(e.to_string()))?;

        let scheme = parsed.scheme().to_lowercase();
        if scheme != "http" && scheme != "https" {
            return Err(invalid(format!(
                "invalid scheme '{scheme}', only 'http' and 'https' are allowed"
            )));
        }
        if parsed.host_str().is_none() {
            return Err(invalid("URL must have a host".to_string()));
        }
        if !parsed.username().is_empty() || parsed.password().is_some() {
            return Err(invalid("credentials in URL are not allowed".to_string()));
        }

        if !parsed.path().ends_with('/') {
            let path = format!("{}/", parsed.path());
            parsed.set_path(&path);
        }

        let user_id = user_id.into();
        if user_id.trim().is_empty() {
            return Err(invalid("user id cannot be empty".to_string()));
        }

        Ok(Self {
            base: parsed,
            user_id,
        })
    }

    pub fn resolve(&self, endpoint: &Endpoint, payload: &Value) -> Result<Url, ApiError> {
        let path = match endpoint {
            Endpoint::RecordEmergencyLocation => "locations/emergency".to_string(),
            Endpoint::NotifyContacts => format!(
                "emergency-contacts/users/{}/notify-emergency",
                self.user_id
            ),
            Endpoint::CancelNotify => {
                format!("emergency-contacts/users/{}/notify-safe", self.user_id)
            }
            Endpoint::BatteryCritical => "notifications/battery-critical".to_string(),
            Endpoint::BatteryLog => "battery/log".to_string(),
            Endpoint::ZoneTransition => {
                let zone = payload
                    .get("zoneId")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ApiError::InvalidUrl {
                        url: endpoint.to_string(),
                        reason: "payload has no zoneId".to_string(),
                    })?;
                let transition = match payload.get("transition").and_then(Value::as_str) {
                    Some("exit") => "exit",
                    _ => "entry",
                };
                format!("safe-zones/{zone}/{transition}")
            }
            Endpoint::Custom(path) => path.trim_start_matches('/').to_string(),
        };

        self.base.join(&path).map_err(|e| ApiError::InvalidUrl {
            url: path,
            reason: e.to_string(),
        })
    }
}
