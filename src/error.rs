use std::collections::BTreeMap;

use serde_json::Value;
use thiserror::Error;

use crate::cache::KeyError;

/// Normalized failure reported by a [`Transport`](crate::transport::Transport).
///
/// Coordinators only understand this shape, never transport-specific errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    #[error("network error: {message}")]
    Network {
        message: String,
        details: Option<Value>,
    },
    #[error("server error ({status}): {message}")]
    Server {
        status: u16,
        message: String,
        details: Option<Value>,
    },
    #[error("validation failed: {message}")]
    Validation {
        message: String,
        fields: BTreeMap<String, Vec<String>>,
    },
    #[error("unexpected response shape: {message}")]
    Decode { message: String },
    #[error("request cancelled")]
    Cancelled,
}

impl TransportError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            details: None,
        }
    }

    pub fn server(status: u16, message: impl Into<String>) -> Self {
        Self::Server {
            status,
            message: message.into(),
            details: None,
        }
    }

    pub fn validation(
        message: impl Into<String>,
        fields: BTreeMap<String, Vec<String>>,
    ) -> Self {
        Self::Validation {
            message: message.into(),
            fields,
        }
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Attach structured details to network and server errors.
    #[must_use]
    pub fn with_details(mut self, value: Value) -> Self {
        match &mut self {
            Self::Network { details, .. } | Self::Server { details, .. } => {
                *details = Some(value);
            }
            Self::Validation { .. } | Self::Decode { .. } | Self::Cancelled => {}
        }
        self
    }

    /// Human-readable message of the normalized `{message, details?}` shape.
    pub fn message(&self) -> &str {
        match self {
            Self::Network { message, .. }
            | Self::Server { message, .. }
            | Self::Validation { message, .. }
            | Self::Decode { message } => message,
            Self::Cancelled => "request cancelled",
        }
    }

    /// Structured details of the normalized `{message, details?}` shape.
    pub fn details(&self) -> Option<Value> {
        match self {
            Self::Network { details, .. } | Self::Server { details, .. } => details.clone(),
            Self::Validation { fields, .. } => serde_json::to_value(fields).ok(),
            Self::Decode { .. } | Self::Cancelled => None,
        }
    }

    /// Network failures and 5xx responses may be retried by reads.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. } => true,
            Self::Server { status, .. } => *status >= 500,
            Self::Validation { .. } | Self::Decode { .. } | Self::Cancelled => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Errors surfaced by the cache layer.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CacheError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("cache entry {key} does not hold a value of type {expected}")]
    TypeMismatch { key: String, expected: &'static str },
    #[error("fetching is disabled for {key} and nothing is cached")]
    Disabled { key: String },
    #[error("invalid cache key: {0}")]
    Key(#[from] KeyError),
}

impl CacheError {
    pub fn type_mismatch<T>(key: impl Into<String>) -> Self {
        Self::TypeMismatch {
            key: key.into(),
            expected: std::any::type_name::<T>(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Transport(TransportError::Cancelled))
    }

    pub fn transport(&self) -> Option<&TransportError> {
        match self {
            Self::Transport(error) => Some(error),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn retry_classification() {
        assert!(TransportError::network("connection reset").is_retryable());
        assert!(TransportError::server(503, "unavailable").is_retryable());
        assert!(!TransportError::server(404, "not found").is_retryable());
        assert!(!TransportError::validation("bad input", BTreeMap::new()).is_retryable());
        assert!(!TransportError::decode("expected object").is_retryable());
        assert!(!TransportError::Cancelled.is_retryable());
    }

    #[test]
    fn normalized_shape_exposes_message_and_details() {
        let error = TransportError::server(500, "boom").with_details(json!({"trace": "abc"}));
        assert_eq!(error.message(), "boom");
        assert_eq!(error.details(), Some(json!({"trace": "abc"})));

        let mut fields = BTreeMap::new();
        fields.insert("name".to_string(), vec!["is required".to_string()]);
        let error = TransportError::validation("invalid", fields);
        assert_eq!(error.details(), Some(json!({"name": ["is required"]})));
    }

    #[test]
    fn cancelled_is_detected_through_cache_error() {
        let error = CacheError::from(TransportError::Cancelled);
        assert!(error.is_cancelled());
        assert!(!CacheError::from(TransportError::network("x")).is_cancelled());
    }

    #[test]
    fn type_mismatch_names_expected_type() {
        let error = CacheError::type_mismatch::<String>("[\"docs\"]");
        assert!(error.to_string().contains("alloc::string::String"));
    }
}
