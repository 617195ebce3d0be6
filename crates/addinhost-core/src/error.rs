//! Error types for addinhost

use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Result type alias using addinhost's Error
pub type Result<T> = std::result::Result<T, Error>;

/// A single handler fault collected during a publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFailure {
    pub topic: String,
    pub subscription_id: u64,
    pub message: String,
}

/// Core error types with helpful messages and suggestions
#[derive(Error, Debug)]
pub enum Error {
    // Bus errors (E100-E199)
    #[error("Request {request_id} on topic '{topic}' timed out after {timeout:?}")]
    RequestTimeout {
        topic: String,
        request_id: Uuid,
        timeout: Duration,
    },

    #[error("Request {0} was cancelled")]
    RequestCancelled(Uuid),

    #[error("Response for request {request_id} has an unexpected type (expected {expected})")]
    ResponseTypeMismatch {
        request_id: Uuid,
        expected: &'static str,
    },

    #[error("{} handler(s) failed on topic '{topic}'", failures.len())]
    HandlerFailures {
        topic: String,
        failures: Vec<HandlerFailure>,
    },

    // Service errors (E200-E299)
    #[error("Service '{0}' is not registered")]
    ServiceNotRegistered(String),

    #[error("Service '{0}' is scoped and must be resolved from a scope")]
    ScopeRequired(String),

    #[error("Service factory for '{service}' failed: {reason}")]
    ServiceFactoryFailed { service: String, reason: String },

    // Config errors (E300-E399)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Unknown configuration key: {0}. Use `addinhost config list` to see available keys.")]
    UnknownConfigKey(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic errors
    #[error("{0}")]
    Other(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::RequestTimeout { .. } => "E100",
            Self::RequestCancelled(_) => "E101",
            Self::ResponseTypeMismatch { .. } => "E102",
            Self::HandlerFailures { .. } => "E103",
            Self::ServiceNotRegistered(_) => "E200",
            Self::ScopeRequired(_) => "E201",
            Self::ServiceFactoryFailed { .. } => "E202",
            Self::ConfigError(_) => "E300",
            Self::UnknownConfigKey(_) => "E301",
            Self::Serialization(_) => "E302",
            Self::Other(_) | Self::Io(_) => "E9999",
        }
    }

    /// Get suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::RequestTimeout { .. } => {
                Some("addinhost config set bus.request_timeout_ms <millis>".to_string())
            }
            Self::UnknownConfigKey(_) => Some("addinhost config list".to_string()),
            Self::ScopeRequired(_) => Some("resolve through ServiceRegistry::create_scope()".to_string()),
            _ => None,
        }
    }

    /// True for errors raised because a deadline passed
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::RequestTimeout { .. })
    }
}
