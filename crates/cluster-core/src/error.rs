//! Data model errors

use thiserror::Error;

/// Errors raised while building or validating cluster state
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("Invalid settings for index [{index}]: {reason}")]
    InvalidIndexSettings { index: String, reason: String },
    #[error("Invalid setting value: {0}")]
    InvalidSetting(String),
    #[error("Index not found: {0}")]
    IndexNotFound(String),
    #[error("Routing table invariant violated: {0}")]
    InvariantViolation(String),
}
