//! Allocation errors
//!
//! Rejected and throttled placements are not errors, they are recorded on the shard.
//! These variants cover bad requests and broken invariants.

use cluster_core::CoreError;
use thiserror::Error;

use crate::decision::Decision;

#[derive(Debug, Clone, Error)]
pub enum AllocationError {
    #[error("Index not found: {0}")]
    IndexNotFound(String),

    #[error("Shard not found: {0}")]
    ShardNotFound(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("[{command}] rejected by allocation deciders: {decision}")]
    CommandRejected {
        command: &'static str,
        decision: Decision,
    },

    #[error("[{command}] {reason}")]
    IllegalCommand {
        command: &'static str,
        reason: String,
    },

    #[error("Illegal argument: {0}")]
    IllegalArgument(String),

    #[error(transparent)]
    Core(#[from] CoreError),
}

pub type Result<T> = std::result::Result<T, AllocationError>;
