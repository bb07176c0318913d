//! Distro Errors
//!
//! Error taxonomy of the replication core. Transient network failures are
//! recovered by retry or by the next verify cycle and never reach writers;
//! a duplicate component registration is a wiring bug and aborts startup.

use crate::distro::config::ConfigError;
use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, DistroError>;

#[derive(Debug, Error)]
pub enum DistroError {
    #[error("data type {0} is already registered")]
    DuplicateComponent(String),

    #[error("no component registered for data type {0}")]
    ComponentNotFound(String),

    #[error("record {data_type}:{resource_id} not found")]
    RecordNotFound {
        data_type: String,
        resource_id: String,
    },

    #[error("transport error ({peer}): {message}")]
    Transport { peer: String, message: String },

    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("replication engine is shutting down")]
    Shutdown,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl DistroError {
    pub fn transport(peer: impl std::fmt::Display, message: impl std::fmt::Display) -> Self {
        DistroError::Transport {
            peer: peer.to_string(),
            message: message.to_string(),
        }
    }

    pub fn not_found(data_type: impl Into<String>, resource_id: impl Into<String>) -> Self {
        DistroError::RecordNotFound {
            data_type: data_type.into(),
            resource_id: resource_id.into(),
        }
    }

    /// Transient failures are healed by retry or by the verify cycle.
    pub fn is_transient(&self) -> bool {
        matches!(self, DistroError::Transport { .. } | DistroError::Shutdown)
    }
}

impl From<bincode::Error> for DistroError {
    fn from(e: bincode::Error) -> Self {
        DistroError::Codec(e.to_string())
    }
}
