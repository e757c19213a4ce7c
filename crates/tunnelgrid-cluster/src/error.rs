//! Cluster collaborator error types.

use thiserror::Error;

/// Errors returned by a [`crate::ClusterClient`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClusterError {
    #[error("{kind} {key} not found")]
    NotFound { kind: &'static str, key: String },

    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: &'static str, key: String },

    #[error("{kind} {key} was modified concurrently")]
    Conflict { kind: &'static str, key: String },

    #[error("cluster backend error: {0}")]
    Backend(String),
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, ClusterError::AlreadyExists { .. })
    }
}

pub type ClusterResult<T> = Result<T, ClusterError>;
