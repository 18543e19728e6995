use std::fmt;

use thiserror::Error;

use crate::store::StoreError;

/// Which kind of identifier a lookup failed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Missing {
    Entity,
    Cluster,
    /// The entity exists but is not a member of the named cluster.
    Membership,
}

impl fmt::Display for Missing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Missing::Entity => "entity",
            Missing::Cluster => "cluster",
            Missing::Membership => "membership",
        };
        f.write_str(s)
    }
}

/// Errors returned by identity operations.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("identity: {kind} not found: {id}")]
    NotFound { kind: Missing, id: String },

    #[error("identity: invalid state: {0}")]
    InvalidState(String),

    #[error("identity: invalid argument: {0}")]
    InvalidArgument(String),

    #[error("identity: dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("identity: cancelled")]
    Cancelled,

    #[error("identity: {0}")]
    Storage(#[from] StoreError),
}

/// Coarse classification of [`IdentityError`] for outer layers
/// (HTTP status mapping, CLI exit codes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    InvalidState,
    InvalidArgument,
    Cancelled,
    Storage,
}

impl IdentityError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IdentityError::NotFound { .. } => ErrorKind::NotFound,
            IdentityError::InvalidState(_) => ErrorKind::InvalidState,
            IdentityError::InvalidArgument(_) | IdentityError::DimensionMismatch { .. } => {
                ErrorKind::InvalidArgument
            }
            IdentityError::Cancelled => ErrorKind::Cancelled,
            IdentityError::Storage(_) => ErrorKind::Storage,
        }
    }

    pub(crate) fn entity(id: &str) -> Self {
        IdentityError::NotFound {
            kind: Missing::Entity,
            id: id.to_string(),
        }
    }

    pub(crate) fn cluster(id: &str) -> Self {
        IdentityError::NotFound {
            kind: Missing::Cluster,
            id: id.to_string(),
        }
    }

    pub(crate) fn membership(entity_id: &str, cluster_id: &str) -> Self {
        IdentityError::NotFound {
            kind: Missing::Membership,
            id: format!("{entity_id} in {cluster_id}"),
        }
    }
}

/// Result type for identity operations.
pub type IdentityResult<T> = Result<T, IdentityError>;
