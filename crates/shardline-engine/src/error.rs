//! Engine error types.

use shardline_catalog::CatalogError;
use shardline_core::IdentError;
use thiserror::Error;

/// Bad input, rejected before any catalog write or apply call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("access method {method:?} is not registered")]
    InvalidAccessMethod { method: String },

    #[error("exclusion rule {rule}: {reason}")]
    InvalidConstraintColumns { rule: String, reason: String },

    #[error("identity column mismatch on {node}.{column}: {reason}")]
    IdentityColumnMismatch {
        node: String,
        column: String,
        reason: String,
    },

    #[error("invalid identity column {column}: {reason}")]
    InvalidIdentity { column: String, reason: String },

    #[error("exclusion rule {rule} already exists on {node}")]
    DuplicateRuleName { node: String, rule: String },

    #[error("table node already exists: {0}")]
    DuplicateNode(String),

    #[error("schema mismatch on {node}: {reason}")]
    SchemaMismatch { node: String, reason: String },

    #[error("{0} is already distributed")]
    AlreadyDistributed(String),

    #[error("invalid distribution: {0}")]
    InvalidDistribution(String),

    #[error("{0} is not a partition")]
    NotAPartition(String),

    #[error("invalid identifier: {0}")]
    InvalidIdentifier(#[from] IdentError),
}

/// Errors that abort a whole engine operation.
///
/// Per-target apply failures are never returned here; they are reported
/// in the operation's [`AggregateResult`](crate::AggregateResult).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("unknown root: {0}")]
    UnknownRoot(String),

    #[error("unknown target: {0}")]
    UnknownTarget(String),

    #[error("unknown exclusion rule {rule} on {node}")]
    UnknownRule { node: String, rule: String },

    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),
}

pub type EngineResult<T> = Result<T, EngineError>;
