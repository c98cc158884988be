//! Tree Error Types
//!
//! Low-level errors raised by the node table, structure tree and sibling
//! chain. The mutation service maps them onto [`MutationError`](crate::services::MutationError).

use crate::models::ValidationError;
use thiserror::Error;

/// Errors raised by the in-memory tree structures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TreeError {
    /// Node id not present in the node table
    #[error("Node not found: {id}")]
    NotFound { id: String },

    /// Edge or chain pointer would make a node its own parent or sibling
    #[error("Self-referential edge for node '{id}'")]
    SelfReference { id: String },

    /// Node is not a member of the addressed sibling scope
    #[error("Node '{id}' is not a child of scope '{scope}'")]
    NotInScope { id: String, scope: String },

    /// Cycle, fork or orphan found while walking a sibling chain
    #[error("Sibling chain corrupted in scope '{scope}': {reason}")]
    ChainCorruption { scope: String, reason: String },

    /// Record failed validation
    #[error("Invalid node: {0}")]
    Invalid(#[from] ValidationError),
}

impl TreeError {
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    pub fn self_reference(id: impl Into<String>) -> Self {
        Self::SelfReference { id: id.into() }
    }

    pub fn not_in_scope(id: impl Into<String>, scope: impl Into<String>) -> Self {
        Self::NotInScope {
            id: id.into(),
            scope: scope.into(),
        }
    }

    pub fn chain_corruption(scope: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ChainCorruption {
            scope: scope.into(),
            reason: reason.into(),
        }
    }
}
