//! Backing Store Error Types
//!
//! Errors a [`BackingStore`](crate::db::BackingStore) adapter may return. The
//! persistence coordinator catches every one of them and reports it as a
//! diagnostic instead of propagating it to the editing layer.

use thiserror::Error;

/// Backing store operation errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// The store could not be reached (network, closed connection, locked file)
    #[error("Backing store unavailable: {0}")]
    Connectivity(String),

    /// A referential-integrity or uniqueness constraint rejected the write
    #[error("Constraint violation: {context}")]
    Constraint { context: String },

    /// The addressed record does not exist
    #[error("Record not found: {id}")]
    NotFound { id: String },
}

impl StoreError {
    /// Create a connectivity error
    pub fn connectivity(msg: impl Into<String>) -> Self {
        Self::Connectivity(msg.into())
    }

    /// Create a constraint violation error
    pub fn constraint(context: impl Into<String>) -> Self {
        Self::Constraint {
            context: context.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    /// True for integrity errors that retrying the same write cannot fix
    pub fn is_constraint(&self) -> bool {
        matches!(self, Self::Constraint { .. })
    }
}
