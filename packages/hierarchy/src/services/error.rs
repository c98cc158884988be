//! Service Layer Error Types
//!
//! Two families with different delivery paths:
//!
//! - [`MutationError`] is returned synchronously from every mutation. A
//!   mutation that returns one has changed nothing.
//! - [`PersistenceError`] describes a failed or late backing-store write. It
//!   never reaches the caller of a mutation; the coordinator publishes it as a
//!   [`DomainEvent::Diagnostic`](crate::services::DomainEvent::Diagnostic).

use crate::db::StoreError;
use crate::models::{Node, ValidationError};
use crate::tree::TreeError;
use thiserror::Error;

/// Synchronous validation failures of a structural or content mutation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MutationError {
    /// Node not found by ID
    #[error("Node not found: {id}")]
    NodeNotFound { id: String },

    /// Parent reference names no known node
    #[error("Invalid parent node: {parent_id}")]
    InvalidParent { parent_id: String },

    /// Sibling reference is unknown or not in the expected scope
    #[error("Invalid sibling '{sibling_id}': {context}")]
    InvalidSibling { sibling_id: String, context: String },

    /// Operation would make a node its own ancestor
    #[error("Circular reference detected: {context}")]
    CircularReference { context: String },

    /// Split offset beyond the content length (counted in characters)
    #[error("Invalid split position {position} for node {id} (content has {length} characters)")]
    InvalidSplitPosition {
        id: String,
        position: usize,
        length: usize,
    },

    /// Version conflict (optimistic concurrency control)
    ///
    /// Carries the current node so the caller can merge without a re-read.
    #[error("Version conflict for node {node_id}: expected version {expected_version}, found {actual_version}")]
    VersionConflict {
        node_id: String,
        expected_version: i64,
        actual_version: i64,
        current_node: Box<Node>,
    },

    /// Sibling chain found inconsistent while applying a mutation
    #[error("Sibling chain corrupted in scope '{scope}': {reason}")]
    ChainCorruption { scope: String, reason: String },

    /// A node with this id is already in the document
    #[error("Node already exists: {id}")]
    NodeAlreadyExists { id: String },

    /// Record failed validation
    #[error("Node validation failed: {0}")]
    ValidationFailed(#[from] ValidationError),
}

impl MutationError {
    pub fn node_not_found(id: impl Into<String>) -> Self {
        Self::NodeNotFound { id: id.into() }
    }

    pub fn invalid_parent(parent_id: impl Into<String>) -> Self {
        Self::InvalidParent {
            parent_id: parent_id.into(),
        }
    }

    pub fn invalid_sibling(sibling_id: impl Into<String>, context: impl Into<String>) -> Self {
        Self::InvalidSibling {
            sibling_id: sibling_id.into(),
            context: context.into(),
        }
    }

    pub fn circular_reference(context: impl Into<String>) -> Self {
        Self::CircularReference {
            context: context.into(),
        }
    }

    pub fn version_conflict(expected_version: i64, current: &Node) -> Self {
        Self::VersionConflict {
            node_id: current.id.clone(),
            expected_version,
            actual_version: current.version,
            current_node: Box::new(current.clone()),
        }
    }
}

impl From<TreeError> for MutationError {
    fn from(err: TreeError) -> Self {
        match err {
            TreeError::NotFound { id } => Self::NodeNotFound { id },
            TreeError::SelfReference { id } => {
                Self::circular_reference(format!("node '{id}' cannot be its own parent or sibling"))
            }
            TreeError::NotInScope { id, scope } => {
                Self::invalid_sibling(id, format!("not a child of '{scope}'"))
            }
            TreeError::ChainCorruption { scope, reason } => Self::ChainCorruption { scope, reason },
            TreeError::Invalid(e) => Self::ValidationFailed(e),
        }
    }
}

/// Asynchronous backing-store write failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PersistenceError {
    /// Backing store rejected or failed a write
    #[error("Persistence failure for node {node_id} during {operation}: {source}")]
    PersistenceFailure {
        node_id: String,
        operation: String,
        #[source]
        source: StoreError,
    },

    /// Parent creation write did not finish within the ordering window
    #[error("Timed out after {waited_ms}ms waiting for creation of '{parent_id}' before writing edge for '{child_id}'")]
    WriteOrderingTimeout {
        parent_id: String,
        child_id: String,
        waited_ms: u64,
    },
}

impl PersistenceError {
    pub fn failure(node_id: impl Into<String>, operation: impl Into<String>, source: StoreError) -> Self {
        Self::PersistenceFailure {
            node_id: node_id.into(),
            operation: operation.into(),
            source,
        }
    }

    /// Node the failed write was about
    pub fn node_id(&self) -> &str {
        match self {
            Self::PersistenceFailure { node_id, .. } => node_id,
            Self::WriteOrderingTimeout { child_id, .. } => child_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tree_errors_map_to_mutation_errors() {
        assert_eq!(
            MutationError::from(TreeError::not_found("a")),
            MutationError::node_not_found("a")
        );
        assert!(matches!(
            MutationError::from(TreeError::self_reference("a")),
            MutationError::CircularReference { .. }
        ));
        assert!(matches!(
            MutationError::from(TreeError::not_in_scope("b", "root")),
            MutationError::InvalidSibling { sibling_id, .. } if sibling_id == "b"
        ));
    }

    #[test]
    fn test_version_conflict_carries_current_node() {
        let node = Node::new("text".to_string(), "now".to_string(), None, json!({}));
        let err = MutationError::version_conflict(1, &node);

        match err {
            MutationError::VersionConflict {
                expected_version,
                actual_version,
                current_node,
                ..
            } => {
                assert_eq!(expected_version, 1);
                assert_eq!(actual_version, node.version);
                assert_eq!(current_node.content, "now");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_persistence_error_names_the_node() {
        let err = PersistenceError::failure("n1", "create_node", StoreError::connectivity("down"));
        assert_eq!(err.node_id(), "n1");
        assert!(err.to_string().contains("create_node"));
    }
}
