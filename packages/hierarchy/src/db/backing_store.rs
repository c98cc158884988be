//! BackingStore Trait - Persistence Abstraction Layer
//!
//! This module defines the contract the in-memory engine needs from durable
//! storage. The engine never depends on a concrete database: the persistence
//! coordinator talks to an `Arc<dyn BackingStore>`.
//!
//! # Persisted Shape
//!
//! - A node table keyed by opaque id with open properties
//! - A separate structural-edge relation `(parent, child, order)`
//!
//! The two are kept consistent by the coordinator's write ordering: an edge is
//! never written before the creation write of the nodes it references.
//!
//! # Design Decisions
//!
//! 1. **Async-First**: All methods are async so embedded and network backends fit
//! 2. **Ownership Semantics**: Records are passed by value, the caller clones if needed
//! 3. **Typed Errors**: [`StoreError`] distinguishes connectivity from constraint failures
//! 4. **No Transactions**: Sequencing is the coordinator's job, not the adapter's

use crate::db::StoreError;
use crate::models::{HierarchyEdge, Node, NodeFilter, NodePatch};
use async_trait::async_trait;

/// Abstraction layer for node persistence operations
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`: writes are issued from tokio tasks
/// that may run on any worker thread.
#[async_trait]
pub trait BackingStore: Send + Sync {
    /// Create a node record, returning its id
    ///
    /// Fails with [`StoreError::Constraint`] when the id already exists.
    async fn create_node(&self, node: Node) -> Result<String, StoreError>;

    /// Apply a sparse patch to an existing record
    ///
    /// Properties in the patch are shallow-merged. The stored version becomes
    /// `max(stored, patch.version)`.
    async fn update_node(&self, id: &str, patch: NodePatch) -> Result<(), StoreError>;

    /// Delete a node record and every edge that references it
    ///
    /// Deleting a missing record is not an error.
    async fn delete_node(&self, id: &str) -> Result<(), StoreError>;

    /// Query node records
    async fn query_nodes(&self, filter: NodeFilter) -> Result<Vec<Node>, StoreError>;

    /// Insert or replace the edge for `edge.child_id`
    ///
    /// A child has at most one durable parent edge. Fails with
    /// [`StoreError::Constraint`] when the parent or child record is missing.
    async fn upsert_edge(&self, edge: HierarchyEdge) -> Result<(), StoreError>;

    /// Remove the edge between `parent_id` and `child_id` if present
    async fn delete_edge(&self, parent_id: Option<&str>, child_id: &str)
        -> Result<(), StoreError>;

    /// Load every structural edge (initial sync)
    async fn query_edges(&self) -> Result<Vec<HierarchyEdge>, StoreError>;
}
