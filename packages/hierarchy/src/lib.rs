//! NodeSpace Hierarchy Engine
//!
//! In-memory node hierarchy and multi-viewer synchronization for the NodeSpace
//! outliner. Every node has a parent (or sits at the root), an ordered position
//! among its siblings, and open JSON properties. Several viewers (panes, tabs)
//! edit the same document and converge without a round-trip to storage.
//!
//! # Architecture
//!
//! - **Three agreeing structures**: a node table, a parent-to-children
//!   structure tree with fractional order keys, and a `before_sibling_id`
//!   linked list per scope
//! - **Atomic transitions**: each mutation validates, applies and verifies
//!   under one write lock; a failed mutation changes nothing
//! - **Memory first**: subscribers are notified before the call returns, the
//!   backing store is written afterwards (debounced content, ordered edges)
//! - **Schema-free**: properties are `serde_json::Value`; no per-type tables
//!
//! # Modules
//!
//! - [`models`] - Node records, structural edges, query filters
//! - [`tree`] - NodeTable, StructureTree, SiblingChain and the DocumentTree that owns them
//! - [`services`] - MutationService, PersistenceCoordinator, SubscriberHub, Viewer
//! - [`db`] - BackingStore contract, in-memory adapter, fractional ordering
//! - [`session`] - DocumentSession wiring everything for one document
//! - [`config`] - HierarchyConfig

pub mod config;
pub mod db;
pub mod models;
pub mod services;
pub mod session;
pub mod tree;

// Re-export commonly used types
pub use config::{ConfigError, HierarchyConfig};
pub use models::*;
pub use services::*;
pub use session::{DocumentSession, DocumentSessionBuilder, SessionError};
