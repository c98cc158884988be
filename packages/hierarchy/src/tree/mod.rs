//! In-memory Document Structures
//!
//! - [`NodeTable`] - canonical id to record map
//! - [`StructureTree`] - parent to ordered children, fractional order keys
//! - [`SiblingChain`] - `before_sibling_id` linked list per scope
//! - [`DocumentTree`] - the three above, kept in agreement
//!
//! Nothing here is async or locked. The session wraps a [`DocumentTree`] in a
//! single `RwLock` and the mutation service drives it.

pub mod document;
mod error;
pub mod node_table;
pub mod sibling_chain;
pub mod structure_tree;

pub use document::{
    DocumentTree, IntegrityReport, IntegrityViolation, LoadReport, OutlineRow, Placement, Removal,
};
pub use error::TreeError;
pub use node_table::NodeTable;
pub use sibling_chain::SiblingChain;
pub use structure_tree::StructureTree;
