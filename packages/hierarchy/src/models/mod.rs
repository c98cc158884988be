//! Data Models
//!
//! - [`Node`] - the universal node record
//! - [`HierarchyEdge`] - durable `(parent, child, order)` triple
//! - [`NodeFilter`] / [`NodePatch`] - backing-store query and update shapes

pub mod edge;
pub mod filter;
pub mod node;

pub use edge::{scope_label, HierarchyEdge, ParentKey, ROOT_SCOPE};
pub use filter::NodeFilter;
pub use node::{Node, NodePatch, ValidationError};
