//! Backing-store query filter
//!
//! Builder-style filter passed to [`BackingStore::query_nodes`](crate::db::BackingStore::query_nodes).
//! All conditions are AND-ed; an empty filter matches every node.

use crate::models::Node;
use serde::{Deserialize, Serialize};

/// Node query filter
///
/// # Examples
///
/// ```rust
/// use nodespace_hierarchy::models::NodeFilter;
///
/// let filter = NodeFilter::new()
///     .with_node_type("task".to_string())
///     .with_content_contains("release".to_string())
///     .with_limit(10);
/// assert_eq!(filter.limit, Some(10));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeFilter {
    /// Filter by node type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_type: Option<String>,

    /// Filter by specific IDs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,

    /// Filter by content search (substring match)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_contains: Option<String>,

    /// Limit number of results
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl NodeFilter {
    /// Create a new empty filter
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter by node type
    pub fn with_node_type(mut self, node_type: String) -> Self {
        self.node_type = Some(node_type);
        self
    }

    /// Filter by specific IDs
    pub fn with_ids(mut self, ids: Vec<String>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Filter by content substring
    pub fn with_content_contains(mut self, content: String) -> Self {
        self.content_contains = Some(content);
        self
    }

    /// Set result limit
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Check a single node against every condition except `limit`
    pub fn matches(&self, node: &Node) -> bool {
        if let Some(node_type) = &self.node_type {
            if &node.node_type != node_type {
                return false;
            }
        }

        if let Some(ids) = &self.ids {
            if !ids.iter().any(|id| id == &node.id) {
                return false;
            }
        }

        if let Some(needle) = &self.content_contains {
            if !node.content.contains(needle.as_str()) {
                return false;
            }
        }

        true
    }
}
