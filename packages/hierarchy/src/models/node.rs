//! Node Data Structures
//!
//! This module defines the `Node` record held by the canonical node table.
//!
//! # Architecture
//!
//! - **Universal Node**: A single struct represents every content type; the
//!   `node_type` tag is only interpreted by consumers, never by the engine
//! - **Open Properties**: Entity-specific data lives in the `properties` JSON object
//! - **Denormalized Hierarchy**: `parent_id`, `before_sibling_id` and `depth` mirror
//!   the structural edges for fast editor splices (Enter/Backspace/Tab)
//!
//! # Examples
//!
//! ```rust
//! use nodespace_hierarchy::models::Node;
//! use serde_json::json;
//!
//! let task = Node::new(
//!     "task".to_string(),
//!     "Write the release notes".to_string(),
//!     None,
//!     json!({ "status": "todo" }),
//! );
//! assert_eq!(task.version, 1);
//! assert!(task.is_root());
//! ```

use crate::models::edge::ROOT_SCOPE;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Default version value for serde deserialization (version 1)
fn default_version() -> i64 {
    1
}

/// Validation errors for Node records
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Node id '{0}' is reserved for the root scope")]
    ReservedId(String),

    #[error("Properties validation failed: {0}")]
    InvalidProperties(String),

    #[error("Circular reference: node '{0}' references itself")]
    CircularReference(String),
}

/// Universal node record owned by the [`NodeTable`](crate::tree::NodeTable).
///
/// # Fields
///
/// - `id`: Opaque, stable identifier (UUID v4 when generated by the engine)
/// - `node_type`: Type tag (e.g., "text", "task", "header")
/// - `content`: Primary text payload
/// - `parent_id`: Parent node (`None` means the node lives in the root scope)
/// - `before_sibling_id`: Logical predecessor among siblings (`None` means first child)
/// - `depth`: Nesting level, `0` for root-scope nodes
/// - `version`: Optimistic concurrency version, bumped on content/property mutation
/// - `properties`: Open JSON object, no fixed schema
/// - `is_placeholder`: Ephemeral node that has not been written to the backing store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Unique identifier
    pub id: String,

    /// Node type (e.g., "text", "task", "header")
    pub node_type: String,

    /// Primary content/text of the node
    pub content: String,

    /// Parent node ID, `None` for root-scope nodes
    pub parent_id: Option<String>,

    /// Sibling ordering reference (single-pointer linked list)
    pub before_sibling_id: Option<String>,

    /// Nesting depth, derived from the parent chain
    #[serde(default)]
    pub depth: u32,

    /// Optimistic concurrency control version (incremented on each update)
    #[serde(default = "default_version")]
    pub version: i64,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last modification timestamp
    pub modified_at: DateTime<Utc>,

    /// All entity-specific fields
    pub properties: Value,

    /// True while the node only exists in memory (blank line created by Enter)
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_placeholder: bool,
}

impl Node {
    /// Create a new Node with an auto-generated UUID
    ///
    /// The node starts at version 1, depth 0 and without a sibling pointer;
    /// the tree assigns the hierarchy fields when the node is inserted.
    pub fn new(
        node_type: String,
        content: String,
        parent_id: Option<String>,
        properties: Value,
    ) -> Self {
        Self::new_with_id(
            Uuid::new_v4().to_string(),
            node_type,
            content,
            parent_id,
            properties,
        )
    }

    /// Create a new Node with a caller-provided ID
    ///
    /// Used when the editing layer pre-generates IDs for optimistic UI
    /// tracking, and by tests that want readable identifiers.
    pub fn new_with_id(
        id: String,
        node_type: String,
        content: String,
        parent_id: Option<String>,
        properties: Value,
    ) -> Self {
        let now = Utc::now();
        let properties = if properties.is_null() {
            Value::Object(Default::default())
        } else {
            properties
        };

        Self {
            id,
            node_type,
            content,
            parent_id,
            before_sibling_id: None,
            depth: 0,
            version: 1,
            created_at: now,
            modified_at: now,
            properties,
            is_placeholder: false,
        }
    }

    /// Validate node structure and required fields
    ///
    /// Content is allowed to be empty: blank nodes are created when users
    /// press Enter and live as placeholders until they receive text.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.is_empty() {
            return Err(ValidationError::MissingField("id".to_string()));
        }

        if self.id == ROOT_SCOPE {
            return Err(ValidationError::ReservedId(self.id.clone()));
        }

        if self.node_type.is_empty() {
            return Err(ValidationError::MissingField("node_type".to_string()));
        }

        if !self.properties.is_object() {
            return Err(ValidationError::InvalidProperties(
                "properties must be a JSON object".to_string(),
            ));
        }

        if self.parent_id.as_deref() == Some(self.id.as_str())
            || self.before_sibling_id.as_deref() == Some(self.id.as_str())
        {
            return Err(ValidationError::CircularReference(self.id.clone()));
        }

        Ok(())
    }

    /// True when the node lives in the root scope
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Replace content and bump the version
    pub fn set_content(&mut self, content: String) {
        self.content = content;
        self.touch();
    }

    /// Merge properties with existing properties (shallow merge) and bump the version
    ///
    /// Non-object existing properties are replaced by an empty object first so
    /// that a malformed record can still accept patches.
    pub fn merge_properties(&mut self, updates: &Value) -> Result<(), ValidationError> {
        let patch = updates.as_object().ok_or_else(|| {
            ValidationError::InvalidProperties("property patch must be a JSON object".to_string())
        })?;

        if !self.properties.is_object() {
            self.properties = Value::Object(Default::default());
        }

        if let Some(existing) = self.properties.as_object_mut() {
            for (key, value) in patch {
                existing.insert(key.clone(), value.clone());
            }
        }
        self.touch();
        Ok(())
    }

    fn touch(&mut self) {
        self.version += 1;
        self.modified_at = Utc::now();
    }
}

/// Sparse update sent to the backing store
///
/// Only `Some` fields are written. `version` always travels with the patch so
/// the adapter can keep its stored version monotonic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    /// Shallow properties patch
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<Value>,

    pub version: i64,
}

impl NodePatch {
    pub fn content_only(content: String, version: i64) -> Self {
        Self {
            content: Some(content),
            properties: None,
            version,
        }
    }

    pub fn properties_only(patch: Value, version: i64) -> Self {
        Self {
            content: None,
            properties: Some(patch),
            version,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_none() && self.properties.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_node_creation() {
        let node = Node::new(
            "text".to_string(),
            "Test content".to_string(),
            None,
            json!({}),
        );

        assert!(!node.id.is_empty());
        assert_eq!(node.node_type, "text");
        assert_eq!(node.content, "Test content");
        assert_eq!(node.version, 1);
        assert!(node.is_root());
        assert!(node.validate().is_ok());
    }

    #[test]
    fn test_null_properties_become_empty_object() {
        let node = Node::new_with_id(
            "a".to_string(),
            "text".to_string(),
            String::new(),
            None,
            Value::Null,
        );
        assert_eq!(node.properties, json!({}));
    }

    #[test]
    fn test_validate_rejects_reserved_root_id() {
        let node = Node::new_with_id(
            ROOT_SCOPE.to_string(),
            "text".to_string(),
            String::new(),
            None,
            json!({}),
        );
        assert_eq!(
            node.validate(),
            Err(ValidationError::ReservedId("root".to_string()))
        );
    }

    #[test]
    fn test_validate_rejects_self_parent() {
        let mut node = Node::new_with_id(
            "a".to_string(),
            "text".to_string(),
            String::new(),
            None,
            json!({}),
        );
        node.parent_id = Some("a".to_string());
        assert!(matches!(
            node.validate(),
            Err(ValidationError::CircularReference(_))
        ));
    }

    #[test]
    fn test_merge_properties_is_shallow_and_bumps_version() {
        let mut node = Node::new(
            "task".to_string(),
            "Task".to_string(),
            None,
            json!({ "status": "todo", "meta": { "a": 1 } }),
        );

        node.merge_properties(&json!({ "status": "done", "meta": { "b": 2 } }))
            .unwrap();

        assert_eq!(node.properties["status"], "done");
        assert_eq!(node.properties["meta"], json!({ "b": 2 }));
        assert_eq!(node.version, 2);
    }

    #[test]
    fn test_merge_properties_rejects_non_object_patch() {
        let mut node = Node::new("text".to_string(), "x".to_string(), None, json!({}));
        assert!(node.merge_properties(&json!("nope")).is_err());
        assert_eq!(node.version, 1);
    }

    #[test]
    fn test_placeholder_flag_is_omitted_when_false() {
        let node = Node::new("text".to_string(), "x".to_string(), None, json!({}));
        let value = serde_json::to_value(&node).unwrap();
        assert!(value.get("isPlaceholder").is_none());
        assert!(value.get("beforeSiblingId").is_some());
    }
}
