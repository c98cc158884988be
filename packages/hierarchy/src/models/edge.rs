//! Structural edges
//!
//! The durable hierarchy is a relation of `(parent, child, order)` triples kept
//! separately from the node table. A `None` parent is the root scope, written
//! on the wire as the `"root"` sentinel.

use serde::{Deserialize, Serialize};

/// Wire value standing in for the root scope
pub const ROOT_SCOPE: &str = "root";

/// Parent scope key: `None` is the root scope
pub type ParentKey = Option<String>;

/// Human-readable scope label for logs and diagnostics
pub fn scope_label(parent_id: Option<&str>) -> &str {
    parent_id.unwrap_or(ROOT_SCOPE)
}

/// Hierarchical parent-child relationship with ordering
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HierarchyEdge {
    #[serde(with = "root_sentinel")]
    pub parent_id: ParentKey,
    pub child_id: String,
    pub order: f64,
}

impl HierarchyEdge {
    pub fn new(parent_id: Option<&str>, child_id: &str, order: f64) -> Self {
        Self {
            parent_id: parent_id.map(str::to_string),
            child_id: child_id.to_string(),
            order,
        }
    }
}

pub(crate) mod root_sentinel {
    use super::ROOT_SCOPE;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<String>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(value.as_deref().unwrap_or(ROOT_SCOPE))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw.filter(|parent| parent != ROOT_SCOPE))
    }
}
