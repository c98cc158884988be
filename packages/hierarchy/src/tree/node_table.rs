//! NodeTable - canonical node records
//!
//! Single source of truth for node content, type, properties and version.
//! Every other component refers to nodes by id only.
//!
//! Mutations here are synchronous and touch nothing but the table: they do
//! not update the structure tree, the sibling chain or the backing store.

use crate::models::Node;
use crate::tree::TreeError;
use serde_json::Value;
use std::collections::HashMap;

/// Canonical map from node id to node record
#[derive(Debug, Default, Clone)]
pub struct NodeTable {
    nodes: HashMap<String, Node>,
}

impl NodeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a node record
    pub fn get(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Look up a node record, failing with `NotFound`
    pub fn require(&self, id: &str) -> Result<&Node, TreeError> {
        self.nodes.get(id).ok_or_else(|| TreeError::not_found(id))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// Insert or replace a record wholesale (initial load / sync)
    pub fn set(&mut self, node: Node) -> Result<(), TreeError> {
        node.validate()?;
        self.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    /// Replace content and bump the version, returning the new version
    ///
    /// Writing identical content still bumps the version: callers use the
    /// version to detect that an edit happened, not that text changed.
    pub fn update_content(&mut self, id: &str, content: String) -> Result<i64, TreeError> {
        let node = self.get_mut(id)?;
        node.set_content(content);
        Ok(node.version)
    }

    /// Shallow-merge a properties patch and bump the version
    pub fn update_properties(&mut self, id: &str, patch: &Value) -> Result<i64, TreeError> {
        let node = self.get_mut(id)?;
        node.merge_properties(patch)?;
        Ok(node.version)
    }

    /// Remove a record, returning it
    pub fn delete(&mut self, id: &str) -> Result<Node, TreeError> {
        self.nodes.remove(id).ok_or_else(|| TreeError::not_found(id))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &String> {
        self.nodes.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub(crate) fn clear(&mut self) {
        self.nodes.clear();
    }

    pub(crate) fn set_parent(&mut self, id: &str, parent_id: Option<&str>) -> Result<(), TreeError> {
        self.get_mut(id)?.parent_id = parent_id.map(str::to_string);
        Ok(())
    }

    pub(crate) fn set_depth(&mut self, id: &str, depth: u32) -> Result<(), TreeError> {
        self.get_mut(id)?.depth = depth;
        Ok(())
    }

    pub(crate) fn set_placeholder(&mut self, id: &str, placeholder: bool) -> Result<(), TreeError> {
        self.get_mut(id)?.is_placeholder = placeholder;
        Ok(())
    }

    /// Only the sibling chain writes sibling pointers
    pub(super) fn set_before_sibling(
        &mut self,
        id: &str,
        before: Option<&str>,
    ) -> Result<(), TreeError> {
        self.get_mut(id)?.before_sibling_id = before.map(str::to_string);
        Ok(())
    }

    fn get_mut(&mut self, id: &str) -> Result<&mut Node, TreeError> {
        self.nodes.get_mut(id).ok_or_else(|| TreeError::not_found(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn table_with(id: &str, content: &str) -> NodeTable {
        let mut table = NodeTable::new();
        table
            .set(Node::new_with_id(
                id.to_string(),
                "text".to_string(),
                content.to_string(),
                None,
                json!({}),
            ))
            .unwrap();
        table
    }

    #[test]
    fn test_update_content_twice_bumps_version_twice() {
        let mut table = table_with("a", "hello");

        let v1 = table.update_content("a", "same".to_string()).unwrap();
        let v2 = table.update_content("a", "same".to_string()).unwrap();

        assert_eq!(v1, 2);
        assert_eq!(v2, 3);
        assert_eq!(table.get("a").unwrap().content, "same");
    }

    #[test]
    fn test_update_properties_merges() {
        let mut table = table_with("a", "hello");
        table
            .update_properties("a", &json!({ "status": "todo" }))
            .unwrap();
        let version = table
            .update_properties("a", &json!({ "priority": "high" }))
            .unwrap();

        let node = table.get("a").unwrap();
        assert_eq!(version, 3);
        assert_eq!(node.properties, json!({ "status": "todo", "priority": "high" }));
    }

    #[test]
    fn test_missing_node_is_not_found() {
        let mut table = NodeTable::new();
        assert_eq!(
            table.update_content("missing", "x".to_string()),
            Err(TreeError::not_found("missing"))
        );
        assert!(table.delete("missing").is_err());
        assert!(table.require("missing").is_err());
    }

    #[test]
    fn test_set_replaces_wholesale() {
        let mut table = table_with("a", "hello");
        let mut replacement = table.get("a").unwrap().clone();
        replacement.content = "replaced".to_string();
        replacement.version = 42;
        table.set(replacement).unwrap();

        assert_eq!(table.len(), 1);
        assert_eq!(table.get("a").unwrap().version, 42);
    }

    #[test]
    fn test_set_rejects_invalid_record() {
        let mut table = NodeTable::new();
        let invalid = Node::new_with_id(
            String::new(),
            "text".to_string(),
            String::new(),
            None,
            json!({}),
        );
        assert!(matches!(table.set(invalid), Err(TreeError::Invalid(_))));
        assert!(table.is_empty());
    }
}
