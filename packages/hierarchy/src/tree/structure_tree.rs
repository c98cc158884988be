//! StructureTree - parent to ordered-children index
//!
//! Mirrors the durable structural-edge relation in memory. Children of each
//! scope are kept sorted by their fractional order key, so `children_of` is a
//! straight copy and inserting between two siblings never renumbers anyone.
//!
//! A node normally has exactly one parent. `parents_of` returns a set because
//! the model tolerates a node briefly appearing under two parents while it
//! moves; `move_edge` performs the remove and add under one `&mut self` so no
//! reader ever observes the node without a parent.

use crate::db::FractionalOrderCalculator;
use crate::models::{scope_label, HierarchyEdge, ParentKey};
use crate::tree::TreeError;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, PartialEq)]
struct ChildEntry {
    id: String,
    order: f64,
}

/// Ordered child index keyed by parent scope (`None` = root)
#[derive(Debug, Default, Clone)]
pub struct StructureTree {
    children: HashMap<ParentKey, Vec<ChildEntry>>,
    parents: HashMap<String, HashSet<ParentKey>>,
}

impl StructureTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Child ids of a scope in visual order
    pub fn children_of(&self, parent_id: Option<&str>) -> Vec<String> {
        self.entries(parent_id)
            .map(|entries| entries.iter().map(|entry| entry.id.clone()).collect())
            .unwrap_or_default()
    }

    /// Edges of a scope in visual order
    pub fn edges_of(&self, parent_id: Option<&str>) -> Vec<HierarchyEdge> {
        self.entries(parent_id)
            .map(|entries| {
                entries
                    .iter()
                    .map(|entry| HierarchyEdge::new(parent_id, &entry.id, entry.order))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every scope the node currently appears in
    pub fn parents_of(&self, id: &str) -> HashSet<ParentKey> {
        self.parents.get(id).cloned().unwrap_or_default()
    }

    /// The node's single parent scope, if it has an edge at all
    pub fn parent_of(&self, id: &str) -> Option<ParentKey> {
        self.parents
            .get(id)
            .and_then(|parents| parents.iter().next().cloned())
    }

    pub fn has_edge(&self, id: &str) -> bool {
        self.parents.get(id).is_some_and(|parents| !parents.is_empty())
    }

    /// Order key of `child_id` inside `parent_id`
    pub fn order_of(&self, parent_id: Option<&str>, child_id: &str) -> Option<f64> {
        self.entries(parent_id)?
            .iter()
            .find(|entry| entry.id == child_id)
            .map(|entry| entry.order)
    }

    /// Current edge for `child_id` (first parent if it is mid-move)
    pub fn edge_of(&self, child_id: &str) -> Option<HierarchyEdge> {
        let parent = self.parent_of(child_id)?;
        let order = self.order_of(parent.as_deref(), child_id)?;
        Some(HierarchyEdge::new(parent.as_deref(), child_id, order))
    }

    /// Last child of a scope
    pub fn last_child(&self, parent_id: Option<&str>) -> Option<String> {
        self.entries(parent_id)?.last().map(|entry| entry.id.clone())
    }

    /// Sibling sorted directly after `child_id`
    pub fn next_sibling(&self, parent_id: Option<&str>, child_id: &str) -> Option<String> {
        let entries = self.entries(parent_id)?;
        let index = entries.iter().position(|entry| entry.id == child_id)?;
        entries.get(index + 1).map(|entry| entry.id.clone())
    }

    /// Sibling sorted directly before `child_id`
    pub fn previous_sibling(&self, parent_id: Option<&str>, child_id: &str) -> Option<String> {
        let entries = self.entries(parent_id)?;
        let index = entries.iter().position(|entry| entry.id == child_id)?;
        index
            .checked_sub(1)
            .map(|previous| entries[previous].id.clone())
    }

    /// Order key for appending after the last child (`max + 1`, or `1.0` when empty)
    pub fn order_for_append(&self, parent_id: Option<&str>) -> f64 {
        let last = self
            .entries(parent_id)
            .and_then(|entries| entries.last())
            .map(|entry| entry.order);
        FractionalOrderCalculator::calculate_order(last, None)
    }

    /// Order key for inserting directly after `after_id` (or first when `None`)
    ///
    /// Midpoint between `after_id` and its successor, `after.order + 1.0` when
    /// `after_id` is the last child. Falls back to appending when the midpoint
    /// collides with a neighbour.
    pub fn order_after(
        &self,
        parent_id: Option<&str>,
        after_id: Option<&str>,
    ) -> Result<f64, TreeError> {
        let entries: &[ChildEntry] = self.entries(parent_id).map(Vec::as_slice).unwrap_or(&[]);

        let (prev, next) = match after_id {
            None => (None, entries.first().map(|entry| entry.order)),
            Some(after) => {
                let index = entries
                    .iter()
                    .position(|entry| entry.id == after)
                    .ok_or_else(|| TreeError::not_in_scope(after, scope_label(parent_id)))?;
                (
                    Some(entries[index].order),
                    entries.get(index + 1).map(|entry| entry.order),
                )
            }
        };

        let candidate = FractionalOrderCalculator::calculate_order(prev, next);
        if FractionalOrderCalculator::collides(candidate, prev, next) {
            tracing::warn!(
                "Order key collision in scope '{}', appending at end",
                scope_label(parent_id)
            );
            return Ok(self.order_for_append(parent_id));
        }
        Ok(candidate)
    }

    /// Insert an edge, returning the order key actually used
    ///
    /// If the child already has an edge in this scope its order is updated.
    /// A key equal to another sibling's key falls back to append-at-end.
    pub fn add_edge(
        &mut self,
        parent_id: Option<&str>,
        child_id: &str,
        order: f64,
    ) -> Result<f64, TreeError> {
        if parent_id == Some(child_id) {
            return Err(TreeError::self_reference(child_id));
        }

        let key: ParentKey = parent_id.map(str::to_string);
        let entries = self.children.entry(key.clone()).or_default();
        entries.retain(|entry| entry.id != child_id);

        let order = if entries.iter().any(|entry| entry.order == order) {
            let append = FractionalOrderCalculator::calculate_order(
                entries.last().map(|entry| entry.order),
                None,
            );
            tracing::warn!(
                "Order key {} already used in scope '{}', appending '{}' at {}",
                order,
                scope_label(parent_id),
                child_id,
                append
            );
            append
        } else {
            order
        };

        let index = entries.partition_point(|entry| entry.order < order);
        entries.insert(
            index,
            ChildEntry {
                id: child_id.to_string(),
                order,
            },
        );
        self.parents
            .entry(child_id.to_string())
            .or_default()
            .insert(key);
        Ok(order)
    }

    /// Remove an edge, returning its order key if it existed
    pub fn remove_edge(&mut self, parent_id: Option<&str>, child_id: &str) -> Option<f64> {
        let key: ParentKey = parent_id.map(str::to_string);
        let entries = self.children.get_mut(&key)?;
        let index = entries.iter().position(|entry| entry.id == child_id)?;
        let removed = entries.remove(index);
        if entries.is_empty() {
            self.children.remove(&key);
        }

        if let Some(parents) = self.parents.get_mut(child_id) {
            parents.remove(&key);
            if parents.is_empty() {
                self.parents.remove(child_id);
            }
        }
        Some(removed.order)
    }

    /// Atomically move `child_id` from `old_parent` to `new_parent`
    ///
    /// Validation happens before anything changes, so a rejected move leaves
    /// the tree untouched.
    pub fn move_edge(
        &mut self,
        old_parent: Option<&str>,
        new_parent: Option<&str>,
        child_id: &str,
        order: f64,
    ) -> Result<f64, TreeError> {
        if new_parent == Some(child_id) {
            return Err(TreeError::self_reference(child_id));
        }
        if self.order_of(old_parent, child_id).is_none() {
            return Err(TreeError::not_in_scope(child_id, scope_label(old_parent)));
        }

        self.remove_edge(old_parent, child_id);
        self.add_edge(new_parent, child_id, order)
    }

    /// Remove every edge naming `id` as child
    pub fn detach(&mut self, id: &str) {
        for parent in self.parents_of(id) {
            self.remove_edge(parent.as_deref(), id);
        }
    }

    /// True when the smallest gap in the scope is below `threshold`
    pub fn needs_rebalance(&self, parent_id: Option<&str>, threshold: f64) -> bool {
        self.entries(parent_id).is_some_and(|entries| {
            let orders: Vec<f64> = entries.iter().map(|entry| entry.order).collect();
            FractionalOrderCalculator::needs_rebalancing(&orders, threshold)
        })
    }

    /// Renumber a scope to `1..=n`, returning the rewritten edges
    pub fn rebalance(&mut self, parent_id: Option<&str>) -> Vec<HierarchyEdge> {
        let key: ParentKey = parent_id.map(str::to_string);
        let Some(entries) = self.children.get_mut(&key) else {
            return Vec::new();
        };

        let orders = FractionalOrderCalculator::rebalance(entries.len());
        for (entry, order) in entries.iter_mut().zip(orders) {
            entry.order = order;
        }
        tracing::debug!(
            "Rebalanced {} order keys in scope '{}'",
            entries.len(),
            scope_label(parent_id)
        );
        self.edges_of(parent_id)
    }

    /// Every scope that currently has at least one child
    pub fn scopes(&self) -> Vec<ParentKey> {
        self.children.keys().cloned().collect()
    }

    pub(crate) fn clear(&mut self) {
        self.children.clear();
        self.parents.clear();
    }

    fn entries(&self, parent_id: Option<&str>) -> Option<&Vec<ChildEntry>> {
        // HashMap<Option<String>, _> cannot be queried with Option<&str> directly
        self.children.get(&parent_id.map(str::to_string))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree_with_root_children(ids: &[&str]) -> StructureTree {
        let mut tree = StructureTree::new();
        for id in ids {
            let order = tree.order_for_append(None);
            tree.add_edge(None, id, order).unwrap();
        }
        tree
    }

    #[test]
    fn test_append_orders_start_at_one() {
        let tree = tree_with_root_children(&["a", "b", "c"]);
        assert_eq!(tree.children_of(None), vec!["a", "b", "c"]);
        assert_eq!(tree.order_of(None, "a"), Some(1.0));
        assert_eq!(tree.order_of(None, "c"), Some(3.0));
    }

    #[test]
    fn test_order_after_uses_midpoint_and_tail() {
        let tree = tree_with_root_children(&["a", "b"]);
        assert_eq!(tree.order_after(None, Some("a")).unwrap(), 1.5);
        assert_eq!(tree.order_after(None, Some("b")).unwrap(), 3.0);
        assert_eq!(tree.order_after(None, None).unwrap(), 0.0);
        assert!(tree.order_after(None, Some("zzz")).is_err());
    }

    #[test]
    fn test_order_after_in_empty_scope() {
        let tree = StructureTree::new();
        assert_eq!(tree.order_after(Some("p"), None).unwrap(), 1.0);
    }

    #[test]
    fn test_insert_between_keeps_existing_keys() {
        let mut tree = tree_with_root_children(&["a", "b"]);
        let order = tree.order_after(None, Some("a")).unwrap();
        tree.add_edge(None, "x", order).unwrap();

        assert_eq!(tree.children_of(None), vec!["a", "x", "b"]);
        assert_eq!(tree.order_of(None, "a"), Some(1.0));
        assert_eq!(tree.order_of(None, "b"), Some(2.0));
    }

    #[test]
    fn test_duplicate_order_falls_back_to_append() {
        let mut tree = tree_with_root_children(&["a", "b"]);
        let used = tree.add_edge(None, "x", 1.0).unwrap();
        assert_eq!(used, 3.0);
        assert_eq!(tree.children_of(None), vec!["a", "b", "x"]);
    }

    #[test]
    fn test_self_referential_edge_rejected() {
        let mut tree = StructureTree::new();
        assert_eq!(
            tree.add_edge(Some("a"), "a", 1.0),
            Err(TreeError::self_reference("a"))
        );
        assert!(tree.scopes().is_empty());
    }

    #[test]
    fn test_move_edge_is_atomic() {
        let mut tree = tree_with_root_children(&["a", "b"]);
        tree.move_edge(None, Some("a"), "b", 1.0).unwrap();

        assert_eq!(tree.children_of(None), vec!["a"]);
        assert_eq!(tree.children_of(Some("a")), vec!["b"]);
        let parents = tree.parents_of("b");
        assert_eq!(parents.len(), 1);
        assert!(parents.contains(&Some("a".to_string())));
    }

    #[test]
    fn test_move_edge_rejects_unknown_source_without_changes() {
        let mut tree = tree_with_root_children(&["a"]);
        assert!(tree.move_edge(Some("x"), None, "a", 5.0).is_err());
        assert_eq!(tree.order_of(None, "a"), Some(1.0));
    }

    #[test]
    fn test_parents_of_tolerates_temporary_double_parent() {
        let mut tree = tree_with_root_children(&["a", "p"]);
        tree.add_edge(Some("p"), "a", 1.0).unwrap();
        assert_eq!(tree.parents_of("a").len(), 2);

        tree.remove_edge(None, "a");
        assert_eq!(tree.parent_of("a"), Some(Some("p".to_string())));
    }

    #[test]
    fn test_rebalance_renumbers_scope() {
        let mut tree = StructureTree::new();
        tree.add_edge(None, "a", 1.0).unwrap();
        tree.add_edge(None, "b", 1.00001).unwrap();
        tree.add_edge(None, "c", 1.00002).unwrap();
        assert!(tree.needs_rebalance(None, 0.0001));

        let edges = tree.rebalance(None);
        assert_eq!(edges.len(), 3);
        assert_eq!(tree.children_of(None), vec!["a", "b", "c"]);
        assert_eq!(tree.order_of(None, "c"), Some(3.0));
        assert!(!tree.needs_rebalance(None, 0.0001));
    }

    #[test]
    fn test_detach_removes_all_edges() {
        let mut tree = tree_with_root_children(&["a"]);
        tree.add_edge(Some("p"), "a", 1.0).unwrap();
        tree.detach("a");
        assert!(!tree.has_edge("a"));
        assert!(tree.children_of(None).is_empty());
        assert!(tree.children_of(Some("p")).is_empty());
    }
}
