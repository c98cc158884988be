//! DocumentTree - node table, structure tree and sibling chain kept in agreement
//!
//! The three structures are owned together so that every primitive here
//! leaves them consistent: a record's `parent_id` matches its edge, its
//! `before_sibling_id` matches the edge order, and its `depth` is one more
//! than its parent's.
//!
//! Primitives validate before they touch anything. Once a primitive starts
//! writing it only fails on internal inconsistency, which callers surface as
//! chain corruption and fix with [`DocumentTree::repair_scope`].

use crate::db::{FractionalOrderCalculator, DEFAULT_REBALANCE_THRESHOLD};
use crate::models::{scope_label, HierarchyEdge, Node, ParentKey};
use crate::tree::{NodeTable, SiblingChain, StructureTree, TreeError};
use serde::Serialize;
use std::collections::HashSet;

/// Where a node ended up after being placed in a scope
#[derive(Debug, Clone, PartialEq)]
pub struct Placement {
    pub edge: HierarchyEdge,
    /// Every edge of the scope when the placement triggered a rebalance
    pub rebalanced: Vec<HierarchyEdge>,
}

/// Result of removing a node and promoting its children
#[derive(Debug, Clone)]
pub struct Removal {
    pub node: Node,
    pub promoted: Vec<HierarchyEdge>,
    pub rebalanced: Vec<HierarchyEdge>,
}

/// One row of the flattened, visually ordered outline
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutlineRow {
    pub id: String,
    pub depth: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityViolation {
    #[serde(with = "crate::models::edge::root_sentinel")]
    pub scope: ParentKey,
    pub reason: String,
}

/// Outcome of checking every scope
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityReport {
    pub scopes_checked: usize,
    pub violations: Vec<IntegrityViolation>,
}

impl IntegrityReport {
    pub fn is_healthy(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Counters from an initial load
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadReport {
    pub nodes_loaded: usize,
    pub nodes_skipped: usize,
    pub edges_loaded: usize,
    pub edges_skipped: usize,
    /// Records with no edge, attached by their `parent_id`
    pub attached_without_edge: usize,
    /// Nodes reattached to the root scope to break a parent cycle
    pub cycles_broken: usize,
}

#[derive(Debug, Clone)]
pub struct DocumentTree {
    pub(crate) table: NodeTable,
    pub(crate) structure: StructureTree,
    pub(crate) chain: SiblingChain,
    rebalance_threshold: f64,
}

impl Default for DocumentTree {
    fn default() -> Self {
        Self::new(DEFAULT_REBALANCE_THRESHOLD)
    }
}

impl DocumentTree {
    pub fn new(rebalance_threshold: f64) -> Self {
        Self {
            table: NodeTable::new(),
            structure: StructureTree::new(),
            chain: SiblingChain::new(),
            rebalance_threshold,
        }
    }

    pub fn table(&self) -> &NodeTable {
        &self.table
    }

    pub fn structure(&self) -> &StructureTree {
        &self.structure
    }

    pub fn chain(&self) -> &SiblingChain {
        &self.chain
    }

    pub fn get(&self, id: &str) -> Option<&Node> {
        self.table.get(id)
    }

    pub fn require(&self, id: &str) -> Result<&Node, TreeError> {
        self.table.require(id)
    }

    pub fn children_of(&self, parent_id: Option<&str>) -> Vec<String> {
        self.structure.children_of(parent_id)
    }

    /// Sibling rendered directly before `id`
    pub fn previous_sibling(&self, id: &str) -> Option<String> {
        self.table.get(id)?.before_sibling_id.clone()
    }

    /// Siblings rendered after `id`, in order
    pub fn following_siblings(&self, id: &str) -> Vec<String> {
        let Some(node) = self.table.get(id) else {
            return Vec::new();
        };
        let siblings = self.structure.children_of(node.parent_id.as_deref());
        match siblings.iter().position(|sibling| sibling == id) {
            Some(index) => siblings[index + 1..].to_vec(),
            None => Vec::new(),
        }
    }

    /// Depth a child of `parent_id` must have
    pub fn depth_for(&self, parent_id: Option<&str>) -> Result<u32, TreeError> {
        match parent_id {
            None => Ok(0),
            Some(parent) => Ok(self.table.require(parent)?.depth + 1),
        }
    }

    /// True when `id` sits somewhere below `ancestor`
    pub fn is_descendant(&self, ancestor: &str, id: &str) -> bool {
        let mut current = self.table.get(id).and_then(|node| node.parent_id.clone());
        // bounded so a corrupted parent cycle cannot spin forever
        for _ in 0..=self.table.len() {
            match current {
                Some(ref parent) if parent == ancestor => return true,
                Some(parent) => {
                    current = self.table.get(&parent).and_then(|node| node.parent_id.clone());
                }
                None => return false,
            }
        }
        false
    }

    /// Insert a new record directly after `after_id`, or as last child when `None`
    pub fn insert_node(
        &mut self,
        mut node: Node,
        after_id: Option<&str>,
    ) -> Result<Placement, TreeError> {
        node.validate()?;
        let parent = node.parent_id.clone();
        let scope = parent.as_deref();
        if scope == Some(node.id.as_str()) {
            return Err(TreeError::self_reference(&node.id));
        }
        node.depth = self.depth_for(scope)?;

        let after = match after_id {
            Some(after) => Some(after.to_string()),
            None => self.structure.last_child(scope),
        };
        let order = match after.as_deref() {
            Some(after) => self.structure.order_after(scope, Some(after))?,
            None => self.structure.order_for_append(scope),
        };

        let id = node.id.clone();
        node.before_sibling_id = None;
        self.table.set(node)?;
        let order = self.structure.add_edge(scope, &id, order)?;
        self.link_at_key(scope, &id)?;

        Ok(self.placement(scope, &id, order))
    }

    /// Move `id` under `new_parent`, directly after `after_id` (last child when `None`)
    ///
    /// Rejects self-parenting and moving a node under its own descendant.
    /// Depths of the moved subtree are recomputed.
    pub fn relocate(
        &mut self,
        id: &str,
        new_parent: Option<&str>,
        after_id: Option<&str>,
    ) -> Result<Placement, TreeError> {
        self.table.require(id)?;
        if new_parent == Some(id) || after_id == Some(id) {
            return Err(TreeError::self_reference(id));
        }
        if let Some(parent) = new_parent {
            self.table.require(parent)?;
            if self.is_descendant(id, parent) {
                return Err(TreeError::self_reference(id));
            }
        }

        let after = match after_id {
            Some(after) => Some(after.to_string()),
            None => self
                .structure
                .children_of(new_parent)
                .into_iter()
                .filter(|child| child != id)
                .last(),
        };
        let order = match after.as_deref() {
            Some(after) => self.structure.order_after(new_parent, Some(after))?,
            None => self.structure.order_for_append(new_parent),
        };

        let placement = self.place(id, new_parent, order)?;
        self.recompute_depths(id)?;
        Ok(placement)
    }

    /// Remove `id`, promoting its children into its former position
    ///
    /// Children keep their relative order and take keys between the removed
    /// node's key and its successor's. Their subtrees shift up one level.
    pub fn remove_node(&mut self, id: &str) -> Result<Removal, TreeError> {
        let node = self.table.require(id)?;
        let parent = node.parent_id.clone();
        let scope = parent.as_deref();

        let removed_order = self
            .structure
            .order_of(scope, id)
            .unwrap_or_else(|| self.structure.order_for_append(scope));
        let next_order = self
            .structure
            .next_sibling(scope, id)
            .and_then(|next| self.structure.order_of(scope, &next));
        let children = self.structure.children_of(Some(id));

        self.chain.remove(&mut self.table, id)?;
        self.structure.remove_edge(scope, id);

        let orders = FractionalOrderCalculator::spread_orders(removed_order, next_order, children.len());
        let mut promoted = Vec::with_capacity(children.len());
        for (child, order) in children.iter().zip(orders) {
            let order = self.structure.move_edge(Some(id), scope, child, order)?;
            self.link_at_key(scope, child)?;
            self.table.set_parent(child, scope)?;
            promoted.push(HierarchyEdge::new(scope, child, order));
        }
        for child in &children {
            self.recompute_depths(child)?;
        }

        let rebalanced = self.rebalance_if_needed(scope);
        if !rebalanced.is_empty() {
            for edge in &mut promoted {
                if let Some(order) = self.structure.order_of(scope, &edge.child_id) {
                    edge.order = order;
                }
            }
        }

        let node = self.table.delete(id)?;
        Ok(Removal {
            node,
            promoted,
            rebalanced,
        })
    }

    /// Recompute depths of `id` and its whole subtree from its parent's depth
    pub fn recompute_depths(&mut self, id: &str) -> Result<(), TreeError> {
        let parent = self.table.require(id)?.parent_id.clone();
        let base = self.depth_for(parent.as_deref())?;

        let mut stack = vec![(id.to_string(), base)];
        let mut seen = HashSet::new();
        while let Some((current, depth)) = stack.pop() {
            if !seen.insert(current.clone()) {
                continue;
            }
            self.table.set_depth(&current, depth)?;
            for child in self.structure.children_of(Some(&current)) {
                stack.push((child, depth + 1));
            }
        }
        Ok(())
    }

    /// Check one scope: chain walk, chain/edge agreement, parent and depth fields
    pub fn verify_scope(&self, scope: Option<&str>) -> Result<(), TreeError> {
        let label = scope_label(scope);
        let chained = self.chain.traverse(&self.table, scope)?;
        let edges = self.structure.children_of(scope);
        if chained != edges {
            return Err(TreeError::chain_corruption(
                label,
                format!("chain order {chained:?} disagrees with edge order {edges:?}"),
            ));
        }

        let expected_depth = self.depth_for(scope)?;
        for id in &edges {
            let node = self.table.require(id)?;
            if node.parent_id.as_deref() != scope {
                return Err(TreeError::chain_corruption(
                    label,
                    format!("'{id}' records parent {:?}", node.parent_id),
                ));
            }
            if node.depth != expected_depth {
                return Err(TreeError::chain_corruption(
                    label,
                    format!("'{id}' has depth {} (expected {expected_depth})", node.depth),
                ));
            }
        }
        Ok(())
    }

    /// Check every scope known to either the edges or the chain
    pub fn verify_all(&self) -> IntegrityReport {
        let mut scopes: Vec<ParentKey> = self.structure.scopes();
        for scope in self.chain.scopes() {
            if !scopes.contains(&scope) {
                scopes.push(scope);
            }
        }
        scopes.sort();

        let mut report = IntegrityReport {
            scopes_checked: scopes.len(),
            violations: Vec::new(),
        };
        for scope in scopes {
            if let Err(e) = self.verify_scope(scope.as_deref()) {
                report.violations.push(IntegrityViolation {
                    scope,
                    reason: e.to_string(),
                });
            }
        }

        for node in self.table.iter() {
            if !self.structure.has_edge(&node.id) {
                report.violations.push(IntegrityViolation {
                    scope: node.parent_id.clone(),
                    reason: format!("'{}' has no structural edge", node.id),
                });
            }
        }
        report
    }

    /// Rebuild a scope's chain from its edge order and refresh child depths
    pub fn repair_scope(&mut self, scope: Option<&str>) -> Result<(), TreeError> {
        let ordered = self.structure.children_of(scope);
        self.chain.rebuild(&mut self.table, scope, &ordered)?;
        for id in &ordered {
            self.table.set_parent(id, scope)?;
            self.recompute_depths(id)?;
        }
        tracing::warn!(
            "Repaired sibling chain for scope '{}' ({} children)",
            scope_label(scope),
            ordered.len()
        );
        Ok(())
    }

    /// Replace the whole document with records and edges from the backing store
    ///
    /// Edges are authoritative for structure. Edges naming unknown nodes are
    /// skipped, records without an edge are attached by their `parent_id`,
    /// and any parent cycle is broken by reattaching a member to the root.
    pub fn load(&mut self, nodes: Vec<Node>, edges: Vec<HierarchyEdge>) -> LoadReport {
        self.table.clear();
        self.structure.clear();
        self.chain.clear();

        let mut report = LoadReport::default();
        for mut node in nodes {
            node.is_placeholder = false;
            let id = node.id.clone();
            match self.table.set(node) {
                Ok(()) => report.nodes_loaded += 1,
                Err(e) => {
                    tracing::warn!("Skipping invalid node '{}' during load: {}", id, e);
                    report.nodes_skipped += 1;
                }
            }
        }

        for edge in edges {
            let parent_known = edge
                .parent_id
                .as_deref()
                .map_or(true, |parent| self.table.contains(parent));
            if !self.table.contains(&edge.child_id)
                || !parent_known
                || self.structure.has_edge(&edge.child_id)
            {
                tracing::warn!(
                    "Skipping edge {} -> {} during load",
                    scope_label(edge.parent_id.as_deref()),
                    edge.child_id
                );
                report.edges_skipped += 1;
                continue;
            }
            match self
                .structure
                .add_edge(edge.parent_id.as_deref(), &edge.child_id, edge.order)
            {
                Ok(_) => report.edges_loaded += 1,
                Err(e) => {
                    tracing::warn!("Skipping edge for '{}': {}", edge.child_id, e);
                    report.edges_skipped += 1;
                }
            }
        }

        let mut unattached: Vec<(String, ParentKey)> = self
            .table
            .iter()
            .filter(|node| !self.structure.has_edge(&node.id))
            .map(|node| (node.id.clone(), node.parent_id.clone()))
            .collect();
        unattached.sort();
        for (id, parent) in unattached {
            let parent = parent.filter(|parent| parent != &id && self.table.contains(parent));
            let order = self.structure.order_for_append(parent.as_deref());
            if self.structure.add_edge(parent.as_deref(), &id, order).is_ok() {
                report.attached_without_edge += 1;
            }
        }

        report.cycles_broken = self.break_cycles();

        let ids: Vec<String> = self.table.ids().cloned().collect();
        for id in &ids {
            if let Some(parent) = self.structure.parent_of(id) {
                // ids come from the table, so these cannot miss
                let _ = self.table.set_parent(id, parent.as_deref());
            }
        }

        let mut scopes = self.structure.scopes();
        scopes.sort();
        for scope in scopes {
            let ordered = self.structure.children_of(scope.as_deref());
            if let Err(e) = self.chain.rebuild(&mut self.table, scope.as_deref(), &ordered) {
                tracing::error!(
                    "Failed to build sibling chain for scope '{}': {}",
                    scope_label(scope.as_deref()),
                    e
                );
            }
        }

        for id in self.structure.children_of(None) {
            let _ = self.recompute_depths(&id);
        }

        tracing::info!(
            "Loaded {} nodes and {} edges ({} skipped)",
            report.nodes_loaded,
            report.edges_loaded,
            report.edges_skipped
        );
        report
    }

    /// Insert or refresh a record fetched from the backing store
    ///
    /// Known records keep their in-memory position and are only replaced when
    /// the incoming version is not older. Unknown records are appended under
    /// their `parent_id` (root when that parent is not loaded). Returns true
    /// when the record was new.
    pub fn hydrate(&mut self, node: Node) -> Result<bool, TreeError> {
        if let Some(current) = self.table.get(&node.id) {
            if node.version >= current.version {
                let mut merged = current.clone();
                merged.node_type = node.node_type;
                merged.content = node.content;
                merged.properties = node.properties;
                merged.version = node.version;
                merged.modified_at = node.modified_at;
                merged.is_placeholder = false;
                self.table.set(merged)?;
            }
            return Ok(false);
        }

        let mut node = node;
        node.is_placeholder = false;
        if node
            .parent_id
            .as_deref()
            .is_some_and(|parent| !self.table.contains(parent))
        {
            node.parent_id = None;
        }
        self.insert_node(node, None)?;
        Ok(true)
    }

    /// Depth-first outline of the whole document in visual order
    pub fn outline(&self) -> Vec<OutlineRow> {
        let mut rows = Vec::with_capacity(self.table.len());
        let mut stack: Vec<String> = self.structure.children_of(None).into_iter().rev().collect();
        let mut seen = HashSet::new();
        while let Some(id) = stack.pop() {
            if !seen.insert(id.clone()) {
                continue;
            }
            let depth = self.table.get(&id).map_or(0, |node| node.depth);
            stack.extend(self.structure.children_of(Some(&id)).into_iter().rev());
            rows.push(OutlineRow { id, depth });
        }
        rows
    }

    /// Move an already-validated node to `order` under `new_parent`
    fn place(
        &mut self,
        id: &str,
        new_parent: Option<&str>,
        order: f64,
    ) -> Result<Placement, TreeError> {
        let old_parent = self.table.require(id)?.parent_id.clone();
        let order = if self.structure.order_of(old_parent.as_deref(), id).is_some() {
            self.structure
                .move_edge(old_parent.as_deref(), new_parent, id, order)?
        } else {
            self.structure.add_edge(new_parent, id, order)?
        };
        self.link_at_key(new_parent, id)?;
        self.table.set_parent(id, new_parent)?;
        Ok(self.placement(new_parent, id, order))
    }

    /// Splice `id` into the chain behind whatever its order key sorts after
    ///
    /// The key actually stored may differ from the requested one when a
    /// collision forced an append.
    fn link_at_key(&mut self, scope: Option<&str>, id: &str) -> Result<(), TreeError> {
        let anchor = self.structure.previous_sibling(scope, id);
        self.chain
            .insert_after(&mut self.table, scope, id, anchor.as_deref())
    }

    fn placement(&mut self, scope: Option<&str>, id: &str, order: f64) -> Placement {
        let rebalanced = self.rebalance_if_needed(scope);
        let order = self.structure.order_of(scope, id).unwrap_or(order);
        Placement {
            edge: HierarchyEdge::new(scope, id, order),
            rebalanced,
        }
    }

    fn rebalance_if_needed(&mut self, scope: Option<&str>) -> Vec<HierarchyEdge> {
        if self.structure.needs_rebalance(scope, self.rebalance_threshold) {
            self.structure.rebalance(scope)
        } else {
            Vec::new()
        }
    }

    /// Reattach one member of every parent cycle to the root scope
    fn break_cycles(&mut self) -> usize {
        let mut broken = 0;
        let mut settled: HashSet<String> = HashSet::new();
        let mut ids: Vec<String> = self.table.ids().cloned().collect();
        ids.sort();

        for start in ids {
            let mut path = Vec::new();
            let mut on_path = HashSet::new();
            let mut current = Some(start);
            while let Some(id) = current {
                if settled.contains(&id) {
                    break;
                }
                if !on_path.insert(id.clone()) {
                    let parent = self.structure.parent_of(&id).flatten();
                    tracing::warn!(
                        "Parent cycle through '{}' detected during load, attaching it to root",
                        id
                    );
                    let order = self.structure.order_for_append(None);
                    if self
                        .structure
                        .move_edge(parent.as_deref(), None, &id, order)
                        .is_ok()
                    {
                        broken += 1;
                    }
                    break;
                }
                path.push(id.clone());
                current = self.structure.parent_of(&id).flatten();
            }
            settled.extend(path);
        }
        broken
    }
}
