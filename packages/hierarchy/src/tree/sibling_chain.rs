//! SiblingChain - linked-list view over each sibling set
//!
//! Every node stores `before_sibling_id`: the sibling it is rendered after,
//! or `None` when it is the first child of its scope. The chain keeps a
//! reverse index (`next`) and the head of each scope so that insert-after and
//! remove-and-relink touch at most two records.
//!
//! This is the only writer of `before_sibling_id`. `traverse` reads the
//! pointers back from the node table rather than from the index, so it sees
//! exactly what a reader of the records would see and can report corruption.

use crate::models::{scope_label, ParentKey};
use crate::tree::{NodeTable, TreeError};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Default, Clone)]
pub struct SiblingChain {
    members: HashMap<ParentKey, HashSet<String>>,
    scope_of: HashMap<String, ParentKey>,
    /// id -> sibling whose `before_sibling_id` is id
    next: HashMap<String, String>,
    first: HashMap<ParentKey, String>,
}

impl SiblingChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scope the node is currently linked into
    pub fn scope_of(&self, id: &str) -> Option<&ParentKey> {
        self.scope_of.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.scope_of.contains_key(id)
    }

    /// Number of linked members in a scope
    pub fn len(&self, scope: Option<&str>) -> usize {
        self.members
            .get(&scope.map(str::to_string))
            .map_or(0, HashSet::len)
    }

    /// Link `new_id` directly after `after_id` (or at the head when `None`)
    ///
    /// The sibling that previously followed `after_id` (or the old head) is
    /// repointed to `new_id`. A node already linked elsewhere is unlinked
    /// first.
    pub fn insert_after(
        &mut self,
        table: &mut NodeTable,
        scope: Option<&str>,
        new_id: &str,
        after_id: Option<&str>,
    ) -> Result<(), TreeError> {
        if after_id == Some(new_id) {
            return Err(TreeError::self_reference(new_id));
        }
        table.require(new_id)?;

        let key: ParentKey = scope.map(str::to_string);
        if let Some(after) = after_id {
            if self.scope_of.get(after) != Some(&key) {
                return Err(TreeError::not_in_scope(after, scope_label(scope)));
            }
        }

        if self.contains(new_id) {
            self.remove(table, new_id)?;
        }

        let successor = match after_id {
            Some(after) => self.next.get(after).cloned(),
            None => self.first.get(&key).cloned(),
        };

        table.set_before_sibling(new_id, after_id)?;
        if let Some(successor) = successor {
            table.set_before_sibling(&successor, Some(new_id))?;
            self.next.insert(new_id.to_string(), successor);
        }
        match after_id {
            Some(after) => {
                self.next.insert(after.to_string(), new_id.to_string());
            }
            None => {
                self.first.insert(key.clone(), new_id.to_string());
            }
        }

        self.members
            .entry(key.clone())
            .or_default()
            .insert(new_id.to_string());
        self.scope_of.insert(new_id.to_string(), key);
        Ok(())
    }

    /// Unlink `id`, repointing its successor at its predecessor
    ///
    /// Must be called while the record is still in the table. Unlinking a node
    /// that is not linked is a no-op.
    pub fn remove(&mut self, table: &mut NodeTable, id: &str) -> Result<(), TreeError> {
        let Some(key) = self.scope_of.get(id).cloned() else {
            return Ok(());
        };
        let before = table.require(id)?.before_sibling_id.clone();

        let successor = self.next.remove(id);
        match (&successor, &before) {
            (Some(successor), Some(before)) => {
                table.set_before_sibling(successor, Some(before))?;
                self.next.insert(before.clone(), successor.clone());
            }
            (Some(successor), None) => {
                table.set_before_sibling(successor, None)?;
                self.first.insert(key.clone(), successor.clone());
            }
            (None, Some(before)) => {
                self.next.remove(before);
            }
            (None, None) => {
                self.first.remove(&key);
            }
        }

        table.set_before_sibling(id, None)?;
        self.scope_of.remove(id);
        if let Some(members) = self.members.get_mut(&key) {
            members.remove(id);
            if members.is_empty() {
                self.members.remove(&key);
            }
        }
        Ok(())
    }

    /// Forget a node whose record is already gone from the table
    pub(crate) fn forget(&mut self, id: &str) {
        if let Some(key) = self.scope_of.remove(id) {
            if let Some(members) = self.members.get_mut(&key) {
                members.remove(id);
            }
            if self.first.get(&key).map(String::as_str) == Some(id) {
                self.first.remove(&key);
            }
        }
        self.next.remove(id);
        self.next.retain(|_, successor| successor != id);
    }

    /// Walk a scope from its unique first child
    ///
    /// Fails with `ChainCorruption` when the scope has zero or several heads,
    /// a pointer names a node outside the scope, two siblings claim the same
    /// predecessor, or some members are unreachable (cycle or orphan).
    pub fn traverse(&self, table: &NodeTable, scope: Option<&str>) -> Result<Vec<String>, TreeError> {
        let key: ParentKey = scope.map(str::to_string);
        let Some(members) = self.members.get(&key) else {
            return Ok(Vec::new());
        };
        let label = scope_label(scope);

        let mut heads = Vec::new();
        let mut successors: HashMap<&str, &str> = HashMap::new();
        for id in members {
            let node = table.require(id)?;
            match node.before_sibling_id.as_deref() {
                None => heads.push(id.as_str()),
                Some(before) if !members.contains(before) => {
                    return Err(TreeError::chain_corruption(
                        label,
                        format!("'{id}' points at '{before}' which is not a sibling"),
                    ));
                }
                Some(before) => {
                    if let Some(other) = successors.insert(before, id.as_str()) {
                        return Err(TreeError::chain_corruption(
                            label,
                            format!("'{other}' and '{id}' both follow '{before}'"),
                        ));
                    }
                }
            }
        }

        if heads.is_empty() {
            return Err(TreeError::chain_corruption(label, "no first child (cycle)"));
        }
        if heads.len() > 1 {
            heads.sort_unstable();
            return Err(TreeError::chain_corruption(
                label,
                format!("multiple first children: {}", heads.join(", ")),
            ));
        }
        let head = heads[0];

        let mut ordered = Vec::with_capacity(members.len());
        let mut visited = HashSet::with_capacity(members.len());
        let mut current = Some(head);
        while let Some(id) = current {
            if !visited.insert(id) {
                return Err(TreeError::chain_corruption(
                    label,
                    format!("cycle through '{id}'"),
                ));
            }
            ordered.push(id.to_string());
            current = successors.get(id).copied();
        }

        if ordered.len() != members.len() {
            let mut orphans: Vec<&str> = members
                .iter()
                .map(String::as_str)
                .filter(|id| !visited.contains(id))
                .collect();
            orphans.sort_unstable();
            return Err(TreeError::chain_corruption(
                label,
                format!("unreachable siblings: {}", orphans.join(", ")),
            ));
        }
        Ok(ordered)
    }

    /// Check a scope's chain, discarding the order
    pub fn verify(&self, table: &NodeTable, scope: Option<&str>) -> Result<(), TreeError> {
        self.traverse(table, scope).map(|_| ())
    }

    /// Rewrite a scope's pointers to follow `ordered_ids`
    ///
    /// Reconciliation step for initial load and repair. Previous members that
    /// are not in `ordered_ids` are unlinked from this scope.
    pub fn rebuild(
        &mut self,
        table: &mut NodeTable,
        scope: Option<&str>,
        ordered_ids: &[String],
    ) -> Result<(), TreeError> {
        for id in ordered_ids {
            table.require(id)?;
        }

        let key: ParentKey = scope.map(str::to_string);
        if let Some(previous) = self.members.remove(&key) {
            for id in previous {
                self.scope_of.remove(&id);
                self.next.remove(&id);
            }
        }
        self.first.remove(&key);

        for id in ordered_ids {
            if let Some(other) = self.scope_of.get(id).cloned() {
                if other != key {
                    self.remove(table, id)?;
                }
            }
        }

        let mut before: Option<&str> = None;
        for id in ordered_ids {
            table.set_before_sibling(id, before)?;
            match before {
                Some(prev) => {
                    self.next.insert(prev.to_string(), id.clone());
                }
                None => {
                    self.first.insert(key.clone(), id.clone());
                }
            }
            self.scope_of.insert(id.clone(), key.clone());
            before = Some(id);
        }
        if let Some(last) = ordered_ids.last() {
            self.next.remove(last);
        }
        if !ordered_ids.is_empty() {
            self.members
                .insert(key, ordered_ids.iter().cloned().collect());
        }
        Ok(())
    }

    /// Every scope with at least one linked member
    pub fn scopes(&self) -> Vec<ParentKey> {
        self.members.keys().cloned().collect()
    }

    pub(crate) fn clear(&mut self) {
        self.members.clear();
        self.scope_of.clear();
        self.next.clear();
        self.first.clear();
    }
}
