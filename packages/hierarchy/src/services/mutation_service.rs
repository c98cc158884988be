//! MutationService - atomic structural and content transitions
//!
//! Every public operation is one logical transition:
//!
//! 1. take the document write lock
//! 2. validate (any failure returns here, nothing has changed)
//! 3. apply the change to the node table, structure tree and sibling chain
//! 4. verify every touched scope; repair and report corruption if found
//! 5. hand the resulting backing-store writes to the persistence coordinator
//! 6. release the lock, then notify subscribers synchronously
//!
//! There is no await between the first and last write, so no caller ever
//! observes a half-applied transition. Writes are scheduled while the lock is
//! still held so the coordinator sees them in commit order.
//!
//! # Placeholders
//!
//! A node created with empty content is a placeholder: it exists in memory
//! and is visible to every viewer, but nothing is written for it. It is
//! promoted (creation write plus edge write) as soon as its content becomes
//! non-empty, or when a durable node is placed under it.

use crate::models::{HierarchyEdge, Node, ParentKey, ROOT_SCOPE};
use crate::services::events::{Diagnostic, DiagnosticKind, DomainEvent, StructuralOperation};
use crate::services::{ContentProcessor, MutationError, PersistenceCoordinator, SubscriberHub};
use crate::tree::{DocumentTree, IntegrityReport, LoadReport, Placement};
use serde_json::Value;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Parameters for creating a node
///
/// # Placement
///
/// - `insert_after_node_id` set: the node goes directly after that sibling and
///   its parent is derived from the sibling (`parent_id` is ignored)
/// - otherwise the node is appended as the last child of `parent_id`
///   (`None` = root scope)
///
/// # ID Generation
///
/// `id: None` generates a UUID v4. Callers that pre-generate ids for
/// optimistic UI tracking pass them in; a duplicate id is rejected.
///
/// # Examples
///
/// ```
/// # use nodespace_hierarchy::services::CreateNodeParams;
/// let params = CreateNodeParams::text("Buy milk").under("list-1");
/// assert_eq!(params.parent_id.as_deref(), Some("list-1"));
/// assert_eq!(params.node_type, "text");
/// ```
#[derive(Debug, Clone)]
pub struct CreateNodeParams {
    /// Optional ID for the node. If None, a UUID is generated
    pub id: Option<String>,
    /// Type of the node (text, task, header, ...)
    pub node_type: String,
    /// Content of the node; empty creates a placeholder
    pub content: String,
    /// Parent node ID (None = root scope)
    pub parent_id: Option<String>,
    /// Sibling to insert after (if None, appends to end)
    pub insert_after_node_id: Option<String>,
    /// Additional node properties as JSON
    pub properties: Value,
}

impl CreateNodeParams {
    /// Root-scope text node with no properties
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            id: None,
            node_type: "text".to_string(),
            content: content.into(),
            parent_id: None,
            insert_after_node_id: None,
            properties: Value::Object(Default::default()),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_type(mut self, node_type: impl Into<String>) -> Self {
        self.node_type = node_type.into();
        self
    }

    pub fn with_properties(mut self, properties: Value) -> Self {
        self.properties = properties;
        self
    }

    /// Append as last child of `parent_id`
    pub fn under(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    /// Insert directly after `sibling_id`, in that sibling's scope
    pub fn after(mut self, sibling_id: impl Into<String>) -> Self {
        self.insert_after_node_id = Some(sibling_id.into());
        self
    }
}

/// Outcome of indent/outdent/move
///
/// Indent and outdent have soft failures that are not errors: the editor
/// simply ignores Tab on a first child or Shift+Tab at the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MoveOutcome {
    Moved { new_parent_id: Option<String> },
    NoPreviousSibling,
    AlreadyAtRoot,
}

/// Backing-store write produced by a transition
#[derive(Debug, Clone, PartialEq)]
enum PendingWrite {
    Create(Node),
    Content {
        id: String,
        content: String,
        version: i64,
    },
    Properties {
        id: String,
        patch: Value,
        version: i64,
    },
    Edge(HierarchyEdge),
    Delete(String),
}

/// Events, writes and touched scopes collected during one transition
#[derive(Debug, Default)]
struct TransitionLog {
    viewer: Option<String>,
    events: Vec<DomainEvent>,
    writes: Vec<PendingWrite>,
    scopes: Vec<ParentKey>,
}

impl TransitionLog {
    fn new(viewer: Option<String>) -> Self {
        Self {
            viewer,
            ..Self::default()
        }
    }

    fn viewer(&self) -> Option<String> {
        self.viewer.clone()
    }

    fn touch(&mut self, scope: Option<&str>) {
        let scope: ParentKey = scope.map(str::to_string);
        if !self.scopes.contains(&scope) {
            self.scopes.push(scope);
        }
    }

    fn write(&mut self, write: PendingWrite) {
        self.writes.push(write);
    }

    fn diagnostic(&mut self, kind: DiagnosticKind, node_id: Option<&str>, message: String) {
        self.events
            .push(DomainEvent::Diagnostic(Diagnostic::new(kind, node_id, message)));
    }

    fn node_created(&mut self, node: Node) {
        let source_viewer_id = self.viewer();
        self.events.push(DomainEvent::NodeCreated {
            node,
            source_viewer_id,
        });
    }

    fn content_updated(&mut self, node: &Node, mentions: Vec<String>) {
        let source_viewer_id = self.viewer();
        self.events.push(DomainEvent::ContentUpdated {
            node_id: node.id.clone(),
            content: node.content.clone(),
            version: node.version,
            mentions,
            source_viewer_id,
        });
    }

    fn node_deleted(&mut self, node_id: &str, promoted: &[HierarchyEdge]) {
        let source_viewer_id = self.viewer();
        self.events.push(DomainEvent::NodeDeleted {
            node_id: node_id.to_string(),
            promoted_children: promoted.iter().map(|edge| edge.child_id.clone()).collect(),
            source_viewer_id,
        });
    }

    fn hierarchy_changed(
        &mut self,
        operation: StructuralOperation,
        node_id: &str,
        edges: Vec<HierarchyEdge>,
    ) {
        let source_viewer_id = self.viewer();
        self.events.push(DomainEvent::HierarchyChanged {
            operation,
            node_id: node_id.to_string(),
            edges,
            affected_scopes: self.scopes.clone(),
            source_viewer_id,
        });
    }

    /// Persist a placement, using the rewritten scope when it was rebalanced
    fn record_placement(&mut self, doc: &mut DocumentTree, placement: &Placement) {
        if placement.rebalanced.is_empty() {
            self.record_edge(doc, placement.edge.clone());
        } else {
            for edge in &placement.rebalanced {
                self.record_edge(doc, edge.clone());
            }
        }
    }

    /// Queue an edge write, promoting a placeholder parent first
    ///
    /// Edges of placeholder children are skipped; the child's promotion
    /// writes its edge.
    fn record_edge(&mut self, doc: &mut DocumentTree, edge: HierarchyEdge) {
        let child_is_placeholder = doc
            .get(&edge.child_id)
            .map_or(true, |child| child.is_placeholder);
        if child_is_placeholder {
            return;
        }

        if let Some(parent) = edge.parent_id.as_deref() {
            if doc.get(parent).is_some_and(|node| node.is_placeholder) {
                self.promote(doc, parent);
            }
        }

        self.writes.retain(|write| {
            !matches!(write, PendingWrite::Edge(queued) if queued.child_id == edge.child_id)
        });
        self.writes.push(PendingWrite::Edge(edge));
    }

    /// Turn a placeholder into a durable node: creation write, then its edge
    fn promote(&mut self, doc: &mut DocumentTree, id: &str) {
        if doc.table.set_placeholder(id, false).is_err() {
            return;
        }
        let Some(node) = doc.get(id).cloned() else {
            return;
        };
        tracing::debug!("Promoting placeholder node {}", id);

        self.writes.push(PendingWrite::Create(node));
        let source_viewer_id = self.viewer();
        self.events.push(DomainEvent::PlaceholderPromoted {
            node_id: id.to_string(),
            source_viewer_id,
        });
        if let Some(edge) = doc.structure.edge_of(id) {
            self.record_edge(doc, edge);
        }
    }
}

/// Applies mutations to a shared document
///
/// Cheap to clone; clones share the document, hub and coordinator. Use
/// [`MutationService::with_viewer`] to tag emitted events with a viewer id.
#[derive(Clone)]
pub struct MutationService {
    document: Arc<RwLock<DocumentTree>>,
    hub: Arc<SubscriberHub>,
    persistence: PersistenceCoordinator,
    processor: Arc<dyn ContentProcessor>,
    /// When set, all emitted events carry this id as `source_viewer_id`
    viewer_id: Option<String>,
}

impl std::fmt::Debug for MutationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationService")
            .field("viewer_id", &self.viewer_id)
            .finish()
    }
}

impl MutationService {
    pub fn new(
        document: Arc<RwLock<DocumentTree>>,
        hub: Arc<SubscriberHub>,
        persistence: PersistenceCoordinator,
        processor: Arc<dyn ContentProcessor>,
    ) -> Self {
        Self {
            document,
            hub,
            persistence,
            processor,
            viewer_id: None,
        }
    }

    /// Clone of this service whose events carry `viewer_id`
    pub fn with_viewer(&self, viewer_id: impl Into<String>) -> Self {
        let mut cloned = self.clone();
        cloned.viewer_id = Some(viewer_id.into());
        cloned
    }

    pub fn viewer_id(&self) -> Option<&str> {
        self.viewer_id.as_deref()
    }

    /// Create a node and return its id
    ///
    /// # Errors
    ///
    /// - `InvalidSibling` when `insert_after_node_id` is unknown
    /// - `InvalidParent` when `parent_id` is unknown
    /// - `NodeAlreadyExists` for a duplicate caller-supplied id
    /// - `ValidationFailed` for an empty type or the reserved id `"root"`
    pub fn create_node(&self, params: CreateNodeParams) -> Result<String, MutationError> {
        self.transition("create_node", |doc, log| {
            let parent_id = match params.insert_after_node_id.as_deref() {
                Some(after) => {
                    let sibling = doc
                        .get(after)
                        .ok_or_else(|| MutationError::invalid_sibling(after, "sibling not found"))?;
                    if params.parent_id.is_some() && params.parent_id != sibling.parent_id {
                        tracing::debug!(
                            "create_node: parent derived from sibling {} overrides requested parent",
                            after
                        );
                    }
                    sibling.parent_id.clone()
                }
                None => params.parent_id.clone(),
            };
            if let Some(parent) = parent_id.as_deref() {
                if !doc.table.contains(parent) {
                    return Err(MutationError::invalid_parent(parent));
                }
            }

            let id = params
                .id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            if doc.table.contains(&id) {
                return Err(MutationError::NodeAlreadyExists { id });
            }

            let mut node = Node::new_with_id(
                id.clone(),
                params.node_type.clone(),
                params.content.clone(),
                parent_id.clone(),
                params.properties.clone(),
            );
            node.validate()?;
            node.is_placeholder = node.content.is_empty();

            let placement = doc.insert_node(node, params.insert_after_node_id.as_deref())?;
            log.touch(parent_id.as_deref());

            let node = doc.require(&id)?.clone();
            if !node.is_placeholder {
                log.write(PendingWrite::Create(node.clone()));
            }
            log.record_placement(doc, &placement);

            tracing::debug!(
                "Created {}node {} in scope {}",
                if node.is_placeholder { "placeholder " } else { "" },
                id,
                parent_id.as_deref().unwrap_or(ROOT_SCOPE)
            );
            log.node_created(node);
            log.hierarchy_changed(StructuralOperation::Create, &id, vec![placement.edge]);
            Ok(id)
        })
    }

    /// Delete a node, promoting its children into its position
    pub fn delete_node(&self, id: &str) -> Result<(), MutationError> {
        self.transition("delete_node", |doc, log| {
            let node = doc.require(id)?.clone();
            let removal = doc.remove_node(id)?;
            log.touch(node.parent_id.as_deref());
            log.touch(Some(id));

            if removal.rebalanced.is_empty() {
                for edge in &removal.promoted {
                    log.record_edge(doc, edge.clone());
                }
            } else {
                for edge in &removal.rebalanced {
                    log.record_edge(doc, edge.clone());
                }
            }
            if node.is_placeholder {
                self.persistence.cancel_pending(id);
            } else {
                log.write(PendingWrite::Delete(id.to_string()));
            }

            tracing::debug!(
                "Deleted node {} ({} children promoted)",
                id,
                removal.promoted.len()
            );
            log.node_deleted(id, &removal.promoted);
            log.hierarchy_changed(StructuralOperation::Delete, id, removal.promoted);
            Ok(())
        })
    }

    /// Make `id` the last child of its previous sibling
    pub fn indent_node(&self, id: &str) -> Result<MoveOutcome, MutationError> {
        self.transition("indent_node", |doc, log| {
            let old_parent = doc.require(id)?.parent_id.clone();
            let Some(new_parent) = doc.previous_sibling(id) else {
                return Ok(MoveOutcome::NoPreviousSibling);
            };

            let placement = doc.relocate(id, Some(&new_parent), None)?;
            log.touch(old_parent.as_deref());
            log.touch(Some(&new_parent));
            log.record_placement(doc, &placement);

            tracing::debug!("Indented node {} under {}", id, new_parent);
            log.hierarchy_changed(StructuralOperation::Indent, id, vec![placement.edge]);
            Ok(MoveOutcome::Moved {
                new_parent_id: Some(new_parent),
            })
        })
    }

    /// Move `id` up one level, directly after its former parent
    ///
    /// Siblings that followed `id` become its children, appended after the
    /// children it already has.
    pub fn outdent_node(&self, id: &str) -> Result<MoveOutcome, MutationError> {
        self.transition("outdent_node", |doc, log| {
            let Some(parent) = doc.require(id)?.parent_id.clone() else {
                return Ok(MoveOutcome::AlreadyAtRoot);
            };
            let grandparent = doc.require(&parent)?.parent_id.clone();
            let trailing = doc.following_siblings(id);

            log.touch(Some(&parent));
            log.touch(grandparent.as_deref());
            log.touch(Some(id));

            let mut edges = Vec::with_capacity(trailing.len() + 1);
            for sibling in &trailing {
                let placement = doc.relocate(sibling, Some(id), None)?;
                log.record_placement(doc, &placement);
                edges.push(placement.edge);
            }
            let placement = doc.relocate(id, grandparent.as_deref(), Some(&parent))?;
            log.record_placement(doc, &placement);
            edges.insert(0, placement.edge);

            tracing::debug!(
                "Outdented node {} to scope {} ({} siblings adopted)",
                id,
                grandparent.as_deref().unwrap_or(ROOT_SCOPE),
                trailing.len()
            );
            log.hierarchy_changed(StructuralOperation::Outdent, id, edges);
            Ok(MoveOutcome::Moved {
                new_parent_id: grandparent,
            })
        })
    }

    /// Merge `source` into `target` and remove `source`
    ///
    /// Target content becomes `processor.merge(target, source)`. The source's
    /// children are promoted into the target's scope, directly after the
    /// target and in order, with their subtrees' depths recomputed.
    ///
    /// # Errors
    ///
    /// `CircularReference` when `target` is `source` or one of its
    /// descendants.
    pub fn merge_nodes(&self, source_id: &str, target_id: &str) -> Result<(), MutationError> {
        self.transition("merge_nodes", |doc, log| {
            if source_id == target_id {
                return Err(MutationError::circular_reference(format!(
                    "cannot merge node '{source_id}' into itself"
                )));
            }
            let source = doc.require(source_id)?.clone();
            let target = doc.require(target_id)?.clone();
            if doc.is_descendant(source_id, target_id) {
                return Err(MutationError::circular_reference(format!(
                    "cannot merge node '{source_id}' into its own descendant '{target_id}'"
                )));
            }
            let merged = self.processor.merge(&target.content, &source.content);
            let scope = target.parent_id.clone();

            log.touch(source.parent_id.as_deref());
            log.touch(scope.as_deref());
            log.touch(Some(source_id));

            self.apply_content(doc, log, target_id, merged)?;

            let mut promoted = Vec::new();
            let mut after = target_id.to_string();
            for child in doc.children_of(Some(source_id)) {
                let placement = doc.relocate(&child, scope.as_deref(), Some(&after))?;
                log.record_placement(doc, &placement);
                promoted.push(placement.edge);
                after = child;
            }
            // reread keys in case a later placement renumbered the scope
            for edge in &mut promoted {
                if let Some(order) = doc.structure().order_of(scope.as_deref(), &edge.child_id) {
                    edge.order = order;
                }
            }

            let removal = doc.remove_node(source_id)?;
            for edge in &removal.rebalanced {
                log.record_edge(doc, edge.clone());
            }
            if source.is_placeholder {
                self.persistence.cancel_pending(source_id);
            } else {
                log.write(PendingWrite::Delete(source_id.to_string()));
            }

            tracing::debug!(
                "Merged node {} into {} ({} children promoted)",
                source_id,
                target_id,
                promoted.len()
            );
            log.node_deleted(source_id, &promoted);
            log.hierarchy_changed(StructuralOperation::Merge, source_id, promoted);
            Ok(())
        })
    }

    /// Split `source_id` at a character offset, returning the new node's id
    ///
    /// The source keeps the prefix; a new node holding the suffix is inserted
    /// directly after it and takes over the source's children.
    pub fn split_node(&self, source_id: &str, position: usize) -> Result<String, MutationError> {
        self.transition("split_node", |doc, log| {
            let source = doc.require(source_id)?.clone();
            let length = source.content.chars().count();
            if position > length {
                return Err(MutationError::InvalidSplitPosition {
                    id: source_id.to_string(),
                    position,
                    length,
                });
            }
            let split_at = source
                .content
                .char_indices()
                .nth(position)
                .map_or(source.content.len(), |(index, _)| index);
            let (prefix, suffix) = source.content.split_at(split_at);

            let mut tail = Node::new(
                source.node_type.clone(),
                suffix.to_string(),
                source.parent_id.clone(),
                Value::Object(Default::default()),
            );
            tail.is_placeholder = suffix.is_empty();
            let tail_id = tail.id.clone();

            let placement = doc.insert_node(tail, Some(source_id))?;
            log.touch(source.parent_id.as_deref());
            log.touch(Some(source_id));
            log.touch(Some(&tail_id));

            self.apply_content(doc, log, source_id, prefix.to_string())?;

            let tail = doc.require(&tail_id)?.clone();
            if !tail.is_placeholder {
                log.write(PendingWrite::Create(tail.clone()));
            }
            log.record_placement(doc, &placement);

            let mut edges = vec![placement.edge];
            for child in doc.children_of(Some(source_id)) {
                let moved = doc.relocate(&child, Some(&tail_id), None)?;
                log.record_placement(doc, &moved);
                edges.push(moved.edge);
            }

            tracing::debug!(
                "Split node {} at {} into {} ({} children moved)",
                source_id,
                position,
                tail_id,
                edges.len() - 1
            );
            // a placeholder tail may have been promoted by its adopted children
            let tail = doc.require(&tail_id)?.clone();
            log.node_created(tail);
            log.hierarchy_changed(StructuralOperation::Split, &tail_id, edges);
            Ok(tail_id)
        })
    }

    /// Replace content and return the new version
    ///
    /// Durable nodes get a debounced content write. A placeholder whose
    /// content becomes non-empty is promoted.
    pub fn update_content(&self, id: &str, content: impl Into<String>) -> Result<i64, MutationError> {
        let content = content.into();
        self.transition("update_content", |doc, log| {
            self.apply_content(doc, log, id, content)
        })
    }

    /// Replace content only if the node is still at `expected_version`
    ///
    /// # Errors
    ///
    /// `VersionConflict` carrying the current node when the version moved on.
    pub fn update_content_with_version(
        &self,
        id: &str,
        expected_version: i64,
        content: impl Into<String>,
    ) -> Result<i64, MutationError> {
        let content = content.into();
        self.transition("update_content_with_version", |doc, log| {
            let current = doc.require(id)?;
            if current.version != expected_version {
                return Err(MutationError::version_conflict(expected_version, current));
            }
            self.apply_content(doc, log, id, content)
        })
    }

    /// Shallow-merge a properties patch and return the new version
    ///
    /// Durable nodes get an immediate (not debounced) write.
    pub fn update_properties(&self, id: &str, patch: Value) -> Result<i64, MutationError> {
        self.transition("update_properties", |doc, log| {
            let version = doc.table.update_properties(id, &patch)?;
            let node = doc.require(id)?.clone();
            if !node.is_placeholder {
                log.write(PendingWrite::Properties {
                    id: id.to_string(),
                    patch,
                    version,
                });
            }

            let source_viewer_id = log.viewer();
            log.events.push(DomainEvent::PropertiesUpdated {
                node_id: id.to_string(),
                properties: node.properties,
                version,
                source_viewer_id,
            });
            Ok(version)
        })
    }

    /// Reparent or reorder `id`
    ///
    /// With `insert_after` the node goes directly after that sibling, which
    /// must be a child of `new_parent_id`; otherwise it is appended.
    pub fn move_node(
        &self,
        id: &str,
        new_parent_id: Option<&str>,
        insert_after: Option<&str>,
    ) -> Result<MoveOutcome, MutationError> {
        self.transition("move_node", |doc, log| {
            let old_parent = doc.require(id)?.parent_id.clone();
            if let Some(parent) = new_parent_id {
                if parent == id || doc.is_descendant(id, parent) {
                    return Err(MutationError::circular_reference(format!(
                        "cannot move node '{id}' under its own descendant '{parent}'"
                    )));
                }
                if !doc.table.contains(parent) {
                    return Err(MutationError::invalid_parent(parent));
                }
            }
            if let Some(after) = insert_after {
                let sibling = doc
                    .get(after)
                    .ok_or_else(|| MutationError::invalid_sibling(after, "sibling not found"))?;
                if after == id || sibling.parent_id.as_deref() != new_parent_id {
                    return Err(MutationError::invalid_sibling(
                        after,
                        format!(
                            "not a child of '{}'",
                            new_parent_id.unwrap_or(ROOT_SCOPE)
                        ),
                    ));
                }
            }

            let placement = doc.relocate(id, new_parent_id, insert_after)?;
            log.touch(old_parent.as_deref());
            log.touch(new_parent_id);
            log.record_placement(doc, &placement);

            tracing::debug!(
                "Moved node {} to scope {}",
                id,
                new_parent_id.unwrap_or(ROOT_SCOPE)
            );
            log.hierarchy_changed(StructuralOperation::Move, id, vec![placement.edge]);
            Ok(MoveOutcome::Moved {
                new_parent_id: new_parent_id.map(str::to_string),
            })
        })
    }

    /// Replace the document with records and edges read from the backing store
    ///
    /// Nothing is written back.
    pub fn load(&self, nodes: Vec<Node>, edges: Vec<HierarchyEdge>) -> LoadReport {
        let mut log = TransitionLog::new(self.viewer_id.clone());
        let report = {
            let mut doc = self.write_document();
            let report = doc.load(nodes, edges);
            log.touch(None);
            log.hierarchy_changed(StructuralOperation::Load, ROOT_SCOPE, Vec::new());
            report
        };
        self.publish(log.events);
        report
    }

    /// Merge query results into the document, returning how many were new
    ///
    /// The batch is rejected as a whole when any record fails validation.
    pub fn hydrate(&self, nodes: Vec<Node>) -> Result<usize, MutationError> {
        self.transition("hydrate", |doc, log| {
            for node in &nodes {
                node.validate()?;
            }

            let mut inserted = 0;
            for node in nodes {
                let id = node.id.clone();
                let previous_version = doc.get(&id).map(|current| current.version);
                if doc.hydrate(node)? {
                    inserted += 1;
                    let node = doc.require(&id)?.clone();
                    log.touch(node.parent_id.as_deref());
                    log.node_created(node);
                } else {
                    let node = doc.require(&id)?.clone();
                    if Some(node.version) != previous_version {
                        let mentions = self.processor.extract_mentions(&node.content);
                        log.content_updated(&node, mentions);
                    }
                }
            }
            Ok(inserted)
        })
    }

    /// Check every scope's chain, edge agreement and depths
    pub fn verify_integrity(&self) -> IntegrityReport {
        self.read_document().verify_all()
    }

    fn apply_content(
        &self,
        doc: &mut DocumentTree,
        log: &mut TransitionLog,
        id: &str,
        content: String,
    ) -> Result<i64, MutationError> {
        let version = doc.table.update_content(id, content)?;
        let node = doc.require(id)?.clone();

        if node.is_placeholder {
            if !node.content.is_empty() {
                log.promote(doc, id);
            }
        } else {
            log.write(PendingWrite::Content {
                id: id.to_string(),
                content: node.content.clone(),
                version,
            });
        }

        let mentions = self.processor.extract_mentions(&node.content);
        log.content_updated(&node, mentions);
        Ok(version)
    }

    /// Run one transition under the write lock, then publish its events
    fn transition<T, F>(&self, operation: &str, apply: F) -> Result<T, MutationError>
    where
        F: FnOnce(&mut DocumentTree, &mut TransitionLog) -> Result<T, MutationError>,
    {
        let mut log = TransitionLog::new(self.viewer_id.clone());
        let result = {
            let mut doc = self.write_document();
            let result = apply(&mut doc, &mut log);
            self.verify_touched(&mut doc, &mut log, operation);
            if result.is_ok() {
                self.dispatch(std::mem::take(&mut log.writes));
            }
            result
        };

        match result {
            Ok(value) => {
                self.publish(log.events);
                Ok(value)
            }
            Err(e) => {
                tracing::warn!("{} rejected: {}", operation, e);
                // only diagnostics survive a rejected transition
                let diagnostics = log.events.into_iter().filter(DomainEvent::is_diagnostic).collect();
                self.publish(diagnostics);
                Err(e)
            }
        }
    }

    /// Check touched scopes, repairing and reporting any corruption
    fn verify_touched(&self, doc: &mut DocumentTree, log: &mut TransitionLog, operation: &str) {
        for scope in log.scopes.clone() {
            // a removed node leaves no scope behind
            if let Some(parent) = scope.as_deref() {
                if !doc.table.contains(parent) {
                    continue;
                }
            }
            if let Err(e) = doc.verify_scope(scope.as_deref()) {
                tracing::error!("Chain corruption after {}: {}", operation, e);
                let repaired = doc.repair_scope(scope.as_deref());
                let message = match repaired {
                    Ok(()) => format!("{e} (repaired from structural edges)"),
                    Err(repair) => format!("{e} (repair failed: {repair})"),
                };
                log.diagnostic(DiagnosticKind::ChainCorruption, scope.as_deref(), message);
            }
        }
    }

    fn dispatch(&self, writes: Vec<PendingWrite>) {
        for write in writes {
            match write {
                PendingWrite::Create(node) => self.persistence.schedule_create(&node),
                PendingWrite::Content {
                    id,
                    content,
                    version,
                } => self
                    .persistence
                    .schedule_content_write(&id, content, version),
                PendingWrite::Properties { id, patch, version } => {
                    self.persistence.write_properties_now(&id, patch, version)
                }
                PendingWrite::Edge(edge) => self.persistence.schedule_structural_write(
                    edge.parent_id.as_deref(),
                    &edge.child_id,
                    edge.order,
                ),
                PendingWrite::Delete(id) => self.persistence.schedule_delete(&id),
            }
        }
    }

    fn publish(&self, events: Vec<DomainEvent>) {
        for event in &events {
            self.hub.notify(event);
        }
    }

    fn write_document(&self) -> RwLockWriteGuard<'_, DocumentTree> {
        self.document.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_document(&self) -> RwLockReadGuard<'_, DocumentTree> {
        self.document.read().unwrap_or_else(PoisonError::into_inner)
    }
}

// Comprehensive tests in separate module
#[cfg(test)]
#[path = "mutation_service_test.rs"]
mod mutation_service_test;
