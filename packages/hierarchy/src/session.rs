//! Shared document session
//!
//! One [`DocumentSession`] per open document. It owns the canonical
//! [`DocumentTree`] behind a single `RwLock`, the [`SubscriberHub`] and the
//! [`PersistenceCoordinator`], and hands out [`Viewer`]s that share all of
//! them.
//!
//! ```no_run
//! # use nodespace_hierarchy::{DocumentSession, services::CreateNodeParams};
//! # async fn demo() -> anyhow::Result<()> {
//! let session = DocumentSession::builder().build()?;
//! let left = session.viewer("left");
//! let right = session.viewer("right");
//!
//! let id = left.mutations().create_node(CreateNodeParams::text("Groceries"))?;
//! assert!(right.visible_outline().iter().any(|row| row.id == id));
//!
//! session.shutdown().await;
//! # Ok(())
//! # }
//! ```

use crate::config::{ConfigError, HierarchyConfig};
use crate::db::{BackingStore, InMemoryBackingStore, StoreError};
use crate::models::{Node, NodeFilter, ParentKey};
use crate::services::{
    ContentProcessor, DefaultContentProcessor, MutationError, MutationService,
    PersistenceCoordinator, SubscriberHub, Viewer,
};
use crate::tree::{DocumentTree, IntegrityReport, LoadReport, OutlineRow, TreeError};
use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

/// Failures of session-level operations that touch the backing store
#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Mutation(#[from] MutationError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Canonical state shared by every viewer of one document
pub struct DocumentSession {
    config: HierarchyConfig,
    document: Arc<RwLock<DocumentTree>>,
    hub: Arc<SubscriberHub>,
    persistence: PersistenceCoordinator,
    mutations: MutationService,
}

impl std::fmt::Debug for DocumentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentSession")
            .field("config", &self.config)
            .field("hub", &self.hub)
            .finish()
    }
}

impl DocumentSession {
    pub fn builder() -> DocumentSessionBuilder {
        DocumentSessionBuilder::new()
    }

    pub fn config(&self) -> &HierarchyConfig {
        &self.config
    }

    /// Mutation service without a viewer id
    ///
    /// Events it emits carry no `source_viewer_id`; use a [`Viewer`] for
    /// edits that come from a pane.
    pub fn mutations(&self) -> &MutationService {
        &self.mutations
    }

    /// Open a new viewer on this document
    pub fn viewer(self: &Arc<Self>, viewer_id: impl Into<String>) -> Viewer {
        Viewer::new(Arc::clone(self), viewer_id.into())
    }

    pub fn hub(&self) -> &Arc<SubscriberHub> {
        &self.hub
    }

    pub fn persistence(&self) -> &PersistenceCoordinator {
        &self.persistence
    }

    /// Run `f` against a consistent snapshot of the document
    ///
    /// Holds the read lock for the duration of `f`; do not mutate from inside.
    pub fn read<T>(&self, f: impl FnOnce(&DocumentTree) -> T) -> T {
        let doc = self.document.read().unwrap_or_else(PoisonError::into_inner);
        f(&doc)
    }

    pub fn get_node(&self, id: &str) -> Option<Node> {
        self.read(|doc| doc.get(id).cloned())
    }

    /// Child ids of `parent_id` in structural order (`None` = root)
    pub fn children_of(&self, parent_id: Option<&str>) -> Vec<String> {
        self.read(|doc| doc.children_of(parent_id))
    }

    pub fn parents_of(&self, id: &str) -> HashSet<ParentKey> {
        self.read(|doc| doc.structure().parents_of(id))
    }

    /// Child ids of `scope` following the `before_sibling_id` chain
    pub fn chain_of(&self, scope: Option<&str>) -> Result<Vec<String>, TreeError> {
        self.read(|doc| doc.chain().traverse(doc.table(), scope))
    }

    /// Depth-first outline of the whole document
    pub fn outline(&self) -> Vec<OutlineRow> {
        self.read(DocumentTree::outline)
    }

    pub fn node_count(&self) -> usize {
        self.read(|doc| doc.table().len())
    }

    pub fn verify_integrity(&self) -> IntegrityReport {
        self.mutations.verify_integrity()
    }

    /// Replace the document with everything in the backing store
    pub async fn load_from_backing_store(&self) -> Result<LoadReport, SessionError> {
        let store = self.persistence.store();
        let nodes = store.query_nodes(NodeFilter::new()).await?;
        let edges = store.query_edges().await?;
        tracing::info!(
            "Loading {} nodes and {} edges from backing store",
            nodes.len(),
            edges.len()
        );

        let report = self.mutations.load(nodes, edges);
        if report.nodes_skipped > 0 || report.edges_skipped > 0 || report.cycles_broken > 0 {
            tracing::warn!("Initial load repaired inconsistent data: {:?}", report);
        }
        Ok(report)
    }

    /// Query the backing store and merge the results into the document
    ///
    /// Records already in memory keep their position; only newer versions
    /// replace their fields. Returns the records as the store sent them.
    pub async fn query_nodes(&self, filter: NodeFilter) -> Result<Vec<Node>, SessionError> {
        let nodes = self.persistence.store().query_nodes(filter).await?;
        let inserted = self.mutations.hydrate(nodes.clone())?;
        tracing::debug!(
            "Hydrated {} queried nodes ({} new)",
            nodes.len(),
            inserted
        );
        Ok(nodes)
    }

    /// Write every pending change now and wait for the writes to finish
    pub async fn flush(&self) {
        self.persistence.flush_all().await;
    }

    /// Flush, then refuse further writes
    pub async fn shutdown(&self) {
        self.persistence.shutdown().await;
        tracing::info!("Document session closed");
    }
}

/// Builder for [`DocumentSession`]
pub struct DocumentSessionBuilder {
    config: HierarchyConfig,
    store: Option<Arc<dyn BackingStore>>,
    processor: Option<Arc<dyn ContentProcessor>>,
}

impl Default for DocumentSessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentSessionBuilder {
    pub fn new() -> Self {
        Self {
            config: HierarchyConfig::default(),
            store: None,
            processor: None,
        }
    }

    pub fn config(mut self, config: HierarchyConfig) -> Self {
        self.config = config;
        self
    }

    /// Backing store adapter; defaults to a fresh [`InMemoryBackingStore`]
    pub fn backing_store(mut self, store: Arc<dyn BackingStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Content collaborator; defaults to [`DefaultContentProcessor`]
    pub fn content_processor(mut self, processor: Arc<dyn ContentProcessor>) -> Self {
        self.processor = Some(processor);
        self
    }

    /// Validate the configuration and wire the session
    ///
    /// Call from inside a tokio runtime; the persistence coordinator spawns
    /// its write tasks on the runtime current at build time.
    pub fn build(self) -> Result<Arc<DocumentSession>, ConfigError> {
        self.config.validate().map_err(ConfigError::Invalid)?;

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryBackingStore::new()) as Arc<dyn BackingStore>);
        let processor = self
            .processor
            .unwrap_or_else(|| Arc::new(DefaultContentProcessor) as Arc<dyn ContentProcessor>);

        let hub = Arc::new(SubscriberHub::new(self.config.event_channel_capacity));
        let persistence = PersistenceCoordinator::new(store, Arc::clone(&hub), &self.config);
        let document = Arc::new(RwLock::new(DocumentTree::new(
            self.config.rebalance_threshold,
        )));
        let mutations = MutationService::new(
            Arc::clone(&document),
            Arc::clone(&hub),
            persistence.clone(),
            processor,
        );

        tracing::info!(
            "Document session ready (debounce {}ms, ordering timeout {}ms)",
            self.config.content_debounce_ms,
            self.config.write_ordering_timeout_ms
        );
        Ok(Arc::new(DocumentSession {
            config: self.config,
            document,
            hub,
            persistence,
            mutations,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::HierarchyEdge;
    use crate::services::CreateNodeParams;
    use serde_json::json;

    fn stored(id: &str, parent: Option<&str>, version: i64) -> Node {
        let mut node = Node::new_with_id(
            id.to_string(),
            "text".to_string(),
            format!("{id} v{version}"),
            parent.map(str::to_string),
            json!({}),
        );
        node.version = version;
        node
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let config = HierarchyConfig {
            event_channel_capacity: 0,
            ..HierarchyConfig::default()
        };
        let err = DocumentSession::builder().config(config).build().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_load_from_backing_store_rebuilds_document() {
        let store = Arc::new(InMemoryBackingStore::new());
        store
            .seed(
                vec![stored("a", None, 1), stored("b", None, 1), stored("c", Some("a"), 1)],
                vec![
                    HierarchyEdge::new(None, "b", 2.0),
                    HierarchyEdge::new(None, "a", 1.0),
                    HierarchyEdge::new(Some("a"), "c", 1.0),
                ],
            )
            .await;
        let session = DocumentSession::builder()
            .backing_store(store)
            .build()
            .unwrap();

        let report = session.load_from_backing_store().await.unwrap();

        assert_eq!(report.nodes_loaded, 3);
        assert_eq!(session.children_of(None), vec!["a", "b"]);
        assert_eq!(session.chain_of(None).unwrap(), vec!["a", "b"]);
        assert_eq!(session.get_node("c").unwrap().depth, 1);
        assert!(session.verify_integrity().is_healthy());
    }

    #[tokio::test]
    async fn test_query_nodes_hydrates_new_and_newer_records() {
        let store = Arc::new(InMemoryBackingStore::new());
        store
            .seed(
                vec![stored("a", None, 1), stored("b", None, 1)],
                vec![HierarchyEdge::new(None, "a", 1.0), HierarchyEdge::new(None, "b", 2.0)],
            )
            .await;
        let session = DocumentSession::builder()
            .backing_store(store.clone())
            .build()
            .unwrap();
        session
            .mutations()
            .create_node(CreateNodeParams::text("local").with_id("local"))
            .unwrap();
        session.flush().await;

        let found = session
            .query_nodes(NodeFilter::new().with_ids(vec!["b".to_string()]))
            .await
            .unwrap();

        assert_eq!(found.len(), 1);
        assert_eq!(session.get_node("b").unwrap().content, "b v1");
        assert!(session.children_of(None).contains(&"b".to_string()));
        assert!(session.verify_integrity().is_healthy());
    }

    #[tokio::test]
    async fn test_parents_of_reports_single_scope() {
        let session = DocumentSession::builder().build().unwrap();
        let parent = session
            .mutations()
            .create_node(CreateNodeParams::text("p"))
            .unwrap();
        let child = session
            .mutations()
            .create_node(CreateNodeParams::text("c").under(parent.clone()))
            .unwrap();

        let parents = session.parents_of(&child);
        assert_eq!(parents.len(), 1);
        assert!(parents.contains(&Some(parent)));
        assert_eq!(session.node_count(), 2);
    }
}
