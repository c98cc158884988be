//! In-memory BackingStore
//!
//! A [`BackingStore`] that keeps records in process memory while enforcing the
//! same referential-integrity rules a relational or graph backend would:
//!
//! - duplicate ids are rejected on create
//! - an edge may only reference existing parent and child records
//! - deleting a node cascades to every edge touching it
//!
//! Every applied write is appended to a write log so tests and the dev
//! simulator can assert on ordering. Failures and latency can be injected per
//! write kind to exercise the coordinator's error and ordering paths.

use crate::db::{BackingStore, StoreError};
use crate::models::{scope_label, HierarchyEdge, Node, NodeFilter, NodePatch};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

/// Kind of write issued against the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum WriteKind {
    CreateNode,
    UpdateNode,
    DeleteNode,
    UpsertEdge,
    DeleteEdge,
}

/// One entry in the write log
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteRecord {
    pub kind: WriteKind,
    /// Node id for node writes, child id for edge writes
    pub id: String,
    /// Parent scope for edge writes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
    /// Set when the write was rejected
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WriteRecord {
    fn new(kind: WriteKind, id: &str) -> Self {
        Self {
            kind,
            id: id.to_string(),
            parent_id: None,
            content: None,
            version: None,
            error: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Default)]
struct MemoryState {
    nodes: HashMap<String, Node>,
    /// child id -> edge (a child has exactly one durable parent)
    edges: HashMap<String, HierarchyEdge>,
    log: Vec<WriteRecord>,
    injected: HashMap<WriteKind, VecDeque<StoreError>>,
    latency: HashMap<WriteKind, Duration>,
}

impl MemoryState {
    fn take_injected(&mut self, kind: WriteKind) -> Option<StoreError> {
        self.injected.get_mut(&kind).and_then(VecDeque::pop_front)
    }

    fn record(&mut self, mut entry: WriteRecord, result: &Result<(), StoreError>) {
        if let Err(e) = result {
            entry.error = Some(e.to_string());
        }
        self.log.push(entry);
    }
}

/// Process-local backing store used by tests and the dev simulator
#[derive(Default)]
pub struct InMemoryBackingStore {
    state: RwLock<MemoryState>,
    offline: AtomicBool,
}

impl InMemoryBackingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed records and edges without touching the write log
    pub async fn seed(&self, nodes: Vec<Node>, edges: Vec<HierarchyEdge>) {
        let mut state = self.state.write().await;
        for node in nodes {
            state.nodes.insert(node.id.clone(), node);
        }
        for edge in edges {
            state.edges.insert(edge.child_id.clone(), edge);
        }
    }

    /// Queue an error returned by the next write of `kind`
    pub async fn inject_failure(&self, kind: WriteKind, error: StoreError) {
        self.state
            .write()
            .await
            .injected
            .entry(kind)
            .or_default()
            .push_back(error);
    }

    /// Delay every write of `kind` before it is applied
    pub async fn set_latency(&self, kind: WriteKind, latency: Duration) {
        self.state.write().await.latency.insert(kind, latency);
    }

    /// Simulate a lost connection: every call fails with `Connectivity`
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Snapshot of the write log
    pub async fn writes(&self) -> Vec<WriteRecord> {
        self.state.read().await.log.clone()
    }

    /// Stored record for `id`
    pub async fn node(&self, id: &str) -> Option<Node> {
        self.state.read().await.nodes.get(id).cloned()
    }

    /// Stored parent edge of `child_id`
    pub async fn edge_of(&self, child_id: &str) -> Option<HierarchyEdge> {
        self.state.read().await.edges.get(child_id).cloned()
    }

    /// Durable children of a scope, sorted by order
    pub async fn children_of(&self, parent_id: Option<&str>) -> Vec<String> {
        let state = self.state.read().await;
        let mut edges: Vec<&HierarchyEdge> = state
            .edges
            .values()
            .filter(|edge| edge.parent_id.as_deref() == parent_id)
            .collect();
        edges.sort_by(|a, b| a.order.total_cmp(&b.order));
        edges.iter().map(|edge| edge.child_id.clone()).collect()
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StoreError::connectivity("in-memory store is offline"))
        } else {
            Ok(())
        }
    }

    async fn simulate_latency(&self, kind: WriteKind) {
        let latency = self.state.read().await.latency.get(&kind).copied();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl BackingStore for InMemoryBackingStore {
    async fn create_node(&self, node: Node) -> Result<String, StoreError> {
        self.check_online()?;
        self.simulate_latency(WriteKind::CreateNode).await;

        let mut state = self.state.write().await;
        let mut entry = WriteRecord::new(WriteKind::CreateNode, &node.id);
        entry.content = Some(node.content.clone());
        entry.version = Some(node.version);

        let result = match state.take_injected(WriteKind::CreateNode) {
            Some(error) => Err(error),
            None if state.nodes.contains_key(&node.id) => Err(StoreError::constraint(format!(
                "node '{}' already exists",
                node.id
            ))),
            None => Ok(()),
        };

        if result.is_ok() {
            let mut record = node.clone();
            record.is_placeholder = false;
            state.nodes.insert(node.id.clone(), record);
        }
        state.record(entry, &result);
        result.map(|_| node.id)
    }

    async fn update_node(&self, id: &str, patch: NodePatch) -> Result<(), StoreError> {
        self.check_online()?;
        self.simulate_latency(WriteKind::UpdateNode).await;

        let mut state = self.state.write().await;
        let mut entry = WriteRecord::new(WriteKind::UpdateNode, id);
        entry.content = patch.content.clone();
        entry.version = Some(patch.version);

        let result = match state.take_injected(WriteKind::UpdateNode) {
            Some(error) => Err(error),
            None => match state.nodes.get_mut(id) {
                None => Err(StoreError::not_found(id)),
                Some(record) => {
                    let merged = match patch.properties.as_ref() {
                        Some(properties) => merge_stored_properties(record, properties),
                        None => Ok(()),
                    };
                    if merged.is_ok() {
                        if let Some(content) = patch.content {
                            record.content = content;
                        }
                        record.version = record.version.max(patch.version);
                        record.modified_at = chrono::Utc::now();
                    }
                    merged
                }
            },
        };

        state.record(entry, &result);
        result
    }

    async fn delete_node(&self, id: &str) -> Result<(), StoreError> {
        self.check_online()?;
        self.simulate_latency(WriteKind::DeleteNode).await;

        let mut state = self.state.write().await;
        let entry = WriteRecord::new(WriteKind::DeleteNode, id);

        let result = match state.take_injected(WriteKind::DeleteNode) {
            Some(error) => Err(error),
            None => {
                state.nodes.remove(id);
                state
                    .edges
                    .retain(|child, edge| child != id && edge.parent_id.as_deref() != Some(id));
                Ok(())
            }
        };

        state.record(entry, &result);
        result
    }

    async fn query_nodes(&self, filter: NodeFilter) -> Result<Vec<Node>, StoreError> {
        self.check_online()?;
        let state = self.state.read().await;
        let mut nodes: Vec<Node> = state
            .nodes
            .values()
            .filter(|node| filter.matches(node))
            .cloned()
            .collect();
        nodes.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            nodes.truncate(limit);
        }
        Ok(nodes)
    }

    async fn upsert_edge(&self, edge: HierarchyEdge) -> Result<(), StoreError> {
        self.check_online()?;
        self.simulate_latency(WriteKind::UpsertEdge).await;

        let mut state = self.state.write().await;
        let mut entry = WriteRecord::new(WriteKind::UpsertEdge, &edge.child_id);
        entry.parent_id = edge.parent_id.clone();

        let result = match state.take_injected(WriteKind::UpsertEdge) {
            Some(error) => Err(error),
            None if !state.nodes.contains_key(&edge.child_id) => Err(StoreError::constraint(
                format!("edge child '{}' does not exist", edge.child_id),
            )),
            None => match edge.parent_id.as_deref() {
                Some(parent) if !state.nodes.contains_key(parent) => {
                    Err(StoreError::constraint(format!(
                        "edge parent '{}' does not exist",
                        scope_label(Some(parent))
                    )))
                }
                _ => Ok(()),
            },
        };

        if result.is_ok() {
            state.edges.insert(edge.child_id.clone(), edge);
        }
        state.record(entry, &result);
        result
    }

    async fn delete_edge(
        &self,
        parent_id: Option<&str>,
        child_id: &str,
    ) -> Result<(), StoreError> {
        self.check_online()?;
        self.simulate_latency(WriteKind::DeleteEdge).await;

        let mut state = self.state.write().await;
        let mut entry = WriteRecord::new(WriteKind::DeleteEdge, child_id);
        entry.parent_id = parent_id.map(str::to_string);

        let result = match state.take_injected(WriteKind::DeleteEdge) {
            Some(error) => Err(error),
            None => {
                let matches_parent = state
                    .edges
                    .get(child_id)
                    .is_some_and(|edge| edge.parent_id.as_deref() == parent_id);
                if matches_parent {
                    state.edges.remove(child_id);
                }
                Ok(())
            }
        };

        state.record(entry, &result);
        result
    }

    async fn query_edges(&self) -> Result<Vec<HierarchyEdge>, StoreError> {
        self.check_online()?;
        Ok(self.state.read().await.edges.values().cloned().collect())
    }
}

fn merge_stored_properties(record: &mut Node, patch: &serde_json::Value) -> Result<(), StoreError> {
    let patch = patch
        .as_object()
        .ok_or_else(|| StoreError::constraint("properties patch must be an object"))?;
    if !record.properties.is_object() {
        record.properties = serde_json::Value::Object(Default::default());
    }
    if let Some(existing) = record.properties.as_object_mut() {
        for (key, value) in patch {
            existing.insert(key.clone(), value.clone());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(id: &str, content: &str) -> Node {
        Node::new_with_id(
            id.to_string(),
            "text".to_string(),
            content.to_string(),
            None,
            json!({}),
        )
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_id() {
        let store = InMemoryBackingStore::new();
        store.create_node(node("a", "A")).await.unwrap();

        let err = store.create_node(node("a", "again")).await.unwrap_err();
        assert!(err.is_constraint());

        let writes = store.writes().await;
        assert_eq!(writes.len(), 2);
        assert!(writes[0].succeeded());
        assert!(!writes[1].succeeded());
    }

    #[tokio::test]
    async fn test_edge_requires_existing_parent() {
        let store = InMemoryBackingStore::new();
        store.create_node(node("child", "c")).await.unwrap();

        let err = store
            .upsert_edge(HierarchyEdge::new(Some("ghost"), "child", 1.0))
            .await
            .unwrap_err();
        assert!(err.is_constraint());

        store.create_node(node("ghost", "g")).await.unwrap();
        store
            .upsert_edge(HierarchyEdge::new(Some("ghost"), "child", 1.0))
            .await
            .unwrap();
        assert_eq!(store.children_of(Some("ghost")).await, vec!["child"]);
    }

    #[tokio::test]
    async fn test_update_merges_properties_and_keeps_max_version() {
        let store = InMemoryBackingStore::new();
        store.create_node(node("a", "A")).await.unwrap();

        store
            .update_node("a", NodePatch::properties_only(json!({"status": "done"}), 5))
            .await
            .unwrap();
        store
            .update_node("a", NodePatch::content_only("A2".to_string(), 3))
            .await
            .unwrap();

        let stored = store.node("a").await.unwrap();
        assert_eq!(stored.content, "A2");
        assert_eq!(stored.properties["status"], "done");
        assert_eq!(stored.version, 5);
    }

    #[tokio::test]
    async fn test_delete_cascades_edges() {
        let store = InMemoryBackingStore::new();
        store.create_node(node("p", "P")).await.unwrap();
        store.create_node(node("c", "C")).await.unwrap();
        store
            .upsert_edge(HierarchyEdge::new(None, "p", 1.0))
            .await
            .unwrap();
        store
            .upsert_edge(HierarchyEdge::new(Some("p"), "c", 1.0))
            .await
            .unwrap();

        store.delete_node("p").await.unwrap();

        assert!(store.node("p").await.is_none());
        assert!(store.edge_of("p").await.is_none());
        assert!(store.edge_of("c").await.is_none());
        assert!(store.node("c").await.is_some());
    }

    #[tokio::test]
    async fn test_injected_failure_is_consumed_once() {
        let store = InMemoryBackingStore::new();
        store
            .inject_failure(WriteKind::CreateNode, StoreError::connectivity("flaky"))
            .await;

        assert!(store.create_node(node("a", "A")).await.is_err());
        assert!(store.create_node(node("a", "A")).await.is_ok());
    }

    #[tokio::test]
    async fn test_offline_store_rejects_everything() {
        let store = InMemoryBackingStore::new();
        store.set_offline(true);
        assert!(matches!(
            store.query_nodes(NodeFilter::new()).await,
            Err(StoreError::Connectivity(_))
        ));
        store.set_offline(false);
        assert!(store.query_nodes(NodeFilter::new()).await.unwrap().is_empty());
    }
}
