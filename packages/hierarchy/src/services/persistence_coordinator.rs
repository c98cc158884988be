//! PersistenceCoordinator - debounced, ordered reconciliation with the backing store
//!
//! Mutations commit in memory and return immediately; this coordinator makes
//! them durable in the background:
//!
//! - **Content** writes are debounced per node (default 400ms of quiet). A new
//!   call for the same node cancels the pending timer, so a burst of typing
//!   produces one write carrying the last content and version.
//! - **Property** writes and deletions go out immediately.
//! - **Structural** writes (edge upserts) wait for a pending creation write of
//!   their parent, with a bounded timeout. On timeout a
//!   [`DiagnosticKind::WriteOrderingTimeout`] is published and the write is
//!   attempted anyway.
//!
//! Writes for the same node run strictly in submission order on a per-node
//! lane. Writes for different nodes run concurrently.
//!
//! Failures never propagate to the mutation that caused them: they are logged,
//! the node is marked [`WriteState::Failed`], and a
//! [`DiagnosticKind::PersistenceFailure`] is published. In-memory state is not
//! rolled back.

use crate::config::HierarchyConfig;
use crate::db::{BackingStore, StoreError};
use crate::models::{scope_label, HierarchyEdge, Node, NodePatch};
use crate::services::events::{Diagnostic, DiagnosticKind, DomainEvent};
use crate::services::{PersistenceError, SubscriberHub};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;

/// Per-node write queue state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum WriteState {
    /// Nothing queued
    Idle,
    /// Content waiting for its debounce window
    Pending,
    /// At least one write queued or running
    Flushing,
    /// Last write failed; cleared by the next successful write
    Failed,
}

/// Progress of a node's creation write, observed by structural writers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreationState {
    Pending,
    Durable,
    Failed,
}

enum WriteOp {
    Create {
        node: Node,
        done: watch::Sender<CreationState>,
        token: u64,
    },
    Content {
        content: String,
        version: i64,
    },
    Properties {
        patch: Value,
        version: i64,
    },
    Edge {
        edge: HierarchyEdge,
        parent_ready: Option<(String, watch::Receiver<CreationState>)>,
    },
    Delete,
}

impl WriteOp {
    fn name(&self) -> &'static str {
        match self {
            WriteOp::Create { .. } => "create_node",
            WriteOp::Content { .. } => "update_content",
            WriteOp::Properties { .. } => "update_properties",
            WriteOp::Edge { .. } => "upsert_edge",
            WriteOp::Delete => "delete_node",
        }
    }
}

struct PendingContent {
    content: String,
    version: i64,
    token: u64,
    timer: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Lane {
    tail: Option<oneshot::Receiver<()>>,
    generation: u64,
}

#[derive(Default)]
struct Inner {
    debounce: HashMap<String, PendingContent>,
    creations: HashMap<String, (u64, watch::Receiver<CreationState>)>,
    lanes: HashMap<String, Lane>,
    outstanding: HashMap<String, usize>,
    failed: HashSet<String>,
    next_token: u64,
    shutdown: bool,
}

struct Shared {
    store: Arc<dyn BackingStore>,
    hub: Arc<SubscriberHub>,
    debounce: Duration,
    ordering_timeout: Duration,
    runtime: Option<Handle>,
    inner: Mutex<Inner>,
    in_flight: AtomicUsize,
    idle: Notify,
}

/// Decrements the in-flight count when a spawned task finishes or is aborted
struct InFlight(Arc<Shared>);

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn track(self: &Arc<Self>) -> InFlight {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlight(Arc::clone(self))
    }

    fn spawn<F>(&self, task: F) -> Option<JoinHandle<()>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match &self.runtime {
            Some(handle) => Some(handle.spawn(task)),
            None => {
                tracing::error!("No tokio runtime available, dropping persistence task");
                None
            }
        }
    }

    /// Append a write to the node's lane
    fn enqueue(self: &Arc<Self>, id: &str, op: WriteOp) {
        let (done_tx, done_rx) = oneshot::channel::<()>();
        let (previous, generation) = {
            let mut inner = self.lock();
            *inner.outstanding.entry(id.to_string()).or_default() += 1;
            let lane = inner.lanes.entry(id.to_string()).or_default();
            lane.generation += 1;
            (lane.tail.replace(done_rx), lane.generation)
        };
        tracing::debug!("Queued {} for node {}", op.name(), id);

        let operation = op.name();
        let guard = self.track();
        let shared = Arc::clone(self);
        let task_id = id.to_string();
        let spawned = self.spawn(async move {
            let _guard = guard;
            if let Some(previous) = previous {
                // sender dropped means the earlier write was aborted; keep going
                let _ = previous.await;
            }
            let result = shared.execute(&task_id, op).await;
            shared.finish(&task_id, generation, operation, result);
            let _ = done_tx.send(());
        });
        if spawned.is_none() {
            let err = PersistenceError::failure(
                id,
                operation,
                StoreError::connectivity("no async runtime to run the write"),
            );
            self.finish(id, generation, operation, Err(err));
        }
    }

    async fn execute(&self, id: &str, op: WriteOp) -> Result<(), PersistenceError> {
        let operation = op.name();
        let result = match op {
            WriteOp::Create { node, done, token } => {
                let result = self.store.create_node(node).await.map(|_| ());
                let state = if result.is_ok() {
                    CreationState::Durable
                } else {
                    CreationState::Failed
                };
                // wakes structural writers waiting on this node
                let _ = done.send(state);
                let mut inner = self.lock();
                if inner.creations.get(id).is_some_and(|(t, _)| *t == token) {
                    inner.creations.remove(id);
                }
                result
            }
            WriteOp::Content { content, version } => {
                self.store
                    .update_node(id, NodePatch::content_only(content, version))
                    .await
            }
            WriteOp::Properties { patch, version } => {
                self.store
                    .update_node(id, NodePatch::properties_only(patch, version))
                    .await
            }
            WriteOp::Edge { edge, parent_ready } => {
                if let Some((parent_id, ready)) = parent_ready {
                    self.await_creation(&parent_id, id, ready).await;
                }
                self.store.upsert_edge(edge).await
            }
            WriteOp::Delete => self.store.delete_node(id).await,
        };
        result.map_err(|e| PersistenceError::failure(id, operation, e))
    }

    /// Bounded wait for a parent's creation write
    async fn await_creation(
        &self,
        parent_id: &str,
        child_id: &str,
        mut ready: watch::Receiver<CreationState>,
    ) {
        let waited = tokio::time::timeout(
            self.ordering_timeout,
            ready.wait_for(|state| *state != CreationState::Pending),
        )
        .await
        .map(|state| state.map(|state| *state));

        match waited {
            Ok(Ok(CreationState::Failed)) => {
                tracing::warn!(
                    "Creation of parent {} failed, writing edge for {} anyway",
                    parent_id,
                    child_id
                );
            }
            // durable, or the creation task went away without reporting
            Ok(_) => {}
            Err(_) => {
                let err = PersistenceError::WriteOrderingTimeout {
                    parent_id: parent_id.to_string(),
                    child_id: child_id.to_string(),
                    waited_ms: self.ordering_timeout.as_millis() as u64,
                };
                tracing::warn!("{}", err);
                self.report(&err);
            }
        }
    }

    fn finish(
        &self,
        id: &str,
        generation: u64,
        operation: &str,
        result: Result<(), PersistenceError>,
    ) {
        {
            let mut inner = self.lock();
            if let Some(count) = inner.outstanding.get_mut(id) {
                *count -= 1;
                if *count == 0 {
                    inner.outstanding.remove(id);
                }
            }
            if inner
                .lanes
                .get(id)
                .is_some_and(|lane| lane.generation == generation)
            {
                inner.lanes.remove(id);
            }
            match &result {
                Ok(()) => {
                    inner.failed.remove(id);
                }
                Err(_) => {
                    inner.failed.insert(id.to_string());
                }
            }
        }

        match result {
            Ok(()) => tracing::debug!("Persisted {} for node {}", operation, id),
            Err(err) => {
                tracing::error!("{}", err);
                self.report(&err);
            }
        }
    }

    fn report(&self, err: &PersistenceError) {
        let kind = match err {
            PersistenceError::PersistenceFailure { .. } => DiagnosticKind::PersistenceFailure,
            PersistenceError::WriteOrderingTimeout { .. } => DiagnosticKind::WriteOrderingTimeout,
        };
        self.hub.notify(&DomainEvent::Diagnostic(Diagnostic::new(
            kind,
            Some(err.node_id()),
            err.to_string(),
        )));
    }

    /// Debounce timer expired: hand the latest content to the lane
    fn fire(self: &Arc<Self>, id: &str, token: u64) {
        let pending = {
            let mut inner = self.lock();
            match inner.debounce.get(id) {
                Some(pending) if pending.token == token => inner.debounce.remove(id),
                _ => None,
            }
        };
        if let Some(pending) = pending {
            self.enqueue(
                id,
                WriteOp::Content {
                    content: pending.content,
                    version: pending.version,
                },
            );
        }
    }
}

/// Background writer for one document session
#[derive(Clone)]
pub struct PersistenceCoordinator {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for PersistenceCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceCoordinator")
            .field("in_flight", &self.shared.in_flight.load(Ordering::SeqCst))
            .finish()
    }
}

impl PersistenceCoordinator {
    /// Create a coordinator bound to the current tokio runtime
    ///
    /// Must be called from within a runtime; without one every write is
    /// dropped with an error log.
    pub fn new(
        store: Arc<dyn BackingStore>,
        hub: Arc<SubscriberHub>,
        config: &HierarchyConfig,
    ) -> Self {
        let runtime = Handle::try_current().ok();
        if runtime.is_none() {
            tracing::error!("PersistenceCoordinator created outside a tokio runtime");
        }
        Self {
            shared: Arc::new(Shared {
                store,
                hub,
                debounce: config.content_debounce(),
                ordering_timeout: config.write_ordering_timeout(),
                runtime,
                inner: Mutex::new(Inner::default()),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    pub fn store(&self) -> Arc<dyn BackingStore> {
        Arc::clone(&self.shared.store)
    }

    /// Register and issue the creation write for `node`
    ///
    /// Structural writes scheduled afterwards whose parent is `node` wait for
    /// this write to finish.
    pub fn schedule_create(&self, node: &Node) {
        let shared = &self.shared;
        let (done, ready) = watch::channel(CreationState::Pending);
        let token = {
            let mut inner = shared.lock();
            if rejected(&inner, "create_node", &node.id) {
                return;
            }
            inner.next_token += 1;
            let token = inner.next_token;
            inner.creations.insert(node.id.clone(), (token, ready));
            token
        };

        let mut record = node.clone();
        record.is_placeholder = false;
        shared.enqueue(
            &node.id,
            WriteOp::Create {
                node: record,
                done,
                token,
            },
        );
    }

    /// Debounce a content write; a newer call for the same id replaces it
    pub fn schedule_content_write(&self, id: &str, content: String, version: i64) {
        let shared = &self.shared;
        let mut inner = shared.lock();
        if rejected(&inner, "update_content", id) {
            return;
        }
        inner.next_token += 1;
        let token = inner.next_token;
        if let Some(previous) = inner.debounce.remove(id) {
            if let Some(timer) = previous.timer {
                timer.abort();
            }
        }

        let guard = shared.track();
        let timer_shared = Arc::clone(shared);
        let timer_id = id.to_string();
        let delay = shared.debounce;
        let timer = shared.spawn(async move {
            let _guard = guard;
            tokio::time::sleep(delay).await;
            timer_shared.fire(&timer_id, token);
        });

        inner.debounce.insert(
            id.to_string(),
            PendingContent {
                content,
                version,
                token,
                timer,
            },
        );
    }

    /// Write a properties patch without debounce
    pub fn write_properties_now(&self, id: &str, patch: Value, version: i64) {
        if rejected(&self.shared.lock(), "update_properties", id) {
            return;
        }
        self.shared
            .enqueue(id, WriteOp::Properties { patch, version });
    }

    /// Upsert the edge `(parent, child, order)`, after the parent's creation if pending
    pub fn schedule_structural_write(&self, parent_id: Option<&str>, child_id: &str, order: f64) {
        let parent_ready = {
            let inner = self.shared.lock();
            if rejected(&inner, "upsert_edge", child_id) {
                return;
            }
            parent_id.and_then(|parent| {
                inner
                    .creations
                    .get(parent)
                    .map(|(_, ready)| (parent.to_string(), ready.clone()))
            })
        };
        if let Some((parent, _)) = &parent_ready {
            tracing::debug!(
                "Edge {} -> {} waits for creation of {}",
                scope_label(parent_id),
                child_id,
                parent
            );
        }
        self.shared.enqueue(
            child_id,
            WriteOp::Edge {
                edge: HierarchyEdge::new(parent_id, child_id, order),
                parent_ready,
            },
        );
    }

    /// Cancel pending content and delete the record (edges cascade)
    pub fn schedule_delete(&self, id: &str) {
        {
            let mut inner = self.shared.lock();
            if rejected(&inner, "delete_node", id) {
                return;
            }
            if let Some(pending) = inner.debounce.remove(id) {
                if let Some(timer) = pending.timer {
                    timer.abort();
                }
                tracing::debug!("Dropped pending content write for deleted node {}", id);
            }
        }
        self.shared.enqueue(id, WriteOp::Delete);
    }

    /// Drop pending content for a node that will never be persisted
    pub fn cancel_pending(&self, id: &str) {
        if let Some(pending) = self.shared.lock().debounce.remove(id) {
            if let Some(timer) = pending.timer {
                timer.abort();
            }
        }
    }

    pub fn write_state(&self, id: &str) -> WriteState {
        let inner = self.shared.lock();
        if inner.debounce.contains_key(id) {
            WriteState::Pending
        } else if inner.outstanding.contains_key(id) {
            WriteState::Flushing
        } else if inner.failed.contains(id) {
            WriteState::Failed
        } else {
            WriteState::Idle
        }
    }

    /// True while a creation write for `id` has not finished
    pub fn has_pending_creation(&self, id: &str) -> bool {
        self.shared.lock().creations.contains_key(id)
    }

    /// Writes not yet completed (debounced plus queued)
    pub fn pending_count(&self) -> usize {
        let inner = self.shared.lock();
        inner.debounce.len() + inner.outstanding.values().sum::<usize>()
    }

    /// Flush every debounced write now and wait until all queued writes finish
    pub async fn flush_all(&self) {
        let drained: Vec<(String, PendingContent)> = {
            let mut inner = self.shared.lock();
            inner.debounce.drain().collect()
        };
        if !drained.is_empty() {
            tracing::debug!("Flushing {} debounced content writes", drained.len());
        }
        for (id, pending) in drained {
            if let Some(timer) = pending.timer {
                timer.abort();
            }
            self.shared.enqueue(
                &id,
                WriteOp::Content {
                    content: pending.content,
                    version: pending.version,
                },
            );
        }
        self.wait_idle().await;
    }

    /// Wait until no timer or write task is outstanding
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.shared.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Refuse new writes, then flush and drain everything already accepted
    pub async fn shutdown(&self) {
        self.shared.lock().shutdown = true;
        tracing::info!("PersistenceCoordinator shutting down");
        self.flush_all().await;
    }
}

fn rejected(inner: &Inner, operation: &str, id: &str) -> bool {
    if inner.shutdown {
        tracing::warn!(
            "PersistenceCoordinator is shut down, ignoring {} for node {}",
            operation,
            id
        );
    }
    inner.shutdown
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{InMemoryBackingStore, WriteKind};
    use crate::services::{EventFilter, EventKind};
    use serde_json::json;

    fn setup() -> (Arc<InMemoryBackingStore>, Arc<SubscriberHub>, PersistenceCoordinator) {
        let store = Arc::new(InMemoryBackingStore::new());
        let hub = Arc::new(SubscriberHub::default());
        let coordinator = PersistenceCoordinator::new(
            store.clone() as Arc<dyn BackingStore>,
            Arc::clone(&hub),
            &HierarchyConfig::default(),
        );
        (store, hub, coordinator)
    }

    fn node(id: &str, parent: Option<&str>) -> Node {
        Node::new_with_id(
            id.to_string(),
            "text".to_string(),
            format!("{id} content"),
            parent.map(str::to_string),
            json!({}),
        )
    }

    fn collect_diagnostics(hub: &SubscriberHub) -> Arc<Mutex<Vec<Diagnostic>>> {
        let diagnostics = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&diagnostics);
        hub.subscribe(EventKind::Diagnostic, EventFilter::new(), move |event| {
            if let DomainEvent::Diagnostic(diagnostic) = event {
                sink.lock().unwrap().push(diagnostic.clone());
            }
            Ok(())
        });
        diagnostics
    }

    #[tokio::test(start_paused = true)]
    async fn test_content_writes_are_debounced() {
        let (store, _hub, coordinator) = setup();
        coordinator.schedule_create(&node("a", None));
        coordinator.wait_idle().await;

        for version in 2..=11 {
            coordinator.schedule_content_write("a", format!("draft {version}"), version);
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(coordinator.write_state("a"), WriteState::Pending);

        coordinator.wait_idle().await;

        let updates: Vec<_> = store
            .writes()
            .await
            .into_iter()
            .filter(|w| w.kind == WriteKind::UpdateNode)
            .collect();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].content.as_deref(), Some("draft 11"));
        assert_eq!(updates[0].version, Some(11));
        assert_eq!(coordinator.write_state("a"), WriteState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_structural_write_waits_for_parent_creation() {
        let (store, _hub, coordinator) = setup();
        store
            .set_latency(WriteKind::CreateNode, Duration::from_millis(300))
            .await;

        coordinator.schedule_create(&node("parent", None));
        coordinator.schedule_structural_write(None, "parent", 1.0);
        coordinator.schedule_create(&node("child", Some("parent")));
        coordinator.schedule_structural_write(Some("parent"), "child", 1.0);
        assert!(coordinator.has_pending_creation("parent"));

        coordinator.wait_idle().await;

        let writes = store.writes().await;
        assert!(writes.iter().all(|w| w.succeeded()), "{writes:?}");
        let parent_created = writes
            .iter()
            .position(|w| w.kind == WriteKind::CreateNode && w.id == "parent")
            .unwrap();
        let child_edge = writes
            .iter()
            .position(|w| w.kind == WriteKind::UpsertEdge && w.id == "child")
            .unwrap();
        assert!(parent_created < child_edge);
        assert_eq!(store.children_of(Some("parent")).await, vec!["child"]);
        assert!(!coordinator.has_pending_creation("parent"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ordering_timeout_reports_and_writes_anyway() {
        let (store, hub, coordinator) = setup();
        let diagnostics = collect_diagnostics(&hub);
        store
            .set_latency(WriteKind::CreateNode, Duration::from_secs(30))
            .await;

        coordinator.schedule_create(&node("parent", None));
        coordinator.schedule_structural_write(Some("parent"), "orphan", 1.0);
        coordinator.wait_idle().await;

        let diagnostics = diagnostics.lock().unwrap();
        assert!(diagnostics
            .iter()
            .any(|d| d.kind == DiagnosticKind::WriteOrderingTimeout));
        // the edge was attempted before the parent existed and the store refused it
        assert!(diagnostics
            .iter()
            .any(|d| d.kind == DiagnosticKind::PersistenceFailure
                && d.node_id.as_deref() == Some("orphan")));
        assert_eq!(coordinator.write_state("orphan"), WriteState::Failed);
    }

    #[tokio::test]
    async fn test_failed_creation_releases_waiters() {
        let (store, hub, coordinator) = setup();
        let diagnostics = collect_diagnostics(&hub);
        store
            .inject_failure(WriteKind::CreateNode, StoreError::connectivity("down"))
            .await;

        coordinator.schedule_create(&node("parent", None));
        coordinator.schedule_structural_write(Some("parent"), "child", 1.0);
        coordinator.wait_idle().await;

        let diagnostics = diagnostics.lock().unwrap();
        assert!(!diagnostics
            .iter()
            .any(|d| d.kind == DiagnosticKind::WriteOrderingTimeout));
        assert_eq!(coordinator.write_state("parent"), WriteState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_all_skips_debounce_window() {
        let (store, _hub, coordinator) = setup();
        coordinator.schedule_create(&node("a", None));
        coordinator.schedule_content_write("a", "final".to_string(), 2);
        assert_eq!(coordinator.pending_count(), 2);

        coordinator.flush_all().await;

        assert_eq!(store.node("a").await.unwrap().content, "final");
        assert_eq!(coordinator.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_cancels_pending_content() {
        let (store, _hub, coordinator) = setup();
        coordinator.schedule_create(&node("a", None));
        coordinator.schedule_content_write("a", "typing".to_string(), 2);
        coordinator.schedule_delete("a");
        coordinator.wait_idle().await;

        let kinds: Vec<WriteKind> = store.writes().await.iter().map(|w| w.kind).collect();
        assert_eq!(kinds, vec![WriteKind::CreateNode, WriteKind::DeleteNode]);
        assert!(store.node("a").await.is_none());
    }

    #[tokio::test]
    async fn test_properties_written_immediately_in_lane_order() {
        let (store, _hub, coordinator) = setup();
        coordinator.schedule_create(&node("a", None));
        coordinator.write_properties_now("a", json!({ "status": "done" }), 2);
        coordinator.wait_idle().await;

        let stored = store.node("a").await.unwrap();
        assert_eq!(stored.properties["status"], "done");
        assert_eq!(stored.version, 2);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_writes() {
        let (store, _hub, coordinator) = setup();
        coordinator.shutdown().await;
        coordinator.schedule_create(&node("late", None));
        coordinator.wait_idle().await;

        assert!(store.writes().await.is_empty());
    }
}
