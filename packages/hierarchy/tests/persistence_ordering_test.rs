//! Persistence Ordering Tests
//!
//! The backing store sees writes after the in-memory transition has already
//! committed. These tests pin down what it sees and in which order:
//!
//! - a burst of content edits collapses into one write (debounce)
//! - a parent's creation write lands before its child's edge write
//! - a late parent creation produces a `WriteOrderingTimeout` diagnostic
//! - a failed write is reported as a diagnostic and never rolls back memory
//!
//! All tests run on a paused tokio clock so debounce windows and timeouts
//! elapse instantly and deterministically.

use nodespace_hierarchy::db::{InMemoryBackingStore, StoreError, WriteKind};
use nodespace_hierarchy::models::{HierarchyEdge, Node};
use nodespace_hierarchy::services::{
    CreateNodeParams, Diagnostic, DiagnosticKind, DomainEvent, EventFilter, EventKind, WriteState,
};
use nodespace_hierarchy::{DocumentSession, HierarchyConfig};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Test helper: session plus direct access to the store
fn create_session() -> (Arc<DocumentSession>, Arc<InMemoryBackingStore>) {
    let store = Arc::new(InMemoryBackingStore::new());
    let session = DocumentSession::builder()
        .backing_store(store.clone())
        .build()
        .unwrap();
    (session, store)
}

/// Test helper: collect every diagnostic published on the session's hub
fn collect_diagnostics(session: &DocumentSession) -> Arc<Mutex<Vec<Diagnostic>>> {
    let diagnostics = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&diagnostics);
    session
        .hub()
        .subscribe(EventKind::Diagnostic, EventFilter::new(), move |event| {
            if let DomainEvent::Diagnostic(diagnostic) = event {
                sink.lock().unwrap().push(diagnostic.clone());
            }
            Ok(())
        });
    diagnostics
}

#[tokio::test(start_paused = true)]
async fn test_rapid_content_edits_produce_one_write() {
    let (session, store) = create_session();
    let m = session.mutations();
    let id = m
        .create_node(CreateNodeParams::text("draft"))
        .unwrap();

    let mut last_version = 0;
    for i in 0..10 {
        last_version = m.update_content(&id, format!("draft {i}")).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(
        session.persistence().write_state(&id),
        WriteState::Pending
    );

    session.persistence().wait_idle().await;

    let updates: Vec<_> = store
        .writes()
        .await
        .into_iter()
        .filter(|w| w.kind == WriteKind::UpdateNode && w.id == id)
        .collect();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].content.as_deref(), Some("draft 9"));
    assert_eq!(updates[0].version, Some(last_version));

    let stored = store.node(&id).await.unwrap();
    assert_eq!(stored.content, "draft 9");
    assert_eq!(session.persistence().write_state(&id), WriteState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_debounce_window_restarts_on_each_edit() {
    let config = HierarchyConfig {
        content_debounce_ms: 400,
        ..HierarchyConfig::default()
    };
    let store = Arc::new(InMemoryBackingStore::new());
    let session = DocumentSession::builder()
        .config(config)
        .backing_store(store.clone())
        .build()
        .unwrap();
    let id = session
        .mutations()
        .create_node(CreateNodeParams::text("a"))
        .unwrap();

    session.mutations().update_content(&id, "ab").unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    session.mutations().update_content(&id, "abc").unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    // 600ms since the first edit, but only 300ms of quiet
    assert_eq!(store.node(&id).await.unwrap().content, "a");

    tokio::time::sleep(Duration::from_millis(150)).await;
    session.persistence().wait_idle().await;
    assert_eq!(store.node(&id).await.unwrap().content, "abc");
}

#[tokio::test(start_paused = true)]
async fn test_parent_creation_lands_before_child_edge() {
    let (session, store) = create_session();
    store
        .set_latency(WriteKind::CreateNode, Duration::from_millis(200))
        .await;
    let m = session.mutations();

    let parent = m
        .create_node(CreateNodeParams::text("parent").with_id("parent"))
        .unwrap();
    let child = m
        .create_node(CreateNodeParams::text("child").with_id("child").under(parent.clone()))
        .unwrap();
    assert!(session.persistence().has_pending_creation(&parent));

    session.flush().await;

    let writes = store.writes().await;
    assert!(writes.iter().all(|w| w.succeeded()), "{writes:?}");
    let parent_created = writes
        .iter()
        .position(|w| w.kind == WriteKind::CreateNode && w.id == parent)
        .unwrap();
    let child_edge = writes
        .iter()
        .position(|w| w.kind == WriteKind::UpsertEdge && w.id == child)
        .unwrap();
    assert!(parent_created < child_edge);
    assert_eq!(
        store.edge_of(&child).await.unwrap().parent_id.as_deref(),
        Some("parent")
    );
}

#[tokio::test(start_paused = true)]
async fn test_late_parent_creation_reports_ordering_timeout() {
    let store = Arc::new(InMemoryBackingStore::new());
    let existing = Node::new_with_id(
        "existing".to_string(),
        "text".to_string(),
        "loaded".to_string(),
        None,
        json!({}),
    );
    store
        .seed(vec![existing], vec![HierarchyEdge::new(None, "existing", 1.0)])
        .await;
    let session = DocumentSession::builder()
        .backing_store(store.clone())
        .build()
        .unwrap();
    session.load_from_backing_store().await.unwrap();
    let diagnostics = collect_diagnostics(&session);

    // parent creation outlasts the 5s ordering timeout
    store
        .set_latency(WriteKind::CreateNode, Duration::from_secs(10))
        .await;
    let m = session.mutations();
    let parent = m
        .create_node(CreateNodeParams::text("slow parent"))
        .unwrap();
    m.move_node("existing", Some(&parent), None).unwrap();

    session.flush().await;

    let diagnostics = diagnostics.lock().unwrap();
    assert!(diagnostics.iter().any(|d| {
        d.kind == DiagnosticKind::WriteOrderingTimeout && d.node_id.as_deref() == Some("existing")
    }));
    // memory keeps the move regardless of what the store did
    assert_eq!(session.children_of(Some(&parent)), vec!["existing"]);
}

#[tokio::test(start_paused = true)]
async fn test_failed_write_is_reported_not_rolled_back() {
    let (session, store) = create_session();
    let diagnostics = collect_diagnostics(&session);
    let m = session.mutations();
    let id = m.create_node(CreateNodeParams::text("v1")).unwrap();
    session.flush().await;

    store
        .inject_failure(
            WriteKind::UpdateNode,
            StoreError::connectivity("connection reset"),
        )
        .await;
    m.update_content(&id, "v2").unwrap();
    session.flush().await;

    assert_eq!(session.persistence().write_state(&id), WriteState::Failed);
    assert_eq!(session.get_node(&id).unwrap().content, "v2");
    assert_eq!(store.node(&id).await.unwrap().content, "v1");
    {
        let diagnostics = diagnostics.lock().unwrap();
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].kind, DiagnosticKind::PersistenceFailure);
        assert_eq!(diagnostics[0].node_id.as_deref(), Some(id.as_str()));
    }

    // next successful write clears the failure
    m.update_content(&id, "v3").unwrap();
    session.flush().await;
    assert_eq!(session.persistence().write_state(&id), WriteState::Idle);
    assert_eq!(store.node(&id).await.unwrap().content, "v3");
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_flushes_pending_and_refuses_new_writes() {
    let (session, store) = create_session();
    let m = session.mutations();
    let id = m.create_node(CreateNodeParams::text("before")).unwrap();
    m.update_content(&id, "pending at shutdown").unwrap();

    session.shutdown().await;
    assert_eq!(
        store.node(&id).await.unwrap().content,
        "pending at shutdown"
    );

    let count = store.writes().await.len();
    m.update_content(&id, "after shutdown").unwrap();
    session.flush().await;
    assert_eq!(store.writes().await.len(), count);
    assert_eq!(session.persistence().pending_count(), 0);
}
