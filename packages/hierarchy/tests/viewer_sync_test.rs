//! Multi-Viewer Synchronization Tests
//!
//! Two or more viewers share one DocumentSession. Every edit made through one
//! viewer must be visible to the others as soon as the call returns, and the
//! sibling chain, structure tree and depths must agree after any sequence of
//! operations.
//!
//! ## Test Coverage
//! - Outliner keyboard scenarios (Enter, Tab, Shift+Tab, Backspace-merge)
//! - Cross-viewer visibility without flushing
//! - Chain and depth invariants after a long mixed edit script
//! - Persisted hierarchy matching the in-memory hierarchy after flush

#[cfg(test)]
mod viewer_sync_tests {
    use anyhow::Result;
    use nodespace_hierarchy::db::InMemoryBackingStore;
    use nodespace_hierarchy::services::{CreateNodeParams, MoveOutcome};
    use nodespace_hierarchy::DocumentSession;
    use std::sync::Arc;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    /// Helper to create a session over an in-memory store
    fn create_session() -> Result<(Arc<DocumentSession>, Arc<InMemoryBackingStore>)> {
        init_tracing();
        let store = Arc::new(InMemoryBackingStore::new());
        let session = DocumentSession::builder()
            .backing_store(store.clone())
            .build()?;
        Ok((session, store))
    }

    fn assert_consistent(session: &DocumentSession) {
        let report = session.verify_integrity();
        assert!(
            report.is_healthy(),
            "integrity violations: {:?}",
            report.violations
        );
    }

    #[tokio::test]
    async fn test_edit_in_one_viewer_is_visible_in_other() -> Result<()> {
        let (session, _store) = create_session()?;
        let left = session.viewer("left");
        let right = session.viewer("right");

        let id = left
            .mutations()
            .create_node(CreateNodeParams::text("Shared idea"))?;
        left.mutations().update_content(&id, "Shared idea, revised")?;

        let seen = right.session().get_node(&id).expect("visible to right");
        assert_eq!(seen.content, "Shared idea, revised");
        assert_eq!(seen.version, 2);
        assert!(right.visible_outline().iter().any(|row| row.id == id));
        Ok(())
    }

    #[tokio::test]
    async fn test_outliner_keyboard_scenario() -> Result<()> {
        let (session, _store) = create_session()?;
        let viewer = session.viewer("main");
        let m = viewer.mutations();

        // Enter, Enter, Enter: three root lines
        let a = m.create_node(CreateNodeParams::text("A"))?;
        let b = m.create_node(CreateNodeParams::text("B").after(a.clone()))?;
        let c = m.create_node(CreateNodeParams::text("C").after(b.clone()))?;
        assert_eq!(session.children_of(None), vec![a.clone(), b.clone(), c.clone()]);

        // Tab on B
        assert_eq!(
            m.indent_node(&b)?,
            MoveOutcome::Moved {
                new_parent_id: Some(a.clone())
            }
        );
        assert_eq!(session.children_of(None), vec![a.clone(), c.clone()]);
        assert_eq!(session.children_of(Some(&a)), vec![b.clone()]);

        // Tab on C joins B under A
        m.indent_node(&c)?;
        assert_eq!(session.children_of(Some(&a)), vec![b.clone(), c.clone()]);

        // Shift+Tab on B: C follows B and becomes its child
        m.outdent_node(&b)?;
        assert_eq!(session.children_of(None), vec![a.clone(), b.clone()]);
        assert_eq!(session.children_of(Some(&b)), vec![c.clone()]);
        assert_eq!(session.get_node(&c).map(|n| n.depth), Some(1));

        // Backspace at start of C merges it into B
        m.merge_nodes(&c, &b)?;
        assert_eq!(session.get_node(&b).map(|n| n.content), Some("BC".to_string()));
        assert!(session.children_of(Some(&b)).is_empty());

        assert_consistent(&session);
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_with_children_scenario() -> Result<()> {
        let (session, _store) = create_session()?;
        let m = session.mutations();
        for id in ["A", "B", "C"] {
            m.create_node(CreateNodeParams::text(id).with_id(id))?;
        }
        m.create_node(CreateNodeParams::text("D").with_id("D").under("B"))?;
        m.create_node(CreateNodeParams::text("E").with_id("E").under("B"))?;

        m.delete_node("B")?;

        assert_eq!(session.children_of(None), vec!["A", "D", "E", "C"]);
        assert_eq!(session.chain_of(None)?, vec!["A", "D", "E", "C"]);
        assert_consistent(&session);
        Ok(())
    }

    #[tokio::test]
    async fn test_create_delete_round_trip_restores_order() -> Result<()> {
        let (session, _store) = create_session()?;
        let m = session.mutations();
        for id in ["A", "B", "C"] {
            m.create_node(CreateNodeParams::text(id).with_id(id))?;
        }
        let before = session.outline();

        let temp = m.create_node(CreateNodeParams::text("temp").after("A"))?;
        m.delete_node(&temp)?;

        assert_eq!(session.outline(), before);
        assert_consistent(&session);
        Ok(())
    }

    #[tokio::test]
    async fn test_mixed_edit_script_keeps_invariants() -> Result<()> {
        let (session, store) = create_session()?;
        let left = session.viewer("left");
        let right = session.viewer("right");

        let mut ids = Vec::new();
        for i in 0..12 {
            let viewer = if i % 2 == 0 { &left } else { &right };
            let params = match ids.last() {
                Some(prev) if i % 3 == 0 => CreateNodeParams::text(format!("n{i}")).under(
                    String::clone(prev),
                ),
                Some(prev) => CreateNodeParams::text(format!("n{i}")).after(String::clone(prev)),
                None => CreateNodeParams::text(format!("n{i}")),
            };
            ids.push(viewer.mutations().create_node(params)?);
        }

        for (step, id) in ids.iter().enumerate() {
            let viewer = if step % 2 == 0 { &right } else { &left };
            match step % 4 {
                0 => {
                    viewer.mutations().indent_node(id)?;
                }
                1 => {
                    viewer.mutations().outdent_node(id)?;
                }
                2 => {
                    viewer.mutations().update_content(id, format!("edited {step}"))?;
                }
                _ => {
                    viewer.mutations().split_node(id, 1)?;
                }
            }
            assert_consistent(&session);
        }

        left.mutations().delete_node(&ids[3])?;
        right.mutations().move_node(&ids[5], None, None)?;
        assert_consistent(&session);

        // durable hierarchy matches memory once everything is flushed
        session.flush().await;
        for row in session.outline() {
            let node = session.get_node(&row.id).expect("outline row exists");
            let edge = store.edge_of(&row.id).await.expect("edge persisted");
            assert_eq!(edge.parent_id, node.parent_id, "parent of {}", row.id);
        }
        assert_eq!(
            store.children_of(None).await,
            session.children_of(None),
            "root order persisted"
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_mutation_changes_nothing() -> Result<()> {
        let (session, _store) = create_session()?;
        let m = session.mutations();
        let a = m.create_node(CreateNodeParams::text("A"))?;
        let b = m.create_node(CreateNodeParams::text("B").under(a.clone()))?;
        let before = session.outline();

        assert!(m.move_node(&a, Some(&b), None).is_err());
        assert!(m.split_node(&b, 99).is_err());
        assert!(m.create_node(CreateNodeParams::text("x").after("ghost")).is_err());

        assert_eq!(session.outline(), before);
        assert_consistent(&session);
        Ok(())
    }
}
