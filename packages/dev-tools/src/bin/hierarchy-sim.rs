//! Hierarchy Simulator
//!
//! Runs a scripted editing session against an in-memory backing store with two
//! viewers editing the same document, then prints the resulting outline, the
//! backing-store write log and an integrity report.
//!
//! Useful for eyeballing write ordering and debounce behaviour without a
//! frontend or a database.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin hierarchy-sim
//!
//! # JSON output for diffing between runs
//! cargo run --bin hierarchy-sim -- --json
//!
//! # Shorter debounce, slow creation writes, verbose engine logs
//! NODESPACE_CONTENT_DEBOUNCE_MS=50 SIM_CREATE_LATENCY_MS=120 \
//!   RUST_LOG=nodespace_hierarchy=debug cargo run --bin hierarchy-sim
//! ```
//!
//! # Configuration
//!
//! Engine settings come from `NODESPACE_*` environment variables (see
//! `HierarchyConfig`). `SIM_CREATE_LATENCY_MS` delays every creation write in
//! the in-memory store, defaulting to 0.

use anyhow::Context;
use nodespace_hierarchy::db::{InMemoryBackingStore, WriteKind};
use nodespace_hierarchy::services::{CreateNodeParams, DomainEvent, Viewer};
use nodespace_hierarchy::{DocumentSession, HierarchyConfig};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const ENV_CREATE_LATENCY_MS: &str = "SIM_CREATE_LATENCY_MS";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let json_output = std::env::args().any(|arg| arg == "--json");

    let config = HierarchyConfig::default()
        .with_env_overrides()
        .context("invalid NODESPACE_* override")?;
    let create_latency = match std::env::var(ENV_CREATE_LATENCY_MS) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .with_context(|| format!("cannot parse {ENV_CREATE_LATENCY_MS}='{value}'"))?,
        Err(_) => 0,
    };

    println!("🔧 Initializing hierarchy-sim...");
    println!(
        "   Debounce: {}ms, ordering timeout: {}ms, create latency: {}ms",
        config.content_debounce_ms, config.write_ordering_timeout_ms, create_latency
    );

    let store = Arc::new(InMemoryBackingStore::new());
    if create_latency > 0 {
        store
            .set_latency(WriteKind::CreateNode, Duration::from_millis(create_latency))
            .await;
    }
    let session = DocumentSession::builder()
        .config(config)
        .backing_store(store.clone())
        .build()?;

    // Log every event the way a frontend bridge would receive it
    let event_log = session.hub().subscribe_all(|event: &DomainEvent| {
        tracing::debug!(
            "{} from {} {:?}",
            event.event_type(),
            event.source_viewer_id().unwrap_or("-"),
            event.node_ids()
        );
        if let DomainEvent::Diagnostic(diagnostic) = event {
            tracing::warn!("diagnostic: {}", diagnostic.message);
        }
        Ok(())
    });

    let left = session.viewer("left");
    let right = session.viewer("right");

    let started = chrono::Utc::now();
    run_script(&left, &right)
        .await
        .context("editing script failed")?;

    println!("💾 Flushing pending writes...");
    session.shutdown().await;
    let elapsed = chrono::Utc::now() - started;

    let outline = session.outline();
    let writes = store.writes().await;
    let report = session.verify_integrity();

    if json_output {
        let rows: Vec<_> = outline
            .iter()
            .map(|row| {
                let node = session.get_node(&row.id);
                json!({
                    "id": row.id,
                    "depth": row.depth,
                    "content": node.as_ref().map(|n| n.content.clone()),
                    "version": node.as_ref().map(|n| n.version),
                })
            })
            .collect();
        let output = json!({
            "outline": rows,
            "writes": writes,
            "integrity": report,
            "elapsedMs": elapsed.num_milliseconds(),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("\n📄 Outline ({} nodes)", outline.len());
        for row in &outline {
            let content = session
                .get_node(&row.id)
                .map(|n| n.content)
                .unwrap_or_default();
            println!("   {}- {}", "  ".repeat(row.depth as usize), content);
        }

        println!("\n🗄  Backing-store write log ({} writes)", writes.len());
        for (i, write) in writes.iter().enumerate() {
            let status = match &write.error {
                Some(error) => format!("❌ {error}"),
                None => "✅".to_string(),
            };
            let detail = match write.kind {
                WriteKind::UpsertEdge => format!(
                    " under {}",
                    write.parent_id.as_deref().unwrap_or("root")
                ),
                WriteKind::UpdateNode => write
                    .version
                    .map(|v| format!(" v{v}"))
                    .unwrap_or_default(),
                _ => String::new(),
            };
            println!("   {:>3}. {:?} {}{} {}", i + 1, write.kind, write.id, detail, status);
        }

        println!(
            "\n🔍 Integrity: {} scopes checked, {} violations ({}ms)",
            report.scopes_checked,
            report.violations.len(),
            elapsed.num_milliseconds()
        );
        for violation in &report.violations {
            println!(
                "   ❌ {}: {}",
                violation.scope.as_deref().unwrap_or("root"),
                violation.reason
            );
        }
    }

    event_log.unsubscribe();
    left.close();
    right.close();

    if !report.is_healthy() {
        anyhow::bail!("document failed integrity check");
    }
    Ok(())
}

/// Two viewers building and reshaping a grocery list
async fn run_script(left: &Viewer, right: &Viewer) -> anyhow::Result<()> {
    let l = left.mutations();
    let r = right.mutations();

    println!("✏️  left: creating list");
    let groceries = l.create_node(CreateNodeParams::text("Groceries"))?;
    let milk = l.create_node(CreateNodeParams::text("Milk").after(groceries.clone()))?;
    let eggs = l.create_node(CreateNodeParams::text("Eggs").after(milk.clone()))?;
    let bread = l.create_node(CreateNodeParams::text("Bread").after(eggs.clone()))?;

    println!("↹  right: indenting items under Groceries");
    r.indent_node(&milk)?;
    r.indent_node(&eggs)?;
    r.indent_node(&bread)?;
    right.expand(&groceries);

    println!("⌨️  right: typing into Eggs");
    for text in ["Eggs (", "Eggs (12", "Eggs (12, free range)"] {
        r.update_content(&eggs, text)?;
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    println!("⏎  left: blank line after Bread, then typing into it");
    let butter = l.create_node(CreateNodeParams::text("").after(bread.clone()))?;
    l.update_content(&butter, "Butter")?;

    println!("✂️  left: splitting Bread into two lines");
    let extra = l.split_node(&bread, 5)?;
    l.update_content(&extra, "Bagels")?;
    r.update_properties(&extra, json!({ "status": "open" }))?;

    println!("⇤  right: outdenting Bread (Bagels and Butter follow it)");
    r.outdent_node(&bread)?;

    println!("⌫  left: merging Bagels into Bread");
    l.merge_nodes(&extra, &bread)?;

    println!("🗑  right: deleting Groceries (children promoted)");
    r.delete_node(&groceries)?;

    println!(
        "👀 left sees {} rows, right sees {} rows",
        left.visible_outline().len(),
        right.visible_outline().len()
    );
    Ok(())
}
