//! SubscriberHub - synchronous fan-out of domain events
//!
//! Handlers run on the notifying thread, in registration order, before the
//! mutation that produced the event returns to its caller. That is what lets
//! every pane see an edit before the next keystroke is processed.
//!
//! A handler that returns `Err` or panics is logged and reported as a
//! [`DiagnosticKind::SubscriberFailure`] event; the remaining handlers still
//! run. Failures of diagnostic handlers are only logged so reporting cannot
//! recurse.
//!
//! Async consumers (bridges to a frontend, the dev simulator) can take a
//! `tokio::sync::broadcast` receiver instead. Slow receivers lag and skip
//! events rather than blocking the editor.

use crate::services::events::{Diagnostic, DiagnosticKind, DomainEvent, EventKind};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::broadcast;

/// Broadcast channel capacity for domain events
///
/// Large enough for a burst of structural edits; a stuck consumer lags.
pub const DOMAIN_EVENT_CHANNEL_CAPACITY: usize = 128;

/// Synchronous event handler
pub type EventHandler = Arc<dyn Fn(&DomainEvent) -> anyhow::Result<()> + Send + Sync>;

/// Restricts which events reach a subscription
///
/// Every constraint that is set must match.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFilter {
    pub node_id: Option<String>,
    pub viewer_id: Option<String>,
    pub namespace: Option<String>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only events that involve this node
    pub fn for_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    /// Only events produced by this viewer
    pub fn from_viewer(mut self, viewer_id: impl Into<String>) -> Self {
        self.viewer_id = Some(viewer_id.into());
        self
    }

    /// Only events in this namespace (`node`, `hierarchy`, `diagnostic`)
    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn matches(&self, event: &DomainEvent) -> bool {
        if let Some(node_id) = &self.node_id {
            if !event.node_ids().contains(&node_id.as_str()) {
                return false;
            }
        }
        if let Some(viewer_id) = &self.viewer_id {
            if event.source_viewer_id() != Some(viewer_id.as_str()) {
                return false;
            }
        }
        if let Some(namespace) = &self.namespace {
            if event.namespace() != namespace {
                return false;
            }
        }
        true
    }
}

struct Registration {
    id: u64,
    kind: Option<EventKind>,
    filter: EventFilter,
    handler: EventHandler,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    entries: Vec<Registration>,
}

type SharedRegistry = Arc<Mutex<Registry>>;

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle for one registration
///
/// Dropping the handle does NOT unsubscribe; call [`Subscription::unsubscribe`].
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remove the handler. Returns false if the hub is gone or it was already removed.
    pub fn unsubscribe(self) -> bool {
        let Some(registry) = self.registry.upgrade() else {
            return false;
        };
        let mut registry = lock(&registry);
        let before = registry.entries.len();
        registry.entries.retain(|entry| entry.id != self.id);
        registry.entries.len() != before
    }
}

pub struct SubscriberHub {
    registry: SharedRegistry,
    sender: broadcast::Sender<DomainEvent>,
}

impl Default for SubscriberHub {
    fn default() -> Self {
        Self::new(DOMAIN_EVENT_CHANNEL_CAPACITY)
    }
}

impl std::fmt::Debug for SubscriberHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberHub")
            .field("subscribers", &self.subscriber_count())
            .field("stream_receivers", &self.sender.receiver_count())
            .finish()
    }
}

impl SubscriberHub {
    pub fn new(channel_capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(channel_capacity.max(1));
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            sender,
        }
    }

    /// Receive every event
    pub fn subscribe_all<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&DomainEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(None, EventFilter::default(), Arc::new(handler))
    }

    /// Receive events of one kind that pass `filter`
    pub fn subscribe<F>(&self, kind: EventKind, filter: EventFilter, handler: F) -> Subscription
    where
        F: Fn(&DomainEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(Some(kind), filter, Arc::new(handler))
    }

    /// Receive every event that passes `filter`, regardless of kind
    pub fn subscribe_filtered<F>(&self, filter: EventFilter, handler: F) -> Subscription
    where
        F: Fn(&DomainEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(None, filter, Arc::new(handler))
    }

    /// Async receiver of the same events
    pub fn subscribe_stream(&self) -> broadcast::Receiver<DomainEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.registry).entries.len()
    }

    /// Deliver `event` to every matching handler, then to stream receivers
    ///
    /// Returns the number of handlers that failed.
    pub fn notify(&self, event: &DomainEvent) -> usize {
        let failures = self.deliver(event);

        // no receivers is normal
        let _ = self.sender.send(event.clone());

        if event.is_diagnostic() {
            return failures.len();
        }

        let count = failures.len();
        for (subscription_id, message) in failures {
            let diagnostic = DomainEvent::Diagnostic(Diagnostic::new(
                DiagnosticKind::SubscriberFailure,
                event.node_ids().first().copied(),
                format!(
                    "subscriber {} failed on {}: {}",
                    subscription_id,
                    event.event_type(),
                    message
                ),
            ));
            self.notify(&diagnostic);
        }
        count
    }

    fn register(&self, kind: Option<EventKind>, filter: EventFilter, handler: EventHandler) -> Subscription {
        let mut registry = lock(&self.registry);
        registry.next_id += 1;
        let id = registry.next_id;
        registry.entries.push(Registration {
            id,
            kind,
            filter,
            handler,
        });
        tracing::debug!("Registered subscriber {} (kind: {:?})", id, kind);

        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    fn deliver(&self, event: &DomainEvent) -> Vec<(u64, String)> {
        // snapshot so handlers can subscribe or unsubscribe without deadlocking
        let targets: Vec<(u64, EventHandler)> = {
            let registry = lock(&self.registry);
            let kind = event.kind();
            registry
                .entries
                .iter()
                .filter(|entry| entry.kind.map_or(true, |wanted| wanted == kind))
                .filter(|entry| entry.filter.matches(event))
                .map(|entry| (entry.id, Arc::clone(&entry.handler)))
                .collect()
        };

        let mut failures = Vec::new();
        for (id, handler) in targets {
            let message = match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(panic) => panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "handler panicked".to_string()),
            };
            tracing::warn!(
                "Subscriber {} failed handling {}: {}",
                id,
                event.event_type(),
                message
            );
            failures.push((id, message));
        }
        failures
    }
}
