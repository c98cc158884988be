//! Engine Services
//!
//! This module contains the services that keep viewers in sync:
//!
//! - `MutationService` - atomic structural and content transitions
//! - `PersistenceCoordinator` - debounced, ordered backing-store writes
//! - `SubscriberHub` - synchronous pub/sub of domain events
//! - `Viewer` - one pane's handle on a shared document plus its local UI state
//! - `ContentProcessor` - pluggable merge and mention extraction
//!
//! Mutations apply to memory and return immediately; subscribers hear about
//! them before the call returns, and durable writes follow in the background.

pub mod content_processor;
pub mod error;
pub mod events;
pub mod mutation_service;
pub mod persistence_coordinator;
pub mod subscriber_hub;
pub mod viewer;

pub use content_processor::{extract_mentions, ContentProcessor, DefaultContentProcessor};
pub use error::{MutationError, PersistenceError};
pub use events::{Diagnostic, DiagnosticKind, DomainEvent, EventKind, StructuralOperation};
pub use mutation_service::{CreateNodeParams, MoveOutcome, MutationService};
pub use persistence_coordinator::{CreationState, PersistenceCoordinator, WriteState};
pub use subscriber_hub::{
    EventFilter, EventHandler, SubscriberHub, Subscription, DOMAIN_EVENT_CHANNEL_CAPACITY,
};
pub use viewer::{Viewer, ViewerUiState};
