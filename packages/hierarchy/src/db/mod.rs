//! Persistence Layer
//!
//! This module defines what the engine needs from durable storage:
//!
//! - [`BackingStore`] - async adapter contract (node table + structural edges)
//! - [`InMemoryBackingStore`] - integrity-enforcing adapter for tests and tooling
//! - [`FractionalOrderCalculator`] - order keys shared by the tree and the adapters
//!
//! Concrete database adapters (HTTP, embedded engines) live outside this crate
//! and implement [`BackingStore`].

mod backing_store;
mod error;
pub mod fractional_ordering;
pub mod memory_store;

pub use backing_store::BackingStore;
pub use error::StoreError;
pub use fractional_ordering::{FractionalOrderCalculator, DEFAULT_REBALANCE_THRESHOLD};
pub use memory_store::{InMemoryBackingStore, WriteKind, WriteRecord};
