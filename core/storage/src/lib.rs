//! Storage abstraction for the sync engine.
//!
//! This module provides a trait-based interface over the four stores the
//! engine persists (outbox entries, queue entries, queue attempts and sync
//! sessions) and two backends.
//!
//! # Design Principles
//! - Storage is dumb: the engine computes row states, storage persists them
//! - Batch outbox updates are all-or-nothing
//! - Unified error semantics: every backend failure is `Error::Storage`

pub mod memory;
pub mod sqlite;
pub mod store;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use store::{OutboxQuery, SyncStore};
