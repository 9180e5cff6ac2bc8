//! Common utilities and types shared across the store sync crates.
//!
//! This module provides the error taxonomy and the logical data model
//! (outbox entries, hybrid queue entries, attempts and sync sessions)
//! that every storage backend and engine component agrees on.

pub mod error;
pub mod model;
pub mod types;

pub use error::{Error, Result};
pub use model::{
    NewOutboxEntry, NewQueueAttempt, NewQueueEntry, NewSyncSession, Operation, OutboxEntry,
    OutboxStatus, Payload, Priority, QueueAttempt, QueueEntry, QueueStatus, SessionMode,
    SessionStatus, SyncSession,
};
pub use types::{EntityType, SecretString, StoreId};
