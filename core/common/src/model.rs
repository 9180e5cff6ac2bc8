//! Logical data model shared by storage backends and the engine.
//!
//! Rows are plain values. Storage assigns ids; the engine computes new row
//! states and hands them back to storage. Outbox rows are never deleted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::types::{EntityType, StoreId};
use crate::{Error, Result};

/// Opaque payload document. The engine only compares payloads for equality.
pub type Payload = serde_json::Value;

/// Implements `as_str`, `Display` and `FromStr` over a fixed set of labels.
macro_rules! labelled_enum {
    ($ty:ident { $($variant:ident => $label:literal),+ $(,)? }) => {
        impl $ty {
            /// Every variant, in declaration order.
            pub const ALL: &'static [$ty] = &[$($ty::$variant),+];

            /// Stable label used in storage and on the command line.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $label),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                let label = s.trim();
                $(
                    if label.eq_ignore_ascii_case($label) {
                        return Ok($ty::$variant);
                    }
                )+
                Err(Error::Validation(format!(
                    "Unknown {}: {}",
                    stringify!($ty),
                    s
                )))
            }
        }
    };
}

/// Kind of mutation captured in the outbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
    Upsert,
}

labelled_enum!(Operation {
    Create => "create",
    Update => "update",
    Delete => "delete",
    Upsert => "upsert",
});

/// Delivery state of an outbox entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    /// Waiting for the next dispatch cycle.
    Pending,
    /// Accepted by the central authority.
    Sent,
    /// Last delivery attempt failed.
    Failed,
}

labelled_enum!(OutboxStatus {
    Pending => "PENDING",
    Sent => "SENT",
    Failed => "FAILED",
});

/// Dispatch priority tier. Declaration order is dispatch order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    High,
    Normal,
    Low,
}

labelled_enum!(Priority {
    High => "HIGH",
    Normal => "NORMAL",
    Low => "LOW",
});

/// State of an entry in the hybrid local queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueStatus {
    Queued,
    Running,
    Sent,
    Failed,
}

labelled_enum!(QueueStatus {
    Queued => "QUEUED",
    Running => "RUNNING",
    Sent => "SENT",
    Failed => "FAILED",
});

impl QueueStatus {
    /// Whether a dispatch pass may still pick this entry up.
    pub fn is_dispatchable(&self) -> bool {
        matches!(self, QueueStatus::Queued | QueueStatus::Running)
    }
}

/// How a sync session was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionMode {
    Manual,
    Automatic,
}

labelled_enum!(SessionMode {
    Manual => "MANUAL",
    Automatic => "AUTOMATIC",
});

/// Outcome of a sync session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Success,
    Failure,
}

labelled_enum!(SessionStatus {
    Success => "SUCCESS",
    Failure => "FAILURE",
});

/// One captured mutation event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: i64,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub operation: Operation,
    pub payload: Payload,
    pub attempt_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub status: OutboxStatus,
    pub priority: Priority,
    pub error_message: Option<String>,
    pub conflict_flag: bool,
    /// Monotonic per (entity_type, entity_id).
    pub version: u32,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OutboxEntry {
    /// Store referenced by the payload, `None` for global entries.
    pub fn store_reference(&self) -> Option<StoreId> {
        StoreId::from_payload(&self.payload)
    }

    /// Whether a cycle scoped to `scope` should pick this entry up.
    ///
    /// Global entries belong to every scope; no scope selects everything.
    pub fn in_scope(&self, scope: Option<StoreId>) -> bool {
        match (scope, self.store_reference()) {
            (None, _) | (_, None) => true,
            (Some(scope), Some(store)) => scope == store,
        }
    }

    /// Mark as delivered.
    pub fn mark_sent(&mut self, at: DateTime<Utc>) {
        self.status = OutboxStatus::Sent;
        self.attempt_count += 1;
        self.last_attempt_at = Some(at);
        self.error_message = None;
        self.updated_at = at;
    }

    /// Mark the delivery attempt as failed.
    pub fn mark_failed(&mut self, error: impl Into<String>, at: DateTime<Utc>) {
        self.status = OutboxStatus::Failed;
        self.attempt_count += 1;
        self.last_attempt_at = Some(at);
        self.error_message = Some(error.into());
        self.updated_at = at;
    }

    /// Put a failed entry back in line with a fresh attempt budget.
    ///
    /// Conflict state is left alone.
    pub fn requeue(&mut self, at: DateTime<Utc>) {
        self.status = OutboxStatus::Pending;
        self.attempt_count = 0;
        self.error_message = None;
        self.updated_at = at;
    }

    /// Force a re-send regardless of the current status.
    pub fn replay(&mut self, at: DateTime<Utc>) {
        self.status = OutboxStatus::Pending;
        self.error_message = None;
        self.updated_at = at;
    }

    /// Clear the conflict flag after operator review.
    pub fn resolve_conflict(&mut self, resolved_by: impl Into<String>, at: DateTime<Utc>) {
        self.conflict_flag = false;
        self.version += 1;
        self.resolved_by = Some(resolved_by.into());
        self.resolved_at = Some(at);
        self.updated_at = at;
    }

    /// Copy the delivery columns of `other`: status, attempt count, last
    /// attempt, error message and `updated_at`.
    pub fn apply_delivery_state(&mut self, other: &OutboxEntry) {
        self.status = other.status;
        self.attempt_count = other.attempt_count;
        self.last_attempt_at = other.last_attempt_at;
        self.error_message = other.error_message.clone();
        self.updated_at = other.updated_at;
    }

    /// Copy the review columns of `other`: priority, conflict flag,
    /// version, resolution and `updated_at`.
    pub fn apply_review_state(&mut self, other: &OutboxEntry) {
        self.priority = other.priority;
        self.conflict_flag = other.conflict_flag;
        self.version = other.version;
        self.resolved_by = other.resolved_by.clone();
        self.resolved_at = other.resolved_at;
        self.updated_at = other.updated_at;
    }
}

/// Outbox row prior to insertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOutboxEntry {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub operation: Operation,
    pub payload: Payload,
    pub priority: Priority,
    pub conflict_flag: bool,
    pub version: u32,
    pub created_at: DateTime<Utc>,
}

impl NewOutboxEntry {
    /// Materialize the row once storage has assigned an id.
    pub fn into_entry(self, id: i64) -> OutboxEntry {
        OutboxEntry {
            id,
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            operation: self.operation,
            payload: self.payload,
            attempt_count: 0,
            last_attempt_at: None,
            status: OutboxStatus::Pending,
            priority: self.priority,
            error_message: None,
            conflict_flag: self.conflict_flag,
            version: self.version,
            resolved_by: None,
            resolved_at: None,
            created_at: self.created_at,
            updated_at: self.created_at,
        }
    }
}

/// One event in the hybrid local queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: i64,
    pub event_type: String,
    pub payload: Payload,
    pub idempotency_key: Option<String>,
    pub status: QueueStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueueEntry {
    /// Mark as picked up by a dispatch pass.
    pub fn mark_running(&mut self, at: DateTime<Utc>) {
        self.status = QueueStatus::Running;
        self.updated_at = at;
    }

    /// Record a successful delivery.
    pub fn record_success(&mut self, at: DateTime<Utc>) {
        self.status = QueueStatus::Sent;
        self.attempts += 1;
        self.last_error = None;
        self.updated_at = at;
    }

    /// Record a failed delivery.
    ///
    /// Returns `true` once the retry budget is exhausted and the entry is
    /// parked as FAILED; otherwise it goes back to QUEUED.
    pub fn record_failure(
        &mut self,
        error: impl Into<String>,
        max_attempts: u32,
        at: DateTime<Utc>,
    ) -> bool {
        self.attempts += 1;
        self.last_error = Some(error.into());
        self.updated_at = at;
        if self.attempts >= max_attempts {
            self.status = QueueStatus::Failed;
            true
        } else {
            self.status = QueueStatus::Queued;
            false
        }
    }
}

/// Queue row prior to insertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewQueueEntry {
    pub event_type: String,
    pub payload: Payload,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl NewQueueEntry {
    /// Materialize the row once storage has assigned an id.
    pub fn into_entry(self, id: i64) -> QueueEntry {
        QueueEntry {
            id,
            event_type: self.event_type,
            payload: self.payload,
            idempotency_key: self.idempotency_key,
            status: QueueStatus::Queued,
            attempts: 0,
            last_error: None,
            created_at: self.created_at,
            updated_at: self.created_at,
        }
    }
}

/// One delivery attempt of a queue entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueAttempt {
    pub id: i64,
    pub queue_id: i64,
    pub attempted_at: DateTime<Utc>,
    pub success: bool,
    pub error_message: Option<String>,
}

/// Attempt row prior to insertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewQueueAttempt {
    pub queue_id: i64,
    pub attempted_at: DateTime<Utc>,
    pub success: bool,
    pub error_message: Option<String>,
}

impl NewQueueAttempt {
    pub fn into_attempt(self, id: i64) -> QueueAttempt {
        QueueAttempt {
            id,
            queue_id: self.queue_id,
            attempted_at: self.attempted_at,
            success: self.success,
            error_message: self.error_message,
        }
    }
}

/// Summary of one dispatch cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSession {
    pub id: i64,
    /// `None` means the cycle ran globally.
    pub store_id: Option<StoreId>,
    pub mode: SessionMode,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub triggered_by: Option<String>,
    pub error_message: Option<String>,
    pub processed_events: u64,
    pub differences_detected: u64,
}

/// Session row prior to insertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSyncSession {
    pub store_id: Option<StoreId>,
    pub mode: SessionMode,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub triggered_by: Option<String>,
    pub error_message: Option<String>,
    pub processed_events: u64,
    pub differences_detected: u64,
}

impl NewSyncSession {
    pub fn into_session(self, id: i64) -> SyncSession {
        SyncSession {
            id,
            store_id: self.store_id,
            mode: self.mode,
            status: self.status,
            started_at: self.started_at,
            finished_at: self.finished_at,
            triggered_by: self.triggered_by,
            error_message: self.error_message,
            processed_events: self.processed_events,
            differences_detected: self.differences_detected,
        }
    }
}
