//! Storage trait definition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use storesync_common::{
    EntityType, NewOutboxEntry, NewQueueAttempt, NewQueueEntry, NewSyncSession, OutboxEntry,
    OutboxStatus, Priority, QueueAttempt, QueueEntry, QueueStatus, Result, SyncSession,
};

/// Filter over outbox rows. Unset fields match everything.
///
/// Results are ordered by id ascending.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutboxQuery {
    pub entity_type: Option<EntityType>,
    pub entity_id: Option<String>,
    pub status: Option<OutboxStatus>,
    pub priority: Option<Priority>,
    pub conflict_flag: Option<bool>,
    /// Only rows whose last attempt is at or after this instant.
    pub attempted_since: Option<DateTime<Utc>>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl OutboxQuery {
    /// Query for every row with the given status.
    pub fn with_status(status: OutboxStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Same filter without pagination, used for counting.
    pub fn unpaged(&self) -> Self {
        Self {
            offset: 0,
            limit: None,
            ..self.clone()
        }
    }

    /// Whether a row passes the filter (pagination not applied).
    pub fn matches(&self, entry: &OutboxEntry) -> bool {
        self.entity_type.as_ref().is_none_or(|t| &entry.entity_type == t)
            && self.entity_id.as_ref().is_none_or(|id| &entry.entity_id == id)
            && self.status.is_none_or(|s| entry.status == s)
            && self.priority.is_none_or(|p| entry.priority == p)
            && self.conflict_flag.is_none_or(|c| entry.conflict_flag == c)
            && self
                .attempted_since
                .is_none_or(|since| entry.last_attempt_at.is_some_and(|at| at >= since))
    }
}

/// Persistence backend for the sync engine.
///
/// Implementations must be safe to share between tasks. Any failure of the
/// backend itself is reported as `Error::Storage`.
#[async_trait]
pub trait SyncStore: Send + Sync {
    /// Backend name (e.g., "memory", "sqlite").
    fn name(&self) -> &str;

    /// Append a new outbox row. Prior rows are never touched.
    async fn insert_outbox(&self, entry: NewOutboxEntry) -> Result<OutboxEntry>;

    /// Most recently inserted row for an entity key.
    async fn latest_outbox_for(
        &self,
        entity_type: &EntityType,
        entity_id: &str,
    ) -> Result<Option<OutboxEntry>>;

    /// Fetch one row by id.
    async fn get_outbox(&self, id: i64) -> Result<Option<OutboxEntry>>;

    /// Fetch several rows by id, skipping unknown ids. Input order is kept.
    async fn get_outbox_many(&self, ids: &[i64]) -> Result<Vec<OutboxEntry>> {
        let mut found = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(entry) = self.get_outbox(*id).await? {
                found.push(entry);
            }
        }
        Ok(found)
    }

    /// List rows matching a query.
    async fn list_outbox(&self, query: &OutboxQuery) -> Result<Vec<OutboxEntry>>;

    /// Count rows matching a query, ignoring pagination.
    async fn count_outbox(&self, query: &OutboxQuery) -> Result<usize>;

    /// Replace the mutable state of existing rows.
    ///
    /// # Postconditions
    /// - Either every row is written or none is
    ///
    /// # Errors
    /// - `NotFound` if any id is unknown (nothing written)
    /// - `Storage` on backend failure (nothing written)
    async fn update_outbox_batch(&self, entries: &[OutboxEntry]) -> Result<()>;

    /// Write only the delivery state of existing rows (status, attempt
    /// count, last attempt, error message). Priority, conflict flag,
    /// version and resolution keep their stored values.
    ///
    /// Same all-or-nothing contract and errors as `update_outbox_batch`.
    async fn record_delivery_batch(&self, entries: &[OutboxEntry]) -> Result<()>;

    /// Write only the review state of existing rows (priority, conflict
    /// flag, version, resolution). Delivery columns keep their stored
    /// values.
    ///
    /// Same all-or-nothing contract and errors as `update_outbox_batch`.
    async fn record_review_batch(&self, entries: &[OutboxEntry]) -> Result<()>;

    /// Insert a new queue row.
    async fn insert_queue(&self, entry: NewQueueEntry) -> Result<QueueEntry>;

    /// Find the queue row carrying an idempotency key.
    async fn find_queue_by_key(&self, key: &str) -> Result<Option<QueueEntry>>;

    /// List queue rows in any of `statuses` (all rows when empty), oldest first.
    async fn list_queue(&self, statuses: &[QueueStatus]) -> Result<Vec<QueueEntry>>;

    /// Replace the mutable state of one queue row.
    async fn update_queue(&self, entry: &QueueEntry) -> Result<()>;

    /// Append one attempt record.
    async fn insert_attempt(&self, attempt: NewQueueAttempt) -> Result<QueueAttempt>;

    /// Attempts at or after `since`, oldest first.
    async fn list_attempts_since(&self, since: DateTime<Utc>) -> Result<Vec<QueueAttempt>>;

    /// Attempts of a single queue row, oldest first.
    async fn list_attempts_for(&self, queue_id: i64) -> Result<Vec<QueueAttempt>>;

    /// Record a finished sync session.
    async fn insert_session(&self, session: NewSyncSession) -> Result<SyncSession>;

    /// Most recent sessions, newest first.
    async fn list_sessions(&self, limit: usize) -> Result<Vec<SyncSession>>;
}

/// Apply offset/limit to an already filtered, ordered list.
pub(crate) fn paginate<T>(items: Vec<T>, offset: usize, limit: Option<usize>) -> Vec<T> {
    let iter = items.into_iter().skip(offset);
    match limit {
        Some(limit) => iter.take(limit).collect(),
        None => iter.collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use storesync_common::Operation;

    fn sample() -> OutboxEntry {
        NewOutboxEntry {
            entity_type: EntityType::new("sale").unwrap(),
            entity_id: "S1".to_string(),
            operation: Operation::Create,
            payload: json!({"total": 10}),
            priority: Priority::High,
            conflict_flag: false,
            version: 1,
            created_at: Utc::now(),
        }
        .into_entry(1)
    }

    #[test]
    fn test_empty_query_matches_everything() {
        assert!(OutboxQuery::default().matches(&sample()));
    }

    #[test]
    fn test_query_filters() {
        let entry = sample();
        let mut query = OutboxQuery::with_status(OutboxStatus::Pending);
        assert!(query.matches(&entry));

        query.priority = Some(Priority::Low);
        assert!(!query.matches(&entry));

        let attempted = OutboxQuery {
            attempted_since: Some(Utc::now()),
            ..OutboxQuery::default()
        };
        assert!(!attempted.matches(&entry));
    }

    #[test]
    fn test_paginate() {
        let items: Vec<u32> = (0..10).collect();
        assert_eq!(paginate(items.clone(), 8, Some(5)), vec![8, 9]);
        assert_eq!(paginate(items, 2, Some(2)), vec![2, 3]);
    }
}
