//! In-memory storage backend for testing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use storesync_common::{
    EntityType, Error, NewOutboxEntry, NewQueueAttempt, NewQueueEntry, NewSyncSession,
    OutboxEntry, QueueAttempt, QueueEntry, QueueStatus, Result, SyncSession,
};

use crate::store::{paginate, OutboxQuery, SyncStore};

#[derive(Debug, Default)]
struct Tables {
    outbox: BTreeMap<i64, OutboxEntry>,
    queue: BTreeMap<i64, QueueEntry>,
    attempts: Vec<QueueAttempt>,
    sessions: Vec<SyncSession>,
    next_outbox_id: i64,
    next_queue_id: i64,
    next_attempt_id: i64,
    next_session_id: i64,
}

fn next_id(counter: &mut i64) -> i64 {
    *counter += 1;
    *counter
}

/// In-memory storage backend.
///
/// Useful for testing and development. All data is stored in memory
/// and lost on drop. Every mutation happens under a single write lock, so
/// batch updates are naturally all-or-nothing.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    fail_outbox_updates: AtomicBool,
    fail_session_writes: AtomicBool,
    outbox_write_delay_ms: AtomicU64,
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every outbox batch write fail as if the backend were down.
    pub fn inject_outbox_update_failure(&self, fail: bool) {
        self.fail_outbox_updates.store(fail, Ordering::SeqCst);
    }

    /// Make `insert_session` fail as if the backend were down.
    pub fn inject_session_write_failure(&self, fail: bool) {
        self.fail_session_writes.store(fail, Ordering::SeqCst);
    }

    /// Hold every outbox batch write for `delay` before it applies.
    pub fn stall_outbox_writes(&self, delay: Duration) {
        self.outbox_write_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    async fn stall(&self) {
        let ms = self.outbox_write_delay_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| Error::Storage("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| Error::Storage("memory store lock poisoned".to_string()))
    }

    /// Apply `patch` to every stored row named in `entries`, or to none.
    fn patch_outbox<F>(&self, entries: &[OutboxEntry], patch: F) -> Result<()>
    where
        F: Fn(&mut OutboxEntry, &OutboxEntry),
    {
        if self.fail_outbox_updates.load(Ordering::SeqCst) {
            return Err(Error::Storage("outbox store unavailable".to_string()));
        }

        let mut tables = self.write()?;
        if let Some(missing) = entries.iter().find(|e| !tables.outbox.contains_key(&e.id)) {
            return Err(Error::NotFound(format!("Outbox entry not found: {}", missing.id)));
        }
        for entry in entries {
            if let Some(stored) = tables.outbox.get_mut(&entry.id) {
                patch(stored, entry);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SyncStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn insert_outbox(&self, entry: NewOutboxEntry) -> Result<OutboxEntry> {
        let mut tables = self.write()?;
        let id = next_id(&mut tables.next_outbox_id);
        let entry = entry.into_entry(id);
        tables.outbox.insert(id, entry.clone());
        Ok(entry)
    }

    async fn latest_outbox_for(
        &self,
        entity_type: &EntityType,
        entity_id: &str,
    ) -> Result<Option<OutboxEntry>> {
        let tables = self.read()?;
        Ok(tables
            .outbox
            .values()
            .rev()
            .find(|e| &e.entity_type == entity_type && e.entity_id == entity_id)
            .cloned())
    }

    async fn get_outbox(&self, id: i64) -> Result<Option<OutboxEntry>> {
        Ok(self.read()?.outbox.get(&id).cloned())
    }

    async fn list_outbox(&self, query: &OutboxQuery) -> Result<Vec<OutboxEntry>> {
        let tables = self.read()?;
        let matching: Vec<OutboxEntry> = tables
            .outbox
            .values()
            .filter(|e| query.matches(e))
            .cloned()
            .collect();
        Ok(paginate(matching, query.offset, query.limit))
    }

    async fn count_outbox(&self, query: &OutboxQuery) -> Result<usize> {
        let tables = self.read()?;
        Ok(tables.outbox.values().filter(|e| query.matches(e)).count())
    }

    async fn update_outbox_batch(&self, entries: &[OutboxEntry]) -> Result<()> {
        self.stall().await;
        self.patch_outbox(entries, |stored, entry| *stored = entry.clone())
    }

    async fn record_delivery_batch(&self, entries: &[OutboxEntry]) -> Result<()> {
        self.stall().await;
        self.patch_outbox(entries, OutboxEntry::apply_delivery_state)
    }

    async fn record_review_batch(&self, entries: &[OutboxEntry]) -> Result<()> {
        self.stall().await;
        self.patch_outbox(entries, OutboxEntry::apply_review_state)
    }

    async fn insert_queue(&self, entry: NewQueueEntry) -> Result<QueueEntry> {
        let mut tables = self.write()?;
        let id = next_id(&mut tables.next_queue_id);
        let entry = entry.into_entry(id);
        tables.queue.insert(id, entry.clone());
        Ok(entry)
    }

    async fn find_queue_by_key(&self, key: &str) -> Result<Option<QueueEntry>> {
        let tables = self.read()?;
        Ok(tables
            .queue
            .values()
            .find(|e| e.idempotency_key.as_deref() == Some(key))
            .cloned())
    }

    async fn list_queue(&self, statuses: &[QueueStatus]) -> Result<Vec<QueueEntry>> {
        let tables = self.read()?;
        Ok(tables
            .queue
            .values()
            .filter(|e| statuses.is_empty() || statuses.contains(&e.status))
            .cloned()
            .collect())
    }

    async fn update_queue(&self, entry: &QueueEntry) -> Result<()> {
        let mut tables = self.write()?;
        match tables.queue.get_mut(&entry.id) {
            Some(existing) => {
                *existing = entry.clone();
                Ok(())
            }
            None => Err(Error::NotFound(format!("Queue entry not found: {}", entry.id))),
        }
    }

    async fn insert_attempt(&self, attempt: NewQueueAttempt) -> Result<QueueAttempt> {
        let mut tables = self.write()?;
        let id = next_id(&mut tables.next_attempt_id);
        let attempt = attempt.into_attempt(id);
        tables.attempts.push(attempt.clone());
        Ok(attempt)
    }

    async fn list_attempts_since(&self, since: DateTime<Utc>) -> Result<Vec<QueueAttempt>> {
        let tables = self.read()?;
        Ok(tables
            .attempts
            .iter()
            .filter(|a| a.attempted_at >= since)
            .cloned()
            .collect())
    }

    async fn list_attempts_for(&self, queue_id: i64) -> Result<Vec<QueueAttempt>> {
        let tables = self.read()?;
        Ok(tables
            .attempts
            .iter()
            .filter(|a| a.queue_id == queue_id)
            .cloned()
            .collect())
    }

    async fn insert_session(&self, session: NewSyncSession) -> Result<SyncSession> {
        if self.fail_session_writes.load(Ordering::SeqCst) {
            return Err(Error::Storage("session store unavailable".to_string()));
        }

        let mut tables = self.write()?;
        let id = next_id(&mut tables.next_session_id);
        let session = session.into_session(id);
        tables.sessions.push(session.clone());
        Ok(session)
    }

    async fn list_sessions(&self, limit: usize) -> Result<Vec<SyncSession>> {
        let tables = self.read()?;
        Ok(tables.sessions.iter().rev().take(limit).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use storesync_common::{Operation, OutboxStatus, Priority};

    fn new_entry(entity_id: &str, payload: serde_json::Value) -> NewOutboxEntry {
        NewOutboxEntry {
            entity_type: EntityType::new("device").unwrap(),
            entity_id: entity_id.to_string(),
            operation: Operation::Update,
            payload,
            priority: Priority::Normal,
            conflict_flag: false,
            version: 1,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_insert_assigns_increasing_ids() {
        let store = MemoryStore::new();
        let a = store.insert_outbox(new_entry("D1", json!({}))).await.unwrap();
        let b = store.insert_outbox(new_entry("D1", json!({}))).await.unwrap();
        assert!(b.id > a.id);
        assert_eq!(a.status, OutboxStatus::Pending);
    }

    #[tokio::test]
    async fn test_latest_for_key() {
        let store = MemoryStore::new();
        store.insert_outbox(new_entry("D1", json!({"qty": 1}))).await.unwrap();
        store.insert_outbox(new_entry("D2", json!({"qty": 2}))).await.unwrap();
        let last = store.insert_outbox(new_entry("D1", json!({"qty": 3}))).await.unwrap();

        let device = EntityType::new("device").unwrap();
        let found = store.latest_outbox_for(&device, "D1").await.unwrap().unwrap();
        assert_eq!(found.id, last.id);
        assert!(store.latest_outbox_for(&device, "D9").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_batch_update_is_all_or_nothing() {
        let store = MemoryStore::new();
        let mut a = store.insert_outbox(new_entry("D1", json!({}))).await.unwrap();
        let mut ghost = a.clone();
        ghost.id = 999;

        a.mark_sent(Utc::now());
        ghost.mark_sent(Utc::now());
        let result = store.update_outbox_batch(&[a.clone(), ghost]).await;
        assert!(matches!(result, Err(Error::NotFound(_))));

        let stored = store.get_outbox(a.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OutboxStatus::Pending);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let store = MemoryStore::new();
        let mut a = store.insert_outbox(new_entry("D1", json!({}))).await.unwrap();
        store.inject_outbox_update_failure(true);
        a.mark_sent(Utc::now());
        let result = store.update_outbox_batch(&[a]).await;
        assert!(matches!(result, Err(Error::Storage(_))));
    }

    #[tokio::test]
    async fn test_column_scoped_batches_leave_other_columns() {
        let store = MemoryStore::new();
        let original = store.insert_outbox(new_entry("D1", json!({}))).await.unwrap();

        let mut reviewed = original.clone();
        reviewed.resolve_conflict("ops", Utc::now());
        reviewed.priority = Priority::High;
        store.record_review_batch(&[reviewed]).await.unwrap();

        // A stale copy taken before the review carries the old version.
        let mut delivered = original.clone();
        delivered.mark_sent(Utc::now());
        store.record_delivery_batch(&[delivered]).await.unwrap();

        let stored = store.get_outbox(original.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OutboxStatus::Sent);
        assert_eq!(stored.attempt_count, 1);
        assert_eq!(stored.version, 2);
        assert_eq!(stored.priority, Priority::High);
        assert_eq!(stored.resolved_by.as_deref(), Some("ops"));
    }

    #[tokio::test]
    async fn test_queue_lookup_by_key() {
        let store = MemoryStore::new();
        let entry = store
            .insert_queue(NewQueueEntry {
                event_type: "sale".to_string(),
                payload: json!({}),
                idempotency_key: Some("sale-1".to_string()),
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let found = store.find_queue_by_key("sale-1").await.unwrap().unwrap();
        assert_eq!(found.id, entry.id);
        assert!(store.find_queue_by_key("sale-2").await.unwrap().is_none());
        assert_eq!(store.list_queue(&[QueueStatus::Queued]).await.unwrap().len(), 1);
        assert!(store.list_queue(&[QueueStatus::Sent]).await.unwrap().is_empty());
    }
}
