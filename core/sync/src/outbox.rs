//! Outbox event store: capture, conflict stamping, reporting and
//! administration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use storesync_common::{
    EntityType, Error, NewOutboxEntry, Operation, OutboxEntry, OutboxStatus, Payload, Priority,
    Result,
};
use storesync_storage::{OutboxQuery, SyncStore};

use crate::conflict::{ConflictDetector, ConflictInfo, Divergence};
use crate::priority::PriorityResolver;

/// Largest page a listing may return.
pub const MAX_PAGE_SIZE: usize = 500;

/// Default page size for listings.
pub const DEFAULT_PAGE_SIZE: usize = 50;

type EntityKey = (EntityType, String);

/// One page of a listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
}

/// Aggregate counters for one (entity type, priority) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxStats {
    pub entity_type: EntityType,
    pub priority: Priority,
    pub total: usize,
    pub pending: usize,
    pub failed: usize,
    pub conflicts: usize,
    pub oldest_pending: Option<DateTime<Utc>>,
    pub last_conflict: Option<DateTime<Utc>>,
}

impl OutboxStats {
    fn empty(entity_type: EntityType, priority: Priority) -> Self {
        Self {
            entity_type,
            priority,
            total: 0,
            pending: 0,
            failed: 0,
            conflicts: 0,
            oldest_pending: None,
            last_conflict: None,
        }
    }

    fn record(&mut self, entry: &OutboxEntry) {
        self.total += 1;
        match entry.status {
            OutboxStatus::Pending => {
                self.pending += 1;
                self.oldest_pending = Some(match self.oldest_pending {
                    Some(oldest) => oldest.min(entry.created_at),
                    None => entry.created_at,
                });
            }
            OutboxStatus::Failed => self.failed += 1,
            OutboxStatus::Sent => {}
        }
        if entry.conflict_flag {
            self.conflicts += 1;
            self.last_conflict = Some(match self.last_conflict {
                Some(last) => last.max(entry.updated_at),
                None => entry.updated_at,
            });
        }
    }
}

/// Serializes read-modify-write per entity key.
#[derive(Debug, Default)]
struct KeyLocks {
    locks: Mutex<HashMap<EntityKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyLocks {
    fn lock_for(&self, key: &EntityKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(key.clone()).or_default().clone()
    }

    /// Drop the lock for `key` once nobody else holds or waits on it.
    fn release(&self, key: &EntityKey) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(key);
        }
    }

    /// Lock every key, in sorted order so two callers never deadlock.
    async fn hold(&self, keys: impl IntoIterator<Item = EntityKey>) -> HeldKeys<'_> {
        let keys: BTreeSet<EntityKey> = keys.into_iter().collect();
        let mut held = Vec::with_capacity(keys.len());
        for key in keys {
            let guard = self.lock_for(&key).lock_owned().await;
            held.push((key, guard));
        }
        HeldKeys { locks: self, held }
    }
}

/// Keys locked by [`KeyLocks::hold`], released on drop.
struct HeldKeys<'a> {
    locks: &'a KeyLocks,
    held: Vec<(EntityKey, OwnedMutexGuard<()>)>,
}

impl Drop for HeldKeys<'_> {
    fn drop(&mut self) {
        for (key, guard) in self.held.drain(..) {
            drop(guard);
            self.locks.release(&key);
        }
    }
}

fn key_of(entry: &OutboxEntry) -> EntityKey {
    (entry.entity_type.clone(), entry.entity_id.clone())
}

/// Append-only log of mutation events.
pub struct Outbox<S: SyncStore + ?Sized> {
    store: Arc<S>,
    detector: ConflictDetector,
    priorities: PriorityResolver,
    key_locks: KeyLocks,
}

impl<S: SyncStore + ?Sized> Outbox<S> {
    /// Create a new outbox over a store.
    pub fn new(store: Arc<S>, priorities: PriorityResolver) -> Self {
        Self {
            store,
            detector: ConflictDetector::new(),
            priorities,
            key_locks: KeyLocks::default(),
        }
    }

    /// Capture a mutation.
    ///
    /// # Postconditions
    /// - A new PENDING row exists; earlier rows for the key are untouched
    /// - Version and conflict flag follow the prior row for the key
    /// - Priority is `priority` if given, else resolved from the entity type
    ///
    /// # Errors
    /// - `Validation` if the entity id is empty
    /// - `Storage` if the row cannot be persisted
    pub async fn enqueue(
        &self,
        entity_type: EntityType,
        entity_id: impl Into<String>,
        operation: Operation,
        payload: Payload,
        priority: Option<Priority>,
    ) -> Result<OutboxEntry> {
        let entity_id = entity_id.into();
        if entity_id.trim().is_empty() {
            return Err(Error::Validation("Entity id cannot be empty".to_string()));
        }

        let key = (entity_type, entity_id);
        let _held = self.key_locks.hold([key.clone()]).await;
        self.stamp_and_insert(&key, operation, payload, priority).await
    }

    async fn stamp_and_insert(
        &self,
        key: &EntityKey,
        operation: Operation,
        payload: Payload,
        priority: Option<Priority>,
    ) -> Result<OutboxEntry> {
        let (entity_type, entity_id) = key;
        let prior = self.store.latest_outbox_for(entity_type, entity_id).await?;
        let stamp = self.detector.stamp(prior.as_ref(), &payload);

        if stamp.divergence == Divergence::Diverged {
            warn!(
                entity_type = %entity_type,
                entity_id = %entity_id,
                version = stamp.version,
                "conflict potential detected"
            );
        }

        let entry = self
            .store
            .insert_outbox(NewOutboxEntry {
                entity_type: entity_type.clone(),
                entity_id: entity_id.clone(),
                operation,
                payload,
                priority: priority.unwrap_or_else(|| self.priorities.resolve(entity_type)),
                conflict_flag: stamp.conflict_flag,
                version: stamp.version,
                created_at: Utc::now(),
            })
            .await?;

        debug!(
            "Enqueued outbox entry {} ({} {} v{})",
            entry.id, entry.entity_type, entry.entity_id, entry.version
        );
        Ok(entry)
    }

    /// Clear the conflict flag on the given entries.
    ///
    /// Every known id gets `conflict_flag = false` and `version + 1`,
    /// whatever its payload. Unknown ids are skipped.
    pub async fn resolve(&self, entry_ids: &[i64], resolved_by: &str) -> Result<Vec<OutboxEntry>> {
        let keys = self.keys_of(entry_ids).await?;
        let _held = self.key_locks.hold(keys).await;

        // Re-read under the locks; the rows may have moved meanwhile.
        let now = Utc::now();
        let mut resolved = self.store.get_outbox_many(entry_ids).await?;
        if resolved.len() < entry_ids.len() {
            debug!(
                "Skipping {} unknown outbox entries during resolve",
                entry_ids.len() - resolved.len()
            );
        }
        for entry in &mut resolved {
            entry.resolve_conflict(resolved_by, now);
        }

        if resolved.is_empty() {
            return Ok(resolved);
        }
        self.store.record_review_batch(&resolved).await?;

        for entry in &resolved {
            info!(
                entity_type = %entry.entity_type,
                entity_id = %entry.entity_id,
                version = entry.version,
                resolved_by = resolved_by,
                "conflict resolved"
            );
        }
        Ok(resolved)
    }

    /// Resolve the most recent entry of an entity key, if there is one.
    pub async fn resolve_latest(
        &self,
        entity_type: &EntityType,
        entity_id: &str,
        resolved_by: &str,
    ) -> Result<Option<OutboxEntry>> {
        match self.store.latest_outbox_for(entity_type, entity_id).await? {
            Some(latest) => Ok(self.resolve(&[latest.id], resolved_by).await?.pop()),
            None => Ok(None),
        }
    }

    /// Fetch one entry.
    pub async fn get(&self, id: i64) -> Result<OutboxEntry> {
        self.store
            .get_outbox(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Outbox entry not found: {}", id)))
    }

    /// List entries with pagination.
    pub async fn list(&self, query: &OutboxQuery) -> Result<Page<OutboxEntry>> {
        let limit = query
            .limit
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE);
        let paged = OutboxQuery {
            limit: Some(limit),
            ..query.clone()
        };

        let items = self.store.list_outbox(&paged).await?;
        let total = self.store.count_outbox(&paged.unpaged()).await?;
        Ok(Page {
            items,
            total,
            offset: query.offset,
            limit,
        })
    }

    /// Aggregate counters per entity type and priority.
    pub async fn stats(&self) -> Result<Vec<OutboxStats>> {
        let entries = self.store.list_outbox(&OutboxQuery::default()).await?;
        let mut groups: BTreeMap<(EntityType, Priority), OutboxStats> = BTreeMap::new();
        for entry in &entries {
            groups
                .entry((entry.entity_type.clone(), entry.priority))
                .or_insert_with(|| OutboxStats::empty(entry.entity_type.clone(), entry.priority))
                .record(entry);
        }
        Ok(groups.into_values().collect())
    }

    /// Unresolved conflicts: keys whose latest entry is still flagged.
    pub async fn conflicts(&self) -> Result<Vec<ConflictInfo>> {
        let entries = self.store.list_outbox(&OutboxQuery::default()).await?;
        let mut latest: BTreeMap<EntityKey, OutboxEntry> = BTreeMap::new();
        for entry in entries {
            latest.insert((entry.entity_type.clone(), entry.entity_id.clone()), entry);
        }
        Ok(latest
            .values()
            .filter(|e| e.conflict_flag)
            .map(ConflictInfo::from_entry)
            .collect())
    }

    /// Force a re-send of the given entries. Unknown ids are skipped.
    pub async fn replay(&self, entry_ids: &[i64]) -> Result<Vec<OutboxEntry>> {
        let now = Utc::now();
        let mut replayed = self.store.get_outbox_many(entry_ids).await?;
        for entry in &mut replayed {
            entry.replay(now);
        }
        if !replayed.is_empty() {
            self.store.record_delivery_batch(&replayed).await?;
            info!("Replaying {} outbox entries", replayed.len());
        }
        Ok(replayed)
    }

    /// Change the dispatch priority of one entry.
    pub async fn set_priority(&self, id: i64, priority: Priority) -> Result<OutboxEntry> {
        let key = key_of(&self.get(id).await?);
        let _held = self.key_locks.hold([key]).await;

        let mut entry = self.get(id).await?;
        entry.priority = priority;
        entry.updated_at = Utc::now();
        self.store.record_review_batch(std::slice::from_ref(&entry)).await?;
        Ok(entry)
    }

    /// Record a successful delivery of one entry.
    pub async fn mark_sent(&self, id: i64) -> Result<OutboxEntry> {
        let key = key_of(&self.get(id).await?);
        let _held = self.key_locks.hold([key]).await;

        let mut entry = self.get(id).await?;
        entry.mark_sent(Utc::now());
        self.store.record_delivery_batch(std::slice::from_ref(&entry)).await?;
        Ok(entry)
    }

    /// Record a failed delivery of one entry.
    pub async fn mark_failed(&self, id: i64, error: impl Into<String>) -> Result<OutboxEntry> {
        let key = key_of(&self.get(id).await?);
        let _held = self.key_locks.hold([key]).await;

        let mut entry = self.get(id).await?;
        entry.mark_failed(error, Utc::now());
        self.store.record_delivery_batch(std::slice::from_ref(&entry)).await?;
        Ok(entry)
    }

    /// Entity keys of the known ids.
    async fn keys_of(&self, entry_ids: &[i64]) -> Result<Vec<EntityKey>> {
        Ok(self
            .store
            .get_outbox_many(entry_ids)
            .await?
            .iter()
            .map(key_of)
            .collect())
    }
}
