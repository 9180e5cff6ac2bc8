//! Hybrid local queue: deduplicated event capture with its own delivery
//! loop and attempt history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use storesync_common::{
    Error, NewQueueAttempt, NewQueueEntry, Payload, QueueAttempt, QueueEntry, QueueStatus, Result,
};
use storesync_storage::SyncStore;

use crate::dispatch::DEFAULT_DELIVERY_TIMEOUT;
use crate::retry::RetryConfig;
use crate::transport::{deliver_with_timeout, DeliveryTransport, Envelope};

/// Default retry budget per queue entry.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// One event submitted to the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEvent {
    pub event_type: String,
    pub payload: Payload,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

impl QueueEvent {
    pub fn new(event_type: impl Into<String>, payload: Payload) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            idempotency_key: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// Result of an enqueue call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnqueueOutcome {
    /// Entries created by this call.
    pub queued: Vec<QueueEntry>,
    /// Existing entries matched by idempotency key.
    pub reused: Vec<QueueEntry>,
}

/// Counters for one dispatch pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDispatchSummary {
    pub processed: usize,
    pub sent: usize,
    /// Entries that exhausted their budget during this pass.
    pub failed: usize,
    /// Entries that failed this pass but stay eligible.
    pub retried: usize,
}

/// Idempotent local event queue.
pub struct HybridQueue<S: SyncStore + ?Sized> {
    store: Arc<S>,
    transport: Arc<dyn DeliveryTransport>,
    max_attempts: u32,
    backoff: RetryConfig,
    delivery_timeout: Duration,
    write_lock: Mutex<()>,
    dispatch_lock: Mutex<()>,
}

impl<S: SyncStore + ?Sized> HybridQueue<S> {
    /// Create a new queue.
    pub fn new(store: Arc<S>, transport: Arc<dyn DeliveryTransport>) -> Self {
        Self {
            store,
            transport,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: RetryConfig::default(),
            delivery_timeout: DEFAULT_DELIVERY_TIMEOUT,
            write_lock: Mutex::new(()),
            dispatch_lock: Mutex::new(()),
        }
    }

    /// Set the retry budget.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Set the backoff between failed attempts.
    pub fn with_backoff(mut self, backoff: RetryConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the per-delivery timeout.
    pub fn with_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout = timeout;
        self
    }

    /// Capture a batch of events.
    ///
    /// An event whose key was seen before (in storage or earlier in the
    /// batch) is reported under `reused` and not created again. Events
    /// without a key are always created.
    ///
    /// # Errors
    /// - `Validation` for an empty batch or an empty event type, before
    ///   anything is persisted
    pub async fn enqueue_events(&self, events: Vec<QueueEvent>) -> Result<EnqueueOutcome> {
        if events.is_empty() {
            return Err(Error::Validation("No events to enqueue".to_string()));
        }
        if let Some(bad) = events.iter().position(|e| e.event_type.trim().is_empty()) {
            return Err(Error::Validation(format!(
                "Event at position {} has an empty event type",
                bad
            )));
        }

        let _guard = self.write_lock.lock().await;
        let mut outcome = EnqueueOutcome::default();
        let mut seen: HashMap<String, QueueEntry> = HashMap::new();

        for event in events {
            let key = event
                .idempotency_key
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty());

            if let Some(key) = &key {
                if let Some(existing) = seen.get(key) {
                    outcome.reused.push(existing.clone());
                    continue;
                }
                if let Some(existing) = self.store.find_queue_by_key(key).await? {
                    debug!("Reusing queue entry {} for key {}", existing.id, key);
                    seen.insert(key.clone(), existing.clone());
                    outcome.reused.push(existing);
                    continue;
                }
            }

            let entry = self
                .store
                .insert_queue(NewQueueEntry {
                    event_type: event.event_type.trim().to_string(),
                    payload: event.payload,
                    idempotency_key: key.clone(),
                    created_at: Utc::now(),
                })
                .await?;
            if let Some(key) = key {
                seen.insert(key, entry.clone());
            }
            outcome.queued.push(entry);
        }

        info!(
            "Enqueued {} events ({} reused)",
            outcome.queued.len(),
            outcome.reused.len()
        );
        Ok(outcome)
    }

    /// Attempt delivery of every eligible entry.
    ///
    /// # Errors
    /// - `CycleInProgress` if another pass is running
    /// - `Storage` if an entry or attempt could not be written
    pub async fn dispatch_queue(&self) -> Result<QueueDispatchSummary> {
        self.dispatch_queue_at(Utc::now()).await
    }

    /// Same as [`dispatch_queue`](Self::dispatch_queue) with an explicit
    /// clock for backoff decisions.
    pub async fn dispatch_queue_at(&self, now: DateTime<Utc>) -> Result<QueueDispatchSummary> {
        let _guard = self
            .dispatch_lock
            .try_lock()
            .map_err(|_| Error::CycleInProgress("queue".to_string()))?;

        let candidates = self
            .store
            .list_queue(&[QueueStatus::Queued, QueueStatus::Running])
            .await?;

        let mut summary = QueueDispatchSummary::default();
        for mut entry in candidates {
            if !self.backoff.is_due(entry.attempts, entry.updated_at, now) {
                debug!("Queue entry {} is backing off", entry.id);
                continue;
            }

            entry.mark_running(Utc::now());
            self.store.update_queue(&entry).await?;

            let envelope = Envelope::from_queue(&entry);
            let result =
                deliver_with_timeout(self.transport.as_ref(), &envelope, self.delivery_timeout)
                    .await;
            let attempted_at = Utc::now();
            summary.processed += 1;

            match result {
                Ok(()) => {
                    entry.record_success(attempted_at);
                    summary.sent += 1;
                    self.record_attempt(entry.id, attempted_at, None).await?;
                }
                Err(e) => {
                    let message = match &e {
                        Error::Transport(m) | Error::Timeout(m) => m.clone(),
                        other => other.to_string(),
                    };
                    let exhausted =
                        entry.record_failure(message.clone(), self.max_attempts, attempted_at);
                    if exhausted {
                        warn!(
                            "Queue entry {} ({}) failed permanently after {} attempts: {}",
                            entry.id, entry.event_type, entry.attempts, message
                        );
                        summary.failed += 1;
                    } else {
                        warn!(
                            "Queue entry {} ({}) failed, attempt {}: {}",
                            entry.id, entry.event_type, entry.attempts, message
                        );
                        summary.retried += 1;
                    }
                    self.record_attempt(entry.id, attempted_at, Some(message)).await?;
                }
            }
            self.store.update_queue(&entry).await?;
        }

        info!(
            "Queue dispatch: {} processed, {} sent, {} failed, {} retried",
            summary.processed, summary.sent, summary.failed, summary.retried
        );
        Ok(summary)
    }

    /// Queue entries with any of the given statuses (all when empty).
    pub async fn entries(&self, statuses: &[QueueStatus]) -> Result<Vec<QueueEntry>> {
        self.store.list_queue(statuses).await
    }

    /// Attempt history of one entry.
    pub async fn attempts(&self, queue_id: i64) -> Result<Vec<QueueAttempt>> {
        self.store.list_attempts_for(queue_id).await
    }

    async fn record_attempt(
        &self,
        queue_id: i64,
        attempted_at: DateTime<Utc>,
        error_message: Option<String>,
    ) -> Result<()> {
        self.store
            .insert_attempt(NewQueueAttempt {
                queue_id,
                attempted_at,
                success: error_message.is_none(),
                error_message,
            })
            .await?;
        Ok(())
    }
}
