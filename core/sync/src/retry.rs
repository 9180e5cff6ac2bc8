//! Retry strategy with exponential backoff, and requeueing of failed
//! outbox entries.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use storesync_common::{Error, OutboxEntry, OutboxStatus, Result};
use storesync_storage::{OutboxQuery, SyncStore};

/// Backoff schedule between failed attempts.
///
/// The attempt budget belongs to the caller (see
/// `HybridQueue::with_max_attempts`).
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay (cap for exponential growth).
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub jitter: bool,
}

impl RetryConfig {
    /// Create a new retry configuration.
    pub fn new() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    /// Set initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Calculate delay for a given attempt number.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay = self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.powi(attempt as i32);

        let capped_delay = base_delay.min(self.max_delay.as_millis() as f64);

        let final_delay = if self.jitter {
            // Add random jitter of +/- 25%
            let jitter_factor = 0.75 + (rand::random::<f64>() * 0.5);
            capped_delay * jitter_factor
        } else {
            capped_delay
        };

        Duration::from_millis(final_delay as u64)
    }

    /// Whether an item that has failed `attempts` times, last touched at
    /// `last_touched`, may be tried again at `now`.
    pub fn is_due(&self, attempts: u32, last_touched: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        if attempts == 0 {
            return true;
        }
        let delay = self.delay_for_attempt(attempts - 1);
        match chrono::Duration::from_std(delay) {
            Ok(delay) => now.signed_duration_since(last_touched) >= delay,
            Err(_) => false,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Promotes stale FAILED outbox entries back to PENDING.
///
/// Meant to run right before every dispatch cycle. Conflict flags and
/// versions are never touched here.
pub struct RetryManager<S: SyncStore + ?Sized> {
    store: Arc<S>,
}

impl<S: SyncStore + ?Sized> RetryManager<S> {
    /// Create a new retry manager.
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Requeue failed entries whose last attempt is at least
    /// `retry_interval` old.
    pub async fn requeue_failed(&self, retry_interval: Duration) -> Result<Vec<OutboxEntry>> {
        self.requeue_failed_at(Utc::now(), retry_interval).await
    }

    /// Same as [`requeue_failed`](Self::requeue_failed) with an explicit clock.
    pub async fn requeue_failed_at(
        &self,
        now: DateTime<Utc>,
        retry_interval: Duration,
    ) -> Result<Vec<OutboxEntry>> {
        let interval = chrono::Duration::from_std(retry_interval)
            .map_err(|_| Error::Validation("Retry interval out of range".to_string()))?;

        let failed = self
            .store
            .list_outbox(&OutboxQuery::with_status(OutboxStatus::Failed))
            .await?;

        let mut requeued = Vec::new();
        for mut entry in failed {
            let last_attempt = entry.last_attempt_at.unwrap_or(entry.updated_at);
            if now.signed_duration_since(last_attempt) < interval {
                continue;
            }
            debug!(
                "Requeueing outbox entry {} ({} {})",
                entry.id, entry.entity_type, entry.entity_id
            );
            entry.requeue(now);
            requeued.push(entry);
        }

        if !requeued.is_empty() {
            self.store.record_delivery_batch(&requeued).await?;
            info!("Requeued {} failed outbox entries", requeued.len());
        }

        Ok(requeued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use storesync_common::{EntityType, NewOutboxEntry, Operation, Priority};
    use storesync_storage::MemoryStore;

    #[test]
    fn test_retry_config_delay_calculation() {
        let config = RetryConfig::new()
            .with_initial_delay(Duration::from_secs(1))
            .with_backoff_multiplier(2.0)
            .with_jitter(false);

        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(4));
    }

    #[test]
    fn test_max_delay_cap() {
        let config = RetryConfig::new()
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(10))
            .with_backoff_multiplier(10.0)
            .with_jitter(false);

        // 1 * 10^5 = 100000 seconds, but should be capped at 10
        let delay = config.delay_for_attempt(5);
        assert_eq!(delay, Duration::from_secs(10));
    }

    #[test]
    fn test_is_due_respects_backoff() {
        let config = RetryConfig::new()
            .with_initial_delay(Duration::from_secs(60))
            .with_jitter(false);
        let now = Utc::now();

        assert!(config.is_due(0, now, now));
        assert!(!config.is_due(1, now - chrono::Duration::seconds(30), now));
        assert!(config.is_due(1, now - chrono::Duration::seconds(60), now));
        assert!(!config.is_due(2, now - chrono::Duration::seconds(90), now));
    }

    async fn failed_entry(store: &MemoryStore, at: DateTime<Utc>) -> OutboxEntry {
        let mut entry = store
            .insert_outbox(NewOutboxEntry {
                entity_type: EntityType::new("sale").unwrap(),
                entity_id: format!("S-{}", at.timestamp_millis()),
                operation: Operation::Create,
                payload: json!({"total": 12}),
                priority: Priority::High,
                conflict_flag: true,
                version: 2,
                created_at: at,
            })
            .await
            .unwrap();
        entry.mark_failed("connection reset", at);
        store.update_outbox_batch(&[entry.clone()]).await.unwrap();
        entry
    }

    #[tokio::test]
    async fn test_requeue_only_stale_failures() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        let stale = failed_entry(&store, now - chrono::Duration::hours(2)).await;
        let recent = failed_entry(&store, now - chrono::Duration::minutes(10)).await;

        let manager = RetryManager::new(store.clone());
        let requeued = manager
            .requeue_failed_at(now, Duration::from_secs(3600))
            .await
            .unwrap();

        assert_eq!(requeued.len(), 1);
        let stale = store.get_outbox(stale.id).await.unwrap().unwrap();
        assert_eq!(stale.status, OutboxStatus::Pending);
        assert_eq!(stale.attempt_count, 0);
        assert!(stale.error_message.is_none());
        assert!(stale.conflict_flag);
        assert_eq!(stale.version, 2);

        let recent = store.get_outbox(recent.id).await.unwrap().unwrap();
        assert_eq!(recent.status, OutboxStatus::Failed);
        assert_eq!(recent.attempt_count, 1);
    }

    #[tokio::test]
    async fn test_requeue_ignores_other_statuses() {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_outbox(NewOutboxEntry {
                entity_type: EntityType::new("sale").unwrap(),
                entity_id: "S1".to_string(),
                operation: Operation::Create,
                payload: json!({}),
                priority: Priority::High,
                conflict_flag: false,
                version: 1,
                created_at: Utc::now() - chrono::Duration::days(1),
            })
            .await
            .unwrap();

        let manager = RetryManager::new(store);
        let requeued = manager.requeue_failed(Duration::from_secs(60)).await.unwrap();
        assert!(requeued.is_empty());
    }
}
