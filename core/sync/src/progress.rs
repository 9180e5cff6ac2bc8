//! Sync progress and throughput forecast across the outbox and the hybrid
//! queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use storesync_common::{Error, OutboxStatus, QueueStatus, Result};
use storesync_storage::{OutboxQuery, SyncStore};

/// Entity type to system module.
const MODULE_TABLE: &[(&str, &str)] = &[
    ("sale", "sales"),
    ("payment", "sales"),
    ("cash_session", "sales"),
    ("inventory", "inventory"),
    ("stock_adjustment", "inventory"),
    ("device", "inventory"),
    ("transfer", "transfers"),
    ("product", "catalog"),
    ("category", "catalog"),
    ("price_list", "catalog"),
    ("customer", "customers"),
    ("loyalty", "customers"),
    ("purchase_order", "purchasing"),
    ("supplier", "purchasing"),
    ("store", "administration"),
    ("user", "administration"),
    ("backup", "administration"),
    ("draft", "administration"),
];

/// Module for entity types that are not in the table.
pub const OTHER_MODULE: &str = "other";

/// System module an entity or event type belongs to.
pub fn resolve_module(entity_type: &str) -> &'static str {
    let tag = entity_type.trim().to_ascii_lowercase();
    MODULE_TABLE
        .iter()
        .find(|(known, _)| *known == tag)
        .map(|(_, module)| *module)
        .unwrap_or(OTHER_MODULE)
}

/// `100 * processed / max(total, 1)`.
pub fn percent(processed: usize, total: usize) -> f64 {
    100.0 * processed as f64 / total.max(1) as f64
}

/// Counters for one module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleProgress {
    pub module: String,
    pub total: usize,
    pub pending: usize,
    pub failed: usize,
    pub processed: usize,
    pub percent: f64,
}

/// Overall progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressReport {
    pub total: usize,
    pub pending: usize,
    pub failed: usize,
    pub processed: usize,
    pub percent: f64,
    pub modules: Vec<ModuleProgress>,
}

/// Throughput estimate over a lookback window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Forecast {
    pub window_minutes: f64,
    pub completed: usize,
    pub total_attempts: usize,
    pub successful_attempts: usize,
    pub events_per_minute: f64,
    /// `None` when nothing was attempted in the window.
    pub success_rate: Option<f64>,
    pub backlog: usize,
    /// `None` when throughput is zero.
    pub estimated_minutes_remaining: Option<f64>,
    pub estimated_completion: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Tally {
    total: usize,
    pending: usize,
    failed: usize,
}

impl Tally {
    fn add(&mut self, pending: bool, failed: bool) {
        self.total += 1;
        if pending {
            self.pending += 1;
        }
        if failed {
            self.failed += 1;
        }
    }

    fn processed(&self) -> usize {
        self.total.saturating_sub(self.pending + self.failed)
    }
}

/// Computes progress and forecasts from storage.
pub struct ProgressReporter<S: SyncStore + ?Sized> {
    store: Arc<S>,
}

impl<S: SyncStore + ?Sized> ProgressReporter<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Progress across both stores, with a per-module breakdown.
    pub async fn progress(&self) -> Result<ProgressReport> {
        let outbox = self.store.list_outbox(&OutboxQuery::default()).await?;
        let queue = self.store.list_queue(&[]).await?;

        let mut overall = Tally::default();
        let mut modules: BTreeMap<&'static str, Tally> = BTreeMap::new();

        for entry in &outbox {
            let pending = entry.status == OutboxStatus::Pending;
            let failed = entry.status == OutboxStatus::Failed;
            overall.add(pending, failed);
            modules
                .entry(resolve_module(entry.entity_type.as_str()))
                .or_default()
                .add(pending, failed);
        }
        for entry in &queue {
            let pending = entry.status.is_dispatchable();
            let failed = entry.status == QueueStatus::Failed;
            overall.add(pending, failed);
            modules
                .entry(resolve_module(&entry.event_type))
                .or_default()
                .add(pending, failed);
        }

        Ok(ProgressReport {
            total: overall.total,
            pending: overall.pending,
            failed: overall.failed,
            processed: overall.processed(),
            percent: percent(overall.processed(), overall.total),
            modules: modules
                .into_iter()
                .map(|(module, tally)| ModuleProgress {
                    module: module.to_string(),
                    total: tally.total,
                    pending: tally.pending,
                    failed: tally.failed,
                    processed: tally.processed(),
                    percent: percent(tally.processed(), tally.total),
                })
                .collect(),
        })
    }

    /// Forecast over the window ending now.
    pub async fn forecast(&self, window: Duration) -> Result<Forecast> {
        self.forecast_at(Utc::now(), window).await
    }

    /// Forecast over the window ending at `now`.
    ///
    /// # Errors
    /// - `Validation` if the window is zero or out of range
    pub async fn forecast_at(&self, now: DateTime<Utc>, window: Duration) -> Result<Forecast> {
        if window.is_zero() {
            return Err(Error::Validation("Forecast window must be positive".to_string()));
        }
        let span = chrono::Duration::from_std(window)
            .map_err(|_| Error::Validation("Forecast window out of range".to_string()))?;
        let since = now - span;
        let window_minutes = window.as_secs_f64() / 60.0;

        let outbox = self.store.list_outbox(&OutboxQuery::default()).await?;
        let queue = self.store.list_queue(&[]).await?;
        let attempts = self.store.list_attempts_since(since).await?;

        let mut total_attempts = 0;
        let mut successful_attempts = 0;
        for entry in &outbox {
            if entry.last_attempt_at.is_some_and(|at| at >= since && at <= now) {
                total_attempts += 1;
                if entry.status == OutboxStatus::Sent {
                    successful_attempts += 1;
                }
            }
        }
        for attempt in attempts.iter().filter(|a| a.attempted_at <= now) {
            total_attempts += 1;
            if attempt.success {
                successful_attempts += 1;
            }
        }

        let backlog = outbox
            .iter()
            .filter(|e| e.status != OutboxStatus::Sent)
            .count()
            + queue.iter().filter(|e| e.status.is_dispatchable()).count();

        let completed = successful_attempts;
        let events_per_minute = completed as f64 / window_minutes;
        let success_rate = if total_attempts == 0 {
            None
        } else {
            Some(successful_attempts as f64 / total_attempts as f64)
        };

        let estimated_minutes_remaining = if events_per_minute > 0.0 {
            Some(backlog as f64 / events_per_minute)
        } else {
            None
        };
        let estimated_completion = estimated_minutes_remaining
            .and_then(|minutes| chrono::Duration::try_milliseconds((minutes * 60_000.0) as i64))
            .and_then(|remaining| now.checked_add_signed(remaining));

        Ok(Forecast {
            window_minutes,
            completed,
            total_attempts,
            successful_attempts,
            events_per_minute,
            success_rate,
            backlog,
            estimated_minutes_remaining,
            estimated_completion,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use storesync_common::{EntityType, NewOutboxEntry, NewQueueAttempt, NewQueueEntry, Operation, Priority};
    use storesync_storage::MemoryStore;

    async fn seed_outbox(store: &MemoryStore, entity_type: &str) -> storesync_common::OutboxEntry {
        store
            .insert_outbox(NewOutboxEntry {
                entity_type: EntityType::new(entity_type).unwrap(),
                entity_id: "X".to_string(),
                operation: Operation::Create,
                payload: json!({}),
                priority: Priority::Normal,
                conflict_flag: false,
                version: 1,
                created_at: Utc::now(),
            })
            .await
            .unwrap()
    }

    #[test]
    fn test_module_table() {
        assert_eq!(resolve_module("sale"), "sales");
        assert_eq!(resolve_module("Device"), "inventory");
        assert_eq!(resolve_module("transfer"), "transfers");
        assert_eq!(resolve_module("loyalty"), "customers");
        assert_eq!(resolve_module("gift_card"), OTHER_MODULE);
    }

    #[test]
    fn test_percent_of_empty_is_zero() {
        assert_eq!(percent(0, 0), 0.0);
        assert_eq!(percent(1, 4), 25.0);
    }

    #[tokio::test]
    async fn test_progress_joins_both_stores() {
        let store = Arc::new(MemoryStore::new());
        let mut sent = seed_outbox(&store, "sale").await;
        let mut failed = seed_outbox(&store, "product").await;
        seed_outbox(&store, "sale").await;
        sent.mark_sent(Utc::now());
        failed.mark_failed("boom", Utc::now());
        store.update_outbox_batch(&[sent, failed]).await.unwrap();

        let mut q = store
            .insert_queue(NewQueueEntry {
                event_type: "payment".to_string(),
                payload: json!({}),
                idempotency_key: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        q.record_success(Utc::now());
        store.update_queue(&q).await.unwrap();

        let report = ProgressReporter::new(store).progress().await.unwrap();
        assert_eq!(report.total, 4);
        assert_eq!(report.pending, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.processed, 2);
        assert_eq!(report.percent, 50.0);

        let sales = report.modules.iter().find(|m| m.module == "sales").unwrap();
        assert_eq!((sales.total, sales.processed, sales.pending), (3, 2, 1));
        let catalog = report.modules.iter().find(|m| m.module == "catalog").unwrap();
        assert_eq!(catalog.failed, 1);
    }

    #[tokio::test]
    async fn test_forecast_without_throughput_is_unknown() {
        let store = Arc::new(MemoryStore::new());
        seed_outbox(&store, "sale").await;

        let forecast = ProgressReporter::new(store)
            .forecast(Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(forecast.backlog, 1);
        assert_eq!(forecast.events_per_minute, 0.0);
        assert!(forecast.success_rate.is_none());
        assert!(forecast.estimated_minutes_remaining.is_none());
        assert!(forecast.estimated_completion.is_none());
    }

    #[tokio::test]
    async fn test_forecast_estimates_completion() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        for _ in 0..2 {
            let mut e = seed_outbox(&store, "sale").await;
            e.mark_sent(now - chrono::Duration::minutes(5));
            store.update_outbox_batch(&[e]).await.unwrap();
        }
        for _ in 0..4 {
            seed_outbox(&store, "sale").await;
        }
        let q = store
            .insert_queue(NewQueueEntry {
                event_type: "sale".to_string(),
                payload: json!({}),
                idempotency_key: None,
                created_at: now,
            })
            .await
            .unwrap();
        store
            .insert_attempt(NewQueueAttempt {
                queue_id: q.id,
                attempted_at: now - chrono::Duration::minutes(1),
                success: false,
                error_message: Some("refused".to_string()),
            })
            .await
            .unwrap();

        // 2 completions in 10 minutes, 5 items left (4 outbox + 1 queue).
        let forecast = ProgressReporter::new(store)
            .forecast_at(now, Duration::from_secs(600))
            .await
            .unwrap();
        assert_eq!(forecast.completed, 2);
        assert_eq!(forecast.total_attempts, 3);
        assert_eq!(forecast.backlog, 5);
        assert!((forecast.events_per_minute - 0.2).abs() < 1e-9);
        assert!((forecast.success_rate.unwrap() - 2.0 / 3.0).abs() < 1e-9);
        assert!((forecast.estimated_minutes_remaining.unwrap() - 25.0).abs() < 1e-9);
        let eta = forecast.estimated_completion.unwrap() - now;
        assert!((eta - chrono::Duration::minutes(25)).num_milliseconds().abs() <= 1);
    }

    #[tokio::test]
    async fn test_zero_window_rejected() {
        let store = Arc::new(MemoryStore::new());
        let result = ProgressReporter::new(store).forecast(Duration::ZERO).await;
        assert!(matches!(result, Err(Error::Validation(_))));
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn percent_stays_in_bounds(total in 0usize..100_000, done in 0usize..100_000) {
            let processed = done.min(total);
            let p = percent(processed, total);
            prop_assert!((0.0..=100.0).contains(&p));
        }

        #[test]
        fn every_tag_has_a_module(tag in "[a-z_]{1,20}") {
            prop_assert!(!resolve_module(&tag).is_empty());
        }
    }
}
