//! Core sync engine that orchestrates all sync operations.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use storesync_common::{
    EntityType, Error, Operation, OutboxEntry, Payload, Priority, Result, StoreId, SyncSession,
};
use storesync_storage::{OutboxQuery, SyncStore};

use crate::config::SyncConfig;
use crate::conflict::ConflictInfo;
use crate::discrepancy::{
    BranchStock, Discrepancy, DiscrepancyFilter, DiscrepancyReconciler, InventorySource,
};
use crate::dispatch::{CycleReport, CycleTrigger, DispatchCycle};
use crate::outbox::{Outbox, OutboxStats, Page};
use crate::partner::{PartnerGateway, PartnerRegistry};
use crate::priority::PriorityResolver;
use crate::progress::{Forecast, ProgressReport, ProgressReporter};
use crate::queue::{EnqueueOutcome, HybridQueue, QueueDispatchSummary, QueueEvent};
use crate::retry::RetryManager;
use crate::scheduler::{SyncRequest, SyncScheduler, SyncSchedulerHandle, TickReport};
use crate::transport::{DeliveryTransport, LoopbackTransport};

/// Something an operator should look at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Alert {
    /// An entity whose latest entry is still flagged.
    Conflict(ConflictInfo),
    /// An inventory mismatch seen by the most recent cycle.
    Discrepancy(Discrepancy),
}

/// Builder for [`SyncEngine`].
pub struct SyncEngineBuilder<S: SyncStore + ?Sized> {
    store: Arc<S>,
    config: SyncConfig,
    transport: Arc<dyn DeliveryTransport>,
    inventory: Option<Arc<dyn InventorySource>>,
    partners: Option<Arc<PartnerRegistry>>,
}

impl<S: SyncStore + ?Sized + 'static> SyncEngineBuilder<S> {
    /// Use this configuration instead of the defaults.
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Deliver through this transport instead of the loopback one.
    pub fn transport(mut self, transport: Arc<dyn DeliveryTransport>) -> Self {
        self.transport = transport;
        self
    }

    /// Reconcile against this inventory source after every cycle.
    pub fn inventory(mut self, inventory: Arc<dyn InventorySource>) -> Self {
        self.inventory = Some(inventory);
        self
    }

    /// Share an existing partner registry.
    pub fn partners(mut self, partners: Arc<PartnerRegistry>) -> Self {
        self.partners = Some(partners);
        self
    }

    /// Build the engine.
    ///
    /// # Errors
    /// - `Validation` if the configuration is invalid
    pub fn build(self) -> Result<SyncEngine<S>> {
        self.config.validate()?;
        let config = self.config;

        let priorities = PriorityResolver::with_overrides(config.priority_overrides.clone());
        let reconciler = DiscrepancyReconciler::new(config.discrepancy_critical_threshold);

        let mut dispatch = DispatchCycle::new(self.store.clone(), self.transport.clone())
            .with_reconciler(reconciler)
            .with_delivery_timeout(config.delivery_timeout())
            .with_concurrency(config.delivery_concurrency);
        if let Some(inventory) = &self.inventory {
            dispatch = dispatch.with_inventory(inventory.clone());
        }

        let queue = HybridQueue::new(self.store.clone(), self.transport.clone())
            .with_max_attempts(config.queue_max_attempts)
            .with_backoff(config.queue_retry())
            .with_delivery_timeout(config.delivery_timeout());

        info!(
            "Sync engine ready (store: {}, transport: {})",
            self.store.name(),
            self.transport.name()
        );

        Ok(SyncEngine {
            outbox: Arc::new(Outbox::new(self.store.clone(), priorities)),
            retry: RetryManager::new(self.store.clone()),
            dispatch,
            queue,
            progress: ProgressReporter::new(self.store.clone()),
            reconciler,
            inventory: self.inventory,
            partners: self.partners.unwrap_or_default(),
            scheduler: None,
            tick_lock: Mutex::new(()),
            last_discrepancies: RwLock::new(Vec::new()),
            store: self.store,
            config,
        })
    }
}

/// Main sync engine for a branch.
pub struct SyncEngine<S: SyncStore + ?Sized> {
    store: Arc<S>,
    config: SyncConfig,
    outbox: Arc<Outbox<S>>,
    retry: RetryManager<S>,
    dispatch: DispatchCycle<S>,
    queue: HybridQueue<S>,
    progress: ProgressReporter<S>,
    reconciler: DiscrepancyReconciler,
    inventory: Option<Arc<dyn InventorySource>>,
    partners: Arc<PartnerRegistry>,
    scheduler: Option<SyncScheduler>,
    /// Held for the duration of a tick.
    tick_lock: Mutex<()>,
    last_discrepancies: RwLock<Vec<Discrepancy>>,
}

impl<S: SyncStore + ?Sized + 'static> SyncEngine<S> {
    /// Start building an engine over a store.
    pub fn builder(store: Arc<S>) -> SyncEngineBuilder<S> {
        SyncEngineBuilder {
            store,
            config: SyncConfig::default(),
            transport: Arc::new(LoopbackTransport::new()),
            inventory: None,
            partners: None,
        }
    }

    /// Initialize the scheduler and return a handle for running it.
    pub fn init_scheduler(&mut self) -> SyncSchedulerHandle {
        let (scheduler, handle) = SyncScheduler::new(self.config.scheduler_mode());
        self.scheduler = Some(scheduler);
        handle
    }

    /// Get the scheduler for requesting syncs.
    pub fn scheduler(&self) -> Option<&SyncScheduler> {
        self.scheduler.as_ref()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<S> {
        self.store.clone()
    }

    pub fn outbox(&self) -> Arc<Outbox<S>> {
        self.outbox.clone()
    }

    pub fn partners(&self) -> Arc<PartnerRegistry> {
        self.partners.clone()
    }

    /// Gateway for partner requests against this engine's outbox.
    pub fn partner_gateway(&self) -> PartnerGateway<S> {
        PartnerGateway::new(self.outbox.clone(), self.partners.clone())
    }

    // -- ingestion --------------------------------------------------------

    /// Capture a mutation in the outbox.
    pub async fn enqueue(
        &self,
        entity_type: EntityType,
        entity_id: impl Into<String>,
        operation: Operation,
        payload: Payload,
        priority: Option<Priority>,
    ) -> Result<OutboxEntry> {
        self.outbox
            .enqueue(entity_type, entity_id, operation, payload, priority)
            .await
    }

    /// Capture events in the hybrid queue.
    pub async fn enqueue_events(&self, events: Vec<QueueEvent>) -> Result<EnqueueOutcome> {
        self.queue.enqueue_events(events).await
    }

    // -- reporting --------------------------------------------------------

    pub async fn get_entry(&self, id: i64) -> Result<OutboxEntry> {
        self.outbox.get(id).await
    }

    pub async fn list_entries(&self, query: &OutboxQuery) -> Result<Page<OutboxEntry>> {
        self.outbox.list(query).await
    }

    pub async fn stats(&self) -> Result<Vec<OutboxStats>> {
        self.outbox.stats().await
    }

    pub async fn conflicts(&self) -> Result<Vec<ConflictInfo>> {
        self.outbox.conflicts().await
    }

    /// Most recent sync sessions, newest first.
    pub async fn recent_sessions(&self, limit: usize) -> Result<Vec<SyncSession>> {
        self.store.list_sessions(limit).await
    }

    pub async fn progress(&self) -> Result<ProgressReport> {
        self.progress.progress().await
    }

    /// Forecast over the configured window.
    pub async fn forecast(&self) -> Result<Forecast> {
        self.progress.forecast(self.config.forecast_window()).await
    }

    /// Discrepancy report from the configured inventory source.
    ///
    /// Without an inventory source there is nothing to compare.
    pub async fn discrepancies(&self, filter: &DiscrepancyFilter) -> Result<Vec<Discrepancy>> {
        match &self.inventory {
            Some(inventory) => self.reconciler.reconcile(inventory.as_ref(), filter).await,
            None => Ok(Vec::new()),
        }
    }

    /// Discrepancy report over caller-provided aggregates.
    pub fn report_discrepancies(
        &self,
        rows: &[BranchStock],
        filter: &DiscrepancyFilter,
    ) -> Vec<Discrepancy> {
        self.reconciler.report(rows, filter)
    }

    /// Unresolved conflicts plus the discrepancies of the last cycle.
    pub async fn alerts(&self) -> Result<Vec<Alert>> {
        let mut alerts: Vec<Alert> = self
            .outbox
            .conflicts()
            .await?
            .into_iter()
            .map(Alert::Conflict)
            .collect();
        let discrepancies = self.last_discrepancies.read().await;
        alerts.extend(discrepancies.iter().cloned().map(Alert::Discrepancy));
        Ok(alerts)
    }

    // -- administration ---------------------------------------------------

    pub async fn resolve(&self, entry_ids: &[i64], resolved_by: &str) -> Result<Vec<OutboxEntry>> {
        self.outbox.resolve(entry_ids, resolved_by).await
    }

    pub async fn resolve_latest(
        &self,
        entity_type: &EntityType,
        entity_id: &str,
        resolved_by: &str,
    ) -> Result<Option<OutboxEntry>> {
        self.outbox
            .resolve_latest(entity_type, entity_id, resolved_by)
            .await
    }

    pub async fn replay(&self, entry_ids: &[i64]) -> Result<Vec<OutboxEntry>> {
        self.outbox.replay(entry_ids).await
    }

    pub async fn set_priority(&self, id: i64, priority: Priority) -> Result<OutboxEntry> {
        self.outbox.set_priority(id, priority).await
    }

    // -- dispatch ---------------------------------------------------------

    /// Requeue FAILED entries older than the configured retry interval.
    pub async fn requeue_failed(&self) -> Result<Vec<OutboxEntry>> {
        self.retry.requeue_failed(self.config.retry_interval()).await
    }

    /// Run one dispatch cycle.
    pub async fn run_cycle(
        &self,
        scope: Option<StoreId>,
        trigger: CycleTrigger,
    ) -> Result<CycleReport> {
        let report = self.dispatch.run_cycle(scope, trigger).await?;
        let mut last = self.last_discrepancies.write().await;
        *last = report.discrepancies.clone();
        Ok(report)
    }

    /// Attempt delivery of eligible hybrid queue entries.
    pub async fn dispatch_queue(&self) -> Result<QueueDispatchSummary> {
        self.queue.dispatch_queue().await
    }

    /// One scheduler tick: requeue, dispatch the outbox, drain the queue.
    ///
    /// # Errors
    /// - `CycleInProgress` if a tick is already running
    pub async fn tick(&self, scope: Option<StoreId>, trigger: CycleTrigger) -> Result<TickReport> {
        let _guard = self
            .tick_lock
            .try_lock()
            .map_err(|_| Error::CycleInProgress("tick".to_string()))?;
        let start = Instant::now();

        let requeued = self.requeue_failed().await?.len();
        let cycle = self.run_cycle(scope, trigger).await?;
        let queue = self.dispatch_queue().await?;

        let duration = start.elapsed();
        debug!("Tick completed in {:?}", duration);
        Ok(TickReport {
            requeued,
            cycle,
            queue,
            duration,
        })
    }

    /// Process a sync request (for scheduler).
    pub async fn process_request(&self, request: SyncRequest) -> Result<TickReport> {
        match request {
            SyncRequest::Tick { scope, trigger } => self.tick(scope, trigger).await,
            SyncRequest::Shutdown => Err(Error::Scheduler(
                "Shutdown is handled by the scheduler".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discrepancy::StaticInventory;
    use crate::scheduler::SyncMode;
    use crate::transport::{Outcome, RecordingTransport};
    use chrono::Utc;
    use serde_json::json;
    use std::time::Duration;
    use storesync_common::{OutboxStatus, SessionMode};
    use storesync_storage::MemoryStore;

    fn tag(s: &str) -> EntityType {
        EntityType::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let result = SyncEngine::builder(Arc::new(MemoryStore::new()))
            .config(SyncConfig {
                queue_max_attempts: 0,
                ..SyncConfig::default()
            })
            .build();
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_priority_overrides_apply() {
        let mut config = SyncConfig::default();
        config.priority_overrides.insert("device".to_string(), Priority::Low);
        let engine = SyncEngine::builder(Arc::new(MemoryStore::new()))
            .config(config)
            .build()
            .unwrap();

        let entry = engine
            .enqueue(tag("device"), "D1", Operation::Create, json!({}), None)
            .await
            .unwrap();
        assert_eq!(entry.priority, Priority::Low);
    }

    #[tokio::test]
    async fn test_tick_runs_all_stages() {
        let store = Arc::new(MemoryStore::new());
        let engine = SyncEngine::builder(store.clone()).build().unwrap();

        let stale = engine
            .enqueue(tag("sale"), "S1", Operation::Create, json!({}), None)
            .await
            .unwrap();
        let mut failed = stale.clone();
        failed.mark_failed("hq down", Utc::now() - chrono::Duration::hours(2));
        store.update_outbox_batch(&[failed]).await.unwrap();

        engine
            .enqueue(tag("product"), "P1", Operation::Update, json!({"price": 3}), None)
            .await
            .unwrap();
        engine
            .enqueue_events(vec![QueueEvent::new("payment", json!({})).with_key("pay-1")])
            .await
            .unwrap();

        let report = engine.tick(None, CycleTrigger::automatic()).await.unwrap();
        assert_eq!(report.requeued, 1);
        assert_eq!(report.cycle.sent, 2);
        assert_eq!(report.queue.sent, 1);
        assert_eq!(report.cycle.session.mode, SessionMode::Automatic);

        let progress = engine.progress().await.unwrap();
        assert_eq!(progress.percent, 100.0);
        assert_eq!(engine.recent_sessions(5).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_overlapping_tick_skipped() {
        let transport = RecordingTransport::new()
            .with_outcome("sale", Outcome::Stall(Duration::from_millis(300)));
        let engine = Arc::new(
            SyncEngine::builder(Arc::new(MemoryStore::new()))
                .transport(Arc::new(transport))
                .build()
                .unwrap(),
        );
        engine
            .enqueue(tag("sale"), "S1", Operation::Create, json!({}), None)
            .await
            .unwrap();

        let first = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.tick(None, CycleTrigger::automatic()).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = engine.tick(Some(StoreId(1)), CycleTrigger::manual("ops")).await;
        assert!(matches!(second, Err(Error::CycleInProgress(_))));
        assert!(first.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_alerts_cover_conflicts_and_discrepancies() {
        let now = Utc::now();
        let inventory = StaticInventory::new(vec![
            BranchStock {
                store_id: StoreId(1),
                product_id: "SKU-1".to_string(),
                quantity: 8,
                updated_at: now,
            },
            BranchStock {
                store_id: StoreId(2),
                product_id: "SKU-1".to_string(),
                quantity: 2,
                updated_at: now,
            },
        ]);
        let engine = SyncEngine::builder(Arc::new(MemoryStore::new()))
            .inventory(Arc::new(inventory))
            .build()
            .unwrap();

        engine
            .enqueue(tag("device"), "D1", Operation::Create, json!({"qty": 1}), None)
            .await
            .unwrap();
        engine
            .enqueue(tag("device"), "D1", Operation::Update, json!({"qty": 2}), None)
            .await
            .unwrap();
        engine.run_cycle(None, CycleTrigger::manual("ops")).await.unwrap();

        let alerts = engine.alerts().await.unwrap();
        assert_eq!(alerts.len(), 2);
        assert!(matches!(alerts[0], Alert::Conflict(ref c) if c.entity_id == "D1"));
        assert!(matches!(alerts[1], Alert::Discrepancy(ref d) if d.product_id == "SKU-1"));

        let resolved = engine.resolve_latest(&tag("device"), "D1", "ops").await.unwrap();
        assert!(resolved.is_some());
        assert_eq!(engine.alerts().await.unwrap().len(), 1);
        assert_eq!(
            engine
                .discrepancies(&DiscrepancyFilter::default())
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_scheduler_round_trip() {
        let mut engine = SyncEngine::builder(Arc::new(MemoryStore::new()))
            .build()
            .unwrap();
        let handle = engine.init_scheduler();
        let engine = Arc::new(engine);

        let runner = engine.clone();
        let task = tokio::spawn(handle.run(move |request| {
            let engine = runner.clone();
            async move { engine.process_request(request).await }
        }));

        let entry = engine
            .enqueue(tag("sale"), "S1", Operation::Create, json!({"store_id": 7}), None)
            .await
            .unwrap();

        let scheduler = engine.scheduler().unwrap();
        assert_eq!(scheduler.get_mode().await, SyncMode::Manual);
        let report = scheduler.request_sync(Some(StoreId(7)), "ops").await.unwrap();
        assert_eq!(report.cycle.sent, 1);
        assert_eq!(
            engine.get_entry(entry.id).await.unwrap().status,
            OutboxStatus::Sent
        );

        scheduler.shutdown().await;
        task.await.unwrap();
    }
}
