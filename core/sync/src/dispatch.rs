//! Dispatch cycle: deliver pending outbox entries for a store scope.

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use storesync_common::{
    Error, NewSyncSession, OutboxEntry, OutboxStatus, Result, SessionMode, SessionStatus, StoreId,
    SyncSession,
};
use storesync_storage::{OutboxQuery, SyncStore};

use crate::discrepancy::{Discrepancy, DiscrepancyFilter, DiscrepancyReconciler, InventorySource};
use crate::transport::{deliver_with_timeout, DeliveryTransport, Envelope};

/// Default bound on a single delivery.
pub const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of deliveries in flight at once.
pub const DEFAULT_CONCURRENCY: usize = 8;

/// Who or what started a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleTrigger {
    pub mode: SessionMode,
    pub triggered_by: Option<String>,
}

impl CycleTrigger {
    /// Cycle started by an operator.
    pub fn manual(triggered_by: impl Into<String>) -> Self {
        Self {
            mode: SessionMode::Manual,
            triggered_by: Some(triggered_by.into()),
        }
    }

    /// Cycle started by the scheduler, tagged with a fresh correlation id.
    pub fn automatic() -> Self {
        Self {
            mode: SessionMode::Automatic,
            triggered_by: Some(format!("scheduler/{}", Uuid::new_v4())),
        }
    }
}

/// Outcome of one dispatch cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    pub processed: usize,
    pub sent: usize,
    pub failed: usize,
    pub discrepancies: Vec<Discrepancy>,
    pub session: SyncSession,
}

/// Text stored in `error_message` for a failed delivery.
fn delivery_error_message(err: &Error) -> String {
    match err {
        Error::Transport(message) | Error::Timeout(message) => message.clone(),
        other => other.to_string(),
    }
}

fn scope_label(scope: Option<StoreId>) -> String {
    match scope {
        Some(store) => store.to_string(),
        None => "global".to_string(),
    }
}

/// Marks a scope busy for as long as it lives.
struct ScopeGuard<'a> {
    in_flight: &'a Mutex<HashSet<Option<StoreId>>>,
    scope: Option<StoreId>,
}

impl<'a> ScopeGuard<'a> {
    fn acquire(in_flight: &'a Mutex<HashSet<Option<StoreId>>>, scope: Option<StoreId>) -> Result<Self> {
        let mut busy = in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !busy.insert(scope) {
            return Err(Error::CycleInProgress(scope_label(scope)));
        }
        Ok(Self { in_flight, scope })
    }
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        let mut busy = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        busy.remove(&self.scope);
    }
}

/// Delivers pending outbox entries and records a session per run.
pub struct DispatchCycle<S: SyncStore + ?Sized> {
    store: Arc<S>,
    transport: Arc<dyn DeliveryTransport>,
    reconciler: DiscrepancyReconciler,
    inventory: Option<Arc<dyn InventorySource>>,
    delivery_timeout: Duration,
    concurrency: usize,
    in_flight: Mutex<HashSet<Option<StoreId>>>,
}

impl<S: SyncStore + ?Sized> DispatchCycle<S> {
    /// Create a new dispatch cycle.
    pub fn new(store: Arc<S>, transport: Arc<dyn DeliveryTransport>) -> Self {
        Self {
            store,
            transport,
            reconciler: DiscrepancyReconciler::default(),
            inventory: None,
            delivery_timeout: DEFAULT_DELIVERY_TIMEOUT,
            concurrency: DEFAULT_CONCURRENCY,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Set the reconciler used after each batch.
    pub fn with_reconciler(mut self, reconciler: DiscrepancyReconciler) -> Self {
        self.reconciler = reconciler;
        self
    }

    /// Set the inventory source checked after each batch.
    pub fn with_inventory(mut self, inventory: Arc<dyn InventorySource>) -> Self {
        self.inventory = Some(inventory);
        self
    }

    /// Set the per-delivery timeout.
    pub fn with_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout = timeout;
        self
    }

    /// Set how many deliveries may run at once.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Run one cycle for `scope`, or for everything when `scope` is `None`.
    ///
    /// # Postconditions
    /// - Entries outside the scope are not touched
    /// - Every selected entry is SENT or FAILED, committed in one batch
    /// - A session row describes the run
    ///
    /// # Errors
    /// - `CycleInProgress` if a cycle for the same scope is running
    /// - `Storage` if the batch could not be committed (nothing committed,
    ///   a FAILURE session is recorded when possible)
    pub async fn run_cycle(
        &self,
        scope: Option<StoreId>,
        trigger: CycleTrigger,
    ) -> Result<CycleReport> {
        let _guard = ScopeGuard::acquire(&self.in_flight, scope)?;
        let started_at = Utc::now();

        let mut selected = match self.select(scope).await {
            Ok(selected) => selected,
            Err(e) => return Err(self.abort(scope, &trigger, started_at, 0, e).await),
        };
        debug!(
            "Dispatch cycle for scope {} selected {} entries",
            scope_label(scope),
            selected.len()
        );

        let outcomes = self.deliver_all(&selected).await;
        let now = Utc::now();
        let mut sent = 0;
        let mut failed = 0;
        for entry in &mut selected {
            match outcomes.get(&entry.id) {
                Some(Err(e)) => {
                    warn!(
                        "Delivery of outbox entry {} ({} {}) failed: {}",
                        entry.id, entry.entity_type, entry.entity_id, e
                    );
                    entry.mark_failed(delivery_error_message(e), now);
                    failed += 1;
                }
                _ => {
                    entry.mark_sent(now);
                    sent += 1;
                }
            }
        }

        if !selected.is_empty() {
            // Only delivery columns: a concurrent resolve or priority change
            // made while deliveries were in flight stays intact.
            if let Err(e) = self.store.record_delivery_batch(&selected).await {
                return Err(self.abort(scope, &trigger, started_at, selected.len(), e).await);
            }
        }

        let discrepancies = self.check_inventory().await;

        let session = self
            .store
            .insert_session(NewSyncSession {
                store_id: scope,
                mode: trigger.mode,
                status: SessionStatus::Success,
                started_at,
                finished_at: Utc::now(),
                triggered_by: trigger.triggered_by.clone(),
                error_message: None,
                processed_events: selected.len() as u64,
                differences_detected: discrepancies.len() as u64,
            })
            .await?;

        info!(
            "Dispatch cycle for scope {} completed: {} processed, {} sent, {} failed, {} discrepancies",
            scope_label(scope),
            selected.len(),
            sent,
            failed,
            discrepancies.len()
        );

        Ok(CycleReport {
            processed: selected.len(),
            sent,
            failed,
            discrepancies,
            session,
        })
    }

    /// Pending entries in scope, in dispatch order.
    async fn select(&self, scope: Option<StoreId>) -> Result<Vec<OutboxEntry>> {
        let mut selected: Vec<OutboxEntry> = self
            .store
            .list_outbox(&OutboxQuery::with_status(OutboxStatus::Pending))
            .await?
            .into_iter()
            .filter(|e| e.in_scope(scope))
            .collect();
        selected.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        Ok(selected)
    }

    async fn deliver_all(&self, entries: &[OutboxEntry]) -> HashMap<i64, Result<()>> {
        let timeout = self.delivery_timeout;
        // Each delivery owns its envelope and transport handle.
        let deliveries: Vec<_> = entries
            .iter()
            .map(|entry| {
                let id = entry.id;
                let envelope = Envelope::from_outbox(entry);
                let transport = self.transport.clone();
                async move {
                    let result = deliver_with_timeout(transport.as_ref(), &envelope, timeout).await;
                    (id, result)
                }
            })
            .collect();

        stream::iter(deliveries)
            .buffer_unordered(self.concurrency)
            .collect()
            .await
    }

    /// Discrepancies seen in the inventory source. Never fails the cycle.
    async fn check_inventory(&self) -> Vec<Discrepancy> {
        let Some(inventory) = &self.inventory else {
            return Vec::new();
        };
        match self
            .reconciler
            .reconcile(inventory.as_ref(), &DiscrepancyFilter::default())
            .await
        {
            Ok(found) => {
                for d in &found {
                    warn!(
                        product_id = %d.product_id,
                        magnitude = d.magnitude,
                        severity = %d.severity,
                        "inventory discrepancy detected"
                    );
                }
                found
            }
            Err(e) => {
                warn!("Inventory reconciliation skipped: {}", e);
                Vec::new()
            }
        }
    }

    /// Record a FAILURE session, best-effort, and hand back the cause.
    async fn abort(
        &self,
        scope: Option<StoreId>,
        trigger: &CycleTrigger,
        started_at: chrono::DateTime<Utc>,
        processed: usize,
        cause: Error,
    ) -> Error {
        error!("Dispatch cycle for scope {} aborted: {}", scope_label(scope), cause);
        let failure = NewSyncSession {
            store_id: scope,
            mode: trigger.mode,
            status: SessionStatus::Failure,
            started_at,
            finished_at: Utc::now(),
            triggered_by: trigger.triggered_by.clone(),
            error_message: Some(cause.to_string()),
            processed_events: processed as u64,
            differences_detected: 0,
        };
        if let Err(e) = self.store.insert_session(failure).await {
            error!("Failed to record aborted session: {}", e);
        }
        cause
    }
}
