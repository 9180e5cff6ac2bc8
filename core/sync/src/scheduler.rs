//! Sync scheduling - manual and periodic modes.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use storesync_common::{Error, Result, StoreId};

use crate::dispatch::{CycleReport, CycleTrigger};
use crate::queue::QueueDispatchSummary;

/// Sync mode configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMode {
    /// Ticks run only when requested.
    Manual,
    /// Ticks also run at regular intervals.
    Periodic { interval: Duration },
}

impl SyncMode {
    fn interval(&self) -> Option<Duration> {
        match self {
            SyncMode::Manual => None,
            SyncMode::Periodic { interval } => Some(*interval),
        }
    }
}

/// Sync request types.
#[derive(Debug, Clone)]
pub enum SyncRequest {
    /// Requeue, dispatch `scope`, then drain the hybrid queue.
    Tick {
        scope: Option<StoreId>,
        trigger: CycleTrigger,
    },
    /// Shutdown the scheduler.
    Shutdown,
}

/// Result of one scheduler tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickReport {
    /// FAILED outbox entries moved back to PENDING.
    pub requeued: usize,
    pub cycle: CycleReport,
    pub queue: QueueDispatchSummary,
    pub duration: Duration,
}

type Responder = oneshot::Sender<Result<TickReport>>;

/// Scheduler for managing sync timing and requests.
pub struct SyncScheduler {
    /// Current sync mode.
    mode: Arc<RwLock<SyncMode>>,
    /// Channel to send sync requests.
    request_tx: mpsc::Sender<(SyncRequest, Responder)>,
    /// Shutdown signal.
    shutdown: Arc<RwLock<bool>>,
}

impl SyncScheduler {
    /// Create a new scheduler with the given mode.
    pub fn new(mode: SyncMode) -> (Self, SyncSchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(100);
        let mode = Arc::new(RwLock::new(mode));
        let shutdown = Arc::new(RwLock::new(false));

        let scheduler = Self {
            mode: mode.clone(),
            request_tx,
            shutdown: shutdown.clone(),
        };

        let handle = SyncSchedulerHandle {
            mode,
            request_rx,
            shutdown,
        };

        (scheduler, handle)
    }

    /// Request a tick for `scope` and wait for its report.
    pub async fn request_sync(
        &self,
        scope: Option<StoreId>,
        triggered_by: impl Into<String>,
    ) -> Result<TickReport> {
        let (response_tx, response_rx) = oneshot::channel();
        let request = SyncRequest::Tick {
            scope,
            trigger: CycleTrigger::manual(triggered_by),
        };

        self.request_tx
            .send((request, response_tx))
            .await
            .map_err(|_| Error::Scheduler("Scheduler not running".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::Scheduler("Failed to receive sync result".to_string()))?
    }

    /// Change the sync mode.
    pub async fn set_mode(&self, mode: SyncMode) {
        let mut current_mode = self.mode.write().await;
        *current_mode = mode;
    }

    /// Get current sync mode.
    pub async fn get_mode(&self) -> SyncMode {
        self.mode.read().await.clone()
    }

    /// Shutdown the scheduler.
    ///
    /// A tick already running completes; no new tick starts.
    pub async fn shutdown(&self) {
        let mut is_shutdown = self.shutdown.write().await;
        *is_shutdown = true;
        drop(is_shutdown);

        // Wake the loop if it is idle.
        let (response_tx, _) = oneshot::channel();
        let _ = self
            .request_tx
            .send((SyncRequest::Shutdown, response_tx))
            .await;
    }
}

/// Handle for the scheduler background task.
pub struct SyncSchedulerHandle {
    mode: Arc<RwLock<SyncMode>>,
    request_rx: mpsc::Receiver<(SyncRequest, Responder)>,
    shutdown: Arc<RwLock<bool>>,
}

impl SyncSchedulerHandle {
    /// Run the scheduler background task.
    ///
    /// This should be spawned in a tokio task. The `tick_fn` is called for
    /// every requested tick and, in periodic mode, on every interval.
    pub async fn run<F, Fut>(mut self, tick_fn: F)
    where
        F: Fn(SyncRequest) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<TickReport>> + Send,
    {
        let mut current_interval = self.mode.read().await.interval();
        let mut periodic = Self::create_periodic_interval(current_interval);

        info!("Sync scheduler started");

        loop {
            if *self.shutdown.read().await {
                info!("Sync scheduler shutting down");
                break;
            }

            tokio::select! {
                biased;

                request = self.request_rx.recv() => {
                    match request {
                        None => {
                            info!("Scheduler dropped, stopping");
                            break;
                        }
                        Some((SyncRequest::Shutdown, _)) => {
                            info!("Received shutdown request");
                            break;
                        }
                        Some((request, response_tx)) => {
                            debug!("Processing sync request: {:?}", request);
                            let result = tick_fn(request).await;
                            let _ = response_tx.send(result);
                        }
                    }
                }

                _ = Self::wait_for_periodic(&mut periodic) => {
                    debug!("Triggering periodic sync");
                    let request = SyncRequest::Tick {
                        scope: None,
                        trigger: CycleTrigger::automatic(),
                    };
                    match tick_fn(request).await {
                        Ok(report) => {
                            info!(
                                "Periodic sync completed: {} requeued, {} sent, {} failed, {} queue events sent",
                                report.requeued,
                                report.cycle.sent,
                                report.cycle.failed,
                                report.queue.sent
                            );
                        }
                        Err(e) => {
                            error!("Periodic sync failed: {}", e);
                        }
                    }
                }
            }

            // Recreate interval if mode changed
            let expected_interval = self.mode.read().await.interval();
            if current_interval != expected_interval {
                current_interval = expected_interval;
                periodic = Self::create_periodic_interval(current_interval);
            }
        }
    }

    fn create_periodic_interval(period: Option<Duration>) -> Option<tokio::time::Interval> {
        period.map(|period| {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker
        })
    }

    async fn wait_for_periodic(interval: &mut Option<tokio::time::Interval>) {
        if let Some(ref mut interval) = interval {
            interval.tick().await;
        } else {
            // Manual mode: re-check the mode now and then.
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }
}
