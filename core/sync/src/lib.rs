//! Store Sync Engine
//!
//! Offline-first synchronization for a network of retail branches:
//! - Outbox of mutation events with conflict detection
//! - Priority-ordered dispatch cycles scoped per store
//! - Retry of failed deliveries with backoff
//! - Idempotent hybrid queue for local event capture
//! - Progress and throughput forecasts
//! - Cross-branch inventory discrepancy detection
//! - Token-authenticated partner access

pub mod config;
pub mod conflict;
pub mod discrepancy;
pub mod dispatch;
pub mod engine;
pub mod outbox;
pub mod partner;
pub mod priority;
pub mod progress;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod transport;

// Re-export main types
pub use config::{BackoffConfig, ScheduleKind, SyncConfig};
pub use conflict::{ConflictDetector, ConflictInfo, Divergence, VersionStamp};
pub use discrepancy::{
    BranchStock, Discrepancy, DiscrepancyFilter, DiscrepancyReconciler, InventorySource, Severity,
    StaticInventory, StoreQuantity,
};
pub use dispatch::{CycleReport, CycleTrigger, DispatchCycle};
pub use engine::{Alert, SyncEngine, SyncEngineBuilder};
pub use outbox::{Outbox, OutboxStats, Page};
pub use partner::{
    Ack, Capability, PartnerGateway, PartnerProfile, PartnerRegistry, PartnerToken,
    PARTNER_ALLOW_LIST,
};
pub use priority::PriorityResolver;
pub use progress::{resolve_module, Forecast, ModuleProgress, ProgressReport, ProgressReporter};
pub use queue::{EnqueueOutcome, HybridQueue, QueueDispatchSummary, QueueEvent};
pub use retry::{RetryConfig, RetryManager};
pub use scheduler::{SyncMode, SyncRequest, SyncScheduler, SyncSchedulerHandle, TickReport};
pub use transport::{
    DeliveryTransport, Envelope, EnvelopeSource, LoopbackTransport, Outcome, RecordingTransport,
};
