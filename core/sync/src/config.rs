//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use storesync_common::{Error, Priority, Result};

use crate::discrepancy::DEFAULT_CRITICAL_THRESHOLD;
use crate::retry::RetryConfig;
use crate::scheduler::SyncMode;

/// Whether the scheduler ticks on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleKind {
    /// Cycles run only when requested.
    #[default]
    Manual,
    /// Cycles also run every `tick_interval_secs`.
    Periodic,
}

/// Backoff between failed hybrid queue attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_delay_secs: u64,
    pub multiplier: f64,
    pub max_delay_secs: u64,
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_secs: 2,
            multiplier: 2.0,
            max_delay_secs: 300,
            jitter: true,
        }
    }
}

/// Configuration for the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Seconds between scheduler ticks in periodic mode.
    pub tick_interval_secs: u64,
    /// Age a FAILED outbox entry must reach before it is requeued.
    pub retry_interval_secs: u64,
    /// Upper bound on a single delivery.
    pub delivery_timeout_secs: u64,
    /// Deliveries in flight at once during a cycle.
    pub delivery_concurrency: usize,
    /// Retry budget of a hybrid queue entry.
    pub queue_max_attempts: u32,
    pub queue_backoff: BackoffConfig,
    /// Lookback window for forecasts.
    pub forecast_window_minutes: u64,
    /// Relative difference above which a discrepancy is critical.
    pub discrepancy_critical_threshold: f64,
    pub sync_mode: ScheduleKind,
    /// Per-deployment priority overrides by entity type.
    pub priority_overrides: HashMap<String, Priority>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 60,
            retry_interval_secs: 3600,
            delivery_timeout_secs: 30,
            delivery_concurrency: 8,
            queue_max_attempts: 5,
            queue_backoff: BackoffConfig::default(),
            forecast_window_minutes: 60,
            discrepancy_critical_threshold: DEFAULT_CRITICAL_THRESHOLD,
            sync_mode: ScheduleKind::Manual,
            priority_overrides: HashMap::new(),
        }
    }
}

impl SyncConfig {
    /// Load configuration from a JSON file. Missing fields take defaults.
    ///
    /// # Errors
    /// - `Io` if the file cannot be read
    /// - `Serialization` if it is not valid JSON
    /// - `Validation` if a value is out of range
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: SyncConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("tick_interval_secs", self.tick_interval_secs),
            ("retry_interval_secs", self.retry_interval_secs),
            ("delivery_timeout_secs", self.delivery_timeout_secs),
            ("forecast_window_minutes", self.forecast_window_minutes),
            ("delivery_concurrency", self.delivery_concurrency as u64),
            ("queue_max_attempts", u64::from(self.queue_max_attempts)),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(Error::Validation(format!("{} must be positive", name)));
            }
        }
        let threshold = self.discrepancy_critical_threshold;
        if threshold.is_nan() || threshold < 0.0 {
            return Err(Error::Validation(
                "discrepancy_critical_threshold must be non-negative".to_string(),
            ));
        }
        let multiplier = self.queue_backoff.multiplier;
        if multiplier.is_nan() || multiplier < 1.0 {
            return Err(Error::Validation(
                "queue_backoff.multiplier must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_secs(self.delivery_timeout_secs)
    }

    pub fn forecast_window(&self) -> Duration {
        Duration::from_secs(self.forecast_window_minutes * 60)
    }

    /// Backoff for the hybrid queue.
    pub fn queue_retry(&self) -> RetryConfig {
        RetryConfig::new()
            .with_initial_delay(Duration::from_secs(self.queue_backoff.initial_delay_secs))
            .with_max_delay(Duration::from_secs(self.queue_backoff.max_delay_secs))
            .with_backoff_multiplier(self.queue_backoff.multiplier)
            .with_jitter(self.queue_backoff.jitter)
    }

    /// Scheduler mode implied by `sync_mode` and `tick_interval_secs`.
    pub fn scheduler_mode(&self) -> SyncMode {
        match self.sync_mode {
            ScheduleKind::Manual => SyncMode::Manual,
            ScheduleKind::Periodic => SyncMode::Periodic {
                interval: self.tick_interval(),
            },
        }
    }
}
