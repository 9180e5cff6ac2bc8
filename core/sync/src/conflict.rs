//! Conflict detection for concurrent writes to the same entity.
//!
//! Detection never merges anything. A diverging payload bumps the version
//! and raises the flag; an operator clears it through resolution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use storesync_common::{EntityType, OutboxEntry, Payload};

/// How a new payload relates to the previous entry for the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Divergence {
    /// No prior entry for the key.
    FirstWrite,
    /// Same payload as the prior entry.
    Unchanged,
    /// Payload differs from the prior entry.
    Diverged,
}

/// Version and flag to stamp on a new outbox entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionStamp {
    pub version: u32,
    pub conflict_flag: bool,
    pub divergence: Divergence,
}

/// An unresolved conflict, as surfaced to operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictInfo {
    pub entry_id: i64,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub version: u32,
    /// When the flagged entry was last written.
    pub detected_at: DateTime<Utc>,
}

impl ConflictInfo {
    pub fn from_entry(entry: &OutboxEntry) -> Self {
        Self {
            entry_id: entry.id,
            entity_type: entry.entity_type.clone(),
            entity_id: entry.entity_id.clone(),
            version: entry.version,
            detected_at: entry.updated_at,
        }
    }
}

/// Compares a new payload with the latest entry for its key.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictDetector;

impl ConflictDetector {
    pub fn new() -> Self {
        Self
    }

    /// Decide the version and conflict flag of a new entry.
    ///
    /// An unchanged payload carries the prior flag forward as-is, so a
    /// flagged conflict stays flagged until it is resolved.
    pub fn stamp(&self, prior: Option<&OutboxEntry>, payload: &Payload) -> VersionStamp {
        match prior {
            None => VersionStamp {
                version: 1,
                conflict_flag: false,
                divergence: Divergence::FirstWrite,
            },
            Some(prior) if &prior.payload == payload => VersionStamp {
                version: prior.version,
                conflict_flag: prior.conflict_flag,
                divergence: Divergence::Unchanged,
            },
            Some(prior) => VersionStamp {
                version: prior.version + 1,
                conflict_flag: true,
                divergence: Divergence::Diverged,
            },
        }
    }
}
