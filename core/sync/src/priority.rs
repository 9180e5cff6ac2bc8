//! Entity type to dispatch priority mapping.

use std::collections::HashMap;

use storesync_common::{EntityType, Priority};

/// Built-in priority table. Anything not listed is NORMAL.
const PRIORITY_TABLE: &[(&str, Priority)] = &[
    ("sale", Priority::High),
    ("sale_return", Priority::High),
    ("payment", Priority::High),
    ("transfer", Priority::High),
    ("inventory", Priority::High),
    ("stock_adjustment", Priority::High),
    ("product", Priority::Normal),
    ("customer", Priority::Normal),
    ("supplier", Priority::Normal),
    ("purchase_order", Priority::Normal),
    ("device", Priority::Normal),
    ("user", Priority::Normal),
    ("store", Priority::Low),
    ("backup", Priority::Low),
    ("draft", Priority::Low),
    ("pos_draft", Priority::Low),
];

/// Resolves the dispatch priority of an entity type.
///
/// Total and pure: every tag maps to a tier, unknown tags to NORMAL.
/// Overrides take precedence over the built-in table.
#[derive(Debug, Clone, Default)]
pub struct PriorityResolver {
    overrides: HashMap<String, Priority>,
}

impl PriorityResolver {
    /// Resolver using only the built-in table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolver with per-deployment overrides.
    pub fn with_overrides(overrides: HashMap<String, Priority>) -> Self {
        let overrides = overrides
            .into_iter()
            .map(|(tag, priority)| (tag.trim().to_ascii_lowercase(), priority))
            .collect();
        Self { overrides }
    }

    /// Priority for an entity type.
    pub fn resolve(&self, entity_type: &EntityType) -> Priority {
        if let Some(priority) = self.overrides.get(entity_type.as_str()) {
            return *priority;
        }
        builtin_priority(entity_type.as_str())
    }
}

fn builtin_priority(tag: &str) -> Priority {
    PRIORITY_TABLE
        .iter()
        .find(|(known, _)| *known == tag)
        .map(|(_, priority)| *priority)
        .unwrap_or(Priority::Normal)
}
