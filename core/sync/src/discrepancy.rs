//! Cross-branch inventory discrepancy detection.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use storesync_common::{Error, Result, StoreId};

/// Default relative difference above which a mismatch is critical.
pub const DEFAULT_CRITICAL_THRESHOLD: f64 = 0.25;

/// Quantity of one product held by one branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchStock {
    pub store_id: StoreId,
    pub product_id: String,
    pub quantity: i64,
    pub updated_at: DateTime<Utc>,
}

/// How bad a mismatch is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Warning => f.write_str("WARNING"),
            Severity::Critical => f.write_str("CRITICAL"),
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "WARNING" => Ok(Severity::Warning),
            "CRITICAL" => Ok(Severity::Critical),
            _ => Err(Error::Validation(format!("Unknown severity: {}", s))),
        }
    }
}

/// Per-branch total for a product that is out of line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreQuantity {
    pub store_id: StoreId,
    pub quantity: i64,
}

/// A product whose aggregate quantity differs across branches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Discrepancy {
    pub product_id: String,
    pub max_quantity: i64,
    pub min_quantity: i64,
    /// `max_quantity - min_quantity`.
    pub magnitude: i64,
    pub relative_difference: f64,
    pub severity: Severity,
    pub stores: Vec<StoreQuantity>,
}

/// Restricts a standalone discrepancy report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscrepancyFilter {
    /// Only consider these branches. Empty means all.
    pub store_ids: Vec<StoreId>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub severity: Option<Severity>,
}

impl DiscrepancyFilter {
    fn admits(&self, row: &BranchStock) -> bool {
        if !self.store_ids.is_empty() && !self.store_ids.contains(&row.store_id) {
            return false;
        }
        if self.since.is_some_and(|since| row.updated_at < since) {
            return false;
        }
        if self.until.is_some_and(|until| row.updated_at > until) {
            return false;
        }
        true
    }
}

/// Provides per-branch inventory aggregates.
#[async_trait]
pub trait InventorySource: Send + Sync {
    async fn aggregates(&self) -> Result<Vec<BranchStock>>;
}

/// Fixed set of aggregates, e.g. loaded from a file.
#[derive(Debug, Clone, Default)]
pub struct StaticInventory {
    rows: Vec<BranchStock>,
}

impl StaticInventory {
    pub fn new(rows: Vec<BranchStock>) -> Self {
        Self { rows }
    }
}

#[async_trait]
impl InventorySource for StaticInventory {
    async fn aggregates(&self) -> Result<Vec<BranchStock>> {
        Ok(self.rows.clone())
    }
}

/// Relative difference of a spread: `magnitude / max(|max|, 1)`.
pub fn relative_difference(max_quantity: i64, min_quantity: i64) -> f64 {
    let magnitude = max_quantity.saturating_sub(min_quantity) as f64;
    magnitude / (max_quantity.unsigned_abs().max(1) as f64)
}

/// Groups branch aggregates by product and flags mismatches.
#[derive(Debug, Clone, Copy)]
pub struct DiscrepancyReconciler {
    critical_threshold: f64,
}

impl Default for DiscrepancyReconciler {
    fn default() -> Self {
        Self::new(DEFAULT_CRITICAL_THRESHOLD)
    }
}

impl DiscrepancyReconciler {
    pub fn new(critical_threshold: f64) -> Self {
        Self { critical_threshold }
    }

    pub fn critical_threshold(&self) -> f64 {
        self.critical_threshold
    }

    /// Severity for a given relative difference.
    pub fn classify(&self, relative: f64) -> Severity {
        if relative > self.critical_threshold {
            Severity::Critical
        } else {
            Severity::Warning
        }
    }

    /// Find every product whose branch totals disagree.
    ///
    /// Rows for the same branch and product are summed first. A product
    /// seen in only one branch cannot mismatch.
    pub fn detect(&self, rows: &[BranchStock]) -> Vec<Discrepancy> {
        let mut per_product: BTreeMap<&str, BTreeMap<StoreId, i64>> = BTreeMap::new();
        for row in rows {
            let total = per_product
                .entry(row.product_id.as_str())
                .or_default()
                .entry(row.store_id)
                .or_insert(0);
            *total = total.saturating_add(row.quantity);
        }

        let mut found = Vec::new();
        for (product_id, branches) in per_product {
            if branches.len() < 2 {
                continue;
            }
            let max_quantity = branches.values().copied().max().unwrap_or(0);
            let min_quantity = branches.values().copied().min().unwrap_or(0);
            if max_quantity == min_quantity {
                continue;
            }

            let relative = relative_difference(max_quantity, min_quantity);
            found.push(Discrepancy {
                product_id: product_id.to_string(),
                max_quantity,
                min_quantity,
                magnitude: max_quantity.saturating_sub(min_quantity),
                relative_difference: relative,
                severity: self.classify(relative),
                stores: branches
                    .into_iter()
                    .map(|(store_id, quantity)| StoreQuantity { store_id, quantity })
                    .collect(),
            });
        }
        found
    }

    /// Standalone report over already fetched aggregates.
    pub fn report(&self, rows: &[BranchStock], filter: &DiscrepancyFilter) -> Vec<Discrepancy> {
        let admitted: Vec<BranchStock> = rows.iter().filter(|r| filter.admits(r)).cloned().collect();
        self.detect(&admitted)
            .into_iter()
            .filter(|d| filter.severity.map_or(true, |s| d.severity == s))
            .collect()
    }

    /// Fetch aggregates from a source and report on them.
    pub async fn reconcile(
        &self,
        source: &dyn InventorySource,
        filter: &DiscrepancyFilter,
    ) -> Result<Vec<Discrepancy>> {
        let rows = source.aggregates().await?;
        Ok(self.report(&rows, filter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn stock(store: i64, product: &str, quantity: i64) -> BranchStock {
        BranchStock {
            store_id: StoreId(store),
            product_id: product.to_string(),
            quantity,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_matching_branches_are_quiet() {
        let rows = vec![stock(1, "SKU-1", 10), stock(2, "SKU-1", 10), stock(3, "SKU-2", 4)];
        assert!(DiscrepancyReconciler::default().detect(&rows).is_empty());
    }

    #[test]
    fn test_rows_summed_per_branch() {
        let rows = vec![stock(1, "SKU-1", 4), stock(1, "SKU-1", 6), stock(2, "SKU-1", 10)];
        assert!(DiscrepancyReconciler::default().detect(&rows).is_empty());
    }

    #[test]
    fn test_severity_threshold() {
        let reconciler = DiscrepancyReconciler::new(0.25);
        let rows = vec![
            stock(1, "SKU-1", 100),
            stock(2, "SKU-1", 90),
            stock(1, "SKU-2", 100),
            stock(2, "SKU-2", 50),
        ];
        let found = reconciler.detect(&rows);
        assert_eq!(found.len(), 2);

        assert_eq!(found[0].product_id, "SKU-1");
        assert_eq!(found[0].magnitude, 10);
        assert_eq!(found[0].severity, Severity::Warning);

        assert_eq!(found[1].product_id, "SKU-2");
        assert_eq!(found[1].magnitude, 50);
        assert_eq!(found[1].severity, Severity::Critical);
        assert_eq!(found[1].stores.len(), 2);
    }

    #[test]
    fn test_filter_by_store_and_window() {
        let reconciler = DiscrepancyReconciler::default();
        let mut stale = stock(3, "SKU-1", 1);
        stale.updated_at = Utc::now() - Duration::days(3);
        let rows = vec![stock(1, "SKU-1", 10), stock(2, "SKU-1", 10), stale];

        assert_eq!(reconciler.report(&rows, &DiscrepancyFilter::default()).len(), 1);

        let recent = DiscrepancyFilter {
            since: Some(Utc::now() - Duration::days(1)),
            ..DiscrepancyFilter::default()
        };
        assert!(reconciler.report(&rows, &recent).is_empty());

        let branches = DiscrepancyFilter {
            store_ids: vec![StoreId(1), StoreId(2)],
            ..DiscrepancyFilter::default()
        };
        assert!(reconciler.report(&rows, &branches).is_empty());

        let warning_only = DiscrepancyFilter {
            severity: Some(Severity::Warning),
            ..DiscrepancyFilter::default()
        };
        assert!(reconciler.report(&rows, &warning_only).is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_from_source() {
        let source = StaticInventory::new(vec![stock(1, "SKU-9", 0), stock(2, "SKU-9", 3)]);
        let found = DiscrepancyReconciler::default()
            .reconcile(&source, &DiscrepancyFilter::default())
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].severity, Severity::Critical);
    }

    #[test]
    fn test_severity_parse() {
        assert_eq!("critical".parse::<Severity>().unwrap(), Severity::Critical);
        assert!("minor".parse::<Severity>().is_err());
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn severity_is_monotonic_in_spread(
            max in 1i64..10_000,
            small in 0i64..10_000,
            extra in 0i64..10_000,
        ) {
            let reconciler = DiscrepancyReconciler::default();
            let near = (max - small.min(max)).max(0);
            let far = near - extra;
            let near_sev = reconciler.classify(relative_difference(max, near));
            let far_sev = reconciler.classify(relative_difference(max, far));
            prop_assert!(far_sev >= near_sev);
        }

        #[test]
        fn relative_difference_is_non_negative(a in -1_000_000i64..1_000_000, b in -1_000_000i64..1_000_000) {
            let (max, min) = if a >= b { (a, b) } else { (b, a) };
            prop_assert!(relative_difference(max, min) >= 0.0);
        }
    }
}
