//! Per-family remaining capacity.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{info, warn};

use crate::core::FamilyId;

/// Capacity accounting for one quota family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaEntry {
    /// Limit reported by the provider.
    pub nominal: u32,
    /// Limit left after subtracting external consumers at startup. Remaining
    /// capacity never exceeds this.
    pub baseline: u32,
    /// Units not currently held by an admitted item.
    pub remaining: u32,
}

/// How an item relates to its family's capacity right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fit {
    /// Enough remaining capacity to admit.
    Fits,
    /// Would fit once other admissions release.
    Insufficient,
    /// Larger than the family's whole baseline.
    NeverFits,
    /// The table has no such family.
    UnknownFamily,
}

/// Mapping from quota family to remaining capacity units.
#[derive(Debug, Clone, Default)]
pub struct QuotaTable {
    entries: BTreeMap<FamilyId, QuotaEntry>,
}

impl QuotaTable {
    /// Empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a table from provider limits.
    pub fn from_limits(limits: impl IntoIterator<Item = (FamilyId, u32)>) -> Self {
        let mut table = Self::new();
        for (family, limit) in limits {
            table.insert(family, limit);
        }
        table
    }

    /// Add or replace a family with a fresh limit.
    pub fn insert(&mut self, family: FamilyId, limit: u32) {
        self.entries.insert(
            family,
            QuotaEntry {
                nominal: limit,
                baseline: limit,
                remaining: limit,
            },
        );
    }

    /// Subtract capacity consumed by instances this process does not own.
    ///
    /// Only meaningful before any admission. Consumption above the limit
    /// clamps the family to zero. Returns the new baseline, or `None` for an
    /// unknown family.
    pub fn subtract_external(&mut self, family: &FamilyId, units: u32) -> Option<u32> {
        let entry = self.entries.get_mut(family)?;
        if entry.baseline >= units {
            entry.baseline -= units;
            info!(
                family = %family,
                consumed = units,
                remaining = entry.baseline,
                "adjusted quota for running external instances"
            );
        } else {
            warn!(
                family = %family,
                consumed = units,
                limit = entry.baseline,
                "running external instances exceed quota; clamping to zero"
            );
            entry.baseline = 0;
        }
        entry.remaining = entry.baseline;
        Some(entry.baseline)
    }

    /// Accounting for `family`.
    #[must_use]
    pub fn get(&self, family: &FamilyId) -> Option<QuotaEntry> {
        self.entries.get(family).copied()
    }

    /// Remaining units for `family`.
    #[must_use]
    pub fn remaining(&self, family: &FamilyId) -> Option<u32> {
        self.entries.get(family).map(|e| e.remaining)
    }

    /// Classify an item of `cost` against `family`.
    #[must_use]
    pub fn fit(&self, family: &FamilyId, cost: u32) -> Fit {
        match self.entries.get(family) {
            None => Fit::UnknownFamily,
            Some(e) if cost > e.baseline => Fit::NeverFits,
            Some(e) if e.remaining >= cost => Fit::Fits,
            Some(_) => Fit::Insufficient,
        }
    }

    /// Take `cost` units from `family`. Refuses (and returns `false`) rather
    /// than going negative.
    pub(crate) fn debit(&mut self, family: &FamilyId, cost: u32) -> bool {
        match self.entries.get_mut(family) {
            Some(e) if e.remaining >= cost => {
                e.remaining -= cost;
                true
            }
            _ => false,
        }
    }

    /// Return `cost` units to `family`, never above its baseline.
    pub(crate) fn credit(&mut self, family: &FamilyId, cost: u32) {
        if let Some(e) = self.entries.get_mut(family) {
            let restored = e.remaining.saturating_add(cost);
            debug_assert!(restored <= e.baseline, "credit above baseline for {family}");
            e.remaining = restored.min(e.baseline);
        }
    }

    /// Snapshot of every family, ordered by id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(FamilyId, QuotaEntry)> {
        self.entries.iter().map(|(f, e)| (f.clone(), *e)).collect()
    }

    /// Number of families.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the table has no families.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> (QuotaTable, FamilyId) {
        let f = FamilyId::new("c");
        (QuotaTable::from_limits([(f.clone(), 10)]), f)
    }

    #[test]
    fn test_debit_and_credit_stay_in_bounds() {
        let (mut t, f) = table();
        assert!(t.debit(&f, 6));
        assert_eq!(t.remaining(&f), Some(4));
        assert!(!t.debit(&f, 5));
        assert_eq!(t.remaining(&f), Some(4));
        t.credit(&f, 6);
        assert_eq!(t.remaining(&f), Some(10));
    }

    #[test]
    fn test_fit_classification() {
        let (mut t, f) = table();
        assert_eq!(t.fit(&f, 10), Fit::Fits);
        assert_eq!(t.fit(&f, 11), Fit::NeverFits);
        assert!(t.debit(&f, 8));
        assert_eq!(t.fit(&f, 3), Fit::Insufficient);
        assert_eq!(t.fit(&FamilyId::new("zz"), 1), Fit::UnknownFamily);
    }

    #[test]
    fn test_subtract_external_clamps_at_zero() {
        let (mut t, f) = table();
        assert_eq!(t.subtract_external(&f, 4), Some(6));
        assert_eq!(t.get(&f).unwrap().nominal, 10);
        assert_eq!(t.subtract_external(&f, 50), Some(0));
        assert_eq!(t.remaining(&f), Some(0));
        assert_eq!(t.subtract_external(&FamilyId::new("zz"), 1), None);
    }
}
