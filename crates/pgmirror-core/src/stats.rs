//! Per-table and aggregate sync statistics

use std::collections::BTreeMap;

/// Row-level outcome counts for one table.
///
/// The inserted/updated split follows the driver's affected-rows report and
/// is a change-class hint, not an exact census.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableStats {
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
    pub errors: u64,
}

impl TableStats {
    pub fn merge(&mut self, other: TableStats) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.errors += other.errors;
    }

    pub fn is_empty(&self) -> bool {
        *self == TableStats::default()
    }
}

/// Accumulated results across the DELETE, UPSERT and CASCADE phases.
#[derive(Debug, Clone, Default)]
pub struct SyncResults {
    tables: BTreeMap<String, TableStats>,
}

impl SyncResults {
    pub fn record(&mut self, table: &str, stats: TableStats) {
        self.tables.entry(table.to_string()).or_default().merge(stats);
    }

    pub fn get(&self, table: &str) -> TableStats {
        self.tables.get(table).copied().unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &TableStats)> {
        self.tables.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn totals(&self) -> TableStats {
        let mut total = TableStats::default();
        for stats in self.tables.values() {
            total.merge(*stats);
        }
        total
    }

    pub fn is_empty(&self) -> bool {
        self.tables.values().all(TableStats::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_merges_across_phases() {
        let mut results = SyncResults::default();
        results.record(
            "orders",
            TableStats {
                deleted: 5,
                ..Default::default()
            },
        );
        results.record(
            "orders",
            TableStats {
                inserted: 2,
                updated: 3,
                ..Default::default()
            },
        );

        let stats = results.get("orders");
        assert_eq!(stats.deleted, 5);
        assert_eq!(stats.inserted, 2);
        assert_eq!(stats.updated, 3);

        let totals = results.totals();
        assert_eq!(totals.deleted, 5);
        assert!(!results.is_empty());
    }

    #[test]
    fn empty_results() {
        let mut results = SyncResults::default();
        assert!(results.is_empty());
        results.record("users", TableStats::default());
        assert!(results.is_empty());
    }
}
