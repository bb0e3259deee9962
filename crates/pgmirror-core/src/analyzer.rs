//! Differential analysis: per-table diffs and the sync plan
//!
//! The analyzer compares cheap per-table metadata (counts, max id, max
//! updated_at) plus the primary-key id sets, and turns the differences into
//! a plan closed over FK parents.

use crate::adapter::{DatabaseAdapter, TableMetadata};
use crate::db::Database;
use crate::error::Result;
use crate::graph::DependencyGraph;
use crate::schema::RefreshSets;
use crate::syncer::DataSyncer;
use tracing::{debug, info};

/// What one table needs to converge to the source.
#[derive(Debug, Clone, Default)]
pub struct TableDiff {
    pub table: String,
    pub needs_sync: bool,
    pub local_count: i64,
    pub remote_count: i64,
    /// Last-modified timestamps exist on both sides and differ.
    pub has_updates: bool,
    pub ids_to_delete: Vec<String>,
    /// Metadata could not be read on one side; sync defensively.
    pub metadata_error: bool,
    /// The table will be dropped and recreated; rows are a full reload.
    pub refreshed: bool,
    /// Added by parent closure, not by its own differences.
    pub is_parent: bool,
    /// Added by the cascade recheck pass.
    pub is_child: bool,
}

impl TableDiff {
    fn parent(table: &str) -> Self {
        Self {
            table: table.to_string(),
            is_parent: true,
            ..Default::default()
        }
    }
}

/// The work a pull will perform.
#[derive(Debug, Clone, Default)]
pub struct SyncPlan {
    pub tables_to_sync: Vec<TableDiff>,
    pub tables_to_refresh: Vec<String>,
    pub views_to_refresh: Vec<String>,
    pub missing_tables: Vec<String>,
    pub changed_tables: Vec<String>,
    pub missing_views: Vec<String>,
    pub changed_views: Vec<String>,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.tables_to_sync.is_empty()
            && self.tables_to_refresh.is_empty()
            && self.views_to_refresh.is_empty()
    }
}

/// Restrict the source's table list to the sync scope: drop excluded tables
/// (unless included back) and intersect with an explicit `--tables` list.
pub fn scope_tables(
    all: &[String],
    excluded: &[String],
    only: Option<&[String]>,
    include_excluded: bool,
) -> Vec<String> {
    all.iter()
        .filter(|t| include_excluded || !excluded.contains(t))
        .filter(|t| only.map(|names| names.contains(t)).unwrap_or(true))
        .cloned()
        .collect()
}

/// Decide `needs_sync` from the two metadata snapshots and the id delta.
fn evaluate(
    table: &str,
    local: &TableMetadata,
    remote: &TableMetadata,
    ids_to_delete: Vec<String>,
) -> TableDiff {
    if local.error || remote.error {
        return TableDiff {
            table: table.to_string(),
            needs_sync: true,
            metadata_error: true,
            local_count: local.count,
            remote_count: remote.count,
            ..Default::default()
        };
    }

    let mut diff = TableDiff {
        table: table.to_string(),
        local_count: local.count,
        remote_count: remote.count,
        ..Default::default()
    };

    diff.needs_sync = !ids_to_delete.is_empty()
        || remote.count != local.count
        || remote.max_id != local.max_id;
    diff.ids_to_delete = ids_to_delete;

    if local.has_updated_at
        && remote.has_updated_at
        && local.max_updated_at != remote.max_updated_at
    {
        diff.needs_sync = true;
        diff.has_updates = true;
    }
    diff
}

/// Keep the plan entries the execution phases will actually touch.
pub fn filter_actionable(plan: &SyncPlan) -> Vec<TableDiff> {
    plan.tables_to_sync
        .iter()
        .filter(|diff| {
            diff.refreshed
                || !diff.ids_to_delete.is_empty()
                || diff.remote_count != diff.local_count
                || diff.has_updates
                || diff.is_child
        })
        .cloned()
        .collect()
}

pub struct Analyzer<'a> {
    adapter: &'a dyn DatabaseAdapter,
}

impl<'a> Analyzer<'a> {
    pub fn new(adapter: &'a dyn DatabaseAdapter) -> Self {
        Self { adapter }
    }

    /// Produce a diff for every table in `tables` (already scoped).
    pub async fn analyze(
        &self,
        syncer: &DataSyncer<'_>,
        source: &Database,
        target: &Database,
        tables: &[String],
    ) -> Result<Vec<TableDiff>> {
        let mut diffs = Vec::with_capacity(tables.len());
        for table in tables {
            diffs.push(self.analyze_table(syncer, source, target, table).await?);
        }
        let pending = diffs.iter().filter(|d| d.needs_sync).count();
        info!(tables = tables.len(), pending, "Analysis complete");
        Ok(diffs)
    }

    pub async fn analyze_table(
        &self,
        syncer: &DataSyncer<'_>,
        source: &Database,
        target: &Database,
        table: &str,
    ) -> Result<TableDiff> {
        let local = self.adapter.table_metadata(target, table).await;
        let remote = self.adapter.table_metadata(source, table).await;

        if local.error || remote.error {
            debug!(table, "Metadata unavailable; forcing sync");
            return Ok(evaluate(table, &local, &remote, Vec::new()));
        }

        let mut ids_to_delete = Vec::new();
        if local.count > 0 {
            if let Some(pk) = self.adapter.primary_key_column(source, table).await? {
                ids_to_delete = syncer.get_ids_to_delete(source, target, table, &pk).await?;
            }
        }
        Ok(evaluate(table, &local, &remote, ids_to_delete))
    }

    /// Keep diffs that need syncing, tag the ones being structurally
    /// refreshed, and close over FK parents.
    pub fn build_plan(
        &self,
        diffs: Vec<TableDiff>,
        refresh: &RefreshSets,
        graph: &DependencyGraph,
        views_to_refresh: Vec<String>,
    ) -> SyncPlan {
        let refresh_tables = refresh.tables();

        let mut included: Vec<TableDiff> = diffs
            .into_iter()
            .filter(|d| d.needs_sync)
            .map(|mut d| {
                if refresh_tables.contains(&d.table) {
                    d.refreshed = true;
                }
                d
            })
            .collect();

        // Parent closure: every included table pulls in its FK parents so
        // the upsert ordering has the full ancestor context.
        let mut index = 0;
        while index < included.len() {
            let parents = graph.parents_of(&included[index].table);
            for parent in parents {
                if !included.iter().any(|d| d.table == parent) {
                    included.push(TableDiff::parent(&parent));
                }
            }
            index += 1;
        }

        SyncPlan {
            tables_to_sync: included,
            tables_to_refresh: refresh_tables,
            views_to_refresh,
            missing_tables: refresh.missing_tables.clone(),
            changed_tables: refresh.changed_tables.clone(),
            missing_views: refresh.missing_views.clone(),
            changed_views: refresh.changed_views.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(count: i64, max_id: Option<&str>) -> TableMetadata {
        TableMetadata {
            count,
            max_id: max_id.map(|s| s.to_string()),
            ..Default::default()
        }
    }

    fn strings(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn identical_sides_need_no_sync() {
        let diff = evaluate("users", &meta(10, Some("10")), &meta(10, Some("10")), vec![]);
        assert!(!diff.needs_sync);
        assert!(!diff.has_updates);
        assert!(!diff.metadata_error);
    }

    #[test]
    fn count_difference_triggers_sync() {
        let diff = evaluate("users", &meta(8, Some("10")), &meta(10, Some("10")), vec![]);
        assert!(diff.needs_sync);
    }

    #[test]
    fn max_id_difference_triggers_sync() {
        let diff = evaluate("users", &meta(10, Some("9")), &meta(10, Some("10")), vec![]);
        assert!(diff.needs_sync);
    }

    #[test]
    fn pending_deletes_trigger_sync() {
        let diff = evaluate(
            "users",
            &meta(10, Some("10")),
            &meta(10, Some("10")),
            strings(&["3"]),
        );
        assert!(diff.needs_sync);
        assert_eq!(diff.ids_to_delete, strings(&["3"]));
    }

    #[test]
    fn updated_at_drift_triggers_sync() {
        let mut local = meta(10, Some("10"));
        let mut remote = meta(10, Some("10"));
        local.has_updated_at = true;
        remote.has_updated_at = true;
        local.max_updated_at = Some("2026-01-01 00:00:00".to_string());
        remote.max_updated_at = Some("2026-02-01 00:00:00".to_string());

        let diff = evaluate("users", &local, &remote, vec![]);
        assert!(diff.needs_sync);
        assert!(diff.has_updates);
    }

    #[test]
    fn one_sided_updated_at_is_ignored() {
        let mut local = meta(10, Some("10"));
        let remote = meta(10, Some("10"));
        local.has_updated_at = true;
        local.max_updated_at = Some("2026-01-01 00:00:00".to_string());

        let diff = evaluate("users", &local, &remote, vec![]);
        assert!(!diff.needs_sync);
    }

    #[test]
    fn metadata_error_forces_sync() {
        let diff = evaluate("users", &TableMetadata::failed(), &meta(10, None), vec![]);
        assert!(diff.needs_sync);
        assert!(diff.metadata_error);
    }

    #[test]
    fn scope_drops_excluded_and_intersects() {
        let all = strings(&["users", "orders", "audit_log", "sessions"]);
        let excluded = strings(&["audit_log", "sessions"]);

        let scoped = scope_tables(&all, &excluded, None, false);
        assert_eq!(scoped, strings(&["users", "orders"]));

        let only = strings(&["orders", "audit_log", "ghost"]);
        let scoped = scope_tables(&all, &excluded, Some(&only), false);
        assert_eq!(scoped, strings(&["orders"]));

        let scoped = scope_tables(&all, &excluded, Some(&only), true);
        assert_eq!(scoped, strings(&["orders", "audit_log"]));
    }

    #[test]
    fn plan_closes_over_parents() {
        let mut graph = DependencyGraph::default();
        graph.add_dependency("orders", "users");
        graph.add_dependency("order_items", "orders");

        let diffs = vec![TableDiff {
            table: "order_items".to_string(),
            needs_sync: true,
            remote_count: 5,
            ..Default::default()
        }];

        let analyzer_plan = Analyzer::new(&crate::adapter::PostgresAdapter::new()).build_plan(
            diffs,
            &RefreshSets::default(),
            &graph,
            vec![],
        );

        let names: Vec<&str> = analyzer_plan
            .tables_to_sync
            .iter()
            .map(|d| d.table.as_str())
            .collect();
        assert_eq!(names, vec!["order_items", "orders", "users"]);
        assert!(analyzer_plan.tables_to_sync[1].is_parent);
        assert!(analyzer_plan.tables_to_sync[2].is_parent);
    }

    #[test]
    fn refreshed_tables_are_tagged() {
        let graph = DependencyGraph::default();
        let refresh = RefreshSets {
            changed_tables: strings(&["users"]),
            ..Default::default()
        };
        let diffs = vec![TableDiff {
            table: "users".to_string(),
            needs_sync: true,
            ..Default::default()
        }];

        let plan = Analyzer::new(&crate::adapter::PostgresAdapter::new()).build_plan(
            diffs,
            &refresh,
            &graph,
            vec![],
        );
        assert!(plan.tables_to_sync[0].refreshed);
        assert_eq!(plan.tables_to_refresh, strings(&["users"]));
    }

    #[test]
    fn actionable_filter() {
        let plan = SyncPlan {
            tables_to_sync: vec![
                TableDiff {
                    table: "refreshed".to_string(),
                    needs_sync: true,
                    refreshed: true,
                    ..Default::default()
                },
                TableDiff {
                    table: "deletes".to_string(),
                    needs_sync: true,
                    ids_to_delete: strings(&["1"]),
                    ..Default::default()
                },
                TableDiff {
                    table: "drift".to_string(),
                    needs_sync: true,
                    local_count: 1,
                    remote_count: 2,
                    ..Default::default()
                },
                TableDiff {
                    table: "cascade_child".to_string(),
                    is_child: true,
                    ..Default::default()
                },
                // Parent pulled in by closure with no differences of its own.
                TableDiff {
                    table: "quiet_parent".to_string(),
                    is_parent: true,
                    ..Default::default()
                },
            ],
            ..Default::default()
        };

        let actionable = filter_actionable(&plan);
        let names: Vec<&str> = actionable.iter().map(|d| d.table.as_str()).collect();
        assert_eq!(names, vec!["refreshed", "deletes", "drift", "cascade_child"]);
    }
}
