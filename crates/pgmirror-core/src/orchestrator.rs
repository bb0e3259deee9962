//! Command orchestration: pull, clone and restore
//!
//! Drives the phases in their required order: analyze, backup, schema
//! refresh, children-first deletes, parents-first upserts, cascade recheck,
//! view refresh and sequence reset. Structural failures abort the command;
//! row-level failures are counted and reported.

use crate::adapter::{DatabaseAdapter, PostgresAdapter};
use crate::analyzer::{filter_actionable, scope_tables, Analyzer, SyncPlan, TableDiff};
use crate::backup::BackupManager;
use crate::config::{Config, ConnectionSettings, DbSettings};
use crate::db::Database;
use crate::error::{Error, Result};
use crate::graph::{DependencyGraph, Direction, GraphCache};
use crate::schema::SchemaManager;
use crate::stats::SyncResults;
use crate::syncer::DataSyncer;
use crate::tunnel::{RetryPolicy, Tunnel};
use std::collections::{BTreeSet, HashSet};
use std::io::{BufRead, IsTerminal, Write};
use tracing::{debug, info, warn};

/// Options shared by the pull and clone commands, straight from the CLI.
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    pub connection: Option<String>,
    pub tables: Option<Vec<String>>,
    pub views: Option<Vec<String>>,
    pub include_excluded: bool,
    pub force: bool,
    pub dry_run: bool,
    pub skip_backup: bool,
    pub batch_size: Option<usize>,
    pub memory_limit_mb: Option<i64>,
    pub analyze_only: bool,
    pub skip_sequences: bool,
    pub skip_views: bool,
    pub skip_sync_data: bool,
}

/// Which views are in scope, given the table/view flags.
///
/// Naming tables without naming views implies views are skipped.
fn view_scope(
    remote_views: &[String],
    tables: Option<&[String]>,
    views: Option<&[String]>,
) -> Vec<String> {
    match (tables, views) {
        (_, Some(wanted)) => remote_views
            .iter()
            .filter(|v| wanted.contains(v))
            .cloned()
            .collect(),
        (Some(_), None) => Vec::new(),
        (None, None) => remote_views.to_vec(),
    }
}

/// Children of the tables that lost rows or were rebuilt, minus tables
/// already handled and tables out of scope.
fn cascade_candidates(
    graph: &DependencyGraph,
    sources: &[String],
    processed: &HashSet<String>,
    excluded: &[String],
    include_excluded: bool,
) -> Vec<String> {
    let mut candidates: BTreeSet<String> = BTreeSet::new();
    for parent in sources {
        for child in graph.children_of(parent) {
            if processed.contains(&child) {
                continue;
            }
            if !include_excluded && excluded.contains(&child) {
                continue;
            }
            candidates.insert(child);
        }
    }
    candidates.into_iter().collect()
}

fn adapter_for(driver: &str) -> Result<Box<dyn DatabaseAdapter>> {
    match driver {
        "postgres" => Ok(Box::new(PostgresAdapter::new())),
        other => Err(Error::Config(format!("Unknown driver '{}'", other))),
    }
}

/// Everything a single command run needs: resolved connection, open tunnel
/// and connected pools.
struct Session {
    connection: ConnectionSettings,
    /// Source settings as reachable from here (routed through the tunnel).
    source_settings: DbSettings,
    tunnel: Option<Tunnel>,
    source: Database,
    target: Database,
    batch_size: usize,
}

impl Session {
    async fn close(&self) {
        self.source.close().await;
        self.target.close().await;
        if let Some(tunnel) = &self.tunnel {
            tunnel.close().await;
        }
    }
}

pub struct Orchestrator {
    config: Config,
    options: SyncOptions,
    retry: RetryPolicy,
}

impl Orchestrator {
    pub fn new(config: Config, options: SyncOptions) -> Self {
        Self {
            config,
            options,
            retry: RetryPolicy::default(),
        }
    }

    /// Incremental sync: converge the target to the source with the
    /// minimum row-level work plus targeted schema rebuilds.
    pub async fn pull(&self) -> Result<()> {
        let adapter = self.open_adapter()?;
        let session = self.open_session().await?;
        let result = self.run_pull(adapter.as_ref(), &session).await;
        session.close().await;
        result
    }

    /// Full clone: drop and recreate every in-scope object, then reload.
    pub async fn clone_database(&self) -> Result<()> {
        let adapter = self.open_adapter()?;
        let session = self.open_session().await?;
        let result = self.run_clone(adapter.as_ref(), &session).await;
        session.close().await;
        result
    }

    /// Restore the target from a backup (newest, or `file` by exact name,
    /// path or substring). With `list`, print retained backups instead.
    pub async fn restore(&self, file: Option<&str>, list: bool) -> Result<()> {
        let adapter = self.open_adapter()?;
        let (_, connection) = self.config.connection(self.options.connection.as_deref())?;
        let manager = BackupManager::new(adapter.as_ref());
        let dir = self.config.backup.dir();

        if list {
            let records = manager.list(&dir)?;
            if records.is_empty() {
                println!("No backups in {}", dir.display());
                return Ok(());
            }
            println!("Backups in {}:", dir.display());
            for record in records {
                println!(
                    "  {}  {:>10}  {}",
                    record.filename,
                    record.human_size(),
                    record.human_date()
                );
            }
            return Ok(());
        }

        let record = match file {
            Some(name) => manager.find(name, &dir)?,
            None => manager
                .list(&dir)?
                .into_iter()
                .next()
                .ok_or_else(|| Error::Restore(format!("no backups in {}", dir.display())))?,
        };

        if !self.confirm(&format!(
            "Restore '{}' into '{}'? This overwrites local data.",
            record.filename, connection.target.database
        )) {
            println!("Aborted.");
            return Ok(());
        }

        manager.restore(&connection.target, &record.path)?;
        println!("Restored {}", record.filename);
        Ok(())
    }

    fn open_adapter(&self) -> Result<Box<dyn DatabaseAdapter>> {
        let (_, connection) = self.config.connection(self.options.connection.as_deref())?;
        adapter_for(&connection.source.driver)
    }

    async fn open_session(&self) -> Result<Session> {
        let (name, connection) = self.config.connection(self.options.connection.as_deref())?;
        info!(connection = name, "Starting sync session");

        if let Some(limit) = self.options.memory_limit_mb {
            debug!(limit_mb = limit, "Memory limit noted; rows are streamed in batches");
        }

        let tunnel = match &connection.tunnel {
            Some(settings) => {
                let tunnel = Tunnel::new(settings.clone());
                tunnel.open().await?;
                // Tear the tunnel down and leave cleanly on ctrl-c.
                let handle = tunnel.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        handle.close().await;
                        std::process::exit(0);
                    }
                });
                Some(tunnel)
            }
            None => None,
        };

        let source_settings = match &tunnel {
            Some(tunnel) => {
                let (host, port) = tunnel.endpoint();
                connection.source.through(host, port)
            }
            None => connection.source.clone(),
        };

        let source = Database::connect("source", &source_settings, None).await?;
        source
            .health_check()
            .await
            .map_err(|e| Error::Tunnel(format!("source connection failed: {}", e)))?;
        let target = Database::connect("target", &connection.target, None).await?;
        target.health_check().await?;

        Ok(Session {
            connection: connection.clone(),
            source_settings,
            tunnel,
            source,
            target,
            batch_size: self.options.batch_size.unwrap_or_else(|| self.config.batch_size()),
        })
    }

    async fn run_pull(&self, adapter: &dyn DatabaseAdapter, session: &Session) -> Result<()> {
        let mut graph_cache = GraphCache::default();
        let graph = graph_cache.build(adapter, &session.source).await?;

        let mut syncer = DataSyncer::new(adapter, session.batch_size, self.retry);
        let analyzer = Analyzer::new(adapter);
        let schema = SchemaManager::new(adapter, &graph);

        let remote_tables = self
            .retry
            .run(|| async { adapter.tables_list(&session.source).await })
            .await?;
        let remote_views = self
            .retry
            .run(|| async { adapter.views_list(&session.source).await })
            .await?;

        let scoped = scope_tables(
            &remote_tables,
            &session.connection.excluded_tables,
            self.options.tables.as_deref(),
            self.options.include_excluded,
        );
        let scoped_views = view_scope(
            &remote_views,
            self.options.tables.as_deref(),
            self.options.views.as_deref(),
        );
        if scoped.is_empty() {
            println!("Nothing to sync: no tables in scope.");
            return Ok(());
        }

        let diffs = analyzer
            .analyze(&syncer, &session.source, &session.target, &scoped)
            .await?;
        let refresh = schema
            .find_tables_needing_refresh(
                &session.source,
                &session.target,
                &scoped,
                &scoped_views,
            )
            .await?;
        let plan = analyzer.build_plan(diffs, &refresh, &graph, refresh.views());

        if !plan.is_empty() && !self.options.skip_backup {
            let manager = BackupManager::new(adapter);
            let dir = self.config.backup.dir();
            manager.create(&session.connection.target, &dir)?;
            manager.cleanup(&dir, self.config.backup.keep_last())?;
        }

        if self.options.analyze_only {
            self.print_analysis(&plan);
            return Ok(());
        }

        let actionable = filter_actionable(&plan);
        if actionable.is_empty() {
            println!("Already in sync.");
            return Ok(());
        }

        if self.options.dry_run {
            self.print_plan(&actionable, &plan);
            return Ok(());
        }

        if !self.confirm(&format!(
            "Sync {} table(s) into '{}'?",
            actionable.len(),
            session.connection.target.database
        )) {
            println!("Aborted.");
            return Ok(());
        }

        let mut results = SyncResults::default();

        // Structure first: missing and changed tables are rebuilt before
        // any rows move.
        if !plan.tables_to_refresh.is_empty() {
            let outcome = schema
                .refresh_tables_structure(
                    &session.target,
                    &session.source_settings,
                    &plan.tables_to_refresh,
                    &[],
                )
                .await?;
            info!(
                tables = outcome.created_tables,
                sequences = outcome.created_sequences,
                constraints = outcome.created_constraints,
                skipped_fk = outcome.skipped_fk,
                "Structure refresh done"
            );
            for error in &outcome.errors {
                warn!("Schema statement failed: {}", error);
            }
        }

        // DELETE phase, children first. Refreshed tables were just rebuilt
        // empty; there is nothing to delete from them.
        let delete_names: Vec<String> = actionable
            .iter()
            .filter(|d| !d.ids_to_delete.is_empty() && !d.refreshed)
            .map(|d| d.table.clone())
            .collect();
        for table in graph.sort(&delete_names, Direction::ChildrenFirst) {
            let Some(diff) = actionable.iter().find(|d| d.table == table) else {
                continue;
            };
            if let Some(pk) = adapter.primary_key_column(&session.source, &table).await? {
                let stats = syncer
                    .delete_from_table(&session.target, &table, &pk, &diff.ids_to_delete)
                    .await;
                results.record(&table, stats);
            }
        }

        // UPSERT phase, parents first.
        let upsert_names: Vec<String> = actionable
            .iter()
            .filter(|d| !d.is_child)
            .map(|d| d.table.clone())
            .collect();
        for table in graph.sort(&upsert_names, Direction::ParentsFirst) {
            let stats = syncer
                .sync_table_from_remote(&session.source, &session.target, &table)
                .await?;
            results.record(&table, stats);
        }

        self.cascade_recheck(
            adapter,
            session,
            &graph,
            &analyzer,
            &mut syncer,
            &actionable,
            &mut results,
        )
        .await?;

        if !plan.views_to_refresh.is_empty() {
            let outcome = schema
                .refresh_tables_structure(
                    &session.target,
                    &session.source_settings,
                    &[],
                    &plan.views_to_refresh,
                )
                .await?;
            for error in &outcome.errors {
                warn!("View refresh statement failed: {}", error);
            }
        }

        if !self.options.skip_sequences {
            let reset = adapter.reset_sequences(&session.target).await?;
            info!(sequences = reset, "Sequences reset");
        }

        self.print_results(&results);
        Ok(())
    }

    /// Second analysis+sync pass over children of tables that lost rows or
    /// were rebuilt. Orphan rows surface here and are deleted.
    #[allow(clippy::too_many_arguments)]
    async fn cascade_recheck(
        &self,
        adapter: &dyn DatabaseAdapter,
        session: &Session,
        graph: &DependencyGraph,
        analyzer: &Analyzer<'_>,
        syncer: &mut DataSyncer<'_>,
        actionable: &[TableDiff],
        results: &mut SyncResults,
    ) -> Result<()> {
        let sources: Vec<String> = actionable
            .iter()
            .filter(|d| d.refreshed || results.get(&d.table).deleted > 0)
            .map(|d| d.table.clone())
            .collect();
        if sources.is_empty() {
            return Ok(());
        }

        let processed: HashSet<String> =
            actionable.iter().map(|d| d.table.clone()).collect();
        let candidates = cascade_candidates(
            graph,
            &sources,
            &processed,
            &session.connection.excluded_tables,
            self.options.include_excluded,
        );
        if candidates.is_empty() {
            return Ok(());
        }
        info!(children = candidates.len(), "Cascade recheck");

        let diffs = analyzer
            .analyze(syncer, &session.source, &session.target, &candidates)
            .await?;
        let pending: Vec<TableDiff> = diffs
            .into_iter()
            .filter(|d| d.needs_sync)
            .map(|mut d| {
                d.is_child = true;
                d
            })
            .collect();
        if pending.is_empty() {
            return Ok(());
        }

        let delete_names: Vec<String> = pending
            .iter()
            .filter(|d| !d.ids_to_delete.is_empty())
            .map(|d| d.table.clone())
            .collect();
        for table in graph.sort(&delete_names, Direction::ChildrenFirst) {
            let Some(diff) = pending.iter().find(|d| d.table == table) else {
                continue;
            };
            if let Some(pk) = adapter.primary_key_column(&session.source, &table).await? {
                let stats = syncer
                    .delete_from_table(&session.target, &table, &pk, &diff.ids_to_delete)
                    .await;
                results.record(&table, stats);
            }
        }

        // Children are synced in this pass; the main-phase child skip does
        // not apply here.
        let upsert_names: Vec<String> = pending.iter().map(|d| d.table.clone()).collect();
        for table in graph.sort(&upsert_names, Direction::ParentsFirst) {
            let stats = syncer
                .sync_table_from_remote(&session.source, &session.target, &table)
                .await?;
            results.record(&table, stats);
        }
        Ok(())
    }

    async fn run_clone(&self, adapter: &dyn DatabaseAdapter, session: &Session) -> Result<()> {
        let mut graph_cache = GraphCache::default();
        let graph = graph_cache.build(adapter, &session.source).await?;
        let mut syncer = DataSyncer::new(adapter, session.batch_size, self.retry);
        let schema = SchemaManager::new(adapter, &graph);

        let remote_tables = self
            .retry
            .run(|| async { adapter.tables_list(&session.source).await })
            .await?;
        let remote_views = self
            .retry
            .run(|| async { adapter.views_list(&session.source).await })
            .await?;

        // Structure scope keeps excluded tables (they are cloned
        // structure-only); the data walk drops them.
        let structure_scope = scope_tables(&remote_tables, &[], self.options.tables.as_deref(), true);
        let data_scope = scope_tables(
            &remote_tables,
            &session.connection.excluded_tables,
            self.options.tables.as_deref(),
            self.options.include_excluded,
        );
        if structure_scope.is_empty() {
            println!("Nothing to clone: no tables in scope.");
            return Ok(());
        }

        if self.options.dry_run {
            println!("Would drop and recreate {} table(s):", structure_scope.len());
            for table in &structure_scope {
                let data = if data_scope.contains(table) {
                    "structure + data"
                } else {
                    "structure only"
                };
                println!("  {} ({})", table, data);
            }
            return Ok(());
        }

        if !self.confirm(&format!(
            "Drop and recreate {} table(s) in '{}'? All local data will be replaced.",
            structure_scope.len(),
            session.connection.target.database
        )) {
            println!("Aborted.");
            return Ok(());
        }

        if !self.options.skip_backup {
            let manager = BackupManager::new(adapter);
            let dir = self.config.backup.dir();
            manager.create(&session.connection.target, &dir)?;
            manager.cleanup(&dir, self.config.backup.keep_last())?;
        }

        let views = if self.options.skip_views {
            Vec::new()
        } else {
            view_scope(
                &remote_views,
                self.options.tables.as_deref(),
                self.options.views.as_deref(),
            )
        };

        let outcome = schema
            .refresh_tables_structure(
                &session.target,
                &session.source_settings,
                &structure_scope,
                &views,
            )
            .await?;
        info!(
            tables = outcome.created_tables,
            skipped_fk = outcome.skipped_fk,
            "Clone structure created"
        );
        for error in &outcome.errors {
            warn!("Schema statement failed: {}", error);
        }

        let mut results = SyncResults::default();
        if !self.options.skip_sync_data {
            for table in graph.sort(&data_scope, Direction::ParentsFirst) {
                let stats = syncer
                    .copy_table_from_remote(&session.source, &session.target, &table)
                    .await?;
                results.record(&table, stats);
            }
        }

        let reset = adapter.reset_sequences(&session.target).await?;
        info!(sequences = reset, "Sequences reset");

        self.print_results(&results);
        Ok(())
    }

    /// Ask before destructive phases. `--force` and non-interactive runs
    /// proceed without asking.
    fn confirm(&self, prompt: &str) -> bool {
        if self.options.force || !std::io::stdin().is_terminal() {
            return true;
        }
        print!("{} [y/N] ", prompt);
        let _ = std::io::stdout().flush();

        let mut answer = String::new();
        if std::io::stdin().lock().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
    }

    fn print_analysis(&self, plan: &SyncPlan) {
        println!("Analysis:");
        println!(
            "  {:<32} {:>12} {:>12} {:>9}  flags",
            "table", "local", "remote", "deletes"
        );
        for diff in &plan.tables_to_sync {
            let mut flags: Vec<&str> = Vec::new();
            if diff.refreshed {
                flags.push("refresh");
            }
            if diff.has_updates {
                flags.push("updated");
            }
            if diff.metadata_error {
                flags.push("metadata-error");
            }
            if diff.is_parent {
                flags.push("parent");
            }
            println!(
                "  {:<32} {:>12} {:>12} {:>9}  {}",
                diff.table,
                diff.local_count,
                diff.remote_count,
                diff.ids_to_delete.len(),
                flags.join(",")
            );
        }
        if !plan.missing_tables.is_empty() {
            println!("  Missing tables: {}", plan.missing_tables.join(", "));
        }
        if !plan.changed_tables.is_empty() {
            println!("  Changed tables: {}", plan.changed_tables.join(", "));
        }
        if !plan.missing_views.is_empty() {
            println!("  Missing views: {}", plan.missing_views.join(", "));
        }
        if !plan.changed_views.is_empty() {
            println!("  Changed views: {}", plan.changed_views.join(", "));
        }
    }

    fn print_plan(&self, actionable: &[TableDiff], plan: &SyncPlan) {
        println!("Dry run; would sync {} table(s):", actionable.len());
        for diff in actionable {
            println!(
                "  {} ({} deletes, {} -> {} rows{})",
                diff.table,
                diff.ids_to_delete.len(),
                diff.local_count,
                diff.remote_count,
                if diff.refreshed { ", rebuild" } else { "" }
            );
        }
        if !plan.views_to_refresh.is_empty() {
            println!("Would refresh views: {}", plan.views_to_refresh.join(", "));
        }
    }

    fn print_results(&self, results: &SyncResults) {
        println!();
        println!(
            "{:<32} {:>9} {:>9} {:>9} {:>9}",
            "table", "inserted", "updated", "deleted", "errors"
        );
        for (table, stats) in results.iter() {
            if stats.is_empty() {
                continue;
            }
            println!(
                "{:<32} {:>9} {:>9} {:>9} {:>9}",
                table, stats.inserted, stats.updated, stats.deleted, stats.errors
            );
        }
        let totals = results.totals();
        println!(
            "{:<32} {:>9} {:>9} {:>9} {:>9}",
            "total", totals.inserted, totals.updated, totals.deleted, totals.errors
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn views_follow_the_table_flag() {
        let remote = strings(&["report_view", "stats_view"]);

        // No flags: every view is in scope.
        assert_eq!(view_scope(&remote, None, None), remote);

        // --tables without --views skips views entirely.
        let tables = strings(&["users"]);
        assert!(view_scope(&remote, Some(&tables), None).is_empty());

        // An explicit --views list intersects the remote views.
        let views = strings(&["stats_view", "ghost_view"]);
        assert_eq!(
            view_scope(&remote, Some(&tables), Some(&views)),
            strings(&["stats_view"])
        );
        assert_eq!(
            view_scope(&remote, None, Some(&views)),
            strings(&["stats_view"])
        );
    }

    #[test]
    fn cascade_candidates_skip_processed_and_excluded() {
        let mut graph = DependencyGraph::default();
        graph.add_dependency("order_items", "orders");
        graph.add_dependency("shipments", "orders");
        graph.add_dependency("audit_log", "orders");

        let sources = strings(&["orders"]);
        let processed: HashSet<String> = strings(&["orders", "shipments"]).into_iter().collect();
        let excluded = strings(&["audit_log"]);

        let candidates = cascade_candidates(&graph, &sources, &processed, &excluded, false);
        assert_eq!(candidates, strings(&["order_items"]));

        let candidates = cascade_candidates(&graph, &sources, &processed, &excluded, true);
        assert_eq!(candidates, strings(&["audit_log", "order_items"]));
    }

    #[test]
    fn unknown_driver_is_a_config_error() {
        assert!(adapter_for("postgres").is_ok());
        let err = match adapter_for("mysql") {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert!(matches!(err, Error::Config(_)));
    }
}
