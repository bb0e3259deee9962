//! Schema refresh: detect drifted structures, drop and recreate them from
//! source-dumped SQL
//!
//! Dumps taken from a scope-restricted extract can reference objects outside
//! the extract; constraints on such objects are skipped and accounted for
//! instead of widening the scope behind the caller's back.

use crate::adapter::DatabaseAdapter;
use crate::config::DbSettings;
use crate::db::Database;
use crate::error::Result;
use crate::graph::{DependencyGraph, Direction};
use tracing::{info, warn};

/// Tables and views whose structure must be rebuilt.
#[derive(Debug, Clone, Default)]
pub struct RefreshSets {
    pub missing_tables: Vec<String>,
    pub changed_tables: Vec<String>,
    pub missing_views: Vec<String>,
    pub changed_views: Vec<String>,
}

impl RefreshSets {
    pub fn tables(&self) -> Vec<String> {
        let mut all = self.missing_tables.clone();
        all.extend(self.changed_tables.iter().cloned());
        all
    }

    pub fn views(&self) -> Vec<String> {
        let mut all = self.missing_views.clone();
        all.extend(self.changed_views.iter().cloned());
        all
    }

    pub fn is_empty(&self) -> bool {
        self.missing_tables.is_empty()
            && self.changed_tables.is_empty()
            && self.missing_views.is_empty()
            && self.changed_views.is_empty()
    }
}

/// Outcome of one structure refresh.
#[derive(Debug, Clone, Default)]
pub struct RefreshOutcome {
    pub created_tables: usize,
    pub created_sequences: usize,
    pub created_constraints: usize,
    pub skipped_fk: usize,
    pub errors: Vec<String>,
}

/// Classification of one schema statement after execution failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureKind {
    /// FK onto an object outside the refresh scope; intentionally skipped.
    SkippedForeignKey,
    Error,
}

fn classify_failure(statement: &str, error_text: &str) -> FailureKind {
    if statement.contains("FOREIGN KEY") && error_text.contains("does not exist") {
        FailureKind::SkippedForeignKey
    } else {
        FailureKind::Error
    }
}

/// Bump the right creation counter for a successfully applied statement.
fn count_statement(outcome: &mut RefreshOutcome, statement: &str) {
    if statement.contains("CREATE TABLE") {
        outcome.created_tables += 1;
    } else if statement.contains("CREATE SEQUENCE") {
        outcome.created_sequences += 1;
    } else if statement.contains("ADD CONSTRAINT") {
        outcome.created_constraints += 1;
    }
}

pub struct SchemaManager<'a> {
    adapter: &'a dyn DatabaseAdapter,
    graph: &'a DependencyGraph,
}

impl<'a> SchemaManager<'a> {
    pub fn new(adapter: &'a dyn DatabaseAdapter, graph: &'a DependencyGraph) -> Self {
        Self { adapter, graph }
    }

    /// Partition the source's tables and views into missing (absent on
    /// target) and changed (present but structurally different).
    pub async fn find_tables_needing_refresh(
        &self,
        source: &Database,
        target: &Database,
        remote_tables: &[String],
        remote_views: &[String],
    ) -> Result<RefreshSets> {
        let mut sets = RefreshSets::default();

        for table in remote_tables {
            if !self.adapter.table_exists(target, table).await? {
                sets.missing_tables.push(table.clone());
            } else if self.adapter.has_structure_changed(source, target, table).await {
                sets.changed_tables.push(table.clone());
            }
        }
        for view in remote_views {
            if !self.adapter.view_exists(target, view).await? {
                sets.missing_views.push(view.clone());
            } else if self
                .adapter
                .has_view_structure_changed(source, target, view)
                .await
            {
                sets.changed_views.push(view.clone());
            }
        }
        Ok(sets)
    }

    /// Drop `tables` children-first, dump their schema from source
    /// parents-first, and re-apply statement by statement. No single
    /// statement failure aborts the refresh.
    pub async fn refresh_tables_structure(
        &self,
        target: &Database,
        source_settings: &DbSettings,
        tables: &[String],
        views: &[String],
    ) -> Result<RefreshOutcome> {
        let mut outcome = RefreshOutcome::default();

        if !tables.is_empty() {
            let drop_order = self.graph.sort(tables, Direction::ChildrenFirst);
            for table in &drop_order {
                self.adapter.drop_table(target, table).await;
            }

            let create_order = self.graph.sort(tables, Direction::ParentsFirst);
            let dump = self.adapter.dump_schema(source_settings, &create_order)?;
            let statements = self.adapter.parse_sql_statements(&dump);
            info!(
                tables = tables.len(),
                statements = statements.len(),
                "Recreating table structures"
            );

            for statement in &statements {
                match self.adapter.execute_statement(target, statement).await {
                    Ok(()) => count_statement(&mut outcome, statement),
                    Err(e) => match classify_failure(statement, &e.to_string()) {
                        FailureKind::SkippedForeignKey => {
                            warn!("Skipped FK onto out-of-scope table: {}", e);
                            outcome.skipped_fk += 1;
                        }
                        FailureKind::Error => outcome.errors.push(e.to_string()),
                    },
                }
            }
        }

        if !views.is_empty() {
            for view in views {
                self.adapter.drop_view(target, view).await;
            }
            let dump = self.adapter.dump_views_schema(source_settings, views)?;
            for statement in &self.adapter.parse_sql_statements(&dump) {
                if let Err(e) = self.adapter.execute_statement(target, statement).await {
                    outcome.errors.push(format!("VIEW: {}", e));
                }
            }
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fk_onto_missing_table_is_skipped() {
        let statement = "ALTER TABLE ONLY orders \
                         ADD CONSTRAINT orders_user_id_fkey FOREIGN KEY (user_id) REFERENCES users(id);";
        let kind = classify_failure(statement, "relation \"users\" does not exist");
        assert_eq!(kind, FailureKind::SkippedForeignKey);
    }

    #[test]
    fn other_failures_are_errors() {
        let statement = "CREATE TABLE orders (id integer);";
        assert_eq!(
            classify_failure(statement, "relation \"orders\" does not exist"),
            FailureKind::Error
        );

        let fk_statement = "ALTER TABLE ONLY orders \
                            ADD CONSTRAINT c FOREIGN KEY (user_id) REFERENCES users(id);";
        assert_eq!(
            classify_failure(fk_statement, "permission denied"),
            FailureKind::Error
        );
    }

    #[test]
    fn statement_counters() {
        let mut outcome = RefreshOutcome::default();
        count_statement(&mut outcome, "CREATE TABLE users (id integer);");
        count_statement(&mut outcome, "CREATE SEQUENCE users_id_seq;");
        count_statement(
            &mut outcome,
            "ALTER TABLE ONLY users ADD CONSTRAINT users_pkey PRIMARY KEY (id);",
        );
        count_statement(&mut outcome, "CREATE INDEX idx ON users (id);");

        assert_eq!(outcome.created_tables, 1);
        assert_eq!(outcome.created_sequences, 1);
        assert_eq!(outcome.created_constraints, 1);
    }

    #[test]
    fn refresh_sets_union_and_emptiness() {
        let sets = RefreshSets {
            missing_tables: vec!["a".to_string()],
            changed_tables: vec!["b".to_string()],
            missing_views: vec![],
            changed_views: vec!["v".to_string()],
        };
        assert_eq!(sets.tables(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(sets.views(), vec!["v".to_string()]);
        assert!(!sets.is_empty());
        assert!(RefreshSets::default().is_empty());
    }
}
