//! Database adapter contract
//!
//! All DBMS-specific SQL lives behind this trait: metadata introspection,
//! dump/restore tool invocation, upsert rendering and the recursive
//! traversal of self-referencing tables. One adapter (PostgreSQL) ships in
//! this crate; the rest of the engine only sees the contract.

mod postgres;

pub use postgres::PostgresAdapter;

use crate::config::DbSettings;
use crate::db::Database;
use crate::error::Result;
use crate::graph::DependencyGraph;
use crate::stats::TableStats;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// A database row as a column → JSON value map.
pub type Record = BTreeMap<String, serde_json::Value>;

/// Auxiliary key carrying traversal depth on self-referencing records.
/// Stripped before a record is written anywhere.
pub const DEPTH_KEY: &str = "_depth";

/// Counts and freshness markers for one table on one side.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableMetadata {
    pub count: i64,
    pub has_updated_at: bool,
    /// Max of `updated_at`, textual. Read only when the column exists and
    /// the table is non-empty.
    pub max_updated_at: Option<String>,
    /// Max of a column literally named `id`, textual. Absence of the column
    /// is not an error.
    pub max_id: Option<String>,
    /// Set when the primary COUNT(*) probe failed.
    pub error: bool,
}

impl TableMetadata {
    pub fn failed() -> Self {
        Self {
            error: true,
            ..Default::default()
        }
    }
}

/// A UNIQUE constraint on a target table (primary keys excluded).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueConstraint {
    pub name: String,
    pub columns: Vec<String>,
}

/// The DBMS-specific surface the sync engine runs on.
///
/// Shell-tool operations (`dump_*`, `*_backup`) take connection settings
/// rather than a live pool because they spawn the DBMS's own CLI tools.
/// Operations returning stats or bools swallow row-level errors by
/// contract; everything else fails with an adapter error.
#[async_trait]
pub trait DatabaseAdapter: Send + Sync {
    /// Full bidirectional FK graph for the schema.
    async fn foreign_key_dependencies(&self, db: &Database) -> Result<DependencyGraph>;

    /// Tables with an FK into `table`, mapped to the referencing column.
    /// Excludes `table` itself even when self-referencing.
    async fn child_tables(&self, db: &Database, table: &str)
        -> Result<BTreeMap<String, String>>;

    /// First FK column on `table` that references `table` itself.
    async fn self_referencing_column(&self, db: &Database, table: &str)
        -> Result<Option<String>>;

    async fn primary_key_column(&self, db: &Database, table: &str) -> Result<Option<String>>;

    /// UNIQUE constraints on `table`, primary key excluded.
    async fn unique_constraints(&self, db: &Database, table: &str)
        -> Result<Vec<UniqueConstraint>>;

    /// Set every sequence-backed column's sequence to max(column) (or 1 for
    /// an empty table), continuing past per-sequence failures. Returns how
    /// many succeeded.
    async fn reset_sequences(&self, db: &Database) -> Result<usize>;

    /// Schema-only dump of `tables`, owner and ACL stripped. Empty input
    /// yields an empty string.
    fn dump_schema(&self, settings: &DbSettings, tables: &[String]) -> Result<String>;

    fn dump_views_schema(&self, settings: &DbSettings, views: &[String]) -> Result<String>;

    /// Split a dump into executable statements, dropping comments, blank
    /// lines, session `SET`s and configuration-function calls.
    fn parse_sql_statements(&self, sql: &str) -> Vec<String>;

    /// Compressed full dump into `dir`; returns the backup file path.
    fn create_backup(&self, settings: &DbSettings, dir: &Path) -> Result<PathBuf>;

    fn restore_backup(&self, settings: &DbSettings, path: &Path) -> Result<()>;

    async fn tables_list(&self, db: &Database) -> Result<Vec<String>>;

    async fn views_list(&self, db: &Database) -> Result<Vec<String>>;

    async fn table_exists(&self, db: &Database, table: &str) -> Result<bool>;

    async fn view_exists(&self, db: &Database, view: &str) -> Result<bool>;

    /// DROP TABLE CASCADE; errors are swallowed to `false`.
    async fn drop_table(&self, db: &Database, table: &str) -> bool;

    /// DROP VIEW CASCADE; errors are swallowed.
    async fn drop_view(&self, db: &Database, view: &str) -> bool;

    /// Drop and recreate the schema, restoring default grants.
    async fn drop_schema(&self, db: &Database) -> Result<()>;

    /// Execute one schema statement as-is.
    async fn execute_statement(&self, db: &Database, sql: &str) -> Result<()>;

    /// Single-row insert-or-update keyed on `pk`. Row errors are counted,
    /// never raised.
    async fn upsert_record(
        &self,
        db: &Database,
        table: &str,
        record: &Record,
        pk: &str,
    ) -> TableStats;

    /// Plain batch insert for tables without a usable primary key and for
    /// clone-mode loads into an empty target.
    async fn insert_records(&self, db: &Database, table: &str, records: &[Record])
        -> TableStats;

    /// Counts and freshness markers; collapses to `error: true` only when
    /// the COUNT(*) probe fails.
    async fn table_metadata(&self, db: &Database, table: &str) -> TableMetadata;

    /// Column-by-column structural comparison; errors count as changed.
    async fn has_structure_changed(
        &self,
        source: &Database,
        target: &Database,
        table: &str,
    ) -> bool;

    /// Normalized view-definition comparison; errors count as changed.
    async fn has_view_structure_changed(
        &self,
        source: &Database,
        target: &Database,
        view: &str,
    ) -> bool;

    /// One page of full rows, stably ordered. `order_by` defaults to the
    /// physical row order when no primary key is available.
    async fn fetch_records(
        &self,
        db: &Database,
        table: &str,
        order_by: Option<&str>,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Record>>;

    /// One page of primary-key values, textual.
    async fn fetch_ids(
        &self,
        db: &Database,
        table: &str,
        pk: &str,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<String>>;

    /// Every primary-key value, textual, in key order.
    async fn all_ids(&self, db: &Database, table: &str, pk: &str) -> Result<Vec<String>>;

    /// All rows of a self-referencing table, depth-ordered (roots first,
    /// ties broken by `pk`), each carrying [`DEPTH_KEY`].
    async fn self_referencing_records(
        &self,
        db: &Database,
        table: &str,
        pk: &str,
        fk: &str,
    ) -> Result<Vec<Record>>;

    /// Delete rows whose `column` is in `ids`; returns rows deleted.
    async fn delete_ids(
        &self,
        db: &Database,
        table: &str,
        column: &str,
        ids: &[String],
    ) -> Result<u64>;

    /// Primary keys of local rows matching `record` on the constraint's
    /// columns while differing on `pk`.
    async fn find_conflicting_ids(
        &self,
        db: &Database,
        table: &str,
        constraint: &UniqueConstraint,
        record: &Record,
        pk: &str,
    ) -> Result<Vec<String>>;
}
