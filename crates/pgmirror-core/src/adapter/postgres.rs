//! PostgreSQL adapter
//!
//! Catalog introspection goes through `pg_constraint`/`pg_attribute` and
//! `information_schema`; dumps and backups shell out to `pg_dump`/`psql`
//! piped through gzip. Row payloads travel as jsonb (`row_to_json` out,
//! `jsonb_populate_record` back in) so no per-type bind dispatch is needed.

use super::{
    DatabaseAdapter, Record, TableMetadata, UniqueConstraint, DEPTH_KEY,
};
use crate::config::DbSettings;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::graph::DependencyGraph;
use crate::stats::TableStats;
use async_trait::async_trait;
use chrono::Local;
use serde_json::Value;
use sqlx::Row;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, warn};

/// The single schema in scope.
const SCHEMA: &str = "public";

#[derive(Debug, Default, Clone, Copy)]
pub struct PostgresAdapter;

impl PostgresAdapter {
    pub fn new() -> Self {
        Self
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// `-h host -p port -U user dbname` for pg_dump/psql, shell-quoted.
fn connection_args(settings: &DbSettings) -> String {
    format!(
        "-h {} -p {} -U {} {}",
        shell_quote(settings.host()),
        settings.port(),
        shell_quote(&settings.username),
        shell_quote(&settings.database)
    )
}

fn record_to_value(record: &Record) -> Value {
    Value::Object(record.clone().into_iter().collect())
}

fn value_to_record(value: Value) -> Record {
    match value {
        Value::Object(map) => map.into_iter().collect(),
        _ => Record::new(),
    }
}

/// Textual form of a JSON scalar for `::text` comparisons.
fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Render the per-row upsert for `table`: insert through
/// `jsonb_populate_record`, update every non-PK column on conflict.
fn upsert_sql(table: &str, pk: &str, columns: &[String]) -> String {
    let assignments: Vec<String> = columns
        .iter()
        .filter(|c| c.as_str() != pk && c.as_str() != DEPTH_KEY)
        .map(|c| format!("{col} = EXCLUDED.{col}", col = quote_ident(c)))
        .collect();

    let conflict = if assignments.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", assignments.join(", "))
    };

    format!(
        "INSERT INTO {table} SELECT * FROM jsonb_populate_record(NULL::{table}, $1) \
         ON CONFLICT ({pk}) {conflict}",
        table = quote_ident(table),
        pk = quote_ident(pk),
        conflict = conflict
    )
}

fn backup_filename(timestamp: &str) -> String {
    format!("db_backup_{}.sql.gz", timestamp)
}

/// Lines that make a restore fatal: `ERROR:` without `already exists`.
fn restore_error_lines(output: &str) -> Vec<String> {
    output
        .lines()
        .filter(|line| line.contains("ERROR:") && !line.contains("already exists"))
        .map(|line| line.trim().to_string())
        .collect()
}

#[async_trait]
impl DatabaseAdapter for PostgresAdapter {
    async fn foreign_key_dependencies(&self, db: &Database) -> Result<DependencyGraph> {
        let rows = sqlx::query(
            "SELECT src.relname AS child, tgt.relname AS parent \
             FROM pg_constraint con \
             JOIN pg_class src ON src.oid = con.conrelid \
             JOIN pg_class tgt ON tgt.oid = con.confrelid \
             JOIN pg_namespace ns ON ns.oid = src.relnamespace \
             WHERE con.contype = 'f' AND ns.nspname = $1 \
             ORDER BY src.relname, tgt.relname",
        )
        .bind(SCHEMA)
        .fetch_all(db.pool())
        .await?;

        let mut graph = DependencyGraph::default();
        for row in rows {
            let child: String = row.get("child");
            let parent: String = row.get("parent");
            graph.add_dependency(&child, &parent);
        }
        debug!(tables = graph.len(), "Loaded FK dependency graph");
        Ok(graph)
    }

    async fn child_tables(
        &self,
        db: &Database,
        table: &str,
    ) -> Result<BTreeMap<String, String>> {
        let rows = sqlx::query(
            "SELECT src.relname AS child, att.attname AS fk_column \
             FROM pg_constraint con \
             JOIN pg_class src ON src.oid = con.conrelid \
             JOIN pg_class tgt ON tgt.oid = con.confrelid \
             JOIN pg_namespace ns ON ns.oid = src.relnamespace \
             JOIN pg_attribute att ON att.attrelid = con.conrelid AND att.attnum = con.conkey[1] \
             WHERE con.contype = 'f' AND ns.nspname = $1 \
               AND tgt.relname = $2 AND src.relname <> $2 \
             ORDER BY src.relname, con.conname",
        )
        .bind(SCHEMA)
        .bind(table)
        .fetch_all(db.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| (row.get("child"), row.get("fk_column")))
            .collect())
    }

    async fn self_referencing_column(
        &self,
        db: &Database,
        table: &str,
    ) -> Result<Option<String>> {
        let column = sqlx::query_scalar::<_, String>(
            "SELECT att.attname \
             FROM pg_constraint con \
             JOIN pg_class src ON src.oid = con.conrelid \
             JOIN pg_class tgt ON tgt.oid = con.confrelid \
             JOIN pg_namespace ns ON ns.oid = src.relnamespace \
             JOIN pg_attribute att ON att.attrelid = con.conrelid AND att.attnum = con.conkey[1] \
             WHERE con.contype = 'f' AND ns.nspname = $1 \
               AND src.relname = $2 AND tgt.relname = $2 \
             ORDER BY con.conname \
             LIMIT 1",
        )
        .bind(SCHEMA)
        .bind(table)
        .fetch_optional(db.pool())
        .await?;
        Ok(column)
    }

    async fn primary_key_column(&self, db: &Database, table: &str) -> Result<Option<String>> {
        let column = sqlx::query_scalar::<_, String>(
            "SELECT att.attname \
             FROM pg_constraint con \
             JOIN pg_class rel ON rel.oid = con.conrelid \
             JOIN pg_namespace ns ON ns.oid = rel.relnamespace \
             JOIN pg_attribute att ON att.attrelid = con.conrelid AND att.attnum = con.conkey[1] \
             WHERE con.contype = 'p' AND ns.nspname = $1 AND rel.relname = $2",
        )
        .bind(SCHEMA)
        .bind(table)
        .fetch_optional(db.pool())
        .await?;
        Ok(column)
    }

    async fn unique_constraints(
        &self,
        db: &Database,
        table: &str,
    ) -> Result<Vec<UniqueConstraint>> {
        let rows = sqlx::query(
            "SELECT con.conname AS name, att.attname AS column_name \
             FROM pg_constraint con \
             JOIN pg_class rel ON rel.oid = con.conrelid \
             JOIN pg_namespace ns ON ns.oid = rel.relnamespace \
             CROSS JOIN LATERAL unnest(con.conkey) WITH ORDINALITY AS k(attnum, ord) \
             JOIN pg_attribute att ON att.attrelid = con.conrelid AND att.attnum = k.attnum \
             WHERE con.contype = 'u' AND ns.nspname = $1 AND rel.relname = $2 \
             ORDER BY con.conname, k.ord",
        )
        .bind(SCHEMA)
        .bind(table)
        .fetch_all(db.pool())
        .await?;

        let mut constraints: Vec<UniqueConstraint> = Vec::new();
        for row in rows {
            let name: String = row.get("name");
            let column: String = row.get("column_name");
            match constraints.last_mut() {
                Some(last) if last.name == name => last.columns.push(column),
                _ => constraints.push(UniqueConstraint {
                    name,
                    columns: vec![column],
                }),
            }
        }
        Ok(constraints)
    }

    async fn reset_sequences(&self, db: &Database) -> Result<usize> {
        let rows = sqlx::query(
            "SELECT rel.relname AS table_name, att.attname AS column_name, \
                    pg_get_serial_sequence(quote_ident(ns.nspname) || '.' || quote_ident(rel.relname), att.attname) AS seq_name \
             FROM pg_attribute att \
             JOIN pg_class rel ON rel.oid = att.attrelid \
             JOIN pg_namespace ns ON ns.oid = rel.relnamespace \
             JOIN pg_attrdef def ON def.adrelid = rel.oid AND def.adnum = att.attnum \
             WHERE ns.nspname = $1 AND rel.relkind = 'r' \
               AND pg_get_expr(def.adbin, def.adrelid) LIKE 'nextval(%' \
             ORDER BY rel.relname, att.attname",
        )
        .bind(SCHEMA)
        .fetch_all(db.pool())
        .await?;

        let mut succeeded = 0usize;
        for row in rows {
            let table: String = row.get("table_name");
            let column: String = row.get("column_name");
            let seq: Option<String> = row.get("seq_name");
            let Some(seq) = seq else { continue };

            let sql = format!(
                "SELECT setval('{seq}', COALESCE((SELECT MAX({col})::bigint FROM {table}), 1))",
                seq = seq.replace('\'', "''"),
                col = quote_ident(&column),
                table = quote_ident(&table),
            );
            match sqlx::query(&sql).execute(db.pool()).await {
                Ok(_) => succeeded += 1,
                Err(e) => warn!(table = %table, sequence = %seq, "Sequence reset failed: {}", e),
            }
        }
        Ok(succeeded)
    }

    fn dump_schema(&self, settings: &DbSettings, tables: &[String]) -> Result<String> {
        run_pg_dump(settings, tables)
    }

    fn dump_views_schema(&self, settings: &DbSettings, views: &[String]) -> Result<String> {
        run_pg_dump(settings, views)
    }

    fn parse_sql_statements(&self, sql: &str) -> Vec<String> {
        let mut statements = Vec::new();
        let mut current = String::new();

        for line in sql.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with("--") {
                continue;
            }
            // Session-level settings from the dump header.
            if current.is_empty()
                && (trimmed.starts_with("SET ")
                    || trimmed.starts_with("SELECT pg_catalog.set_config"))
            {
                continue;
            }
            if !current.is_empty() {
                current.push('\n');
            }
            current.push_str(trimmed);
            if trimmed.ends_with(';') {
                statements.push(current.trim().to_string());
                current.clear();
            }
        }
        statements
    }

    fn create_backup(&self, settings: &DbSettings, dir: &Path) -> Result<PathBuf> {
        let timestamp = Local::now().format("%Y-%m-%d_%H-%M-%S").to_string();
        let path = dir.join(backup_filename(&timestamp));

        let cmdline = format!(
            "pg_dump {} --no-owner --no-acl | gzip > {}",
            connection_args(settings),
            shell_quote(&path.to_string_lossy()),
        );
        let output = Command::new("sh")
            .arg("-c")
            .arg(&cmdline)
            .env("PGPASSWORD", &settings.password)
            .output()
            .map_err(|e| Error::tool("pg_dump", e))?;

        if !output.status.success() {
            return Err(Error::tool(
                "pg_dump",
                String::from_utf8_lossy(&output.stderr).trim(),
            ));
        }
        Ok(path)
    }

    fn restore_backup(&self, settings: &DbSettings, path: &Path) -> Result<()> {
        let cmdline = format!(
            "gunzip -c {} | psql {} 2>&1",
            shell_quote(&path.to_string_lossy()),
            connection_args(settings),
        );
        let output = Command::new("sh")
            .arg("-c")
            .arg(&cmdline)
            .env("PGPASSWORD", &settings.password)
            .output()
            .map_err(|e| Error::tool("psql", e))?;

        let text = String::from_utf8_lossy(&output.stdout);
        let errors = restore_error_lines(&text);
        if !errors.is_empty() {
            return Err(Error::Restore(errors.join("; ")));
        }
        if !output.status.success() {
            return Err(Error::Restore(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }

    async fn tables_list(&self, db: &Database) -> Result<Vec<String>> {
        let tables = sqlx::query_scalar::<_, String>(
            "SELECT tablename FROM pg_tables WHERE schemaname = $1 ORDER BY tablename",
        )
        .bind(SCHEMA)
        .fetch_all(db.pool())
        .await?;
        Ok(tables)
    }

    async fn views_list(&self, db: &Database) -> Result<Vec<String>> {
        let views = sqlx::query_scalar::<_, String>(
            "SELECT viewname FROM pg_views WHERE schemaname = $1 ORDER BY viewname",
        )
        .bind(SCHEMA)
        .fetch_all(db.pool())
        .await?;
        Ok(views)
    }

    async fn table_exists(&self, db: &Database, table: &str) -> Result<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM pg_tables WHERE schemaname = $1 AND tablename = $2)",
        )
        .bind(SCHEMA)
        .bind(table)
        .fetch_one(db.pool())
        .await?;
        Ok(exists)
    }

    async fn view_exists(&self, db: &Database, view: &str) -> Result<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM pg_views WHERE schemaname = $1 AND viewname = $2)",
        )
        .bind(SCHEMA)
        .bind(view)
        .fetch_one(db.pool())
        .await?;
        Ok(exists)
    }

    async fn drop_table(&self, db: &Database, table: &str) -> bool {
        let sql = format!("DROP TABLE IF EXISTS {} CASCADE", quote_ident(table));
        match sqlx::query(&sql).execute(db.pool()).await {
            Ok(_) => true,
            Err(e) => {
                warn!(table, "Drop table failed: {}", e);
                false
            }
        }
    }

    async fn drop_view(&self, db: &Database, view: &str) -> bool {
        let sql = format!("DROP VIEW IF EXISTS {} CASCADE", quote_ident(view));
        match sqlx::query(&sql).execute(db.pool()).await {
            Ok(_) => true,
            Err(e) => {
                warn!(view, "Drop view failed: {}", e);
                false
            }
        }
    }

    async fn drop_schema(&self, db: &Database) -> Result<()> {
        for sql in [
            format!("DROP SCHEMA IF EXISTS {} CASCADE", quote_ident(SCHEMA)),
            format!("CREATE SCHEMA {}", quote_ident(SCHEMA)),
            format!("GRANT ALL ON SCHEMA {} TO public", quote_ident(SCHEMA)),
        ] {
            sqlx::query(&sql).execute(db.pool()).await?;
        }
        Ok(())
    }

    async fn execute_statement(&self, db: &Database, sql: &str) -> Result<()> {
        sqlx::query(sql).execute(db.pool()).await?;
        Ok(())
    }

    async fn upsert_record(
        &self,
        db: &Database,
        table: &str,
        record: &Record,
        pk: &str,
    ) -> TableStats {
        let columns: Vec<String> = record.keys().cloned().collect();
        let sql = upsert_sql(table, pk, &columns);
        let mut stats = TableStats::default();

        match sqlx::query(&sql)
            .bind(record_to_value(record))
            .execute(db.pool())
            .await
        {
            // Change-class hint only: the driver reports affected rows for
            // both insert and conflict-update paths.
            Ok(result) if result.rows_affected() > 0 => stats.updated += 1,
            Ok(_) => stats.inserted += 1,
            Err(e) => {
                warn!(table, "Row upsert failed: {}", e);
                stats.errors += 1;
            }
        }
        stats
    }

    async fn insert_records(
        &self,
        db: &Database,
        table: &str,
        records: &[Record],
    ) -> TableStats {
        let mut stats = TableStats::default();
        if records.is_empty() {
            return stats;
        }

        let sql = format!(
            "INSERT INTO {table} SELECT * FROM jsonb_populate_recordset(NULL::{table}, $1)",
            table = quote_ident(table),
        );
        let payload = Value::Array(records.iter().map(record_to_value).collect());

        match sqlx::query(&sql).bind(payload).execute(db.pool()).await {
            Ok(result) => stats.inserted += result.rows_affected(),
            Err(e) => {
                warn!(table, "Batch insert failed: {}", e);
                stats.errors += records.len() as u64;
            }
        }
        stats
    }

    async fn table_metadata(&self, db: &Database, table: &str) -> TableMetadata {
        let count_sql = format!("SELECT COUNT(*) FROM {}", quote_ident(table));
        let count = match sqlx::query_scalar::<_, i64>(&count_sql)
            .fetch_one(db.pool())
            .await
        {
            Ok(count) => count,
            Err(e) => {
                warn!(table, db = db.label(), "Count probe failed: {}", e);
                return TableMetadata::failed();
            }
        };

        let has_updated_at = self.column_exists(db, table, "updated_at").await;
        let has_id = self.column_exists(db, table, "id").await;

        let max_updated_at = if has_updated_at && count > 0 {
            self.max_text(db, table, "updated_at").await
        } else {
            None
        };
        let max_id = if has_id {
            self.max_text(db, table, "id").await
        } else {
            None
        };

        TableMetadata {
            count,
            has_updated_at,
            max_updated_at,
            max_id,
            error: false,
        }
    }

    async fn has_structure_changed(
        &self,
        source: &Database,
        target: &Database,
        table: &str,
    ) -> bool {
        let (source_columns, target_columns) = match (
            self.columns_signature(source, table).await,
            self.columns_signature(target, table).await,
        ) {
            (Ok(s), Ok(t)) => (s, t),
            // Comparison failure counts as changed.
            _ => return true,
        };

        if source_columns.len() != target_columns.len() {
            return true;
        }
        let target_by_name: BTreeMap<&String, &(String, String, String)> = target_columns
            .iter()
            .map(|(name, sig)| (name, sig))
            .collect();
        source_columns.iter().any(|(name, sig)| {
            target_by_name
                .get(name)
                .map(|target_sig| *target_sig != sig)
                .unwrap_or(true)
        })
    }

    async fn has_view_structure_changed(
        &self,
        source: &Database,
        target: &Database,
        view: &str,
    ) -> bool {
        let (source_def, target_def) = match (
            self.view_definition(source, view).await,
            self.view_definition(target, view).await,
        ) {
            (Ok(s), Ok(t)) => (s, t),
            _ => return true,
        };
        normalize_definition(&source_def) != normalize_definition(&target_def)
    }

    async fn fetch_records(
        &self,
        db: &Database,
        table: &str,
        order_by: Option<&str>,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Record>> {
        let order = match order_by {
            Some(column) => format!("t.{}", quote_ident(column)),
            None => "t.ctid".to_string(),
        };
        let sql = format!(
            "SELECT row_to_json(t.*)::jsonb FROM {table} t ORDER BY {order} LIMIT $1 OFFSET $2",
            table = quote_ident(table),
            order = order,
        );
        let rows = sqlx::query_scalar::<_, Value>(&sql)
            .bind(limit)
            .bind(offset)
            .fetch_all(db.pool())
            .await?;
        Ok(rows.into_iter().map(value_to_record).collect())
    }

    async fn fetch_ids(
        &self,
        db: &Database,
        table: &str,
        pk: &str,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT {pk}::text FROM {table} ORDER BY {pk} LIMIT $1 OFFSET $2",
            pk = quote_ident(pk),
            table = quote_ident(table),
        );
        let ids = sqlx::query_scalar::<_, String>(&sql)
            .bind(limit)
            .bind(offset)
            .fetch_all(db.pool())
            .await?;
        Ok(ids)
    }

    async fn all_ids(&self, db: &Database, table: &str, pk: &str) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT {pk}::text FROM {table} ORDER BY {pk}",
            pk = quote_ident(pk),
            table = quote_ident(table),
        );
        let ids = sqlx::query_scalar::<_, String>(&sql)
            .fetch_all(db.pool())
            .await?;
        Ok(ids)
    }

    async fn self_referencing_records(
        &self,
        db: &Database,
        table: &str,
        pk: &str,
        fk: &str,
    ) -> Result<Vec<Record>> {
        let sql = format!(
            "WITH RECURSIVE tree AS ( \
                 SELECT t.*, 0 AS {depth} FROM {table} t WHERE t.{fk} IS NULL \
                 UNION ALL \
                 SELECT c.*, tree.{depth} + 1 FROM {table} c \
                 JOIN tree ON c.{fk} = tree.{pk} \
             ) \
             SELECT row_to_json(tree.*)::jsonb FROM tree ORDER BY {depth}, {pk}",
            table = quote_ident(table),
            pk = quote_ident(pk),
            fk = quote_ident(fk),
            depth = DEPTH_KEY,
        );
        let rows = sqlx::query_scalar::<_, Value>(&sql)
            .fetch_all(db.pool())
            .await?;
        Ok(rows.into_iter().map(value_to_record).collect())
    }

    async fn delete_ids(
        &self,
        db: &Database,
        table: &str,
        column: &str,
        ids: &[String],
    ) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "DELETE FROM {table} WHERE {column}::text = ANY($1)",
            table = quote_ident(table),
            column = quote_ident(column),
        );
        let result = sqlx::query(&sql)
            .bind(ids.to_vec())
            .execute(db.pool())
            .await?;
        Ok(result.rows_affected())
    }

    async fn find_conflicting_ids(
        &self,
        db: &Database,
        table: &str,
        constraint: &UniqueConstraint,
        record: &Record,
        pk: &str,
    ) -> Result<Vec<String>> {
        let mut conditions: Vec<String> = Vec::new();
        let mut bound: Vec<Value> = Vec::new();
        // $1 is the record's own primary key.
        let mut placeholder = 1usize;

        for column in &constraint.columns {
            match record.get(column) {
                Some(value) if !value.is_null() => {
                    placeholder += 1;
                    conditions.push(format!(
                        "to_jsonb({col}) = ${n}",
                        col = quote_ident(column),
                        n = placeholder
                    ));
                    bound.push(value.clone());
                }
                _ => conditions.push(format!("{} IS NULL", quote_ident(column))),
            }
        }

        let pk_text = record.get(pk).map(value_to_text).unwrap_or_default();
        let sql = format!(
            "SELECT {pk}::text FROM {table} WHERE {pk}::text <> $1 AND {conditions}",
            pk = quote_ident(pk),
            table = quote_ident(table),
            conditions = conditions.join(" AND "),
        );

        let mut query = sqlx::query_scalar::<_, String>(&sql).bind(pk_text);
        for value in bound {
            query = query.bind(value);
        }
        let ids = query.fetch_all(db.pool()).await?;
        Ok(ids)
    }
}

impl PostgresAdapter {
    async fn column_exists(&self, db: &Database, table: &str, column: &str) -> bool {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS ( \
                 SELECT 1 FROM information_schema.columns \
                 WHERE table_schema = $1 AND table_name = $2 AND column_name = $3 \
             )",
        )
        .bind(SCHEMA)
        .bind(table)
        .bind(column)
        .fetch_one(db.pool())
        .await
        .unwrap_or(false)
    }

    async fn max_text(&self, db: &Database, table: &str, column: &str) -> Option<String> {
        let sql = format!(
            "SELECT MAX({col})::text FROM {table}",
            col = quote_ident(column),
            table = quote_ident(table),
        );
        sqlx::query_scalar::<_, Option<String>>(&sql)
            .fetch_one(db.pool())
            .await
            .ok()
            .flatten()
    }

    /// `(column_name, (data_type, udt_name, is_nullable))` in ordinal order.
    async fn columns_signature(
        &self,
        db: &Database,
        table: &str,
    ) -> Result<Vec<(String, (String, String, String))>> {
        let rows = sqlx::query(
            "SELECT column_name, data_type, udt_name, is_nullable \
             FROM information_schema.columns \
             WHERE table_schema = $1 AND table_name = $2 \
             ORDER BY ordinal_position",
        )
        .bind(SCHEMA)
        .bind(table)
        .fetch_all(db.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                (
                    row.get("column_name"),
                    (
                        row.get("data_type"),
                        row.get("udt_name"),
                        row.get("is_nullable"),
                    ),
                )
            })
            .collect())
    }

    async fn view_definition(&self, db: &Database, view: &str) -> Result<String> {
        let definition = sqlx::query_scalar::<_, String>(
            "SELECT pg_get_viewdef((quote_ident($1) || '.' || quote_ident($2))::regclass, true)",
        )
        .bind(SCHEMA)
        .bind(view)
        .fetch_one(db.pool())
        .await?;
        Ok(definition)
    }
}

fn normalize_definition(definition: &str) -> String {
    definition.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn run_pg_dump(settings: &DbSettings, objects: &[String]) -> Result<String> {
    if objects.is_empty() {
        return Ok(String::new());
    }

    let mut command = Command::new("pg_dump");
    command
        .arg("-h")
        .arg(settings.host())
        .arg("-p")
        .arg(settings.port().to_string())
        .arg("-U")
        .arg(&settings.username)
        .arg("--schema-only")
        .arg("--no-owner")
        .arg("--no-acl")
        .env("PGPASSWORD", &settings.password);
    for object in objects {
        command.arg("-t").arg(format!("{}.{}", SCHEMA, object));
    }
    command.arg(&settings.database);

    let output = command.output().map_err(|e| Error::tool("pg_dump", e))?;
    if !output.status.success() {
        return Err(Error::tool(
            "pg_dump",
            String::from_utf8_lossy(&output.stderr).trim(),
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn quote_ident_doubles_embedded_quotes() {
        assert_eq!(quote_ident("users"), "\"users\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }

    #[test]
    fn upsert_sql_updates_non_pk_columns() {
        let columns = vec!["id".to_string(), "name".to_string(), "email".to_string()];
        let sql = upsert_sql("users", "id", &columns);

        assert!(sql.starts_with("INSERT INTO \"users\""));
        assert!(sql.contains("jsonb_populate_record(NULL::\"users\", $1)"));
        assert!(sql.contains("ON CONFLICT (\"id\") DO UPDATE SET"));
        assert!(sql.contains("\"name\" = EXCLUDED.\"name\""));
        assert!(sql.contains("\"email\" = EXCLUDED.\"email\""));
        assert!(!sql.contains("\"id\" = EXCLUDED.\"id\""));
    }

    #[test]
    fn upsert_sql_with_only_pk_does_nothing_on_conflict() {
        let columns = vec!["id".to_string()];
        let sql = upsert_sql("tags", "id", &columns);
        assert!(sql.ends_with("ON CONFLICT (\"id\") DO NOTHING"));
    }

    #[test]
    fn upsert_sql_never_updates_the_depth_marker() {
        let columns = vec![
            "id".to_string(),
            "parent_id".to_string(),
            DEPTH_KEY.to_string(),
        ];
        let sql = upsert_sql("categories", "id", &columns);
        assert!(!sql.contains(DEPTH_KEY));
    }

    #[test]
    fn parse_statements_drops_noise() {
        let dump = "\
-- PostgreSQL database dump
SET statement_timeout = 0;
SELECT pg_catalog.set_config('search_path', '', false);

CREATE TABLE users (
    id integer NOT NULL,
    email text
);

ALTER TABLE ONLY users
    ADD CONSTRAINT users_pkey PRIMARY KEY (id);
";
        let adapter = PostgresAdapter::new();
        let statements = adapter.parse_sql_statements(dump);

        assert_eq!(statements.len(), 2);
        assert!(statements[0].starts_with("CREATE TABLE users ("));
        assert!(statements[0].ends_with(");"));
        assert!(statements[1].starts_with("ALTER TABLE ONLY users"));
        assert!(statements[1].ends_with("PRIMARY KEY (id);"));
    }

    #[test]
    fn parse_statements_joins_continuation_lines() {
        let adapter = PostgresAdapter::new();
        let statements = adapter.parse_sql_statements("CREATE SEQUENCE s\n  START 1\n  CACHE 1;\n");
        assert_eq!(statements.len(), 1);
        assert_eq!(statements[0], "CREATE SEQUENCE s\nSTART 1\nCACHE 1;");
    }

    #[test]
    fn parse_statements_empty_input() {
        let adapter = PostgresAdapter::new();
        assert!(adapter.parse_sql_statements("").is_empty());
        assert!(adapter.parse_sql_statements("-- only a comment\n").is_empty());
    }

    #[test]
    fn restore_lines_classified() {
        let output = "\
CREATE TABLE
ERROR:  relation \"users\" already exists
ERROR:  syntax error at or near \"BOGUS\"
INSERT 0 10
";
        let errors = restore_error_lines(output);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("syntax error"));
    }

    #[test]
    fn backup_filename_shape() {
        let name = backup_filename("2026-08-02_12-30-00");
        assert_eq!(name, "db_backup_2026-08-02_12-30-00.sql.gz");
    }

    #[test]
    fn value_to_text_forms() {
        assert_eq!(value_to_text(&json!("abc")), "abc");
        assert_eq!(value_to_text(&json!(42)), "42");
        assert_eq!(value_to_text(&json!(null)), "null");
    }

    #[test]
    fn record_value_round_trip() {
        let mut record = Record::new();
        record.insert("id".to_string(), json!(1));
        record.insert("name".to_string(), json!("widget"));

        let value = record_to_value(&record);
        assert_eq!(value_to_record(value), record);
    }

    #[test]
    fn normalize_definition_collapses_whitespace() {
        let a = "SELECT a,\n       b\n  FROM t;";
        let b = "SELECT a, b FROM t;";
        assert_eq!(normalize_definition(a), normalize_definition(b));
    }

    #[test]
    fn connection_args_quote_values() {
        let settings = DbSettings {
            driver: "postgres".to_string(),
            database: "app".to_string(),
            username: "dev".to_string(),
            password: "secret".to_string(),
            host: Some("localhost".to_string()),
            port: Some(5433),
        };
        assert_eq!(connection_args(&settings), "-h 'localhost' -p 5433 -U 'dev' 'app'");
    }
}
