//! Row-level data syncing: deletes, upserts and the self-referencing path
//!
//! All remote reads go through the tunnel retry policy; target writes never
//! do. Row failures are counted into the table's stats and never abort a
//! table, let alone the run.

use crate::adapter::{DatabaseAdapter, Record, UniqueConstraint, DEPTH_KEY};
use crate::db::Database;
use crate::error::Result;
use crate::stats::TableStats;
use crate::tunnel::RetryPolicy;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

pub struct DataSyncer<'a> {
    adapter: &'a dyn DatabaseAdapter,
    batch_size: usize,
    retry: RetryPolicy,
    /// UNIQUE constraints per target table, cached for the run.
    constraints: HashMap<String, Vec<UniqueConstraint>>,
}

/// Local ids with no remote counterpart, in local order. An empty remote id
/// set means the remote table was wiped, so every local id is returned.
fn missing_ids(local: Vec<String>, remote: &HashSet<String>) -> Vec<String> {
    if remote.is_empty() {
        return local;
    }
    local.into_iter().filter(|id| !remote.contains(id)).collect()
}

/// A unique-tuple match is impossible when the record is null in every
/// constraint column.
fn all_columns_null(constraint: &UniqueConstraint, record: &Record) -> bool {
    constraint
        .columns
        .iter()
        .all(|column| record.get(column).map(|v| v.is_null()).unwrap_or(true))
}

fn strip_depth(record: &mut Record) {
    record.remove(DEPTH_KEY);
}

impl<'a> DataSyncer<'a> {
    pub fn new(adapter: &'a dyn DatabaseAdapter, batch_size: usize, retry: RetryPolicy) -> Self {
        Self {
            adapter,
            batch_size,
            retry,
            constraints: HashMap::new(),
        }
    }

    /// Clear the per-run unique-constraint cache.
    pub fn reset_cache(&mut self) {
        self.constraints.clear();
    }

    /// Ids present locally but not on the source.
    ///
    /// Remote ids are paged (through the retry policy); local ids are read
    /// in one query.
    pub async fn get_ids_to_delete(
        &self,
        source: &Database,
        target: &Database,
        table: &str,
        pk: &str,
    ) -> Result<Vec<String>> {
        let mut remote: HashSet<String> = HashSet::new();
        let mut offset = 0i64;
        loop {
            let page = self
                .retry
                .run(|| async {
                    self.adapter
                        .fetch_ids(source, table, pk, offset, self.batch_size as i64)
                        .await
                })
                .await?;
            let fetched = page.len();
            remote.extend(page);
            if fetched < self.batch_size {
                break;
            }
            offset += self.batch_size as i64;
        }

        let local = self.adapter.all_ids(target, table, pk).await?;
        Ok(missing_ids(local, &remote))
    }

    /// Delete `ids` from `table`, clearing one level of referencing child
    /// rows first. Child deletes are best-effort; deeper cascades are left
    /// to the DBMS and the cascade recheck pass.
    pub async fn delete_from_table(
        &self,
        target: &Database,
        table: &str,
        pk: &str,
        ids: &[String],
    ) -> TableStats {
        let mut stats = TableStats::default();
        if ids.is_empty() {
            return stats;
        }

        match self.adapter.child_tables(target, table).await {
            Ok(children) => {
                for (child, fk_column) in children {
                    for chunk in ids.chunks(self.batch_size) {
                        if let Err(e) =
                            self.adapter.delete_ids(target, &child, &fk_column, chunk).await
                        {
                            warn!(child = %child, "Child delete failed: {}", e);
                        }
                    }
                }
            }
            Err(e) => warn!(table, "Could not enumerate child tables: {}", e),
        }

        for chunk in ids.chunks(self.batch_size) {
            match self.adapter.delete_ids(target, table, pk, chunk).await {
                Ok(deleted) => stats.deleted += deleted,
                Err(e) => {
                    warn!(table, "Delete chunk failed: {}", e);
                    stats.errors += chunk.len() as u64;
                }
            }
        }
        debug!(table, deleted = stats.deleted, "Delete phase for table done");
        stats
    }

    /// Upsert every source row of `table` into the target.
    ///
    /// Tables without a primary key cannot converge by row identity and
    /// yield empty stats. Self-referencing tables take the depth-ordered
    /// path so parents land before their children.
    pub async fn sync_table_from_remote(
        &mut self,
        source: &Database,
        target: &Database,
        table: &str,
    ) -> Result<TableStats> {
        let pk = match self.adapter.primary_key_column(source, table).await? {
            Some(pk) => pk,
            None => {
                warn!(table, "No primary key; skipping row sync");
                return Ok(TableStats::default());
            }
        };

        if let Some(fk) = self.adapter.self_referencing_column(source, table).await? {
            return self.sync_self_referencing(source, target, table, &pk, &fk).await;
        }

        let mut stats = TableStats::default();
        let mut offset = 0i64;
        loop {
            let batch = self
                .retry
                .run(|| async {
                    self.adapter
                        .fetch_records(source, table, Some(&pk), offset, self.batch_size as i64)
                        .await
                })
                .await?;
            if batch.is_empty() {
                break;
            }
            let fetched = batch.len();
            stats.merge(self.upsert_records(target, table, batch, &pk).await);
            if fetched < self.batch_size {
                break;
            }
            offset += self.batch_size as i64;
        }
        Ok(stats)
    }

    /// Depth-ordered upsert: every row's parent (when in scope) is written
    /// before the row itself, so no transient FK violation occurs without
    /// deferring constraints.
    async fn sync_self_referencing(
        &mut self,
        source: &Database,
        target: &Database,
        table: &str,
        pk: &str,
        fk: &str,
    ) -> Result<TableStats> {
        debug!(table, fk, "Self-referencing table; using depth-ordered sync");
        let mut records = self
            .retry
            .run(|| async {
                self.adapter
                    .self_referencing_records(source, table, pk, fk)
                    .await
            })
            .await?;
        for record in &mut records {
            strip_depth(record);
        }

        let mut stats = TableStats::default();
        for chunk in records.chunks(self.batch_size) {
            stats.merge(self.upsert_records(target, table, chunk.to_vec(), pk).await);
        }
        Ok(stats)
    }

    /// Plain insert path for clone-mode loads into a just-recreated target.
    pub async fn copy_table_from_remote(
        &self,
        source: &Database,
        target: &Database,
        table: &str,
    ) -> Result<TableStats> {
        let order_by = self.adapter.primary_key_column(source, table).await?;

        let mut stats = TableStats::default();
        let mut offset = 0i64;
        loop {
            let batch = self
                .retry
                .run(|| async {
                    self.adapter
                        .fetch_records(
                            source,
                            table,
                            order_by.as_deref(),
                            offset,
                            self.batch_size as i64,
                        )
                        .await
                })
                .await?;
            if batch.is_empty() {
                break;
            }
            let fetched = batch.len();
            stats.merge(self.adapter.insert_records(target, table, &batch).await);
            if fetched < self.batch_size {
                break;
            }
            offset += self.batch_size as i64;
        }
        Ok(stats)
    }

    /// Upsert a batch. Unique-key collisions with other local rows are
    /// cleared first so each remote row can land by its own primary key.
    pub async fn upsert_records(
        &mut self,
        target: &Database,
        table: &str,
        records: Vec<Record>,
        pk: &str,
    ) -> TableStats {
        let mut stats = TableStats::default();
        if records.is_empty() {
            return stats;
        }

        self.delete_conflicting_records(target, table, &records, pk).await;

        for record in &records {
            stats.merge(self.adapter.upsert_record(target, table, record, pk).await);
        }
        stats
    }

    /// Remove local rows holding a unique tuple some incoming record wants,
    /// under a different primary key. Dependent child rows go first.
    async fn delete_conflicting_records(
        &mut self,
        target: &Database,
        table: &str,
        records: &[Record],
        pk: &str,
    ) {
        let constraints = match self.constraints.get(table) {
            Some(cached) => cached.clone(),
            None => {
                let fetched = match self.adapter.unique_constraints(target, table).await {
                    Ok(fetched) => fetched,
                    Err(e) => {
                        warn!(table, "Could not read unique constraints: {}", e);
                        Vec::new()
                    }
                };
                self.constraints.insert(table.to_string(), fetched.clone());
                fetched
            }
        };
        if constraints.is_empty() {
            return;
        }

        let mut conflicting: Vec<String> = Vec::new();
        for record in records {
            for constraint in &constraints {
                if all_columns_null(constraint, record) {
                    continue;
                }
                match self
                    .adapter
                    .find_conflicting_ids(target, table, constraint, record, pk)
                    .await
                {
                    Ok(ids) => conflicting.extend(ids),
                    Err(e) => {
                        warn!(table, constraint = %constraint.name, "Conflict lookup failed: {}", e)
                    }
                }
            }
        }
        if conflicting.is_empty() {
            return;
        }

        conflicting.sort();
        conflicting.dedup();
        debug!(
            table,
            rows = conflicting.len(),
            "Clearing unique-constraint conflicts"
        );
        self.delete_from_table(target, table, pk, &conflicting).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn set(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn vec_of(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn missing_ids_is_local_minus_remote() {
        let result = missing_ids(vec_of(&["1", "2", "3", "4"]), &set(&["2", "4"]));
        assert_eq!(result, vec_of(&["1", "3"]));
    }

    #[test]
    fn empty_remote_wipes_local() {
        let result = missing_ids(vec_of(&["1", "2", "3"]), &HashSet::new());
        assert_eq!(result, vec_of(&["1", "2", "3"]));
    }

    #[test]
    fn subset_local_yields_nothing() {
        let result = missing_ids(vec_of(&["1", "2"]), &set(&["1", "2", "3"]));
        assert!(result.is_empty());
    }

    #[test]
    fn local_order_is_preserved() {
        let result = missing_ids(vec_of(&["9", "1", "5"]), &set(&["1"]));
        assert_eq!(result, vec_of(&["9", "5"]));
    }

    #[test]
    fn all_null_constraint_tuple_is_skipped() {
        let constraint = UniqueConstraint {
            name: "users_email_key".to_string(),
            columns: vec!["email".to_string(), "tenant_id".to_string()],
        };

        let mut record = Record::new();
        record.insert("email".to_string(), json!(null));
        assert!(all_columns_null(&constraint, &record));

        record.insert("tenant_id".to_string(), json!(7));
        assert!(!all_columns_null(&constraint, &record));
    }

    #[test]
    fn depth_marker_is_stripped() {
        let mut record = Record::new();
        record.insert("id".to_string(), json!(1));
        record.insert(DEPTH_KEY.to_string(), json!(3));

        strip_depth(&mut record);
        assert!(!record.contains_key(DEPTH_KEY));
        assert!(record.contains_key("id"));
    }
}
