//! Foreign-key dependency graph and topological ordering
//!
//! Built once per command run from the source database and shared read-only
//! afterwards. Ordering over the graph is the correctness guarantee for the
//! delete and upsert phases.

use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Direction of a topological sort over the FK graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Referenced tables come before the tables referencing them.
    ParentsFirst,
    /// Referencing tables come before the tables they reference.
    ChildrenFirst,
}

/// One table's edges. An entry in `depends_on` always has the reverse edge
/// in the parent's `referenced_by`.
#[derive(Debug, Clone, Default)]
pub struct TableNode {
    pub depends_on: BTreeSet<String>,
    pub referenced_by: BTreeSet<String>,
}

/// The full bidirectional FK graph for the schema.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    tables: BTreeMap<String, TableNode>,
}

impl DependencyGraph {
    /// Record `child → parent`. Self-loops are recorded but never traversed.
    pub fn add_dependency(&mut self, child: &str, parent: &str) {
        self.tables
            .entry(child.to_string())
            .or_default()
            .depends_on
            .insert(parent.to_string());
        self.tables
            .entry(parent.to_string())
            .or_default()
            .referenced_by
            .insert(child.to_string());
    }

    pub fn node(&self, table: &str) -> Option<&TableNode> {
        self.tables.get(table)
    }

    pub fn parents_of(&self, table: &str) -> BTreeSet<String> {
        self.tables
            .get(table)
            .map(|n| n.depends_on.clone())
            .unwrap_or_default()
    }

    pub fn children_of(&self, table: &str) -> BTreeSet<String> {
        self.tables
            .get(table)
            .map(|n| n.referenced_by.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Topologically order `tables` (a permutation of the input).
    ///
    /// Depth-first with post-order append, bounded to the input set.
    /// Neighbors outside the input, already emitted, or currently on the
    /// visit stack (a cycle) are skipped rather than raised.
    pub fn sort(&self, tables: &[String], direction: Direction) -> Vec<String> {
        let in_scope: HashSet<&str> = tables.iter().map(String::as_str).collect();
        let mut emitted: HashSet<String> = HashSet::with_capacity(tables.len());
        let mut on_stack: HashSet<String> = HashSet::new();
        let mut ordered: Vec<String> = Vec::with_capacity(tables.len());

        for table in tables {
            self.visit(table, direction, &in_scope, &mut emitted, &mut on_stack, &mut ordered);
        }
        ordered
    }

    fn visit(
        &self,
        table: &str,
        direction: Direction,
        in_scope: &HashSet<&str>,
        emitted: &mut HashSet<String>,
        on_stack: &mut HashSet<String>,
        ordered: &mut Vec<String>,
    ) {
        if emitted.contains(table) || on_stack.contains(table) {
            return;
        }
        on_stack.insert(table.to_string());

        if let Some(node) = self.tables.get(table) {
            let neighbors = match direction {
                Direction::ParentsFirst => &node.depends_on,
                Direction::ChildrenFirst => &node.referenced_by,
            };
            for neighbor in neighbors {
                if neighbor != table && in_scope.contains(neighbor.as_str()) {
                    self.visit(neighbor, direction, in_scope, emitted, on_stack, ordered);
                }
            }
        }

        on_stack.remove(table);
        emitted.insert(table.to_string());
        ordered.push(table.to_string());
    }
}

/// Build-once cache for the FK graph. Built from the source database at the
/// start of a command, immutable until `reset`.
#[derive(Debug, Default)]
pub struct GraphCache {
    cached: Option<DependencyGraph>,
}

impl GraphCache {
    pub async fn build(
        &mut self,
        adapter: &dyn crate::adapter::DatabaseAdapter,
        db: &crate::db::Database,
    ) -> crate::error::Result<DependencyGraph> {
        if self.cached.is_none() {
            self.cached = Some(adapter.foreign_key_dependencies(db).await?);
        }
        Ok(self.cached.clone().unwrap_or_default())
    }

    pub fn get(&self) -> Option<&DependencyGraph> {
        self.cached.as_ref()
    }

    pub fn reset(&mut self) {
        self.cached = None;
    }
}
