//! Backup creation, listing, pruning and restore
//!
//! Backups are full compressed dumps named
//! `db_backup_<YYYY-MM-DD_HH-MM-SS>.sql.gz`. They are the rollback point
//! for a pull; nothing else is persisted between runs.

use crate::adapter::DatabaseAdapter;
use crate::config::DbSettings;
use crate::error::{Error, Result};
use chrono::{DateTime, Local};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{info, warn};

/// One retained backup file.
#[derive(Debug, Clone)]
pub struct BackupRecord {
    pub path: PathBuf,
    pub filename: String,
    pub size: u64,
    pub modified: DateTime<Local>,
}

impl BackupRecord {
    pub fn human_size(&self) -> String {
        human_size(self.size)
    }

    pub fn human_date(&self) -> String {
        self.modified.format("%Y-%m-%d %H:%M:%S").to_string()
    }
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[unit])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

pub struct BackupManager<'a> {
    adapter: &'a dyn DatabaseAdapter,
}

impl<'a> BackupManager<'a> {
    pub fn new(adapter: &'a dyn DatabaseAdapter) -> Self {
        Self { adapter }
    }

    /// Dump the target into `dir`, creating it if needed.
    pub fn create(&self, settings: &DbSettings, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let path = self.adapter.create_backup(settings, dir)?;
        info!(path = %path.display(), "Backup created");
        Ok(path)
    }

    /// All backups in `dir`, newest first by modification time.
    pub fn list(&self, dir: &Path) -> Result<Vec<BackupRecord>> {
        let mut records: Vec<BackupRecord> = Vec::new();
        if !dir.exists() {
            return Ok(records);
        }

        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let filename = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };
            if !filename.ends_with(".sql.gz") {
                continue;
            }
            let metadata = entry.metadata()?;
            let modified: DateTime<Local> =
                metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH).into();
            records.push(BackupRecord {
                path,
                filename,
                size: metadata.len(),
                modified,
            });
        }

        records.sort_by(|a, b| b.modified.cmp(&a.modified));
        Ok(records)
    }

    /// Resolve `name` to a backup: exact filename, exact path, or the
    /// first (newest) backup whose filename contains it.
    pub fn find(&self, name: &str, dir: &Path) -> Result<BackupRecord> {
        let records = self.list(dir)?;

        if let Some(exact) = records.iter().find(|r| r.filename == name) {
            return Ok(exact.clone());
        }
        let as_path = Path::new(name);
        if as_path.is_file() {
            if let Some(by_path) = records.iter().find(|r| r.path == as_path) {
                return Ok(by_path.clone());
            }
        }
        records
            .into_iter()
            .find(|r| r.filename.contains(name))
            .ok_or_else(|| Error::Restore(format!("no backup matching '{}'", name)))
    }

    /// Delete all but the `keep_last` newest backups; returns how many
    /// were removed.
    pub fn cleanup(&self, dir: &Path, keep_last: usize) -> Result<usize> {
        let records = self.list(dir)?;
        let mut removed = 0usize;
        for record in records.iter().skip(keep_last) {
            match fs::remove_file(&record.path) {
                Ok(()) => removed += 1,
                Err(e) => warn!(file = %record.path.display(), "Could not prune backup: {}", e),
            }
        }
        if removed > 0 {
            info!(removed, keep_last, "Pruned old backups");
        }
        Ok(removed)
    }

    /// Pipe the gunzipped dump back into the target.
    pub fn restore(&self, settings: &DbSettings, path: &Path) -> Result<()> {
        if !path.is_file() {
            return Err(Error::Restore(format!(
                "backup file not found: {}",
                path.display()
            )));
        }
        info!(path = %path.display(), "Restoring backup");
        self.adapter.restore_backup(settings, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::PostgresAdapter;
    use std::thread::sleep;
    use std::time::Duration;

    fn write_backup(dir: &Path, name: &str, bytes: usize) {
        fs::write(dir.join(name), vec![0u8; bytes]).expect("write backup fixture");
        // Distinct mtimes so newest-first ordering is observable.
        sleep(Duration::from_millis(15));
    }

    #[test]
    fn list_is_newest_first_and_filtered() {
        let adapter = PostgresAdapter::new();
        let manager = BackupManager::new(&adapter);
        let dir = tempfile::tempdir().expect("tempdir");

        write_backup(dir.path(), "db_backup_2026-01-01_00-00-00.sql.gz", 10);
        write_backup(dir.path(), "notes.txt", 5);
        write_backup(dir.path(), "db_backup_2026-01-02_00-00-00.sql.gz", 20);

        let records = manager.list(dir.path()).expect("list");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].filename, "db_backup_2026-01-02_00-00-00.sql.gz");
        assert_eq!(records[0].size, 20);
    }

    #[test]
    fn list_of_missing_dir_is_empty() {
        let adapter = PostgresAdapter::new();
        let manager = BackupManager::new(&adapter);
        let records = manager
            .list(Path::new("/nonexistent/pgmirror-backups"))
            .expect("list");
        assert!(records.is_empty());
    }

    #[test]
    fn find_by_exact_name_and_substring() {
        let adapter = PostgresAdapter::new();
        let manager = BackupManager::new(&adapter);
        let dir = tempfile::tempdir().expect("tempdir");

        write_backup(dir.path(), "db_backup_2026-01-01_00-00-00.sql.gz", 1);
        write_backup(dir.path(), "db_backup_2026-01-02_00-00-00.sql.gz", 1);

        let exact = manager
            .find("db_backup_2026-01-01_00-00-00.sql.gz", dir.path())
            .expect("exact");
        assert_eq!(exact.filename, "db_backup_2026-01-01_00-00-00.sql.gz");

        // Substring matches take the newest candidate.
        let fuzzy = manager.find("2026-01", dir.path()).expect("substring");
        assert_eq!(fuzzy.filename, "db_backup_2026-01-02_00-00-00.sql.gz");

        assert!(manager.find("2030", dir.path()).is_err());
    }

    #[test]
    fn cleanup_keeps_the_newest() {
        let adapter = PostgresAdapter::new();
        let manager = BackupManager::new(&adapter);
        let dir = tempfile::tempdir().expect("tempdir");

        for day in 1..=4 {
            write_backup(
                dir.path(),
                &format!("db_backup_2026-01-0{}_00-00-00.sql.gz", day),
                1,
            );
        }

        let removed = manager.cleanup(dir.path(), 2).expect("cleanup");
        assert_eq!(removed, 2);

        let left = manager.list(dir.path()).expect("list");
        assert_eq!(left.len(), 2);
        assert_eq!(left[0].filename, "db_backup_2026-01-04_00-00-00.sql.gz");
        assert_eq!(left[1].filename, "db_backup_2026-01-03_00-00-00.sql.gz");
    }

    #[test]
    fn restore_of_missing_file_fails() {
        let adapter = PostgresAdapter::new();
        let manager = BackupManager::new(&adapter);
        let settings = DbSettings {
            driver: "postgres".to_string(),
            database: "app".to_string(),
            username: "dev".to_string(),
            password: String::new(),
            host: None,
            port: None,
        };
        let err = manager
            .restore(&settings, Path::new("/nonexistent/backup.sql.gz"))
            .unwrap_err();
        assert!(matches!(err, Error::Restore(_)));
    }

    #[test]
    fn human_sizes() {
        assert_eq!(human_size(512), "512 B");
        assert_eq!(human_size(2048), "2.0 KB");
        assert_eq!(human_size(5 * 1024 * 1024), "5.0 MB");
    }
}
