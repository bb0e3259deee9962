//! Configuration management with file persistence
//!
//! Connections are named; each names a source (remote) and target (local)
//! database plus an optional SSH tunnel and a set of excluded tables.

use crate::error::{Error, Result};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::PathBuf;

/// Default batch size for paged reads and chunked writes.
pub const DEFAULT_BATCH_SIZE: usize = 10_000;

/// Default number of backups retained after pruning.
pub const DEFAULT_KEEP_LAST: usize = 5;

/// pgmirror configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection used when the CLI does not name one.
    pub default: Option<String>,
    /// Batch size for paged reads and chunked writes (CLI overrides).
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub backup: BackupSettings,
    #[serde(default)]
    pub connections: BTreeMap<String, ConnectionSettings>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupSettings {
    /// Directory backups are written to.
    pub path: Option<PathBuf>,
    /// How many backups to keep after a successful run.
    pub keep_last: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSettings {
    /// SSH tunnel the source connection goes through. Absent means direct.
    pub tunnel: Option<crate::tunnel::TunnelSettings>,
    pub source: DbSettings,
    pub target: DbSettings,
    /// Tables never synced unless `--include-excluded` is passed.
    #[serde(default)]
    pub excluded_tables: Vec<String>,
}

/// Connection parameters for one database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbSettings {
    #[serde(default = "default_driver")]
    pub driver: String,
    pub database: String,
    pub username: String,
    #[serde(default)]
    pub password: String,
    pub host: Option<String>,
    pub port: Option<u16>,
}

fn default_driver() -> String {
    "postgres".to_string()
}

impl DbSettings {
    pub fn host(&self) -> &str {
        self.host.as_deref().unwrap_or("127.0.0.1")
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(5432)
    }

    /// Copy of these settings pointing at a tunnel's local endpoint.
    pub fn through(&self, host: impl Into<String>, port: u16) -> Self {
        Self {
            host: Some(host.into()),
            port: Some(port),
            ..self.clone()
        }
    }
}

impl BackupSettings {
    pub fn keep_last(&self) -> usize {
        self.keep_last.unwrap_or(DEFAULT_KEEP_LAST)
    }

    /// Backup directory, defaulting to `<data_dir>/pgmirror/backups`.
    pub fn dir(&self) -> PathBuf {
        if let Some(path) = &self.path {
            path.clone()
        } else {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("pgmirror")
                .join("backups")
        }
    }
}

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var("PGMIRROR_CONFIG_DIR") {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?
                .join("pgmirror")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from file, or return defaults if it doesn't exist
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::config_path()?;

        if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> anyhow::Result<()> {
        self.validate()?;

        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;

        let path = Self::config_path()?;
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(name) = &self.default {
            if !self.connections.contains_key(name) {
                anyhow::bail!("Default connection '{}' is not defined", name);
            }
        }
        for (name, conn) in &self.connections {
            for db in [&conn.source, &conn.target] {
                if db.driver != "postgres" {
                    anyhow::bail!(
                        "Connection '{}' uses unsupported driver '{}' (only 'postgres' is supported)",
                        name,
                        db.driver
                    );
                }
            }
        }
        Ok(())
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size.unwrap_or(DEFAULT_BATCH_SIZE)
    }

    /// Resolve a named connection, falling back to the configured default.
    pub fn connection(&self, name: Option<&str>) -> Result<(&str, &ConnectionSettings)> {
        let name = match name.or(self.default.as_deref()) {
            Some(n) => n,
            None => {
                return Err(Error::Config(
                    "No connection named and no default configured".to_string(),
                ))
            }
        };
        self.connections
            .get_key_value(name)
            .map(|(k, v)| (k.as_str(), v))
            .ok_or_else(|| Error::UnknownConnection(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
default = "staging"
batch_size = 500

[backup]
path = "/var/backups/pgmirror"
keep_last = 3

[connections.staging]
excluded_tables = ["schema_migrations", "audit_log"]

[connections.staging.tunnel]
host = "bastion.example.com"
user = "deploy"
local_port = 15432

[connections.staging.source]
database = "app"
username = "app"
password = "secret"

[connections.staging.target]
database = "app_local"
username = "dev"
host = "localhost"
port = 5433
"#;

    #[test]
    fn parses_sample_config() {
        let config: Config = toml::from_str(SAMPLE).expect("Failed to parse sample config");

        assert_eq!(config.default.as_deref(), Some("staging"));
        assert_eq!(config.batch_size(), 500);
        assert_eq!(config.backup.keep_last(), 3);

        let (name, conn) = config.connection(None).expect("default connection");
        assert_eq!(name, "staging");
        assert_eq!(conn.excluded_tables.len(), 2);
        assert_eq!(conn.source.driver, "postgres");
        assert_eq!(conn.source.host(), "127.0.0.1");
        assert_eq!(conn.source.port(), 5432);
        assert_eq!(conn.target.port(), 5433);

        let tunnel = conn.tunnel.as_ref().expect("tunnel settings");
        assert_eq!(tunnel.host, "bastion.example.com");
        assert_eq!(tunnel.local_port, 15432);
    }

    #[test]
    fn unknown_connection_is_an_error() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        let err = config.connection(Some("production")).unwrap_err();
        assert!(matches!(err, Error::UnknownConnection(name) if name == "production"));
    }

    #[test]
    fn missing_default_is_an_error() {
        let config = Config::default();
        let err = config.connection(None).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn validate_rejects_unknown_driver() {
        let mut config: Config = toml::from_str(SAMPLE).unwrap();
        config
            .connections
            .get_mut("staging")
            .unwrap()
            .source
            .driver = "mysql".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_dangling_default() {
        let mut config: Config = toml::from_str(SAMPLE).unwrap();
        config.default = Some("missing".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn through_points_at_endpoint() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        let (_, conn) = config.connection(None).unwrap();
        let routed = conn.source.through("127.0.0.1", 15432);
        assert_eq!(routed.host(), "127.0.0.1");
        assert_eq!(routed.port(), 15432);
        assert_eq!(routed.database, conn.source.database);
    }

    #[test]
    fn defaults_round_trip() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).expect("serialize");
        let parsed: Config = toml::from_str(&text).expect("reparse");
        assert_eq!(parsed.batch_size(), DEFAULT_BATCH_SIZE);
        assert_eq!(parsed.backup.keep_last(), DEFAULT_KEEP_LAST);
    }
}
