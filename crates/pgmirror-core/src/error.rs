//! Error types for pgmirror

use thiserror::Error;

/// Result type alias using pgmirror's Error
pub type Result<T> = std::result::Result<T, Error>;

/// pgmirror error types
///
/// Structural failures (configuration, tunnel, schema-level adapter calls,
/// restore) are fatal to the running command. Per-row and per-statement
/// failures are never raised as errors; they are counted into the sync
/// statistics instead.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection '{0}' is not defined in config.toml")]
    UnknownConnection(String),

    #[error("Tunnel error: {0}")]
    Tunnel(String),

    #[error("Adapter error: {0}")]
    Adapter(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Restore failed: {0}")]
    Restore(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build an adapter error from a failed shell tool invocation.
    pub fn tool(tool: &str, detail: impl std::fmt::Display) -> Self {
        Self::Adapter(format!("{} failed: {}", tool, detail))
    }
}
