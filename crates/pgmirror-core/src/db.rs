//! Database connection management
//!
//! Thin wrapper around a `PgPool` so the rest of the crate talks about
//! databases, not driver pools.

use crate::config::DbSettings;
use crate::error::Result;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;

/// Maximum connections per pool. The sync engine is strictly sequential, so
/// a small pool is enough.
const MAX_CONNECTIONS: u32 = 4;

/// A connected database (source or target).
#[derive(Debug, Clone)]
pub struct Database {
    pool: PgPool,
    label: String,
}

impl Database {
    /// Connect using the given settings. When `endpoint` is set the
    /// host/port are overridden, which is how source connections are routed
    /// through the tunnel's local endpoint.
    pub async fn connect(
        label: impl Into<String>,
        settings: &DbSettings,
        endpoint: Option<(&str, u16)>,
    ) -> Result<Self> {
        let settings = match endpoint {
            Some((host, port)) => settings.through(host, port),
            None => settings.clone(),
        };

        let options = PgConnectOptions::new()
            .host(settings.host())
            .port(settings.port())
            .username(&settings.username)
            .password(&settings.password)
            .database(&settings.database);

        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await?;

        Ok(Self {
            pool,
            label: label.into(),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Label used in logs and reports ("source" / "target").
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Check the connection is alive
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
