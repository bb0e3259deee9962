//! pgmirror CLI - one-way PostgreSQL sync over SSH tunnels

use clap::{Args, Parser, Subcommand};
use pgmirror_core::config::Config;
use pgmirror_core::orchestrator::{Orchestrator, SyncOptions};

#[derive(Parser)]
#[command(name = "pgmirror")]
#[command(author, version, about = "One-way PostgreSQL synchronization", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
}

/// Flags shared by `pull` and `clone`.
#[derive(Args, Clone, Default)]
struct SyncArgs {
    /// Named connection from config.toml (defaults to the configured default)
    #[arg(long = "sync-connection")]
    sync_connection: Option<String>,

    /// Skip confirmation prompts
    #[arg(long)]
    force: bool,

    /// Only sync these tables (comma-separated; implies skipping views)
    #[arg(long, value_delimiter = ',')]
    tables: Option<Vec<String>>,

    /// Only refresh these views (comma-separated)
    #[arg(long, value_delimiter = ',')]
    views: Option<Vec<String>>,

    /// Sync tables listed in excluded_tables too
    #[arg(long)]
    include_excluded: bool,

    /// Show what would be done without doing it
    #[arg(long)]
    dry_run: bool,

    /// Do not take a backup before syncing
    #[arg(long)]
    skip_backup: bool,

    /// Rows per page/chunk (defaults to config batch_size, then 10000)
    #[arg(long)]
    batch_size: Option<usize>,

    /// Memory limit in MB (-1 = unrestricted)
    #[arg(long, default_value_t = -1)]
    memory_limit: i64,
}

#[derive(Subcommand)]
enum Commands {
    /// Incrementally sync the remote database into the local one
    Pull {
        #[command(flatten)]
        sync: SyncArgs,

        /// Print the analysis and exit without syncing
        #[arg(long)]
        analyze_only: bool,

        /// Do not reset sequences after syncing
        #[arg(long)]
        skip_sequences: bool,
    },

    /// Drop and recreate every local object from the remote database
    Clone {
        #[command(flatten)]
        sync: SyncArgs,

        /// Recreate tables only, no views
        #[arg(long)]
        skip_views: bool,

        /// Recreate structure only, no data
        #[arg(long)]
        skip_sync_data: bool,
    },

    /// Restore the local database from a backup
    Restore {
        /// Backup to restore: exact filename, path, or substring
        /// (defaults to the newest)
        file: Option<String>,

        /// List retained backups instead of restoring
        #[arg(long)]
        list: bool,

        /// Named connection from config.toml
        #[arg(long = "sync-connection")]
        sync_connection: Option<String>,

        /// Skip confirmation prompts
        #[arg(long)]
        force: bool,
    },
}

impl SyncArgs {
    fn into_options(self) -> SyncOptions {
        SyncOptions {
            connection: self.sync_connection,
            tables: self.tables,
            views: self.views,
            include_excluded: self.include_excluded,
            force: self.force,
            dry_run: self.dry_run,
            skip_backup: self.skip_backup,
            batch_size: self.batch_size,
            memory_limit_mb: (self.memory_limit >= 0).then_some(self.memory_limit),
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --log; default to info.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let config = Config::load()?;

    match cli.command {
        Commands::Pull {
            sync,
            analyze_only,
            skip_sequences,
        } => {
            let options = SyncOptions {
                analyze_only,
                skip_sequences,
                ..sync.into_options()
            };
            Orchestrator::new(config, options).pull().await?;
        }
        Commands::Clone {
            sync,
            skip_views,
            skip_sync_data,
        } => {
            let options = SyncOptions {
                skip_views,
                skip_sync_data,
                ..sync.into_options()
            };
            Orchestrator::new(config, options).clone_database().await?;
        }
        Commands::Restore {
            file,
            list,
            sync_connection,
            force,
        } => {
            let options = SyncOptions {
                connection: sync_connection,
                force,
                ..Default::default()
            };
            Orchestrator::new(config, options)
                .restore(file.as_deref(), list)
                .await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod main_tests;
