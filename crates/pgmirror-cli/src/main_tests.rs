//! CLI tests

use super::*;

#[test]
fn pull_parses_common_flags() {
    let cli = Cli::try_parse_from([
        "pgmirror",
        "pull",
        "--sync-connection",
        "staging",
        "--tables",
        "users,orders",
        "--batch-size",
        "250",
        "--dry-run",
        "--skip-backup",
    ])
    .expect("parse pull");

    let Commands::Pull {
        sync,
        analyze_only,
        skip_sequences,
    } = cli.command
    else {
        panic!("expected pull");
    };
    assert!(!analyze_only);
    assert!(!skip_sequences);

    let options = sync.into_options();
    assert_eq!(options.connection.as_deref(), Some("staging"));
    assert_eq!(
        options.tables,
        Some(vec!["users".to_string(), "orders".to_string()])
    );
    assert_eq!(options.views, None);
    assert_eq!(options.batch_size, Some(250));
    assert!(options.dry_run);
    assert!(options.skip_backup);
    assert_eq!(options.memory_limit_mb, None);
}

#[test]
fn pull_only_flags() {
    let cli = Cli::try_parse_from(["pgmirror", "pull", "--analyze-only", "--skip-sequences"])
        .expect("parse pull");
    let Commands::Pull {
        analyze_only,
        skip_sequences,
        ..
    } = cli.command
    else {
        panic!("expected pull");
    };
    assert!(analyze_only);
    assert!(skip_sequences);
}

#[test]
fn clone_only_flags() {
    let cli = Cli::try_parse_from([
        "pgmirror",
        "clone",
        "--skip-views",
        "--skip-sync-data",
        "--force",
    ])
    .expect("parse clone");
    let Commands::Clone {
        sync,
        skip_views,
        skip_sync_data,
    } = cli.command
    else {
        panic!("expected clone");
    };
    assert!(skip_views);
    assert!(skip_sync_data);
    assert!(sync.force);
}

#[test]
fn clone_rejects_pull_only_flags() {
    assert!(Cli::try_parse_from(["pgmirror", "clone", "--analyze-only"]).is_err());
    assert!(Cli::try_parse_from(["pgmirror", "pull", "--skip-views"]).is_err());
}

#[test]
fn memory_limit_defaults_to_unrestricted() {
    let cli = Cli::try_parse_from(["pgmirror", "pull"]).expect("parse pull");
    let Commands::Pull { sync, .. } = cli.command else {
        panic!("expected pull");
    };
    assert_eq!(sync.memory_limit, -1);
    assert_eq!(sync.into_options().memory_limit_mb, None);

    let cli = Cli::try_parse_from(["pgmirror", "pull", "--memory-limit", "512"]).expect("parse");
    let Commands::Pull { sync, .. } = cli.command else {
        panic!("expected pull");
    };
    assert_eq!(sync.into_options().memory_limit_mb, Some(512));
}

#[test]
fn restore_takes_positional_file_or_list() {
    let cli = Cli::try_parse_from(["pgmirror", "restore", "2026-01"]).expect("parse restore");
    let Commands::Restore { file, list, .. } = cli.command else {
        panic!("expected restore");
    };
    assert_eq!(file.as_deref(), Some("2026-01"));
    assert!(!list);

    let cli = Cli::try_parse_from(["pgmirror", "restore", "--list"]).expect("parse restore");
    let Commands::Restore { file, list, .. } = cli.command else {
        panic!("expected restore");
    };
    assert!(file.is_none());
    assert!(list);
}

#[test]
fn missing_subcommand_is_an_error() {
    assert!(Cli::try_parse_from(["pgmirror"]).is_err());
}
