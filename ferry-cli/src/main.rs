//! Ferry: module registry migration and sync CLI.
//!
//! # Usage
//!
//! ```text
//! ferry plan create --name <n> --source <env> --target <env> --module <id>... [--dry-run]
//! ferry plan list|show <plan>|retry <plan>
//! ferry migrate <plan> prepare|execute|validate|complete|rollback|run
//! ferry sync <name> | ferry sync --source <env> --target <env> [--mode] [--policy]
//! ferry rollback list|create|restore
//! ferry export --env <env> [--module <id>...] [--output <file>] [--format json|yaml|jsonl]
//! ferry import --env <env> --input <file> [--overwrite]
//! ferry diff <module> --source <env> --target <env>
//! ferry daemon start|stop|status|sync <name>
//! ```

mod commands;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use commands::{
    daemon::DaemonCommand,
    diff::DiffArgs,
    migrate::MigrateArgs,
    plan::PlanCommand,
    rollback::RollbackCommand,
    sync::SyncArgs,
    transfer::{ExportArgs, ImportArgs},
};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "ferry",
    version,
    about = "Migrate and synchronize modules between registry environments",
    long_about = None,
)]
struct Cli {
    /// Home directory holding `.ferry/` (defaults to the user's home).
    #[arg(long, global = true, value_name = "DIR")]
    home: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create, inspect and retry migration plans.
    Plan {
        #[command(subcommand)]
        command: PlanCommand,
    },

    /// Drive a migration plan through its phases.
    Migrate(MigrateArgs),

    /// Run a configured or ad-hoc sync between two environments.
    Sync(SyncArgs),

    /// List, create and restore rollback points.
    Rollback {
        #[command(subcommand)]
        command: RollbackCommand,
    },

    /// Write modules from an environment to an interchange file.
    Export(ExportArgs),

    /// Load modules from an interchange file into an environment.
    Import(ImportArgs),

    /// Show what syncing a module from source would change in target.
    Diff(DiffArgs),

    /// Run or talk to the scheduled-sync daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    let home = match cli.home {
        Some(home) => home,
        None => dirs::home_dir().context("could not determine home directory")?,
    };

    let level = match (&cli.command, cli.verbose) {
        (_, true) => "debug",
        (Commands::Daemon { command: DaemonCommand::Start }, false) => "info",
        _ => "warn",
    };
    ferry_daemon::init_tracing(level);

    match cli.command {
        Commands::Plan { command } => commands::plan::run(command, &home),
        Commands::Migrate(args) => args.run(&home),
        Commands::Sync(args) => args.run(&home),
        Commands::Rollback { command } => commands::rollback::run(command, &home),
        Commands::Export(args) => args.run(&home),
        Commands::Import(args) => args.run(&home),
        Commands::Diff(args) => args.run(&home),
        Commands::Daemon { command } => commands::daemon::run(command, &home),
    }
}
