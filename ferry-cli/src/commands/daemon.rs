//! `ferry daemon`: scheduled-sync daemon lifecycle.

use std::path::Path;

use anyhow::{Context, Result};
use clap::Subcommand;

use ferry_daemon::paths::socket_path;
use ferry_daemon::{request_status, request_stop, request_sync, start_blocking, DaemonError};

use super::print_json;

#[derive(Subcommand, Debug)]
pub enum DaemonCommand {
    /// Run the daemon in the foreground (schedulers + socket server).
    Start,
    /// Request graceful daemon shutdown over the Unix socket.
    Stop,
    /// Query daemon runtime status over the Unix socket.
    Status,
    /// Ask the running daemon to run a configured sync now.
    Sync { name: String },
}

pub fn run(command: DaemonCommand, home: &Path) -> Result<()> {
    match command {
        DaemonCommand::Start => {
            start_blocking(home).context("daemon exited with error")?;
        }
        DaemonCommand::Stop => match request_stop(home) {
            Ok(()) => println!("daemon stop requested"),
            Err(DaemonError::DaemonNotRunning { .. }) => println!("daemon is not running"),
            Err(err) => return Err(err).context("failed to stop daemon"),
        },
        DaemonCommand::Status => match request_status(home) {
            Ok(status) => print_json(&status)?,
            Err(DaemonError::DaemonNotRunning { .. }) => print_json(&serde_json::json!({
                "running": false,
                "socket": socket_path(home).display().to_string(),
            }))?,
            Err(err) => return Err(err).context("failed to query daemon status"),
        },
        DaemonCommand::Sync { name } => {
            let summary = request_sync(home, &name)
                .with_context(|| format!("daemon sync '{name}' failed"))?;
            print_json(&summary)?;
        }
    }
    Ok(())
}
