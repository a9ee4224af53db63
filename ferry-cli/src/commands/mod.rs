pub mod daemon;
pub mod diff;
pub mod migrate;
pub mod plan;
pub mod rollback;
pub mod sync;
pub mod transfer;

use std::future::Future;
use std::path::Path;

use anyhow::{Context, Result};
use colored::{ColoredString, Colorize};
use serde::Serialize;

use ferry_core::{Environment, Phase, RunReport};
use ferry_sync::FerryContext;

/// Run one async command to completion on a fresh runtime.
pub fn block_on<F: Future>(future: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    Ok(runtime.block_on(future))
}

/// Load config and registries at `home`, opening file registries for
/// `environments` that config does not mention.
pub fn open_context<'a>(
    home: &Path,
    environments: impl IntoIterator<Item = &'a Environment>,
) -> Result<FerryContext> {
    let mut ctx = FerryContext::open_at(home)
        .with_context(|| format!("failed to load ferry config under {}", home.display()))?;
    ctx.ensure_environments(environments);
    Ok(ctx)
}

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("failed to serialize JSON output")?
    );
    Ok(())
}

pub fn phase_label(phase: Phase) -> ColoredString {
    let label = phase.to_string();
    match phase {
        Phase::Completed => label.green().bold(),
        Phase::RolledBack => label.cyan().bold(),
        Phase::Failed => label.red().bold(),
        Phase::NotStarted => label.bright_black(),
        _ => label.yellow(),
    }
}

pub fn print_report(report: &RunReport) {
    let mark = if report.is_clean() {
        "✓".green()
    } else {
        "✗".red()
    };
    println!(
        "{mark} {} {} ({} ok, {} failed, {} conflicts)",
        report.subject,
        report.stage.bold(),
        report.succeeded.len(),
        report.failed.len(),
        report.conflicts.len(),
    );
    for (module, failure) in &report.failed {
        println!("  ✗  {module}: {} {}", failure.code.as_str().red(), failure.detail);
    }
}
