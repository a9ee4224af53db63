//! `ferry sync`: run a configured sync, or an ad-hoc one between two
//! environments.

use std::path::Path;

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;

use ferry_core::{ConflictPolicy, Environment, ModuleId, SyncConfiguration, SyncMode};
use ferry_sync::{run_sync_config, SyncOutcome};

use super::{block_on, open_context, print_json};

/// Arguments for `ferry sync`.
#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Name of a sync from config.yaml (omit for an ad-hoc sync).
    pub name: Option<String>,

    #[arg(long, conflicts_with = "name", requires = "target")]
    pub source: Option<String>,

    #[arg(long, conflicts_with = "name", requires = "source")]
    pub target: Option<String>,

    /// full, incremental or selective (ad-hoc only).
    #[arg(long, default_value = "full", conflicts_with = "name")]
    pub mode: SyncMode,

    /// source-wins, target-wins, manual, skip or latest-update (ad-hoc only).
    #[arg(long, default_value = "manual", conflicts_with = "name")]
    pub policy: ConflictPolicy,

    /// Module to include in a selective sync; repeat for several.
    #[arg(long = "module", conflicts_with = "name")]
    pub modules: Vec<String>,

    #[arg(long)]
    pub json: bool,
}

impl SyncArgs {
    pub fn run(self, home: &Path) -> Result<()> {
        let sync = match (&self.name, &self.source, &self.target) {
            (Some(name), _, _) => {
                let ctx = open_context(home, std::iter::empty())?;
                ctx.config
                    .find_sync(name)
                    .cloned()
                    .with_context(|| format!("no sync named '{name}' in config"))?
            }
            (None, Some(source), Some(target)) => {
                let mut sync = SyncConfiguration::new(
                    format!("{source}-to-{target}"),
                    source.as_str(),
                    target.as_str(),
                );
                sync.mode = self.mode;
                sync.conflict_resolution = self.policy;
                sync.modules = self.modules.iter().map(|m| ModuleId::from(m.as_str())).collect();
                sync
            }
            _ => bail!("provide a sync name or both --source and --target"),
        };

        let envs: [&Environment; 2] = [&sync.source_environment, &sync.target_environment];
        let ctx = open_context(home, envs)?;
        let outcome = block_on(run_sync_config(&ctx, &sync))?
            .with_context(|| format!("sync '{}' failed", sync.name))?;

        if self.json {
            print_json(&outcome.to_report())?;
        } else {
            print_outcome(&sync, &outcome);
        }
        if !outcome.failed.is_empty() {
            bail!("{} module(s) failed to sync", outcome.failed.len());
        }
        Ok(())
    }
}

fn print_outcome(sync: &SyncConfiguration, outcome: &SyncOutcome) {
    println!(
        "{} '{}' {} → {} [{}] ({} synced, {} unchanged, {} conflicts, {} failed)",
        if outcome.failed.is_empty() { "✓".green() } else { "✗".red() },
        sync.name,
        sync.source_environment,
        sync.target_environment,
        outcome.mode,
        outcome.synced.len(),
        outcome.unchanged.len(),
        outcome.conflicts.len(),
        outcome.failed.len(),
    );
    for id in &outcome.synced {
        println!("  ✎  {id}");
    }
    for conflict in &outcome.conflicts {
        let label = if conflict.is_resolved() {
            conflict.resolution.to_string().green()
        } else {
            conflict.resolution.to_string().yellow()
        };
        println!("  ⇄  {}: {label}", conflict.module_id);
    }
    for (id, err) in &outcome.failed {
        println!("  ✗  {id}: {} {}", err.kind.as_str().red(), err.detail);
    }
}
