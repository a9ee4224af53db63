//! `ferry export` / `ferry import`: interchange files.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;

use ferry_core::serializer::{self, Format, InterchangeDocument};
use ferry_core::{Environment, ModuleId};

use super::{block_on, open_context};

/// Arguments for `ferry export`.
#[derive(Args, Debug)]
pub struct ExportArgs {
    #[arg(long)]
    pub env: String,

    /// Module to export; repeat for several. Omit to export everything.
    #[arg(long = "module")]
    pub modules: Vec<String>,

    /// Destination file (stdout when omitted).
    #[arg(long, short)]
    pub output: Option<PathBuf>,

    /// json, yaml or jsonl (defaults to the output extension, then json).
    #[arg(long)]
    pub format: Option<Format>,
}

/// Arguments for `ferry import`.
#[derive(Args, Debug)]
pub struct ImportArgs {
    #[arg(long)]
    pub env: String,

    #[arg(long, short)]
    pub input: PathBuf,

    /// json, yaml or jsonl (defaults to the input extension).
    #[arg(long)]
    pub format: Option<Format>,

    /// Replace modules that already exist with different content.
    #[arg(long)]
    pub overwrite: bool,
}

impl ExportArgs {
    pub fn run(self, home: &Path) -> Result<()> {
        let env = Environment::from(self.env.as_str());
        let ctx = open_context(home, [&env])?;
        let registry = ctx.registries.require(&env)?;
        let engine = ctx.engine();
        let ids: BTreeSet<ModuleId> = self.modules.iter().map(|m| ModuleId::from(m.as_str())).collect();

        let results = block_on(async {
            if ids.is_empty() {
                engine.export_all(registry.as_ref()).await
            } else {
                Ok(engine.export(registry.as_ref(), &ids).await)
            }
        })?
        .with_context(|| format!("failed to list modules in {env}"))?;

        let mut records = Vec::new();
        let mut failures = 0usize;
        for result in results {
            match result {
                Ok(record) => records.push(record),
                Err(err) => {
                    failures += 1;
                    eprintln!("{} {err}", "✗".red());
                }
            }
        }

        let format = self
            .format
            .or_else(|| self.output.as_deref().and_then(Format::from_path))
            .unwrap_or_default();
        let count = records.len();
        let text = serializer::encode(&InterchangeDocument::new(Some(env.clone()), records), format)
            .context("failed to encode interchange document")?;

        match &self.output {
            Some(path) => {
                fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))?;
                eprintln!(
                    "{} exported {count} module(s) from {env} to {} ({format})",
                    "✓".green(),
                    path.display()
                );
            }
            None => print!("{text}"),
        }

        if failures > 0 {
            bail!("{failures} module(s) could not be exported");
        }
        Ok(())
    }
}

impl ImportArgs {
    pub fn run(self, home: &Path) -> Result<()> {
        let format = match self.format.or_else(|| Format::from_path(&self.input)) {
            Some(format) => format,
            None => bail!(
                "cannot tell the format of {}; pass --format",
                self.input.display()
            ),
        };
        let text = fs::read_to_string(&self.input)
            .with_context(|| format!("failed to read {}", self.input.display()))?;
        let doc = serializer::decode(&text, format)
            .with_context(|| format!("failed to decode {}", self.input.display()))?;
        for id in doc.corrupted() {
            eprintln!("{} {id}: checksum does not match payload", "!".yellow());
        }

        let env = Environment::from(self.env.as_str());
        let ctx = open_context(home, [&env])?;
        let registry = ctx.registries.require(&env)?;
        let outcome = block_on(ctx.engine().import(registry.as_ref(), &doc.records, self.overwrite))?;

        println!(
            "{} imported into {env}: {} imported, {} skipped, {} failed",
            if outcome.failed.is_empty() { "✓".green() } else { "✗".red() },
            outcome.imported.len(),
            outcome.skipped.len(),
            outcome.failed.len(),
        );
        for (id, err) in &outcome.failed {
            println!("  ✗  {id}: {} {}", err.kind.as_str().red(), err.detail);
        }
        if !outcome.failed.is_empty() {
            bail!("{} module(s) failed to import", outcome.failed.len());
        }
        Ok(())
    }
}
