//! `ferry diff <module>`: what syncing a module from source would change.

use std::path::Path;

use anyhow::{Context, Result};
use clap::Args;

use ferry_core::{Environment, ModuleId};
use ferry_sync::diff::diff_module;

use super::{block_on, open_context};

/// Arguments for `ferry diff`.
#[derive(Args, Debug)]
pub struct DiffArgs {
    pub module: String,

    #[arg(long)]
    pub source: String,

    #[arg(long)]
    pub target: String,
}

impl DiffArgs {
    pub fn run(self, home: &Path) -> Result<()> {
        let source = Environment::from(self.source.as_str());
        let target = Environment::from(self.target.as_str());
        let module = ModuleId::from(self.module.as_str());
        let ctx = open_context(home, [&source, &target])?;
        let source_registry = ctx.registries.require(&source)?;
        let target_registry = ctx.registries.require(&target)?;

        let diff = block_on(diff_module(
            &ctx.engine(),
            source_registry.as_ref(),
            target_registry.as_ref(),
            &module,
        ))?
        .with_context(|| format!("diff failed for '{module}'"))?;

        if diff.unified_diff.is_empty() {
            println!("No differences for '{module}'.");
            return Ok(());
        }
        print!("{}", diff.unified_diff);
        if !diff.unified_diff.ends_with('\n') {
            println!();
        }
        Ok(())
    }
}
