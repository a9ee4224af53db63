//! `ferry rollback`: manual rollback points.

use std::path::Path;

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use ferry_core::{Environment, ModuleId, PlanId, RollbackId, RollbackScope};

use super::{block_on, open_context, print_json};

#[derive(Subcommand, Debug)]
pub enum RollbackCommand {
    /// List rollback points for a module or a plan, newest first.
    List {
        #[arg(long, conflicts_with = "plan", required_unless_present = "plan")]
        module: Option<String>,
        #[arg(long)]
        plan: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Snapshot a module's current record in an environment.
    Create {
        #[arg(long)]
        env: String,
        #[arg(long)]
        module: String,
        #[arg(long, default_value = "manual snapshot")]
        reason: String,
        #[arg(long, default_value = "cli")]
        created_by: String,
    },
    /// Write a rollback point's snapshot back to its environment.
    Restore { rollback_id: String },
}

#[derive(Tabled)]
struct PointRow {
    #[tabled(rename = "rollback id")]
    rollback_id: String,
    #[tabled(rename = "module")]
    module: String,
    #[tabled(rename = "env")]
    environment: String,
    #[tabled(rename = "version")]
    version: String,
    #[tabled(rename = "plan")]
    plan: String,
    #[tabled(rename = "reason")]
    reason: String,
    #[tabled(rename = "created")]
    created: String,
}

pub fn run(command: RollbackCommand, home: &Path) -> Result<()> {
    match command {
        RollbackCommand::List { module, plan, json } => {
            let scope = match (module, plan) {
                (Some(module), _) => RollbackScope::Module(ModuleId::from(module.as_str())),
                (None, Some(plan)) => RollbackScope::Plan(PlanId::from(plan.as_str())),
                (None, None) => anyhow::bail!("provide --module or --plan"),
            };
            list(home, &scope, json)
        }
        RollbackCommand::Create {
            env,
            module,
            reason,
            created_by,
        } => {
            let env = Environment::from(env.as_str());
            let module = ModuleId::from(module.as_str());
            let ctx = open_context(home, [&env])?;
            let registry = ctx.registries.require(&env)?;
            let point = block_on(ctx.rollback_manager().create_point(
                registry.as_ref(),
                &module,
                None,
                &reason,
                &created_by,
            ))?
            .with_context(|| format!("failed to snapshot '{module}' in {env}"))?;
            println!(
                "{} rollback point {} for {} {} in {}",
                "✓".green(),
                point.rollback_id.as_str().bold(),
                point.module_id,
                point.snapshot.version,
                point.environment
            );
            Ok(())
        }
        RollbackCommand::Restore { rollback_id } => {
            let rollback_id = RollbackId::from(rollback_id.as_str());
            let ctx = open_context(home, std::iter::empty())?;
            let point = ctx
                .store
                .load_rollback_point(&rollback_id)
                .with_context(|| format!("failed to load rollback point '{rollback_id}'"))?;
            let ctx = open_context(home, [&point.environment])?;
            block_on(ctx.rollback_manager().restore(&ctx.registries, &rollback_id))?
                .with_context(|| format!("failed to restore '{rollback_id}'"))?;
            println!(
                "{} restored {} {} in {}",
                "✓".green(),
                point.module_id,
                point.snapshot.version,
                point.environment
            );
            Ok(())
        }
    }
}

fn list(home: &Path, scope: &RollbackScope, json: bool) -> Result<()> {
    let ctx = open_context(home, std::iter::empty())?;
    let points = ctx
        .rollback_manager()
        .list(scope)
        .context("failed to list rollback points")?;
    if json {
        return print_json(&points);
    }
    if points.is_empty() {
        println!("No rollback points.");
        return Ok(());
    }
    let rows: Vec<PointRow> = points
        .into_iter()
        .map(|p| PointRow {
            rollback_id: p.rollback_id.to_string(),
            module: p.module_id.to_string(),
            environment: p.environment.to_string(),
            version: p.snapshot.version,
            plan: p.plan_id.map(|id| id.to_string()).unwrap_or_else(|| "-".to_string()),
            reason: p.reason,
            created: p.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
    Ok(())
}
