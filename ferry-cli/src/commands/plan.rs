//! `ferry plan`: create, list, show and retry migration plans.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use ferry_core::{Environment, MigrationPlan, ModuleId, PlanId};
use ferry_sync::PlanRequest;

use super::{block_on, open_context, phase_label, print_json};

#[derive(Subcommand, Debug)]
pub enum PlanCommand {
    /// Validate a request and save a new NOT_STARTED plan.
    Create(CreateArgs),
    /// List saved plans, oldest first.
    List {
        #[arg(long)]
        json: bool,
    },
    /// Show one plan with its phase history.
    Show {
        plan: String,
        #[arg(long)]
        json: bool,
    },
    /// Create a plan covering only the failed modules of a FAILED plan.
    Retry {
        plan: String,
        #[arg(long, default_value = "cli")]
        created_by: String,
    },
}

#[derive(Args, Debug)]
pub struct CreateArgs {
    #[arg(long)]
    pub name: String,

    #[arg(long, default_value = "")]
    pub description: String,

    #[arg(long)]
    pub source: String,

    #[arg(long)]
    pub target: String,

    /// Module to migrate; repeat for several.
    #[arg(long = "module", required = true)]
    pub modules: Vec<String>,

    #[arg(long, default_value = "cli")]
    pub created_by: String,

    /// Read and verify only; never write to the target.
    #[arg(long)]
    pub dry_run: bool,

    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct PlanRow {
    #[tabled(rename = "plan")]
    plan_id: String,
    #[tabled(rename = "name")]
    name: String,
    #[tabled(rename = "route")]
    route: String,
    #[tabled(rename = "modules")]
    modules: usize,
    #[tabled(rename = "phase")]
    phase: String,
    #[tabled(rename = "created")]
    created: String,
}

pub fn run(command: PlanCommand, home: &Path) -> Result<()> {
    match command {
        PlanCommand::Create(args) => create(args, home),
        PlanCommand::List { json } => list(home, json),
        PlanCommand::Show { plan, json } => show(home, &PlanId::from(plan.as_str()), json),
        PlanCommand::Retry { plan, created_by } => {
            retry(home, &PlanId::from(plan.as_str()), &created_by)
        }
    }
}

fn create(args: CreateArgs, home: &Path) -> Result<()> {
    let source = Environment::from(args.source.as_str());
    let target = Environment::from(args.target.as_str());
    let ctx = open_context(home, [&source, &target])?;

    let request = PlanRequest {
        name: args.name,
        description: args.description,
        source_environment: source,
        target_environment: target,
        module_ids: args
            .modules
            .iter()
            .map(|m| ModuleId::from(m.as_str()))
            .collect::<BTreeSet<_>>(),
        created_by: args.created_by,
        dry_run: args.dry_run,
    };
    let plan = block_on(ctx.planner().create_plan(request))??;
    ctx.store.save_plan(&plan).context("failed to save plan")?;

    if args.json {
        return print_json(&plan);
    }
    println!(
        "{} created plan {} ({} → {}, {} modules{})",
        "✓".green(),
        plan.plan_id.as_str().bold(),
        plan.source_environment,
        plan.target_environment,
        plan.module_ids.len(),
        if plan.dry_run { ", dry run" } else { "" },
    );
    Ok(())
}

fn list(home: &Path, json: bool) -> Result<()> {
    let ctx = open_context(home, std::iter::empty())?;
    let plans = ctx.store.list_plans().context("failed to list plans")?;
    if json {
        return print_json(&plans);
    }
    if plans.is_empty() {
        println!("No plans yet. Run `ferry plan create` first.");
        return Ok(());
    }

    let rows: Vec<PlanRow> = plans
        .iter()
        .map(|plan| PlanRow {
            plan_id: plan.plan_id.to_string(),
            name: plan.name.clone(),
            route: format!("{} → {}", plan.source_environment, plan.target_environment),
            modules: plan.module_ids.len(),
            phase: phase_label(plan.current_phase).to_string(),
            created: plan.created_at.format("%Y-%m-%d %H:%M").to_string(),
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
    Ok(())
}

fn show(home: &Path, plan_id: &PlanId, json: bool) -> Result<()> {
    let ctx = open_context(home, std::iter::empty())?;
    let plan = ctx
        .store
        .load_plan(plan_id)
        .with_context(|| format!("failed to load plan '{plan_id}'"))?;
    if json {
        return print_json(&plan);
    }
    print_plan(&plan);
    Ok(())
}

fn retry(home: &Path, plan_id: &PlanId, created_by: &str) -> Result<()> {
    let mut ctx = open_context(home, std::iter::empty())?;
    let parent = ctx
        .store
        .load_plan(plan_id)
        .with_context(|| format!("failed to load plan '{plan_id}'"))?;
    ctx.ensure_environments([&parent.source_environment, &parent.target_environment]);

    let plan = block_on(ctx.planner().retry_plan(&parent, created_by))??;
    ctx.store.save_plan(&plan).context("failed to save retry plan")?;
    println!(
        "{} created retry plan {} for {} failed module(s)",
        "✓".green(),
        plan.plan_id.as_str().bold(),
        plan.module_ids.len()
    );
    Ok(())
}

pub fn print_plan(plan: &MigrationPlan) {
    println!("{} {}", plan.plan_id.as_str().bold(), plan.name);
    if !plan.description.is_empty() {
        println!("  {}", plan.description);
    }
    println!(
        "  route:    {} → {}{}",
        plan.source_environment,
        plan.target_environment,
        if plan.dry_run { " (dry run)" } else { "" }
    );
    println!("  phase:    {}", phase_label(plan.current_phase));
    if let Some(parent) = &plan.parent_plan_id {
        println!("  retry of: {parent}");
    }
    let modules: Vec<&str> = plan.module_ids.iter().map(ModuleId::as_str).collect();
    println!("  modules:  {}", modules.join(", "));

    if !plan.outcome.migrated.is_empty() {
        let migrated: Vec<&str> = plan.outcome.migrated.iter().map(ModuleId::as_str).collect();
        println!("  migrated: {}", migrated.join(", "));
    }
    for (module, failure) in &plan.outcome.failed {
        println!("  {}  {module}: {failure}", "✗".red());
    }
    for (module, failure) in &plan.outcome.partial_rollback {
        println!("  {}  {module} not restored: {failure}", "!".yellow());
    }
    if plan.outcome.cancelled {
        println!("  {}", "cancelled".yellow());
    }

    for transition in &plan.history {
        let note = transition.note.as_deref().unwrap_or("");
        println!(
            "    {}  {} → {}  {note}",
            transition.at.format("%Y-%m-%d %H:%M:%S"),
            transition.from,
            transition.to
        );
    }
}
