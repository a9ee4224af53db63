//! `ferry migrate <plan> <step>`: advance a plan through its phases.

use std::path::Path;

use anyhow::{bail, Context, Result};
use clap::{Args, ValueEnum};
use serde_json::json;

use ferry_core::{Phase, PlanId, RunReport};
use ferry_sync::run_plan;

use super::{block_on, open_context, phase_label, print_json, print_report};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Step {
    Prepare,
    Execute,
    Validate,
    Complete,
    Rollback,
    /// Every remaining forward phase, stopping at the first terminal one.
    Run,
}

/// Arguments for `ferry migrate`.
#[derive(Args, Debug)]
pub struct MigrateArgs {
    pub plan: String,

    #[arg(value_enum)]
    pub step: Step,

    #[arg(long)]
    pub json: bool,
}

impl MigrateArgs {
    pub fn run(self, home: &Path) -> Result<()> {
        let plan_id = PlanId::from(self.plan.as_str());
        let mut ctx = open_context(home, std::iter::empty())?;
        let mut plan = ctx
            .store
            .load_plan(&plan_id)
            .with_context(|| format!("failed to load plan '{plan_id}'"))?;
        ctx.ensure_environments([&plan.source_environment, &plan.target_environment]);

        let executor = ctx.executor();
        let token = executor.cancellation_token();
        let step = self.step;
        let reports: Vec<RunReport> = block_on(async {
            // Ctrl-c stops new module work; in-flight modules finish.
            let interrupt = tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    token.cancel();
                }
            });
            let result = match step {
                Step::Prepare => executor.prepare(&mut plan).await.map(|r| vec![r]),
                Step::Execute => executor.execute(&mut plan).await.map(|r| vec![r]),
                Step::Validate => executor.validate(&mut plan).await.map(|r| vec![r]),
                Step::Complete => executor.complete(&mut plan).await.map(|r| vec![r]),
                Step::Rollback => executor.rollback(&mut plan).await.map(|r| vec![r]),
                Step::Run => run_plan(&executor, &mut plan).await,
            };
            interrupt.abort();
            result
        })?
        .with_context(|| format!("{step:?} failed for plan '{plan_id}'"))?;

        if self.json {
            print_json(&json!({ "plan": plan, "reports": reports }))?;
        } else {
            for report in &reports {
                print_report(report);
            }
            println!("plan {} is {}", plan.plan_id, phase_label(plan.current_phase));
            if plan.current_phase == Phase::Failed && !plan.outcome.failed.is_empty() {
                println!("Run 'ferry plan retry {}' to retry the failed modules.", plan.plan_id);
            }
        }

        if plan.current_phase == Phase::Failed {
            bail!("plan {} FAILED", plan.plan_id);
        }
        Ok(())
    }
}
