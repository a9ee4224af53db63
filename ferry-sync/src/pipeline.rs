//! Shared entrypoints used by the CLI and the daemon.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;

use ferry_core::error::ConfigError;
use ferry_core::{
    config, FerryConfig, MigrationPlan, Phase, RegistrySet, ReportSink, RunReport, StateStore,
    SyncConfiguration, SyncMode,
};

use crate::error::{ExecutorError, SyncError};
use crate::executor::PhaseExecutor;
use crate::locks::ModuleLocks;
use crate::planner::MigrationPlanner;
use crate::report::{StoreSink, TracingSink};
use crate::rollback::RollbackManager;
use crate::transfer::{SyncOutcome, TransferEngine};

/// Everything a command needs: config, registries, durable state and the
/// module locks shared by every engine built from it.
#[derive(Debug, Clone)]
pub struct FerryContext {
    pub home: PathBuf,
    pub config: FerryConfig,
    pub registries: RegistrySet,
    pub store: StateStore,
    locks: ModuleLocks,
}

impl FerryContext {
    /// Load `<home>/.ferry/config.yaml` and open file registries for every
    /// environment it mentions.
    pub fn open_at(home: &Path) -> Result<Self, ConfigError> {
        let config = config::load_at(home)?;
        let registries = config.open_registries_at(home, std::iter::empty());
        Ok(Self::with_registries(home, config, registries))
    }

    pub fn with_registries(home: &Path, config: FerryConfig, registries: RegistrySet) -> Self {
        Self {
            home: home.to_path_buf(),
            config,
            registries,
            store: StateStore::new(home),
            locks: ModuleLocks::new(),
        }
    }

    /// Make sure `environments` have a registry, opening file registries at
    /// their configured or default directory.
    pub fn ensure_environments<'a>(
        &mut self,
        environments: impl IntoIterator<Item = &'a ferry_core::Environment>,
    ) {
        let missing: Vec<_> = environments
            .into_iter()
            .filter(|env| !self.registries.contains(env))
            .cloned()
            .collect();
        let opened = self.config.open_registries_at(&self.home, &missing);
        for env in &missing {
            if let Some(client) = opened.get(env) {
                self.registries.insert(client);
            }
        }
    }

    pub fn engine(&self) -> TransferEngine {
        TransferEngine::from_config(&self.config.execution, self.locks.clone())
    }

    pub fn rollback_manager(&self) -> RollbackManager {
        RollbackManager::new(self.store.clone(), self.locks.clone())
    }

    pub fn planner(&self) -> MigrationPlanner {
        MigrationPlanner::new(self.registries.clone())
    }

    /// Executor wired to log and persist every report.
    pub fn executor(&self) -> PhaseExecutor {
        PhaseExecutor::new(
            self.registries.clone(),
            self.store.clone(),
            self.engine(),
            self.rollback_manager(),
        )
        .with_failure_threshold(self.config.execution.failure_threshold)
        .with_sink(Arc::new(TracingSink))
        .with_sink(Arc::new(StoreSink::new(self.store.clone())))
    }

    fn sinks(&self) -> [Box<dyn ReportSink>; 2] {
        [
            Box::new(TracingSink),
            Box::new(StoreSink::new(self.store.clone())),
        ]
    }
}

/// Run the remaining phases of `plan` in order, stopping at the first
/// terminal phase. Returns the report of every phase run.
pub async fn run_plan(
    executor: &PhaseExecutor,
    plan: &mut MigrationPlan,
) -> Result<Vec<RunReport>, ExecutorError> {
    let mut reports = Vec::new();
    if matches!(plan.current_phase, Phase::NotStarted | Phase::Preparing) {
        reports.push(executor.prepare(plan).await?);
    }
    if plan.current_phase == Phase::Prepared
        || (plan.current_phase == Phase::Executing && !plan.outcome.validation_started)
    {
        reports.push(executor.execute(plan).await?);
    }
    if plan.current_phase == Phase::Executing
        || (plan.current_phase == Phase::Validating && !plan.outcome.validation_passed)
    {
        reports.push(executor.validate(plan).await?);
    }
    if plan.current_phase == Phase::Validating && plan.outcome.validation_passed {
        reports.push(executor.complete(plan).await?);
    }
    Ok(reports)
}

/// Run the named sync from config.
pub async fn run_sync(ctx: &FerryContext, name: &str) -> Result<SyncOutcome, SyncError> {
    let sync = ctx
        .config
        .find_sync(name)
        .cloned()
        .ok_or_else(|| SyncError::UnknownSync(name.to_string()))?;
    run_sync_config(ctx, &sync).await
}

/// Run one sync and emit its report.
///
/// The incremental watermark advances to the run's start time only when
/// nothing failed and no conflict was left unresolved; otherwise the next
/// run looks at the same window again.
pub async fn run_sync_config(
    ctx: &FerryContext,
    sync: &SyncConfiguration,
) -> Result<SyncOutcome, SyncError> {
    if !sync.enabled {
        return Err(SyncError::Disabled(sync.name.clone()));
    }
    let source = ctx.registries.require(&sync.source_environment)?;
    let target = ctx.registries.require(&sync.target_environment)?;
    let watermark = match sync.mode {
        SyncMode::Incremental => ctx.store.load_watermark(&sync.name)?,
        _ => None,
    };
    let started = Utc::now();

    let outcome = ctx
        .engine()
        .sync(source.as_ref(), target.as_ref(), sync, watermark)
        .await?;

    if sync.mode == SyncMode::Incremental
        && outcome.failed.is_empty()
        && outcome.unresolved().next().is_none()
    {
        ctx.store.save_watermark(&sync.name, started)?;
    }

    let report = outcome.to_report();
    for sink in ctx.sinks() {
        sink.emit(&report);
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_core::memory::MemoryRegistry;
    use ferry_core::{ModuleRecord, ModuleStatus, Payload};
    use tempfile::TempDir;

    #[test]
    fn open_at_empty_home_uses_defaults() {
        let home = TempDir::new().expect("home");
        let ctx = FerryContext::open_at(home.path()).expect("open");
        assert_eq!(ctx.config, FerryConfig::default());
        assert_eq!(ctx.registries.environments().count(), 0);
    }

    #[test]
    fn ensure_environments_opens_default_file_registries() {
        let home = TempDir::new().expect("home");
        let mut ctx = FerryContext::open_at(home.path()).expect("open");
        let staging = ferry_core::Environment::from("staging");
        ctx.ensure_environments([&staging]);
        assert!(ctx.registries.contains(&staging));
    }

    #[tokio::test]
    async fn unknown_sync_name_is_an_error() {
        let home = TempDir::new().expect("home");
        let ctx = FerryContext::open_at(home.path()).expect("open");
        assert!(matches!(
            run_sync(&ctx, "nightly").await,
            Err(SyncError::UnknownSync(_))
        ));
    }

    #[tokio::test]
    async fn incremental_watermark_only_advances_on_clean_runs() {
        let home = TempDir::new().expect("home");
        let rec = ModuleRecord::new("dao", "1.0.0", ModuleStatus::Testing, Payload::new());
        let source = Arc::new(MemoryRegistry::new("staging").with_records([rec]));
        let target = Arc::new(MemoryRegistry::new("production"));
        let registries = RegistrySet::new().with(source.clone()).with(target.clone());
        let mut config = FerryConfig::default();
        config.execution.backoff_ms = 0;
        config.execution.max_backoff_ms = 0;
        let ctx = FerryContext::with_registries(home.path(), config, registries);

        let mut sync = SyncConfiguration::new("nightly", "staging", "production");
        sync.mode = SyncMode::Incremental;

        target.set_offline(true);
        let failed = run_sync_config(&ctx, &sync).await;
        assert!(failed.is_err(), "listing an offline registry fails the run");
        assert_eq!(ctx.store.load_watermark("nightly").unwrap(), None);

        target.set_offline(false);
        let out = run_sync_config(&ctx, &sync).await.expect("sync");
        assert_eq!(out.synced.len(), 1);
        assert!(ctx.store.load_watermark("nightly").unwrap().is_some());
        assert_eq!(ctx.store.recent_reports(10).unwrap().len(), 1);
    }
}
