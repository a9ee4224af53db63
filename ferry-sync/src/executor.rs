//! Drives a [`MigrationPlan`] through its lifecycle.
//!
//! ```text
//! prepare   NOT_STARTED → PREPARING → PREPARED        (or FAILED)
//! execute   PREPARED → EXECUTING                      (or FAILED)
//! validate  EXECUTING → VALIDATING                    (or FAILED)
//! complete  VALIDATING(pass) → COMPLETED
//! rollback  any non-terminal, or FAILED → ROLLED_BACK (or FAILED, partial)
//! ```
//!
//! Each transition is persisted before the phase touches a registry, so a
//! crashed run can be resumed: `prepare` from PREPARING, `execute` from
//! EXECUTING until validation has started. Module failures are recorded on
//! the plan; only illegal transitions and store errors are raised.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;

use ferry_core::{
    FailureCode, MigrationPlan, ModuleFailure, ModuleId, Phase, PlanSnapshot, RegistryClient,
    RegistrySet, ReportSink, ReportSubject, RunReport, SnapshotEntry, StateStore,
};

use crate::error::{ExecutorError, PhaseTransitionError, SnapshotError};
use crate::rollback::RollbackManager;
use crate::transfer::TransferEngine;

pub const DEFAULT_FAILURE_THRESHOLD: f64 = 0.5;

pub struct PhaseExecutor {
    registries: RegistrySet,
    store: StateStore,
    engine: TransferEngine,
    rollback: RollbackManager,
    failure_threshold: f64,
    sinks: Vec<Arc<dyn ReportSink>>,
    cancel: CancellationToken,
}

impl PhaseExecutor {
    pub fn new(
        registries: RegistrySet,
        store: StateStore,
        engine: TransferEngine,
        rollback: RollbackManager,
    ) -> Self {
        Self {
            registries,
            store,
            engine,
            rollback,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            sinks: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// `execute` fails the plan when the failed fraction is strictly greater.
    pub fn with_failure_threshold(mut self, threshold: f64) -> Self {
        self.failure_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Cancelling stops new module work; in-flight modules finish.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    // -- prepare ------------------------------------------------------------

    /// Snapshot every module. All-or-nothing: a single failure discards the
    /// plan's rollback points and fails the plan.
    pub async fn prepare(&self, plan: &mut MigrationPlan) -> Result<RunReport, ExecutorError> {
        match plan.current_phase {
            Phase::NotStarted => {}
            Phase::Preparing => {
                tracing::info!(plan = %plan.plan_id, "resuming interrupted prepare");
                self.rollback.discard_plan_points(&plan.plan_id)?;
            }
            _ => return Err(refuse(plan, Phase::Preparing)),
        }
        let source = self.registries.require(&plan.source_environment)?;
        let target = self.registries.require(&plan.target_environment)?;
        if plan.current_phase == Phase::NotStarted {
            self.transition(plan, Phase::Preparing, None, BTreeSet::new(), BTreeMap::new())?;
        }

        let results: Vec<_> = {
            let (source, target) = (source.as_ref(), target.as_ref());
            let plan_ref: &MigrationPlan = plan;
            stream::iter(&plan_ref.module_ids)
                .map(|id| async move {
                    (id.clone(), self.snapshot_module(plan_ref, source, target, id).await)
                })
                .buffer_unordered(self.engine.concurrency())
                .collect()
                .await
        };

        let mut entries = BTreeMap::new();
        let mut failed = BTreeMap::new();
        for (id, result) in results {
            match result {
                Ok(entry) => {
                    entries.insert(id, entry);
                }
                Err(failure) => {
                    failed.insert(id, failure);
                }
            }
        }

        if !failed.is_empty() {
            let discarded = self.rollback.discard_plan_points(&plan.plan_id)?;
            tracing::warn!(
                plan = %plan.plan_id,
                failed = failed.len(),
                discarded,
                "prepare failed, snapshots discarded"
            );
            plan.outcome.failed.extend(failed.clone());
            let note = format!("{} module(s) could not be snapshotted", failed.len());
            return self.transition(plan, Phase::Failed, Some(note), BTreeSet::new(), failed);
        }

        self.store.save_snapshot(&PlanSnapshot {
            plan_id: plan.plan_id.clone(),
            taken_at: Utc::now(),
            entries,
        })?;
        let prepared = plan.module_ids.clone();
        self.transition(plan, Phase::Prepared, None, prepared, BTreeMap::new())
    }

    async fn snapshot_module(
        &self,
        plan: &MigrationPlan,
        source: &dyn RegistryClient,
        target: &dyn RegistryClient,
        module_id: &ModuleId,
    ) -> Result<SnapshotEntry, ModuleFailure> {
        let record = self
            .engine
            .export_one(source, module_id)
            .await
            .map_err(|err| err.to_failure())?;

        let target_rollback_id = match self
            .rollback
            .create_point(
                target,
                module_id,
                Some(&plan.plan_id),
                &format!("pre-migration snapshot for plan {}", plan.plan_id),
                &plan.created_by,
            )
            .await
        {
            Ok(point) => Some(point.rollback_id),
            Err(SnapshotError::ModuleNotFound { .. }) => None,
            Err(err) => return Err(ModuleFailure::new(FailureCode::SnapshotFailed, err.to_string())),
        };

        Ok(SnapshotEntry {
            module_id: module_id.clone(),
            checksum: record.checksum.clone(),
            record,
            target_rollback_id,
        })
    }

    // -- execute ------------------------------------------------------------

    /// Export from the source and import into the target, module by module.
    pub async fn execute(&self, plan: &mut MigrationPlan) -> Result<RunReport, ExecutorError> {
        match plan.current_phase {
            Phase::Prepared => {}
            Phase::Executing if !plan.outcome.validation_started => {
                tracing::info!(plan = %plan.plan_id, "resuming interrupted execute");
            }
            _ => return Err(refuse(plan, Phase::Executing)),
        }
        let source = self.registries.require(&plan.source_environment)?;
        let target = self.registries.require(&plan.target_environment)?;
        self.store.load_snapshot(&plan.plan_id)?;
        if plan.current_phase == Phase::Prepared {
            let (done, failed) = (plan.outcome.transferred.clone(), plan.outcome.failed.clone());
            self.transition(plan, Phase::Executing, None, done, failed)?;
        }

        let pending: Vec<ModuleId> = plan
            .module_ids
            .iter()
            .filter(|id| !plan.outcome.transferred.contains(*id))
            .cloned()
            .collect();
        let dry_run = plan.dry_run;
        let results: Vec<_> = {
            let (source, target) = (source.as_ref(), target.as_ref());
            stream::iter(&pending)
                .map(|id| async move {
                    if self.cancel.is_cancelled() {
                        return (id.clone(), None);
                    }
                    (id.clone(), Some(self.transfer_module(source, target, id, dry_run).await))
                })
                .buffer_unordered(self.engine.concurrency())
                .collect()
                .await
        };

        let mut cancelled = false;
        for (id, result) in results {
            match result {
                None => {
                    cancelled = true;
                    plan.outcome.failed.insert(
                        id,
                        ModuleFailure::new(FailureCode::Cancelled, "cancelled before transfer"),
                    );
                }
                Some(Ok(())) => {
                    plan.outcome.failed.remove(&id);
                    plan.outcome.transferred.insert(id);
                }
                Some(Err(failure)) => {
                    tracing::warn!(plan = %plan.plan_id, module = %id, code = %failure.code, "transfer failed");
                    plan.outcome.failed.insert(id, failure);
                }
            }
        }

        let (done, failed) = (plan.outcome.transferred.clone(), plan.outcome.failed.clone());
        if cancelled {
            return self.fail_cancelled(plan, done, failed);
        }
        let total = plan.module_ids.len().max(1) as f64;
        let fraction = failed.len() as f64 / total;
        if fraction > self.failure_threshold {
            let note = format!(
                "{} of {} modules failed (threshold {})",
                failed.len(),
                plan.module_ids.len(),
                self.failure_threshold
            );
            return self.transition(plan, Phase::Failed, Some(note), done, failed);
        }
        self.store.save_plan(plan)?;
        Ok(self.finish(plan, done, failed))
    }

    async fn transfer_module(
        &self,
        source: &dyn RegistryClient,
        target: &dyn RegistryClient,
        module_id: &ModuleId,
        dry_run: bool,
    ) -> Result<(), ModuleFailure> {
        let record = self
            .engine
            .export_one(source, module_id)
            .await
            .map_err(|err| err.to_failure())?;
        if dry_run {
            tracing::info!(module = %module_id, version = %record.version, "dry run: would import");
            return Ok(());
        }
        self.engine
            .import_one(target, &record, true)
            .await
            .map(|_| ())
            .map_err(|err| err.to_failure())
    }

    // -- validate -----------------------------------------------------------

    /// Re-read every transferred module and compare it with the baseline.
    /// Dry runs compare the source instead, since nothing was written.
    pub async fn validate(&self, plan: &mut MigrationPlan) -> Result<RunReport, ExecutorError> {
        match plan.current_phase {
            Phase::Executing => {}
            Phase::Validating if !plan.outcome.validation_passed => {}
            _ => return Err(refuse(plan, Phase::Validating)),
        }
        let env = if plan.dry_run {
            &plan.source_environment
        } else {
            &plan.target_environment
        };
        let registry = self.registries.require(env)?;
        let baseline = self.store.load_snapshot(&plan.plan_id)?;
        if plan.current_phase == Phase::Executing {
            plan.outcome.validation_started = true;
            let (done, failed) = (plan.outcome.migrated.clone(), plan.outcome.failed.clone());
            self.transition(plan, Phase::Validating, None, done, failed)?;
        }

        let to_check: Vec<ModuleId> = plan.outcome.transferred.iter().cloned().collect();
        let results: Vec<_> = {
            let registry = registry.as_ref();
            let baseline = &baseline;
            stream::iter(&to_check)
                .map(|id| async move {
                    if self.cancel.is_cancelled() {
                        return (id.clone(), None);
                    }
                    let entry = baseline.entries.get(id);
                    (id.clone(), Some(self.validate_module(registry, id, entry).await))
                })
                .buffer_unordered(self.engine.concurrency())
                .collect()
                .await
        };

        let mut cancelled = false;
        for (id, result) in results {
            match result {
                None => {
                    cancelled = true;
                    plan.outcome.failed.insert(
                        id,
                        ModuleFailure::new(FailureCode::Cancelled, "cancelled before validation"),
                    );
                }
                Some(Ok(())) => {
                    plan.outcome.migrated.insert(id);
                }
                Some(Err(failure)) => {
                    tracing::warn!(plan = %plan.plan_id, module = %id, code = %failure.code, "validation failed");
                    plan.outcome.migrated.remove(&id);
                    plan.outcome.failed.insert(id, failure);
                }
            }
        }

        let (done, failed) = (plan.outcome.migrated.clone(), plan.outcome.failed.clone());
        if cancelled {
            return self.fail_cancelled(plan, done, failed);
        }
        if !failed.is_empty() {
            let note = format!("{} module(s) not migrated", failed.len());
            return self.transition(plan, Phase::Failed, Some(note), done, failed);
        }
        plan.outcome.validation_passed = true;
        self.store.save_plan(plan)?;
        Ok(self.finish(plan, done, failed))
    }

    async fn validate_module(
        &self,
        registry: &dyn RegistryClient,
        module_id: &ModuleId,
        entry: Option<&SnapshotEntry>,
    ) -> Result<(), ModuleFailure> {
        let Some(entry) = entry else {
            return Err(ModuleFailure::new(
                FailureCode::MissingRecord,
                "no baseline entry for module",
            ));
        };
        let record = match self.engine.export_one(registry, module_id).await {
            Ok(record) => record,
            Err(err) if err.kind == FailureCode::NotFound => {
                return Err(ModuleFailure::new(
                    FailureCode::MissingRecord,
                    format!("missing from {} after transfer", registry.environment()),
                ))
            }
            Err(err) => return Err(err.to_failure()),
        };
        if record.checksum != entry.checksum {
            return Err(ModuleFailure::new(
                FailureCode::ValidationMismatch,
                format!("expected {}, found {}", entry.checksum.short(), record.checksum.short()),
            ));
        }
        Ok(())
    }

    // -- complete -----------------------------------------------------------

    pub async fn complete(&self, plan: &mut MigrationPlan) -> Result<RunReport, ExecutorError> {
        if plan.current_phase != Phase::Validating || !plan.outcome.validation_passed {
            return Err(refuse(plan, Phase::Completed));
        }
        let migrated = plan.outcome.migrated.clone();
        self.transition(plan, Phase::Completed, None, migrated, BTreeMap::new())
    }

    // -- rollback -----------------------------------------------------------

    /// Restore the target's pre-migration state. Modules absent from the
    /// target before migration are deleted.
    pub async fn rollback(&self, plan: &mut MigrationPlan) -> Result<RunReport, ExecutorError> {
        if !plan.current_phase.can_transition_to(Phase::RolledBack) {
            return Err(refuse(plan, Phase::RolledBack));
        }
        let target = self.registries.require(&plan.target_environment)?;
        let touched_target = !plan.dry_run && plan.history.iter().any(|t| t.to == Phase::Executing);
        let entries: Vec<SnapshotEntry> = match self.store.find_snapshot(&plan.plan_id)? {
            Some(baseline) if touched_target => baseline.entries.into_values().collect(),
            _ => Vec::new(),
        };

        let results: Vec<_> = {
            let target = target.as_ref();
            stream::iter(&entries)
                .map(|entry| async move {
                    (entry.module_id.clone(), self.rollback_module(target, entry).await)
                })
                .buffer_unordered(self.engine.concurrency())
                .collect()
                .await
        };

        let mut restored = BTreeSet::new();
        let mut partial = BTreeMap::new();
        for (id, result) in results {
            match result {
                Ok(()) => {
                    restored.insert(id);
                }
                Err(failure) => {
                    tracing::error!(plan = %plan.plan_id, module = %id, code = %failure.code, "rollback failed");
                    partial.insert(id, failure);
                }
            }
        }

        if partial.is_empty() {
            plan.outcome.partial_rollback.clear();
            return self.transition(plan, Phase::RolledBack, None, restored, partial);
        }
        plan.outcome.partial_rollback = partial.clone();
        let note = format!("{} module(s) could not be restored", partial.len());
        if plan.current_phase == Phase::Failed {
            tracing::warn!(plan = %plan.plan_id, "{note}");
            self.store.save_plan(plan)?;
            return Ok(self.finish(plan, restored, partial));
        }
        self.transition(plan, Phase::Failed, Some(note), restored, partial)
    }

    async fn rollback_module(
        &self,
        target: &dyn RegistryClient,
        entry: &SnapshotEntry,
    ) -> Result<(), ModuleFailure> {
        match &entry.target_rollback_id {
            Some(rollback_id) => self
                .rollback
                .restore(&self.registries, rollback_id)
                .await
                .map(|_| ())
                .map_err(|err| err.to_failure()),
            None => self
                .engine
                .remove_one(target, &entry.module_id)
                .await
                .map_err(|err| ModuleFailure::new(FailureCode::RestoreFailed, err.to_string())),
        }
    }

    // -- helpers ------------------------------------------------------------

    /// Check, record and persist `plan → to`, then report the modules that
    /// have succeeded and failed so far.
    fn transition(
        &self,
        plan: &mut MigrationPlan,
        to: Phase,
        note: Option<String>,
        succeeded: BTreeSet<ModuleId>,
        failed: BTreeMap<ModuleId, ModuleFailure>,
    ) -> Result<RunReport, ExecutorError> {
        let from = plan.current_phase;
        if !from.can_transition_to(to) {
            return Err(refuse(plan, to));
        }
        plan.record_transition(to, note);
        self.store.save_plan(plan)?;
        tracing::info!(plan = %plan.plan_id, %from, %to, "phase transition");
        Ok(self.finish(plan, succeeded, failed))
    }

    fn fail_cancelled(
        &self,
        plan: &mut MigrationPlan,
        succeeded: BTreeSet<ModuleId>,
        failed: BTreeMap<ModuleId, ModuleFailure>,
    ) -> Result<RunReport, ExecutorError> {
        plan.outcome.cancelled = true;
        tracing::warn!(plan = %plan.plan_id, phase = %plan.current_phase, "plan cancelled");
        self.transition(plan, Phase::Failed, Some("cancelled".to_string()), succeeded, failed)
    }

    /// Hand a report to every sink.
    fn finish(
        &self,
        plan: &MigrationPlan,
        succeeded: BTreeSet<ModuleId>,
        failed: BTreeMap<ModuleId, ModuleFailure>,
    ) -> RunReport {
        let mut report = RunReport::new(
            ReportSubject::Plan(plan.plan_id.clone()),
            plan.current_phase.to_string(),
        );
        report.succeeded = succeeded;
        report.failed = failed;
        for sink in &self.sinks {
            sink.emit(&report);
        }
        report
    }
}

fn refuse(plan: &MigrationPlan, attempted: Phase) -> ExecutorError {
    PhaseTransitionError {
        plan_id: plan.plan_id.clone(),
        from: plan.current_phase,
        attempted,
    }
    .into()
}
