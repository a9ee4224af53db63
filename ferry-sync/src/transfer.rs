//! Batched export, import and two-way sync between registries.
//!
//! Every module-level operation takes the module's lock from the shared
//! [`ModuleLocks`], retries transient registry errors through the
//! [`RetryPolicy`], and reports failure per module. Nothing here is
//! transactional across modules.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};

use ferry_core::{
    get_optional, ConflictRecord, ExecutionConfig, FailureCode, ModuleId, ModuleRecord,
    RegistryClient, RegistryError, ReportSubject, RunReport, SyncConfiguration, SyncMode,
    SyncRunId,
};

use crate::conflict::ConflictResolver;
use crate::error::{SyncError, TransferError};
use crate::locks::ModuleLocks;
use crate::retry::RetryPolicy;

/// What `import_one` did with a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportAction {
    Imported,
    /// Already present (no overwrite) or already identical.
    Skipped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportOutcome {
    pub imported: BTreeSet<ModuleId>,
    pub skipped: BTreeSet<ModuleId>,
    pub failed: BTreeMap<ModuleId, TransferError>,
}

/// Result of one sync run. Every considered module lands in exactly one of
/// `synced`, `unchanged`, `failed`, or (unresolved) `conflicts`; resolved
/// conflicts also appear in `synced` or `failed` depending on the write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    pub run_id: SyncRunId,
    pub mode: SyncMode,
    pub started_at: DateTime<Utc>,
    pub synced: BTreeSet<ModuleId>,
    pub unchanged: BTreeSet<ModuleId>,
    pub conflicts: Vec<ConflictRecord>,
    pub failed: BTreeMap<ModuleId, TransferError>,
}

impl SyncOutcome {
    fn new(mode: SyncMode) -> Self {
        Self {
            run_id: SyncRunId::generate(),
            mode,
            started_at: Utc::now(),
            synced: BTreeSet::new(),
            unchanged: BTreeSet::new(),
            conflicts: Vec::new(),
            failed: BTreeMap::new(),
        }
    }

    pub fn unresolved(&self) -> impl Iterator<Item = &ConflictRecord> {
        self.conflicts.iter().filter(|c| !c.is_resolved())
    }

    pub fn to_report(&self) -> RunReport {
        let mut report = RunReport::new(ReportSubject::Sync(self.run_id.clone()), self.mode.to_string());
        report.succeeded = self.synced.clone();
        report.failed = self
            .failed
            .iter()
            .map(|(id, err)| (id.clone(), err.to_failure()))
            .collect();
        report.conflicts = self.conflicts.clone();
        report
    }
}

enum SyncStep {
    Synced,
    Unchanged,
    Outside,
    Failed(TransferError),
    Conflict(ConflictRecord, Result<(), TransferError>),
}

#[derive(Debug, Clone)]
pub struct TransferEngine {
    concurrency: usize,
    retry: RetryPolicy,
    locks: ModuleLocks,
    resolver: ConflictResolver,
}

impl TransferEngine {
    pub fn new(concurrency: usize, retry: RetryPolicy, locks: ModuleLocks) -> Self {
        Self {
            concurrency: concurrency.max(1),
            retry,
            locks,
            resolver: ConflictResolver,
        }
    }

    pub fn from_config(config: &ExecutionConfig, locks: ModuleLocks) -> Self {
        Self::new(config.effective_concurrency(), RetryPolicy::from(config), locks)
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    // -- single module ------------------------------------------------------

    /// Read `module_id` and verify its checksum.
    pub async fn export_one(
        &self,
        registry: &dyn RegistryClient,
        module_id: &ModuleId,
    ) -> Result<ModuleRecord, TransferError> {
        let _guard = self.locks.acquire(module_id).await;
        let record = self.fetch(registry, module_id).await?.ok_or_else(|| {
            TransferError::new(
                module_id.clone(),
                FailureCode::NotFound,
                format!("not found in {}", registry.environment()),
            )
        })?;
        verified(record)
    }

    /// Store `record`, skipping when it is already there.
    pub async fn import_one(
        &self,
        registry: &dyn RegistryClient,
        record: &ModuleRecord,
        overwrite: bool,
    ) -> Result<ImportAction, TransferError> {
        if !record.verify_checksum() {
            return Err(mismatch(&record.module_id));
        }
        let _guard = self.locks.acquire(&record.module_id).await;
        match self.fetch(registry, &record.module_id).await? {
            Some(_) if !overwrite => return Ok(ImportAction::Skipped),
            Some(existing) if existing.same_content(record) && existing.verify_checksum() => {
                return Ok(ImportAction::Skipped)
            }
            _ => {}
        }
        match self.write(registry, record, overwrite).await {
            Ok(()) => Ok(ImportAction::Imported),
            Err(err) if err.kind == FailureCode::WriteConflict && !overwrite => Ok(ImportAction::Skipped),
            Err(err) => Err(err),
        }
    }

    /// Delete `module_id`; an absent module counts as removed.
    pub async fn remove_one(
        &self,
        registry: &dyn RegistryClient,
        module_id: &ModuleId,
    ) -> Result<(), TransferError> {
        let _guard = self.locks.acquire(module_id).await;
        match self
            .retry
            .run("delete", module_id, || registry.delete(module_id))
            .await
        {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(TransferError::from_registry(module_id, &err)),
        }
    }

    // -- batches ------------------------------------------------------------

    /// Export every id, one result per id, sorted by module.
    pub async fn export(
        &self,
        registry: &dyn RegistryClient,
        ids: &BTreeSet<ModuleId>,
    ) -> Vec<Result<ModuleRecord, TransferError>> {
        let mut results: Vec<_> = stream::iter(ids)
            .map(|id| self.export_one(registry, id))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;
        results.sort_by(|a, b| result_id(a).cmp(result_id(b)));
        results
    }

    /// Export every module currently listed in `registry`.
    pub async fn export_all(
        &self,
        registry: &dyn RegistryClient,
    ) -> Result<Vec<Result<ModuleRecord, TransferError>>, RegistryError> {
        let ids = self.retry.run("list", registry.environment(), || registry.list()).await?;
        Ok(self.export(registry, &ids).await)
    }

    pub async fn import(
        &self,
        registry: &dyn RegistryClient,
        records: &[ModuleRecord],
        overwrite: bool,
    ) -> ImportOutcome {
        let results: Vec<_> = stream::iter(records)
            .map(|record| async move {
                (
                    record.module_id.clone(),
                    self.import_one(registry, record, overwrite).await,
                )
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut outcome = ImportOutcome::default();
        for (id, result) in results {
            match result {
                Ok(ImportAction::Imported) => {
                    outcome.imported.insert(id);
                }
                Ok(ImportAction::Skipped) => {
                    outcome.skipped.insert(id);
                }
                Err(err) => {
                    tracing::warn!(module = %id, error = %err, "import failed");
                    outcome.failed.insert(id, err);
                }
            }
        }
        tracing::info!(
            environment = %registry.environment(),
            imported = outcome.imported.len(),
            skipped = outcome.skipped.len(),
            failed = outcome.failed.len(),
            "import finished"
        );
        outcome
    }

    // -- sync ---------------------------------------------------------------

    /// Reconcile `source` and `target` according to `config`.
    ///
    /// `watermark` is the start of the last successful incremental run; it
    /// is ignored by the other modes.
    pub async fn sync(
        &self,
        source: &dyn RegistryClient,
        target: &dyn RegistryClient,
        config: &SyncConfiguration,
        watermark: Option<DateTime<Utc>>,
    ) -> Result<SyncOutcome, SyncError> {
        if !config.enabled {
            return Err(SyncError::Disabled(config.name.clone()));
        }
        let ids = match config.mode {
            SyncMode::Selective => {
                if config.modules.is_empty() {
                    return Err(SyncError::EmptySelection(config.name.clone()));
                }
                config.modules.clone()
            }
            SyncMode::Full | SyncMode::Incremental => {
                let mut ids = self.retry.run("list", source.environment(), || source.list()).await?;
                ids.extend(self.retry.run("list", target.environment(), || target.list()).await?);
                ids
            }
        };
        let since = match config.mode {
            SyncMode::Incremental => watermark,
            _ => None,
        };

        let mut outcome = SyncOutcome::new(config.mode);
        let steps: Vec<_> = stream::iter(ids.iter().cloned())
            .map(|id| async move {
                let step = self.sync_one(source, target, &id, config, since).await;
                (id, step)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for (id, step) in steps {
            match step {
                SyncStep::Synced => {
                    outcome.synced.insert(id);
                }
                SyncStep::Unchanged => {
                    outcome.unchanged.insert(id);
                }
                SyncStep::Outside => {}
                SyncStep::Failed(err) => {
                    outcome.failed.insert(id, err);
                }
                SyncStep::Conflict(record, write) => {
                    match write {
                        Ok(()) if record.is_resolved() => {
                            outcome.synced.insert(id);
                        }
                        Ok(()) => {}
                        Err(err) => {
                            outcome.failed.insert(id, err);
                        }
                    }
                    outcome.conflicts.push(record);
                }
            }
        }
        outcome.conflicts.sort_by(|a, b| a.module_id.cmp(&b.module_id));

        tracing::info!(
            sync = %config.name,
            mode = %config.mode,
            synced = outcome.synced.len(),
            unchanged = outcome.unchanged.len(),
            conflicts = outcome.conflicts.len(),
            failed = outcome.failed.len(),
            "sync finished"
        );
        Ok(outcome)
    }

    async fn sync_one(
        &self,
        source: &dyn RegistryClient,
        target: &dyn RegistryClient,
        module_id: &ModuleId,
        config: &SyncConfiguration,
        since: Option<DateTime<Utc>>,
    ) -> SyncStep {
        let _guard = self.locks.acquire(module_id).await;

        let pair = async {
            let s = self.fetch(source, module_id).await?;
            let t = self.fetch(target, module_id).await?;
            Ok::<_, TransferError>((s, t))
        };
        let (s, t) = match pair.await {
            Ok(pair) => pair,
            Err(err) => return SyncStep::Failed(err),
        };

        if let Some(since) = since {
            let changed = |r: &Option<ModuleRecord>| r.as_ref().is_some_and(|r| r.updated_at > since);
            if !changed(&s) && !changed(&t) {
                return SyncStep::Outside;
            }
        }

        if s.iter().chain(t.iter()).any(|r| !r.verify_checksum()) {
            return SyncStep::Failed(mismatch(module_id));
        }

        let result = match (s, t) {
            (None, None) => Err(TransferError::new(
                module_id.clone(),
                FailureCode::NotFound,
                "absent from both registries",
            )),
            (Some(record), None) => self.propagate(target, record).await,
            (None, Some(record)) => self.propagate(source, record).await,
            (Some(s), Some(t)) if s.same_content(&t) => return SyncStep::Unchanged,
            (Some(s), Some(t)) => {
                let resolved = self
                    .resolver
                    .resolve(&ConflictRecord::new(s, t), config.conflict_resolution);
                let write = match &resolved.resolved_record {
                    None => Ok(()),
                    Some(winner) => {
                        let loser = if winner == &resolved.source_record { target } else { source };
                        self.propagate(loser, winner.clone()).await
                    }
                };
                if resolved.resolved_record.is_none() {
                    tracing::warn!(module = %module_id, policy = %config.conflict_resolution, "conflict left unresolved");
                }
                return SyncStep::Conflict(resolved, write);
            }
        };
        match result {
            Ok(()) => SyncStep::Synced,
            Err(err) => SyncStep::Failed(err),
        }
    }

    async fn propagate(&self, to: &dyn RegistryClient, record: ModuleRecord) -> Result<(), TransferError> {
        let record = verified(record)?;
        self.write(to, &record, true).await
    }

    // -- unlocked helpers ---------------------------------------------------

    /// `get` with retries; `NotFound` becomes `Ok(None)`.
    pub(crate) async fn fetch(
        &self,
        registry: &dyn RegistryClient,
        module_id: &ModuleId,
    ) -> Result<Option<ModuleRecord>, TransferError> {
        self.retry
            .run("get", module_id, || get_optional(registry, module_id))
            .await
            .map_err(|err| TransferError::from_registry(module_id, &err))
    }

    async fn write(
        &self,
        registry: &dyn RegistryClient,
        record: &ModuleRecord,
        overwrite: bool,
    ) -> Result<(), TransferError> {
        self.retry
            .run("put", &record.module_id, || registry.put(record, overwrite))
            .await
            .map_err(|err| TransferError::from_registry(&record.module_id, &err))?;
        tracing::debug!(module = %record.module_id, environment = %registry.environment(), "wrote record");
        Ok(())
    }
}

fn verified(record: ModuleRecord) -> Result<ModuleRecord, TransferError> {
    if record.verify_checksum() {
        Ok(record)
    } else {
        Err(mismatch(&record.module_id))
    }
}

fn mismatch(module_id: &ModuleId) -> TransferError {
    TransferError::new(
        module_id.clone(),
        FailureCode::ChecksumMismatch,
        "stored checksum does not match payload",
    )
}

fn result_id(result: &Result<ModuleRecord, TransferError>) -> &ModuleId {
    match result {
        Ok(record) => &record.module_id,
        Err(err) => &err.module_id,
    }
}
