//! Point-in-time snapshots of module records and their restoration.
//!
//! Points are persisted through the [`StateStore`] before `create_point`
//! returns, so a listing always reflects durable state. Neither snapshotting
//! nor restoring is retried: a failure here needs a human.

use chrono::Utc;

use ferry_core::{
    get_optional, ModuleId, PlanId, RegistryClient, RegistrySet, RollbackId, RollbackPoint,
    RollbackScope, StateStore, StoreError,
};

use crate::error::{RestoreError, SnapshotError};
use crate::locks::ModuleLocks;

#[derive(Debug, Clone)]
pub struct RollbackManager {
    store: StateStore,
    locks: ModuleLocks,
}

impl RollbackManager {
    pub fn new(store: StateStore, locks: ModuleLocks) -> Self {
        Self { store, locks }
    }

    /// Snapshot the current record of `module_id` in `registry`.
    pub async fn create_point(
        &self,
        registry: &dyn RegistryClient,
        module_id: &ModuleId,
        plan_id: Option<&PlanId>,
        reason: &str,
        created_by: &str,
    ) -> Result<RollbackPoint, SnapshotError> {
        let _guard = self.locks.acquire(module_id).await;

        let Some(snapshot) = get_optional(registry, module_id).await? else {
            return Err(SnapshotError::ModuleNotFound {
                module_id: module_id.clone(),
                environment: registry.environment().clone(),
            });
        };
        if !snapshot.verify_checksum() {
            return Err(SnapshotError::ChecksumMismatch {
                module_id: module_id.clone(),
            });
        }

        let point = RollbackPoint {
            rollback_id: RollbackId::generate(),
            module_id: module_id.clone(),
            plan_id: plan_id.cloned(),
            environment: registry.environment().clone(),
            snapshot,
            reason: reason.to_string(),
            created_by: created_by.to_string(),
            created_at: Utc::now(),
        };
        self.store.save_rollback_point(&point)?;
        tracing::info!(
            module = %module_id,
            environment = %point.environment,
            rollback_id = %point.rollback_id,
            "created rollback point"
        );
        Ok(point)
    }

    /// Write the snapshot back to its environment and verify it landed.
    pub async fn restore(
        &self,
        registries: &RegistrySet,
        rollback_id: &RollbackId,
    ) -> Result<RollbackPoint, RestoreError> {
        let point = self.store.load_rollback_point(rollback_id)?;
        let registry = registries.require(&point.environment)?;
        let _guard = self.locks.acquire(&point.module_id).await;

        registry.put(&point.snapshot, true).await?;
        let written = registry.get(&point.module_id).await?;
        let actual = written.computed_checksum();
        if written.checksum != point.snapshot.checksum || actual != point.snapshot.checksum {
            tracing::error!(
                module = %point.module_id,
                rollback_id = %rollback_id,
                "restored record does not match snapshot"
            );
            return Err(RestoreError::VerificationFailed {
                module_id: point.module_id.clone(),
                expected: point.snapshot.checksum.clone(),
                actual,
            });
        }
        tracing::info!(
            module = %point.module_id,
            environment = %point.environment,
            rollback_id = %rollback_id,
            "restored rollback point"
        );
        Ok(point)
    }

    /// Points for a module or a plan, newest first.
    pub fn list(&self, scope: &RollbackScope) -> Result<Vec<RollbackPoint>, StoreError> {
        self.store.list_rollback_points(scope)
    }

    /// Remove every point created for `plan_id`. Returns how many were removed.
    pub fn discard_plan_points(&self, plan_id: &PlanId) -> Result<usize, StoreError> {
        let points = self.store.list_rollback_points(&RollbackScope::Plan(plan_id.clone()))?;
        for point in &points {
            self.store.remove_rollback_point(&point.rollback_id)?;
        }
        if !points.is_empty() {
            tracing::debug!(plan = %plan_id, count = points.len(), "discarded plan rollback points");
        }
        Ok(points.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_core::memory::MemoryRegistry;
    use ferry_core::{ModuleRecord, ModuleStatus, Payload};
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn record(id: &str, v: i64) -> ModuleRecord {
        let mut p = Payload::new();
        p.insert("v".into(), json!(v));
        ModuleRecord::new(id, "1.0.0", ModuleStatus::ProductionReady, p)
    }

    fn setup() -> (TempDir, RollbackManager, Arc<MemoryRegistry>, RegistrySet) {
        let home = TempDir::new().unwrap();
        let manager = RollbackManager::new(StateStore::new(home.path()), ModuleLocks::new());
        let prod = Arc::new(MemoryRegistry::new("production").with_records([record("dao", 1)]));
        let set = RegistrySet::new().with(prod.clone());
        (home, manager, prod, set)
    }

    #[tokio::test]
    async fn snapshot_then_restore_roundtrip() {
        let (_home, manager, prod, set) = setup();
        let id = ModuleId::from("dao");
        let point = manager
            .create_point(prod.as_ref(), &id, None, "manual", "ops")
            .await
            .unwrap();

        prod.seed(record("dao", 2));
        manager.restore(&set, &point.rollback_id).await.unwrap();

        assert_eq!(prod.record(&id).unwrap().checksum, point.snapshot.checksum);
    }

    #[tokio::test]
    async fn missing_module_cannot_be_snapshotted() {
        let (_home, manager, prod, _set) = setup();
        let err = manager
            .create_point(prod.as_ref(), &ModuleId::from("ghost"), None, "manual", "ops")
            .await
            .unwrap_err();
        assert!(matches!(err, SnapshotError::ModuleNotFound { .. }));
    }

    #[tokio::test]
    async fn racing_writer_fails_verification() {
        let (_home, manager, prod, set) = setup();
        let id = ModuleId::from("dao");
        let point = manager
            .create_point(prod.as_ref(), &id, None, "manual", "ops")
            .await
            .unwrap();
        prod.mangle_writes("dao");

        let err = manager.restore(&set, &point.rollback_id).await.unwrap_err();
        assert!(matches!(err, RestoreError::VerificationFailed { .. }), "got {err}");
    }

    #[tokio::test]
    async fn discard_only_touches_the_plan() {
        let (_home, manager, prod, _set) = setup();
        let id = ModuleId::from("dao");
        let plan = PlanId::from("plan-1");
        manager.create_point(prod.as_ref(), &id, Some(&plan), "prepare", "ops").await.unwrap();
        manager.create_point(prod.as_ref(), &id, None, "manual", "ops").await.unwrap();

        assert_eq!(manager.discard_plan_points(&plan).unwrap(), 1);
        assert_eq!(manager.list(&RollbackScope::Module(id)).unwrap().len(), 1);
    }
}
