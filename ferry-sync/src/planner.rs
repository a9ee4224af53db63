//! Validates migration requests and builds [`MigrationPlan`]s.

use std::collections::BTreeSet;

use chrono::Utc;

use ferry_core::{
    Environment, MigrationPlan, ModuleId, Phase, PlanId, PlanOutcome, RegistrySet,
};

use crate::error::{ValidationError, Violation};

/// What a user asked to migrate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanRequest {
    pub name: String,
    pub description: String,
    pub source_environment: Environment,
    pub target_environment: Environment,
    pub module_ids: BTreeSet<ModuleId>,
    pub created_by: String,
    pub dry_run: bool,
}

#[derive(Debug, Clone)]
pub struct MigrationPlanner {
    registries: RegistrySet,
}

impl MigrationPlanner {
    pub fn new(registries: RegistrySet) -> Self {
        Self { registries }
    }

    /// Build a plan, or report every problem with the request at once.
    /// Reads the source registry; writes nothing.
    pub async fn create_plan(&self, request: PlanRequest) -> Result<MigrationPlan, ValidationError> {
        let mut violations = Vec::new();

        if request.name.trim().is_empty() {
            violations.push(Violation::EmptyName);
        }
        if request.module_ids.is_empty() {
            violations.push(Violation::EmptyModuleSet);
        }
        if request.source_environment == request.target_environment {
            violations.push(Violation::SameEnvironment(request.source_environment.clone()));
        }
        for env in [&request.source_environment, &request.target_environment] {
            if !self.registries.contains(env) {
                violations.push(Violation::UnknownEnvironment(env.clone()));
            }
        }

        if let Some(source) = self.registries.get(&request.source_environment) {
            if !request.module_ids.is_empty() {
                match source.list().await {
                    Ok(present) => {
                        for id in request.module_ids.difference(&present) {
                            violations.push(Violation::ModuleNotInSource {
                                module_id: id.clone(),
                                environment: request.source_environment.clone(),
                            });
                        }
                    }
                    Err(err) => violations.push(Violation::SourceUnreadable(err.to_string())),
                }
            }
        }

        if !violations.is_empty() {
            violations.dedup();
            return Err(ValidationError { violations });
        }

        let plan = MigrationPlan {
            plan_id: PlanId::generate(),
            name: request.name,
            description: request.description,
            source_environment: request.source_environment,
            target_environment: request.target_environment,
            module_ids: request.module_ids,
            created_by: request.created_by,
            created_at: Utc::now(),
            current_phase: Phase::NotStarted,
            dry_run: request.dry_run,
            parent_plan_id: None,
            history: Vec::new(),
            outcome: PlanOutcome::default(),
        };
        tracing::info!(
            plan = %plan.plan_id,
            source = %plan.source_environment,
            target = %plan.target_environment,
            modules = plan.module_ids.len(),
            dry_run = plan.dry_run,
            "created migration plan"
        );
        Ok(plan)
    }

    /// A new plan covering only the failed modules of a FAILED plan.
    pub async fn retry_plan(
        &self,
        parent: &MigrationPlan,
        created_by: &str,
    ) -> Result<MigrationPlan, ValidationError> {
        if parent.current_phase != Phase::Failed {
            return Err(ValidationError {
                violations: vec![Violation::ParentNotFailed {
                    plan_id: parent.plan_id.clone(),
                    phase: parent.current_phase,
                }],
            });
        }
        let module_ids: BTreeSet<ModuleId> = parent.outcome.failed.keys().cloned().collect();
        if module_ids.is_empty() {
            return Err(ValidationError {
                violations: vec![Violation::NothingToRetry(parent.plan_id.clone())],
            });
        }

        let mut plan = self
            .create_plan(PlanRequest {
                name: format!("{} (retry)", parent.name),
                description: format!("retry of failed modules from {}", parent.plan_id),
                source_environment: parent.source_environment.clone(),
                target_environment: parent.target_environment.clone(),
                module_ids,
                created_by: created_by.to_string(),
                dry_run: parent.dry_run,
            })
            .await?;
        plan.parent_plan_id = Some(parent.plan_id.clone());
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_core::memory::MemoryRegistry;
    use ferry_core::{FailureCode, ModuleFailure, ModuleRecord, ModuleStatus, Payload};
    use std::sync::Arc;

    fn planner() -> MigrationPlanner {
        let rec = |id: &str| ModuleRecord::new(id, "1.0.0", ModuleStatus::Testing, Payload::new());
        let staging = MemoryRegistry::new("staging").with_records([rec("qwallet"), rec("qsocial")]);
        MigrationPlanner::new(
            RegistrySet::new()
                .with(Arc::new(staging))
                .with(Arc::new(MemoryRegistry::new("production"))),
        )
    }

    fn request(source: &str, target: &str, ids: &[&str]) -> PlanRequest {
        PlanRequest {
            name: "release".into(),
            description: String::new(),
            source_environment: source.into(),
            target_environment: target.into(),
            module_ids: ids.iter().copied().map(ModuleId::from).collect(),
            created_by: "ops".into(),
            dry_run: false,
        }
    }

    #[tokio::test]
    async fn valid_request_yields_not_started_plan() {
        let plan = planner()
            .create_plan(request("staging", "production", &["qwallet", "qsocial"]))
            .await
            .unwrap();
        assert_eq!(plan.current_phase, Phase::NotStarted);
        assert_eq!(plan.module_ids.len(), 2);
        assert!(plan.plan_id.as_str().starts_with("plan-"));
    }

    #[tokio::test]
    async fn reports_all_violations_together() {
        let mut req = request("staging", "staging", &["qwallet", "ghost"]);
        req.name = "  ".into();
        let err = planner().create_plan(req).await.unwrap_err();
        assert_eq!(
            err.violations,
            vec![
                Violation::EmptyName,
                Violation::SameEnvironment("staging".into()),
                Violation::ModuleNotInSource {
                    module_id: "ghost".into(),
                    environment: "staging".into(),
                },
            ]
        );
    }

    #[tokio::test]
    async fn unknown_environment_and_empty_set() {
        let err = planner()
            .create_plan(request("legacy", "production", &[]))
            .await
            .unwrap_err();
        assert!(err.violations.contains(&Violation::EmptyModuleSet));
        assert!(err.violations.contains(&Violation::UnknownEnvironment("legacy".into())));
    }

    #[tokio::test]
    async fn retry_is_scoped_to_failed_modules() {
        let planner = planner();
        let mut parent = planner
            .create_plan(request("staging", "production", &["qwallet", "qsocial"]))
            .await
            .unwrap();
        assert!(planner.retry_plan(&parent, "ops").await.is_err());

        parent.current_phase = Phase::Failed;
        parent.outcome.failed.insert(
            "qsocial".into(),
            ModuleFailure::new(FailureCode::TransferTimeout, "timed out"),
        );
        let retry = planner.retry_plan(&parent, "ops").await.unwrap();
        let expected: BTreeSet<ModuleId> = ["qsocial"].into_iter().map(ModuleId::from).collect();
        assert_eq!(retry.module_ids, expected);
        assert_eq!(retry.parent_plan_id, Some(parent.plan_id.clone()));
    }
}
