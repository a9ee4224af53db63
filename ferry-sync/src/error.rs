//! Error types for ferry-sync.

use std::fmt;

use thiserror::Error;

use ferry_core::error::{ConfigError, RegistryError, StoreError};
use ferry_core::{Checksum, Environment, FailureCode, ModuleFailure, ModuleId, Phase, PlanId};

/// A module-level transfer failure. Collected into results, never raised
/// for the batch as a whole.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{module_id}: {kind}: {detail}")]
pub struct TransferError {
    pub module_id: ModuleId,
    pub kind: FailureCode,
    pub detail: String,
}

impl TransferError {
    pub fn new(module_id: ModuleId, kind: FailureCode, detail: impl Into<String>) -> Self {
        Self {
            module_id,
            kind,
            detail: detail.into(),
        }
    }

    /// Classify a registry error for `module_id`.
    pub fn from_registry(module_id: &ModuleId, err: &RegistryError) -> Self {
        let kind = match err {
            RegistryError::Timeout { .. } => FailureCode::TransferTimeout,
            RegistryError::Unavailable { .. } | RegistryError::UnknownEnvironment { .. } => {
                FailureCode::RegistryUnavailable
            }
            RegistryError::NotFound { .. } => FailureCode::NotFound,
            RegistryError::AlreadyExists { .. } => FailureCode::WriteConflict,
            _ => FailureCode::Backend,
        };
        Self::new(module_id.clone(), kind, err.to_string())
    }

    pub fn to_failure(&self) -> ModuleFailure {
        ModuleFailure::new(self.kind, self.detail.clone())
    }
}

/// One reason a plan request was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    EmptyName,
    EmptyModuleSet,
    SameEnvironment(Environment),
    UnknownEnvironment(Environment),
    ModuleNotInSource {
        module_id: ModuleId,
        environment: Environment,
    },
    SourceUnreadable(String),
    ParentNotFailed { plan_id: PlanId, phase: Phase },
    NothingToRetry(PlanId),
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::EmptyName => write!(f, "plan name must not be empty"),
            Violation::EmptyModuleSet => write!(f, "module set must not be empty"),
            Violation::SameEnvironment(env) => {
                write!(f, "source and target are both '{env}'")
            }
            Violation::UnknownEnvironment(env) => write!(f, "unknown environment '{env}'"),
            Violation::ModuleNotInSource {
                module_id,
                environment,
            } => write!(f, "module '{module_id}' does not exist in {environment}"),
            Violation::SourceUnreadable(reason) => {
                write!(f, "source registry could not be read: {reason}")
            }
            Violation::ParentNotFailed { plan_id, phase } => {
                write!(f, "plan '{plan_id}' is {phase}; only FAILED plans can be retried")
            }
            Violation::NothingToRetry(plan_id) => {
                write!(f, "plan '{plan_id}' has no failed modules to retry")
            }
        }
    }
}

/// Every violation found in a plan request, reported together.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid plan: {}", join(.violations))]
pub struct ValidationError {
    pub violations: Vec<Violation>,
}

fn join(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("cannot snapshot '{module_id}': not found in {environment}")]
    ModuleNotFound {
        module_id: ModuleId,
        environment: Environment,
    },

    /// The live record is already corrupt; a snapshot of it would be useless.
    #[error("cannot snapshot '{module_id}': stored checksum does not match payload")]
    ChecksumMismatch { module_id: ModuleId },

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("state store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("restore of '{module_id}' did not verify: expected {expected}, found {actual}")]
    VerificationFailed {
        module_id: ModuleId,
        expected: Checksum,
        actual: Checksum,
    },

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("state store error: {0}")]
    Store(#[from] StoreError),
}

impl RestoreError {
    pub fn to_failure(&self) -> ModuleFailure {
        match self {
            RestoreError::VerificationFailed { .. } => {
                ModuleFailure::new(FailureCode::ChecksumMismatch, self.to_string())
            }
            _ => ModuleFailure::new(FailureCode::RestoreFailed, self.to_string()),
        }
    }
}

/// An operation was requested in a phase that does not allow it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("plan '{plan_id}' cannot go from {from} to {attempted}")]
pub struct PhaseTransitionError {
    pub plan_id: PlanId,
    pub from: Phase,
    pub attempted: Phase,
}

/// Plan-level failures raised by the phase executor.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Transition(#[from] PhaseTransitionError),

    #[error("state store error: {0}")]
    Store(#[from] StoreError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
}

/// Run-level sync failures. Module-level failures live in the outcome.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("sync '{0}' is disabled")]
    Disabled(String),

    #[error("sync '{0}' is SELECTIVE but lists no modules")]
    EmptySelection(String),

    #[error("no sync named '{0}' in config")]
    UnknownSync(String),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("state store error: {0}")]
    Store(#[from] StoreError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}
