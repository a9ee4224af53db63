//! # ferry-sync
//!
//! Migration planning, phased execution, rollback and two-way sync.
//!
//! Build a [`FerryContext`] and use [`pipeline::run_plan`] to drive a plan
//! from the planner through every phase, or [`pipeline::run_sync`] to run a
//! configured sync. The pieces are usable on their own against any
//! [`ferry_core::RegistryClient`].

pub mod conflict;
pub mod diff;
pub mod error;
pub mod executor;
pub mod locks;
pub mod pipeline;
pub mod planner;
pub mod report;
pub mod retry;
pub mod rollback;
pub mod transfer;

pub use conflict::ConflictResolver;
pub use error::{
    ExecutorError, PhaseTransitionError, RestoreError, SnapshotError, SyncError, TransferError,
    ValidationError, Violation,
};
pub use executor::PhaseExecutor;
pub use locks::{ModuleGuard, ModuleLocks};
pub use pipeline::{run_plan, run_sync, run_sync_config, FerryContext};
pub use planner::{MigrationPlanner, PlanRequest};
pub use report::{MemorySink, StoreSink, TracingSink};
pub use retry::RetryPolicy;
pub use rollback::RollbackManager;
pub use transfer::{ImportAction, ImportOutcome, SyncOutcome, TransferEngine};
