//! Migration plans, their lifecycle phases, and rollback snapshots.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checksum::Checksum;
use crate::report::ModuleFailure;
use crate::types::{Environment, ModuleId, ModuleRecord, PlanId, RollbackId};

// ---------------------------------------------------------------------------
// Phase state machine
// ---------------------------------------------------------------------------

/// Lifecycle phase of a [`MigrationPlan`].
///
/// ```text
/// NOT_STARTED → PREPARING → PREPARED → EXECUTING → VALIDATING → COMPLETED
///                   │                      │            │
///                   └──────────────────────┴────────────┴──→ FAILED
/// any non-terminal state, or FAILED ──rollback──→ ROLLED_BACK
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    #[default]
    NotStarted,
    Preparing,
    Prepared,
    Executing,
    Validating,
    Completed,
    Failed,
    RolledBack,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed | Phase::RolledBack)
    }

    /// Position along the forward path; used to assert monotonicity.
    pub fn rank(self) -> u8 {
        match self {
            Phase::NotStarted => 0,
            Phase::Preparing => 1,
            Phase::Prepared => 2,
            Phase::Executing => 3,
            Phase::Validating => 4,
            Phase::Completed | Phase::Failed => 5,
            Phase::RolledBack => 6,
        }
    }

    /// Whether `self → next` is a legal transition.
    pub fn can_transition_to(self, next: Phase) -> bool {
        use Phase::*;
        match (self, next) {
            (NotStarted, Preparing)
            | (Preparing, Prepared)
            | (Prepared, Executing)
            | (Executing, Validating)
            | (Validating, Completed) => true,
            (from, Failed) => !from.is_terminal(),
            (from, RolledBack) => !from.is_terminal() || from == Failed,
            _ => false,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::NotStarted => "NOT_STARTED",
            Phase::Preparing => "PREPARING",
            Phase::Prepared => "PREPARED",
            Phase::Executing => "EXECUTING",
            Phase::Validating => "VALIDATING",
            Phase::Completed => "COMPLETED",
            Phase::Failed => "FAILED",
            Phase::RolledBack => "ROLLED_BACK",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// One entry in a plan's phase history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub from: Phase,
    pub to: Phase,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Accumulated results of the phases run so far.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PlanOutcome {
    /// Modules exported and imported during `execute`.
    #[serde(default)]
    pub transferred: BTreeSet<ModuleId>,
    /// Modules whose target copy passed validation.
    #[serde(default)]
    pub migrated: BTreeSet<ModuleId>,
    /// Module-level failures from any phase, keyed by module.
    #[serde(default)]
    pub failed: BTreeMap<ModuleId, ModuleFailure>,
    #[serde(default)]
    pub validation_started: bool,
    #[serde(default)]
    pub validation_passed: bool,
    #[serde(default)]
    pub cancelled: bool,
    /// Modules a rollback could not restore.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub partial_rollback: BTreeMap<ModuleId, ModuleFailure>,
}

/// A validated request to move a set of modules between two environments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationPlan {
    pub plan_id: PlanId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub source_environment: Environment,
    pub target_environment: Environment,
    pub module_ids: BTreeSet<ModuleId>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub current_phase: Phase,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_plan_id: Option<PlanId>,
    #[serde(default)]
    pub history: Vec<PhaseTransition>,
    #[serde(default)]
    pub outcome: PlanOutcome,
}

impl MigrationPlan {
    /// Record `self.current_phase → to` in the history. Legality is checked
    /// by the caller.
    pub fn record_transition(&mut self, to: Phase, note: Option<String>) {
        self.history.push(PhaseTransition {
            from: self.current_phase,
            to,
            at: Utc::now(),
            note,
        });
        self.current_phase = to;
    }
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// Immutable point-in-time copy of one module record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackPoint {
    pub rollback_id: RollbackId,
    pub module_id: ModuleId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<PlanId>,
    /// Registry the snapshot was taken from and is restored into.
    pub environment: Environment,
    pub snapshot: ModuleRecord,
    pub reason: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

/// Selector for [`RollbackPoint`] listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackScope {
    Module(ModuleId),
    Plan(PlanId),
}

impl RollbackScope {
    pub fn matches(&self, point: &RollbackPoint) -> bool {
        match self {
            RollbackScope::Module(id) => &point.module_id == id,
            RollbackScope::Plan(id) => point.plan_id.as_ref() == Some(id),
        }
    }
}

/// Per-module pre-migration state captured by `prepare`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub module_id: ModuleId,
    /// Checksum of the source record at prepare time.
    pub checksum: Checksum,
    /// Full source record at prepare time.
    pub record: ModuleRecord,
    /// Rollback point for the target's pre-image; `None` when the module did
    /// not exist in the target before migration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_rollback_id: Option<RollbackId>,
}

/// Durable baseline of a prepared plan, one entry per module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSnapshot {
    pub plan_id: PlanId,
    pub taken_at: DateTime<Utc>,
    pub entries: BTreeMap<ModuleId, SnapshotEntry>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
