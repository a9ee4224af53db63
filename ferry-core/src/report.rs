//! Structured run results handed to presentation layers.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ConflictRecord, ModuleId, PlanId, SyncRunId};

/// Machine-readable reason a module-level operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureCode {
    TransferTimeout,
    RegistryUnavailable,
    ChecksumMismatch,
    NotFound,
    WriteConflict,
    ValidationMismatch,
    MissingRecord,
    SnapshotFailed,
    RestoreFailed,
    Cancelled,
    #[serde(rename = "BACKEND_ERROR")]
    Backend,
}

impl FailureCode {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureCode::TransferTimeout => "TRANSFER_TIMEOUT",
            FailureCode::RegistryUnavailable => "REGISTRY_UNAVAILABLE",
            FailureCode::ChecksumMismatch => "CHECKSUM_MISMATCH",
            FailureCode::NotFound => "NOT_FOUND",
            FailureCode::WriteConflict => "WRITE_CONFLICT",
            FailureCode::ValidationMismatch => "VALIDATION_MISMATCH",
            FailureCode::MissingRecord => "MISSING_RECORD",
            FailureCode::SnapshotFailed => "SNAPSHOT_FAILED",
            FailureCode::RestoreFailed => "RESTORE_FAILED",
            FailureCode::Cancelled => "CANCELLED",
            FailureCode::Backend => "BACKEND_ERROR",
        }
    }
}

impl fmt::Display for FailureCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why one module failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleFailure {
    pub code: FailureCode,
    pub detail: String,
}

impl ModuleFailure {
    pub fn new(code: FailureCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for ModuleFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.detail)
    }
}

/// What a report is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ReportSubject {
    Plan(PlanId),
    Sync(SyncRunId),
}

impl fmt::Display for ReportSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportSubject::Plan(id) => write!(f, "plan {id}"),
            ReportSubject::Sync(id) => write!(f, "sync {id}"),
        }
    }
}

/// Emitted after every phase transition and after every sync run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub subject: ReportSubject,
    /// Phase name for plans, mode name for syncs.
    pub stage: String,
    pub succeeded: BTreeSet<ModuleId>,
    pub failed: BTreeMap<ModuleId, ModuleFailure>,
    pub conflicts: Vec<ConflictRecord>,
    pub timestamp: DateTime<Utc>,
}

impl RunReport {
    pub fn new(subject: ReportSubject, stage: impl Into<String>) -> Self {
        Self {
            subject,
            stage: stage.into(),
            succeeded: BTreeSet::new(),
            failed: BTreeMap::new(),
            conflicts: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Consumer of [`RunReport`]s (notifications, CLI output, report files).
///
/// Sinks receive a shared reference and must not assume exclusive ownership.
pub trait ReportSink: Send + Sync {
    fn emit(&self, report: &RunReport);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_code_wire_name_matches_display() {
        let json = serde_json::to_string(&FailureCode::TransferTimeout).unwrap();
        assert_eq!(json, "\"TRANSFER_TIMEOUT\"");
        assert_eq!(FailureCode::TransferTimeout.to_string(), "TRANSFER_TIMEOUT");
        assert_eq!(FailureCode::Backend.to_string(), "BACKEND_ERROR");
    }

    #[test]
    fn report_serializes_failed_map_keyed_by_module() {
        let mut report = RunReport::new(ReportSubject::Plan(PlanId::from("p1")), "EXECUTING");
        report.succeeded.insert(ModuleId::from("qwallet"));
        report.failed.insert(
            ModuleId::from("qsocial"),
            ModuleFailure::new(FailureCode::TransferTimeout, "timed out"),
        );
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["subject"]["kind"], "plan");
        assert_eq!(value["failed"]["qsocial"]["code"], "TRANSFER_TIMEOUT");
        assert_eq!(value["succeeded"][0], "qwallet");
    }
}
