//! Durable plan, snapshot, watermark and report store.
//!
//! Everything lives under `<home>/.ferry/` (see [`crate::paths`]). Writes use
//! the `.tmp` + rename pattern so a crash never leaves a half-written plan or
//! rollback point behind; the store is the sole source of truth for resuming
//! or rolling back after a crash.

use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{store_io_err, StoreError};
use crate::paths;
use crate::plan::{MigrationPlan, PlanSnapshot, RollbackPoint, RollbackScope};
use crate::report::RunReport;
use crate::types::{PlanId, RollbackId};

/// Last successful incremental sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct WatermarkFile {
    synced_at: DateTime<Utc>,
}

/// Handle on the state directory of one home.
#[derive(Debug, Clone)]
pub struct StateStore {
    home: PathBuf,
}

impl StateStore {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    // -- plans --------------------------------------------------------------

    pub fn save_plan(&self, plan: &MigrationPlan) -> Result<(), StoreError> {
        checked_plan(&plan.plan_id)?;
        write_json_atomic(&paths::plan_path(&self.home, &plan.plan_id), plan)
    }

    pub fn load_plan(&self, plan_id: &PlanId) -> Result<MigrationPlan, StoreError> {
        checked_plan(plan_id)?;
        read_json(&paths::plan_path(&self.home, plan_id))?.ok_or_else(|| StoreError::PlanNotFound {
            plan_id: plan_id.clone(),
        })
    }

    /// All stored plans, oldest first.
    pub fn list_plans(&self) -> Result<Vec<MigrationPlan>, StoreError> {
        let dir = paths::plans_dir(&self.home);
        let mut plans = Vec::new();
        for entry in read_dir_or_empty(&dir)? {
            let path = entry.join("plan.json");
            if let Some(plan) = read_json::<MigrationPlan>(&path)? {
                plans.push(plan);
            }
        }
        plans.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.plan_id.cmp(&b.plan_id))
        });
        Ok(plans)
    }

    pub fn save_snapshot(&self, snapshot: &PlanSnapshot) -> Result<(), StoreError> {
        checked_plan(&snapshot.plan_id)?;
        write_json_atomic(&paths::baseline_path(&self.home, &snapshot.plan_id), snapshot)
    }

    pub fn load_snapshot(&self, plan_id: &PlanId) -> Result<PlanSnapshot, StoreError> {
        self.find_snapshot(plan_id)?
            .ok_or_else(|| StoreError::SnapshotNotFound {
                plan_id: plan_id.clone(),
            })
    }

    pub fn find_snapshot(&self, plan_id: &PlanId) -> Result<Option<PlanSnapshot>, StoreError> {
        checked_plan(plan_id)?;
        read_json(&paths::baseline_path(&self.home, plan_id))
    }

    // -- rollback points ----------------------------------------------------

    /// Persist a new rollback point. Points are write-once.
    pub fn save_rollback_point(&self, point: &RollbackPoint) -> Result<(), StoreError> {
        checked_rollback(&point.rollback_id)?;
        let path = paths::rollback_path(&self.home, &point.rollback_id);
        if path.exists() {
            return Err(StoreError::RollbackExists {
                rollback_id: point.rollback_id.clone(),
            });
        }
        write_json_atomic(&path, point)
    }

    pub fn load_rollback_point(&self, rollback_id: &RollbackId) -> Result<RollbackPoint, StoreError> {
        checked_rollback(rollback_id)?;
        read_json(&paths::rollback_path(&self.home, rollback_id))?.ok_or_else(|| {
            StoreError::RollbackNotFound {
                rollback_id: rollback_id.clone(),
            }
        })
    }

    /// Points matching `scope`, newest first.
    pub fn list_rollback_points(&self, scope: &RollbackScope) -> Result<Vec<RollbackPoint>, StoreError> {
        let dir = paths::rollback_dir(&self.home);
        let mut points = Vec::new();
        for path in read_dir_or_empty(&dir)? {
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(point) = read_json::<RollbackPoint>(&path)? {
                if scope.matches(&point) {
                    points.push(point);
                }
            }
        }
        points.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.rollback_id.cmp(&a.rollback_id))
        });
        Ok(points)
    }

    /// Remove a rollback point. Only used to discard the points of a prepare
    /// phase that did not complete.
    pub fn remove_rollback_point(&self, rollback_id: &RollbackId) -> Result<(), StoreError> {
        checked_rollback(rollback_id)?;
        let path = paths::rollback_path(&self.home, rollback_id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(store_io_err(&path, err)),
        }
    }

    // -- sync watermarks ----------------------------------------------------

    pub fn load_watermark(&self, sync_name: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(read_json::<WatermarkFile>(&paths::watermark_path(&self.home, sync_name))?
            .map(|w| w.synced_at))
    }

    pub fn save_watermark(&self, sync_name: &str, synced_at: DateTime<Utc>) -> Result<(), StoreError> {
        write_json_atomic(
            &paths::watermark_path(&self.home, sync_name),
            &WatermarkFile { synced_at },
        )
    }

    // -- reports ------------------------------------------------------------

    /// Append one report as a JSON line to `reports.jsonl`.
    pub fn append_report(&self, report: &RunReport) -> Result<(), StoreError> {
        let path = paths::reports_path(&self.home);
        ensure_parent(&path)?;
        let line = serde_json::to_string(report).map_err(|e| StoreError::Json {
            path: path.clone(),
            source: e,
        })?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| store_io_err(&path, e))?;
        writeln!(file, "{line}").map_err(|e| store_io_err(&path, e))
    }

    /// Most recent `limit` reports, oldest first.
    pub fn recent_reports(&self, limit: usize) -> Result<Vec<RunReport>, StoreError> {
        let path = paths::reports_path(&self.home);
        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(vec![]),
            Err(err) => return Err(store_io_err(&path, err)),
        };
        let mut reports = Vec::new();
        for line in contents.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<RunReport>(line) {
                Ok(report) => reports.push(report),
                Err(err) => tracing::warn!(path = %path.display(), error = %err, "skipping malformed report line"),
            }
        }
        let skip = reports.len().saturating_sub(limit);
        Ok(reports.into_iter().skip(skip).collect())
    }
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn checked_plan(plan_id: &PlanId) -> Result<(), StoreError> {
    if plan_id.is_path_safe() {
        Ok(())
    } else {
        Err(StoreError::InvalidId {
            kind: "plan",
            id: plan_id.to_string(),
        })
    }
}

fn checked_rollback(rollback_id: &RollbackId) -> Result<(), StoreError> {
    if rollback_id.is_path_safe() {
        Ok(())
    } else {
        Err(StoreError::InvalidId {
            kind: "rollback",
            id: rollback_id.to_string(),
        })
    }
}

fn ensure_parent(path: &Path) -> Result<(), StoreError> {
    let Some(dir) = path.parent() else {
        return Err(store_io_err(path, std::io::Error::other("invalid state path")));
    };
    std::fs::create_dir_all(dir).map_err(|e| store_io_err(dir, e))
}

/// Write `value` to `<path>.tmp` then rename to `<path>`.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    ensure_parent(path)?;
    let json = serde_json::to_string_pretty(value).map_err(|e| StoreError::Json {
        path: path.to_path_buf(),
        source: e,
    })?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &json).map_err(|e| store_io_err(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| store_io_err(path, e))?;
    Ok(())
}

/// `Ok(None)` when the file does not exist.
fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(store_io_err(path, err)),
    };
    serde_json::from_str(&contents)
        .map(Some)
        .map_err(|e| StoreError::Json {
            path: path.to_path_buf(),
            source: e,
        })
}

fn read_dir_or_empty(dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(vec![]),
        Err(err) => return Err(store_io_err(dir, err)),
    };
    let mut paths: Vec<PathBuf> = entries.filter_map(|e| e.ok()).map(|e| e.path()).collect();
    paths.sort();
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_plan_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let store = StateStore::new(tmp.path());
        let err = store.load_plan(&PlanId::from("nope")).unwrap_err();
        assert!(matches!(err, StoreError::PlanNotFound { .. }));
    }

    #[test]
    fn watermark_roundtrip_and_absent_default() {
        let tmp = TempDir::new().unwrap();
        let store = StateStore::new(tmp.path());
        assert_eq!(store.load_watermark("nightly").unwrap(), None);
        let now = Utc::now();
        store.save_watermark("nightly", now).unwrap();
        assert_eq!(store.load_watermark("nightly").unwrap(), Some(now));
        let tmp_path = paths::watermark_path(tmp.path(), "nightly").with_extension("json.tmp");
        assert!(!tmp_path.exists(), "tmp file should be removed after atomic rename");
    }

    #[test]
    fn recent_reports_returns_tail() {
        let tmp = TempDir::new().unwrap();
        let store = StateStore::new(tmp.path());
        for stage in ["A", "B", "C"] {
            let report = RunReport::new(
                crate::report::ReportSubject::Plan(PlanId::from("p")),
                stage,
            );
            store.append_report(&report).unwrap();
        }
        let tail = store.recent_reports(2).unwrap();
        let stages: Vec<_> = tail.iter().map(|r| r.stage.as_str()).collect();
        assert_eq!(stages, vec!["B", "C"]);
    }
}
