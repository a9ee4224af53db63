//! On-disk layout under `<home>/.ferry/`.
//!
//! ```text
//! ~/.ferry/
//!   config.yaml
//!   plans/<plan_id>/plan.json
//!   plans/<plan_id>/baseline.json
//!   rollback/<rollback_id>.json
//!   sync/<sync_name>.json
//!   reports.jsonl
//!   registries/<environment>/<module_id>.yaml
//! ```

use std::path::{Path, PathBuf};

use crate::types::{Environment, PlanId, RollbackId};

pub fn ferry_root(home: &Path) -> PathBuf {
    home.join(".ferry")
}

pub fn config_path(home: &Path) -> PathBuf {
    ferry_root(home).join("config.yaml")
}

pub fn plans_dir(home: &Path) -> PathBuf {
    ferry_root(home).join("plans")
}

pub fn plan_dir(home: &Path, plan_id: &PlanId) -> PathBuf {
    plans_dir(home).join(&plan_id.0)
}

pub fn plan_path(home: &Path, plan_id: &PlanId) -> PathBuf {
    plan_dir(home, plan_id).join("plan.json")
}

pub fn baseline_path(home: &Path, plan_id: &PlanId) -> PathBuf {
    plan_dir(home, plan_id).join("baseline.json")
}

pub fn rollback_dir(home: &Path) -> PathBuf {
    ferry_root(home).join("rollback")
}

pub fn rollback_path(home: &Path, rollback_id: &RollbackId) -> PathBuf {
    rollback_dir(home).join(format!("{}.json", rollback_id.0))
}

pub fn watermark_path(home: &Path, sync_name: &str) -> PathBuf {
    ferry_root(home).join("sync").join(format!("{sync_name}.json"))
}

pub fn reports_path(home: &Path) -> PathBuf {
    ferry_root(home).join("reports.jsonl")
}

/// Default directory of a file-backed registry when the config names none.
pub fn default_registry_dir(home: &Path, environment: &Environment) -> PathBuf {
    ferry_root(home).join("registries").join(&environment.0)
}
