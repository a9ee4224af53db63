use std::path::Path;
use std::process::Command;

use assert_cmd::prelude::*;
use predicates::str::contains;
use serde_json::{json, Value};
use tempfile::TempDir;

use ferry_core::file::{load_record_at, save_record_at};
use ferry_core::paths::default_registry_dir;
use ferry_core::{Environment, ModuleId, ModuleRecord, ModuleStatus, Payload};

fn ferry_cmd(home: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("ferry"));
    cmd.env("HOME", home)
        .env("USERPROFILE", home)
        .env_remove("RUST_LOG");
    cmd
}

fn seed(home: &Path, env: &str, id: &str, version: &str) -> ModuleRecord {
    let mut payload = Payload::new();
    payload.insert("entry".into(), json!(format!("{id}-{version}.js")));
    let record = ModuleRecord::new(id, version, ModuleStatus::ProductionReady, payload);
    let root = default_registry_dir(home, &Environment::from(env));
    save_record_at(&root, &record, true).expect("seed record");
    record
}

fn stored(home: &Path, env: &str, id: &str) -> Option<ModuleRecord> {
    let root = default_registry_dir(home, &Environment::from(env));
    load_record_at(&root, &ModuleId::from(id)).expect("load record")
}

fn stdout_json(output: std::process::Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("stdout is JSON")
}

#[test]
fn plan_create_and_migrate_run_promotes_modules() {
    let home = TempDir::new().expect("home");
    seed(home.path(), "staging", "qwallet", "2.0.0");
    seed(home.path(), "staging", "qsocial", "1.3.0");
    seed(home.path(), "production", "qwallet", "1.9.0");

    let output = ferry_cmd(home.path())
        .args([
            "plan", "create", "--name", "release 42", "--source", "staging", "--target",
            "production", "--module", "qwallet", "--module", "qsocial", "--json",
        ])
        .output()
        .expect("run plan create");
    assert!(output.status.success(), "plan create failed: {output:?}");
    let plan = stdout_json(output);
    let plan_id = plan["plan_id"].as_str().expect("plan id").to_string();
    assert_eq!(plan["current_phase"], json!("NOT_STARTED"));

    ferry_cmd(home.path())
        .args(["migrate", &plan_id, "run"])
        .assert()
        .success()
        .stdout(contains("COMPLETED"));

    assert_eq!(stored(home.path(), "production", "qwallet").unwrap().version, "2.0.0");
    assert_eq!(stored(home.path(), "production", "qsocial").unwrap().version, "1.3.0");

    ferry_cmd(home.path())
        .args(["plan", "list"])
        .assert()
        .success()
        .stdout(contains(plan_id.as_str()));

    ferry_cmd(home.path())
        .args(["plan", "show", &plan_id])
        .assert()
        .success()
        .stdout(contains("VALIDATING → COMPLETED"));

    ferry_cmd(home.path())
        .args(["rollback", "list", "--plan", &plan_id])
        .assert()
        .success()
        .stdout(contains("qwallet"))
        .stdout(contains("1.9.0"));

    ferry_cmd(home.path())
        .args(["migrate", &plan_id, "rollback"])
        .assert()
        .failure()
        .stderr(contains("COMPLETED"));
}

#[test]
fn invalid_plan_request_lists_every_violation() {
    let home = TempDir::new().expect("home");
    seed(home.path(), "staging", "qwallet", "1.0.0");

    ferry_cmd(home.path())
        .args([
            "plan", "create", "--name", "oops", "--source", "staging", "--target", "staging",
            "--module", "qwallet", "--module", "ghost",
        ])
        .assert()
        .failure()
        .stderr(contains("source and target are both 'staging'"))
        .stderr(contains("module 'ghost' does not exist in staging"));
}

#[test]
fn ad_hoc_source_wins_sync_overwrites_target() {
    let home = TempDir::new().expect("home");
    seed(home.path(), "staging", "dao", "2.0.0");
    seed(home.path(), "production", "dao", "1.0.0");

    ferry_cmd(home.path())
        .args([
            "sync", "--source", "staging", "--target", "production", "--policy", "source-wins",
        ])
        .assert()
        .success()
        .stdout(contains("1 synced"))
        .stdout(contains("SOURCE_WINS"));
    assert_eq!(stored(home.path(), "production", "dao").unwrap().version, "2.0.0");

    ferry_cmd(home.path())
        .args(["sync", "nightly"])
        .assert()
        .failure()
        .stderr(contains("no sync named 'nightly'"));
}

#[test]
fn export_then_import_is_idempotent() {
    let home = TempDir::new().expect("home");
    let work = TempDir::new().expect("work");
    seed(home.path(), "staging", "qwallet", "2.0.0");
    seed(home.path(), "staging", "qsocial", "1.3.0");
    let file = work.path().join("staging.jsonl");

    ferry_cmd(home.path())
        .args(["export", "--env", "staging", "--output"])
        .arg(&file)
        .assert()
        .success();
    let text = std::fs::read_to_string(&file).expect("export file");
    assert_eq!(text.lines().count(), 2);

    ferry_cmd(home.path())
        .args(["import", "--env", "qa", "--input"])
        .arg(&file)
        .assert()
        .success()
        .stdout(contains("2 imported"));
    assert!(stored(home.path(), "qa", "qwallet").is_some());

    ferry_cmd(home.path())
        .args(["import", "--env", "qa", "--input"])
        .arg(&file)
        .assert()
        .success()
        .stdout(contains("0 imported, 2 skipped"));
}

#[test]
fn diff_shows_payload_changes() {
    let home = TempDir::new().expect("home");
    seed(home.path(), "staging", "dao", "2.0.0");
    seed(home.path(), "production", "dao", "1.0.0");

    ferry_cmd(home.path())
        .args(["diff", "dao", "--source", "staging", "--target", "production"])
        .assert()
        .success()
        .stdout(contains("--- production/dao"))
        .stdout(contains("+++ staging/dao"))
        .stdout(contains("+    \"entry\": \"dao-2.0.0.js\""));
}

#[test]
fn manual_rollback_point_restores_record() {
    let home = TempDir::new().expect("home");
    let original = seed(home.path(), "production", "dao", "1.0.0");

    let output = ferry_cmd(home.path())
        .args(["rollback", "create", "--env", "production", "--module", "dao"])
        .output()
        .expect("run rollback create");
    assert!(output.status.success(), "rollback create failed: {output:?}");

    let listed = ferry_cmd(home.path())
        .args(["rollback", "list", "--module", "dao", "--json"])
        .output()
        .expect("run rollback list");
    let points = stdout_json(listed);
    let rollback_id = points[0]["rollback_id"].as_str().expect("rollback id").to_string();

    seed(home.path(), "production", "dao", "9.9.9");
    ferry_cmd(home.path())
        .args(["rollback", "restore", &rollback_id])
        .assert()
        .success()
        .stdout(contains("restored dao 1.0.0"));
    assert_eq!(stored(home.path(), "production", "dao"), Some(original));
}

#[test]
fn daemon_status_when_not_running() {
    let home = TempDir::new().expect("home");
    let output = ferry_cmd(home.path())
        .args(["daemon", "status"])
        .output()
        .expect("run daemon status");
    assert!(output.status.success());
    assert_eq!(stdout_json(output)["running"], json!(false));
}
