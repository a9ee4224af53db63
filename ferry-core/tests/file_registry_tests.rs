//! File-backed registry error messages, atomic-write safety and client behavior.
//! Layout: <root>/<module_id>.yaml

use assert_fs::prelude::*;
use ferry_core::{
    file::{self, FileRegistry},
    ModuleId, ModuleRecord, ModuleStatus, Payload, RegistryClient, RegistryError,
};
use predicates::prelude::predicate;
use rstest::rstest;
use serde_json::json;
use std::fs;

fn record(id: &str, entry: &str) -> ModuleRecord {
    let mut p = Payload::new();
    p.insert("entry".into(), json!(entry));
    p.insert("deps".into(), json!(["qcore", "qstore"]));
    ModuleRecord::new(id, "1.4.2", ModuleStatus::ProductionReady, p)
}

// ---------------------------------------------------------------------------
// 1. Load error messages
// ---------------------------------------------------------------------------

#[test]
fn corrupt_yaml_returns_parse_error_with_path() {
    let root = assert_fs::TempDir::new().expect("tempdir");
    root.child("qwallet.yaml")
        .write_str(": : corrupt : yaml : !!!\n  - broken: [unclosed")
        .expect("write");

    let err = file::load_record_at(root.path(), &ModuleId::from("qwallet")).unwrap_err();
    assert!(matches!(err, RegistryError::Parse { .. }), "got: {err}");
    assert!(err.to_string().contains("qwallet.yaml"), "must contain file path, got: {err}");
}

#[test]
fn wrong_shape_yaml_returns_parse_error() {
    let root = assert_fs::TempDir::new().expect("tempdir");
    root.child("qwallet.yaml")
        .write_str("- this is a list, not a record\n")
        .expect("write");
    let err = file::load_record_at(root.path(), &ModuleId::from("qwallet")).unwrap_err();
    assert!(matches!(err, RegistryError::Parse { .. }), "got: {err}");
}

#[rstest]
#[case("../escape")]
#[case("nested/module")]
#[case(".hidden")]
#[case("")]
fn unsafe_ids_never_touch_disk(#[case] id: &str) {
    let root = assert_fs::TempDir::new().expect("tempdir");
    let mut r = record("placeholder", "main.js");
    r.module_id = ModuleId::from(id);
    let err = file::save_record_at(root.path(), &r, true).unwrap_err();
    assert!(matches!(err, RegistryError::InvalidModuleId { .. }), "got: {err}");
}

// ---------------------------------------------------------------------------
// 2. Atomic write safety
// ---------------------------------------------------------------------------

#[test]
fn save_writes_yaml_and_leaves_no_tmp() {
    let root = assert_fs::TempDir::new().expect("tempdir");
    file::save_record_at(root.path(), &record("qsocial", "feed.js"), false).expect("save");

    root.child("qsocial.yaml").assert(predicate::path::is_file());
    root.child("qsocial.yaml")
        .assert(predicate::str::contains("module_id: qsocial"));
    root.child("qsocial.yaml.tmp").assert(predicate::path::missing());
}

#[test]
fn overwrite_replaces_content_atomically() {
    let root = assert_fs::TempDir::new().expect("tempdir");
    file::save_record_at(root.path(), &record("dao", "v1.js"), false).expect("first");
    file::save_record_at(root.path(), &record("dao", "v2.js"), true).expect("second");

    let contents = fs::read_to_string(root.path().join("dao.yaml")).expect("read");
    assert!(contents.contains("v2.js"));
    assert!(!contents.contains("v1.js"));
}

// ---------------------------------------------------------------------------
// 3. RegistryClient
// ---------------------------------------------------------------------------

#[tokio::test]
async fn client_roundtrip_preserves_checksum() {
    let root = assert_fs::TempDir::new().expect("tempdir");
    let reg = FileRegistry::new("staging", root.path());
    let original = record("qwallet", "wallet.js").with_signature("ed25519:abc");

    reg.put(&original, false).await.expect("put");
    let loaded = reg.get(&original.module_id).await.expect("get");

    assert_eq!(loaded, original);
    assert!(loaded.verify_checksum());
}

#[tokio::test]
async fn already_exists_names_the_environment() {
    let root = assert_fs::TempDir::new().expect("tempdir");
    let reg = FileRegistry::new("production", root.path());
    reg.put(&record("qwallet", "a.js"), false).await.expect("put");

    let err = reg.put(&record("qwallet", "b.js"), false).await.unwrap_err();
    match err {
        RegistryError::AlreadyExists { environment, module_id } => {
            assert_eq!(environment.as_str(), "production");
            assert_eq!(module_id.as_str(), "qwallet");
        }
        other => panic!("expected AlreadyExists, got {other}"),
    }
}

#[tokio::test]
async fn list_and_delete() {
    let root = assert_fs::TempDir::new().expect("tempdir");
    let reg = FileRegistry::new("staging", root.path().join("staging"));
    for id in ["qwallet", "qsocial", "dao"] {
        reg.put(&record(id, "x.js"), false).await.expect("put");
    }
    let ids: Vec<String> = reg.list().await.expect("list").into_iter().map(|m| m.0).collect();
    assert_eq!(ids, vec!["dao", "qsocial", "qwallet"]);

    reg.delete(&ModuleId::from("dao")).await.expect("delete");
    assert!(reg.get(&ModuleId::from("dao")).await.unwrap_err().is_not_found());
    assert_eq!(reg.list().await.expect("list").len(), 2);
}
