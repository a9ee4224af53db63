use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{Duration, Utc};
use ferry_core::memory::{FaultKind, MemoryRegistry, Operation};
use ferry_core::{
    ConflictPolicy, ConflictRecord, FailureCode, FerryConfig, ModuleId, ModuleRecord,
    ModuleStatus, Payload, RegistryClient, RegistrySet, Resolution, StateStore,
    SyncConfiguration, SyncMode,
};
use ferry_sync::{
    run_sync, ConflictResolver, FerryContext, ModuleLocks, RetryPolicy, RollbackManager,
    TransferEngine,
};
use rstest::rstest;
use serde_json::json;
use tempfile::TempDir;

fn record(id: &str, version: &str) -> ModuleRecord {
    let mut p = Payload::new();
    p.insert("entry".into(), json!(format!("{id}-{version}.js")));
    ModuleRecord::new(id, version, ModuleStatus::Testing, p)
}

fn ids(names: &[&str]) -> BTreeSet<ModuleId> {
    names.iter().copied().map(ModuleId::from).collect()
}

fn engine() -> TransferEngine {
    TransferEngine::new(4, RetryPolicy::immediate(1), ModuleLocks::new())
}

// ---------------------------------------------------------------------------
// Configured syncs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dao_full_sync_source_wins_converges_both_registries() {
    let home = TempDir::new().expect("home");
    let now = Utc::now();
    let staging = Arc::new(MemoryRegistry::new("staging").with_records([
        record("dao", "2.0.0").with_updated_at(now - Duration::hours(2)),
        record("qwallet", "1.0.0"),
    ]));
    let production = Arc::new(MemoryRegistry::new("production").with_records([
        record("dao", "1.0.0").with_updated_at(now),
        record("qsocial", "1.0.0"),
    ]));

    let mut config = FerryConfig::default();
    config.execution.backoff_ms = 0;
    config.execution.max_backoff_ms = 0;
    let mut sync = SyncConfiguration::new("dao-mirror", "staging", "production");
    sync.mode = SyncMode::Full;
    sync.conflict_resolution = ConflictPolicy::SourceWins;
    config.syncs.push(sync);
    let registries = RegistrySet::new()
        .with(staging.clone())
        .with(production.clone());
    let ctx = FerryContext::with_registries(home.path(), config, registries);

    let outcome = run_sync(&ctx, "dao-mirror").await.expect("sync");
    assert_eq!(outcome.synced, ids(&["dao", "qsocial", "qwallet"]));
    assert!(outcome.failed.is_empty());
    assert_eq!(outcome.conflicts.len(), 1);
    assert_eq!(outcome.conflicts[0].resolution, Resolution::SourceWins);
    assert_eq!(outcome.unresolved().count(), 0);

    let dao = ModuleId::from("dao");
    assert_eq!(production.record(&dao).unwrap().version, "2.0.0");
    assert_eq!(staging.records().len(), 3);
    assert_eq!(production.records().len(), 3);

    let again = run_sync(&ctx, "dao-mirror").await.expect("second sync");
    assert!(again.synced.is_empty());
    assert_eq!(again.unchanged, ids(&["dao", "qsocial", "qwallet"]));
    assert_eq!(ctx.store.recent_reports(10).expect("reports").len(), 2);
}

#[tokio::test]
async fn selective_sync_touches_only_the_selected_modules() {
    let staging = MemoryRegistry::new("staging").with_records([
        record("a", "2.0.0"),
        record("b", "2.0.0"),
        record("c", "2.0.0"),
    ]);
    let production = MemoryRegistry::new("production").with_records([
        record("a", "1.0.0"),
        record("b", "1.0.0"),
        record("c", "1.0.0"),
    ]);
    let mut cfg = SyncConfiguration::new("only-a", "staging", "production");
    cfg.mode = SyncMode::Selective;
    cfg.conflict_resolution = ConflictPolicy::SourceWins;
    cfg.modules = ids(&["a"]);

    let out = engine().sync(&staging, &production, &cfg, None).await.expect("sync");
    assert_eq!(out.synced, ids(&["a"]));
    assert!(out.unchanged.is_empty());
    assert!(out.failed.is_empty());
    assert_eq!(out.conflicts.len(), 1);
    assert_eq!(out.conflicts[0].module_id, ModuleId::from("a"));
    assert_eq!(production.record(&ModuleId::from("a")).unwrap().version, "2.0.0");

    for untouched in ["b", "c"] {
        let id = ModuleId::from(untouched);
        assert_eq!(staging.record(&id).unwrap().version, "2.0.0");
        assert_eq!(production.record(&id).unwrap().version, "1.0.0");
    }
    assert_eq!(staging.write_count(), 0);
    assert_eq!(production.write_count(), 1);
}

#[tokio::test]
async fn latest_update_picks_the_newer_side() {
    let now = Utc::now();
    let source = MemoryRegistry::new("staging")
        .with_records([record("dao", "1.0.0").with_updated_at(now - Duration::minutes(5))]);
    let target = MemoryRegistry::new("production")
        .with_records([record("dao", "1.1.0").with_updated_at(now)]);
    let mut sync = SyncConfiguration::new("dao", "staging", "production");
    sync.conflict_resolution = ConflictPolicy::LatestUpdate;

    let outcome = engine().sync(&source, &target, &sync, None).await.expect("sync");
    assert_eq!(outcome.conflicts[0].resolution, Resolution::LatestUpdate);
    assert_eq!(source.record(&"dao".into()).unwrap().version, "1.1.0");
    assert_eq!(target.write_count(), 0);
}

#[tokio::test]
async fn skip_policy_leaves_conflict_unresolved_and_writes_nothing() {
    let source = MemoryRegistry::new("staging").with_records([record("dao", "2.0.0")]);
    let target = MemoryRegistry::new("production").with_records([record("dao", "1.0.0")]);
    let mut sync = SyncConfiguration::new("dao", "staging", "production");
    sync.conflict_resolution = ConflictPolicy::Skip;

    let outcome = engine().sync(&source, &target, &sync, None).await.expect("sync");
    assert_eq!(outcome.unresolved().count(), 1);
    assert!(outcome.synced.is_empty());
    assert_eq!(source.write_count() + target.write_count(), 0);
}

#[tokio::test]
async fn one_failing_module_does_not_stop_the_others() {
    let source = MemoryRegistry::new("staging").with_records([
        record("qwallet", "1.0.0"),
        record("qsocial", "1.0.0"),
        record("dao", "1.0.0"),
    ]);
    let target = MemoryRegistry::new("production");
    target.inject_fault("qsocial", Operation::Put, FaultKind::Unavailable, usize::MAX);
    let sync = SyncConfiguration::new("all", "staging", "production");

    let outcome = engine().sync(&source, &target, &sync, None).await.expect("sync");
    assert_eq!(outcome.synced, ids(&["dao", "qwallet"]));
    assert_eq!(
        outcome.failed.keys().cloned().collect::<BTreeSet<_>>(),
        ids(&["qsocial"])
    );
    assert_eq!(
        outcome.failed[&ModuleId::from("qsocial")].kind,
        FailureCode::RegistryUnavailable
    );
    assert_eq!(target.write_count(), 2);
}

// ---------------------------------------------------------------------------
// Import, snapshot and resolver properties
// ---------------------------------------------------------------------------

#[tokio::test]
async fn importing_twice_writes_once() {
    let target = MemoryRegistry::new("production");
    let records = vec![record("qwallet", "1.0.0"), record("qsocial", "1.0.0")];
    let engine = engine();

    let first = engine.import(&target, &records, true).await;
    assert_eq!(first.imported, ids(&["qsocial", "qwallet"]));
    let writes = target.write_count();

    let second = engine.import(&target, &records, true).await;
    assert!(second.imported.is_empty());
    assert_eq!(second.skipped, ids(&["qsocial", "qwallet"]));
    assert_eq!(target.write_count(), writes);
}

#[rstest]
#[case::empty_payload(Payload::new())]
#[case::nested(Payload::from([("config".to_string(), json!({"limits": [1, 2, 3], "beta": true}))]))]
#[case::unicode(Payload::from([("title".to_string(), json!("portefeuille \u{20ac}"))]))]
#[tokio::test]
async fn restore_returns_exactly_the_snapshotted_record(#[case] payload: Payload) {
    let home = TempDir::new().expect("home");
    let original = ModuleRecord::new("qwallet", "1.0.0", ModuleStatus::ProductionReady, payload)
        .with_signature("sig-abc");
    let production = Arc::new(MemoryRegistry::new("production").with_records([original.clone()]));
    let registries = RegistrySet::new().with(production.clone());
    let manager = RollbackManager::new(StateStore::new(home.path()), ModuleLocks::new());

    let point = manager
        .create_point(production.as_ref(), &original.module_id, None, "before edit", "ops")
        .await
        .expect("point");
    production
        .put(&record("qwallet", "9.9.9"), true)
        .await
        .expect("overwrite");

    manager.restore(&registries, &point.rollback_id).await.expect("restore");
    assert_eq!(production.record(&original.module_id), Some(original));
}

#[test]
fn resolver_is_deterministic_for_every_policy() {
    let now = Utc::now();
    let conflict = ConflictRecord::new(
        record("dao", "2.0.0").with_updated_at(now),
        record("dao", "1.0.0").with_updated_at(now - Duration::seconds(1)),
    );
    let resolver = ConflictResolver;
    for policy in [
        ConflictPolicy::SourceWins,
        ConflictPolicy::TargetWins,
        ConflictPolicy::Manual,
        ConflictPolicy::Skip,
        ConflictPolicy::LatestUpdate,
    ] {
        let first = resolver.resolve(&conflict, policy);
        let second = resolver.resolve(&conflict, policy);
        assert_eq!(first.resolution, second.resolution, "{policy:?}");
        assert_eq!(first.resolved_record, second.resolved_record, "{policy:?}");
    }
}
