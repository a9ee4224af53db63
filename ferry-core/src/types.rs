//! Domain types for module registries and synchronization.
//!
//! All types are serializable via serde; identifiers are transparent newtypes
//! so they read as plain strings in JSON and YAML.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checksum::{payload_checksum, Checksum};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_id!(
    /// Identity of a module record, unique within one registry.
    ModuleId
);

string_id!(
    /// Name of a registry environment (e.g. `staging`, `production`).
    Environment
);

string_id!(
    /// Identifier of a migration plan.
    PlanId
);

string_id!(
    /// Identifier of an immutable rollback point.
    RollbackId
);

string_id!(
    /// Identifier of a single sync run.
    SyncRunId
);

/// A single file-name component: no separators, no leading dot.
fn is_path_component(s: &str) -> bool {
    !s.is_empty()
        && !s.starts_with('.')
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'))
}

impl ModuleId {
    /// Module ids double as file names in file-backed registries.
    pub fn is_path_safe(&self) -> bool {
        is_path_component(&self.0)
    }
}

impl PlanId {
    pub fn generate() -> Self {
        Self(format!("plan-{}", uuid::Uuid::new_v4().simple()))
    }

    /// Plan ids name a directory under `plans/`.
    pub fn is_path_safe(&self) -> bool {
        is_path_component(&self.0)
    }
}

impl RollbackId {
    pub fn generate() -> Self {
        Self(format!("rb-{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn is_path_safe(&self) -> bool {
        is_path_component(&self.0)
    }
}

impl SyncRunId {
    pub fn generate() -> Self {
        Self(format!("sync-{}", uuid::Uuid::new_v4().simple()))
    }
}

// ---------------------------------------------------------------------------
// Module records
// ---------------------------------------------------------------------------

/// Opaque module metadata. Keys are kept sorted so the canonical encoding
/// (and therefore the checksum) is stable.
pub type Payload = BTreeMap<String, serde_json::Value>;

/// Lifecycle status of a module in its registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModuleStatus {
    #[default]
    Draft,
    Testing,
    ProductionReady,
    Deprecated,
}

impl fmt::Display for ModuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleStatus::Draft => write!(f, "DRAFT"),
            ModuleStatus::Testing => write!(f, "TESTING"),
            ModuleStatus::ProductionReady => write!(f, "PRODUCTION_READY"),
            ModuleStatus::Deprecated => write!(f, "DEPRECATED"),
        }
    }
}

/// A versioned, checksummed unit of module metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleRecord {
    pub module_id: ModuleId,
    pub version: String,
    #[serde(default)]
    pub status: ModuleStatus,
    #[serde(default)]
    pub payload: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub checksum: Checksum,
}

impl ModuleRecord {
    /// Build a record stamped with the current time; the checksum is derived
    /// from `payload`.
    pub fn new(
        module_id: impl Into<ModuleId>,
        version: impl Into<String>,
        status: ModuleStatus,
        payload: Payload,
    ) -> Self {
        let checksum = payload_checksum(&payload);
        Self {
            module_id: module_id.into(),
            version: version.into(),
            status,
            payload,
            signature: None,
            updated_at: Utc::now(),
            checksum,
        }
    }

    pub fn with_updated_at(mut self, updated_at: DateTime<Utc>) -> Self {
        self.updated_at = updated_at;
        self
    }

    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = Some(signature.into());
        self
    }

    /// Replace the payload and recompute the checksum.
    pub fn set_payload(&mut self, payload: Payload) {
        self.checksum = payload_checksum(&payload);
        self.payload = payload;
    }

    /// Checksum recomputed from the current payload.
    pub fn computed_checksum(&self) -> Checksum {
        payload_checksum(&self.payload)
    }

    /// `true` when the stored checksum matches the payload.
    pub fn verify_checksum(&self) -> bool {
        self.checksum == self.computed_checksum()
    }

    /// Content equality; `updated_at` is deliberately ignored.
    pub fn same_content(&self, other: &ModuleRecord) -> bool {
        self.checksum == other.checksum
    }
}

// ---------------------------------------------------------------------------
// Synchronization
// ---------------------------------------------------------------------------

/// Which module ids a sync run considers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncMode {
    #[default]
    Full,
    Incremental,
    Selective,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::Full => write!(f, "FULL"),
            SyncMode::Incremental => write!(f, "INCREMENTAL"),
            SyncMode::Selective => write!(f, "SELECTIVE"),
        }
    }
}

impl FromStr for SyncMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize_token(s).as_str() {
            "full" => Ok(Self::Full),
            "incremental" => Ok(Self::Incremental),
            "selective" => Ok(Self::Selective),
            other => Err(format!(
                "unknown sync mode '{other}'; expected: full, incremental, selective"
            )),
        }
    }
}

/// How a sync run settles a module whose content differs on both sides.
///
/// `LatestUpdate` is opt-in only: `updated_at` is not a reliable total order
/// across environments with clock skew.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictPolicy {
    SourceWins,
    TargetWins,
    #[default]
    Manual,
    Skip,
    LatestUpdate,
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictPolicy::SourceWins => write!(f, "SOURCE_WINS"),
            ConflictPolicy::TargetWins => write!(f, "TARGET_WINS"),
            ConflictPolicy::Manual => write!(f, "MANUAL"),
            ConflictPolicy::Skip => write!(f, "SKIP"),
            ConflictPolicy::LatestUpdate => write!(f, "LATEST_UPDATE"),
        }
    }
}

impl FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize_token(s).as_str() {
            "source_wins" | "source" => Ok(Self::SourceWins),
            "target_wins" | "target" => Ok(Self::TargetWins),
            "manual" => Ok(Self::Manual),
            "skip" => Ok(Self::Skip),
            "latest_update" | "latest" => Ok(Self::LatestUpdate),
            other => Err(format!(
                "unknown conflict policy '{other}'; expected: source-wins, target-wins, manual, skip, latest-update"
            )),
        }
    }
}

fn normalize_token(s: &str) -> String {
    s.trim().to_ascii_lowercase().replace('-', "_")
}

/// Recurring trigger for a scheduled sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub every_secs: u64,
}

impl Schedule {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.every_secs.max(1))
    }
}

/// A named, persistent description of a two-way sync between registries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfiguration {
    pub name: String,
    pub source_environment: Environment,
    pub target_environment: Environment,
    #[serde(default)]
    pub mode: SyncMode,
    #[serde(default)]
    pub conflict_resolution: ConflictPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<Schedule>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// The subset considered by [`SyncMode::Selective`].
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub modules: BTreeSet<ModuleId>,
}

fn default_enabled() -> bool {
    true
}

impl SyncConfiguration {
    pub fn new(
        name: impl Into<String>,
        source: impl Into<Environment>,
        target: impl Into<Environment>,
    ) -> Self {
        Self {
            name: name.into(),
            source_environment: source.into(),
            target_environment: target.into(),
            mode: SyncMode::Full,
            conflict_resolution: ConflictPolicy::Manual,
            schedule: None,
            enabled: true,
            modules: BTreeSet::new(),
        }
    }
}

/// Outcome recorded on a [`ConflictRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Resolution {
    SourceWins,
    TargetWins,
    Manual,
    Skip,
    LatestUpdate,
    #[default]
    Unresolved,
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::SourceWins => write!(f, "SOURCE_WINS"),
            Resolution::TargetWins => write!(f, "TARGET_WINS"),
            Resolution::Manual => write!(f, "MANUAL"),
            Resolution::Skip => write!(f, "SKIP"),
            Resolution::LatestUpdate => write!(f, "LATEST_UPDATE"),
            Resolution::Unresolved => write!(f, "UNRESOLVED"),
        }
    }
}

/// The same module with diverging content in two registries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub module_id: ModuleId,
    pub source_record: ModuleRecord,
    pub target_record: ModuleRecord,
    pub detected_at: DateTime<Utc>,
    pub resolution: Resolution,
    pub resolved_record: Option<ModuleRecord>,
}

impl ConflictRecord {
    pub fn new(source_record: ModuleRecord, target_record: ModuleRecord) -> Self {
        Self {
            module_id: source_record.module_id.clone(),
            source_record,
            target_record,
            detected_at: Utc::now(),
            resolution: Resolution::Unresolved,
            resolved_record: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved_record.is_some()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(v: serde_json::Value) -> Payload {
        match v {
            serde_json::Value::Object(map) => map.into_iter().collect(),
            _ => Payload::new(),
        }
    }

    #[test]
    fn newtype_display_and_equality() {
        assert_eq!(ModuleId::from("qwallet").to_string(), "qwallet");
        assert_eq!(Environment::from("staging"), Environment::from(String::from("staging")));
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let json = serde_json::to_string(&ModuleId::from("dao")).unwrap();
        assert_eq!(json, "\"dao\"");
    }

    #[test]
    fn path_safety() {
        assert!(ModuleId::from("qwallet-v2_core").is_path_safe());
        assert!(!ModuleId::from("../etc").is_path_safe());
        assert!(!ModuleId::from("a/b").is_path_safe());
        assert!(!ModuleId::from("").is_path_safe());
        assert!(PlanId::generate().is_path_safe());
        assert!(RollbackId::generate().is_path_safe());
        assert!(!PlanId::from("../../x").is_path_safe());
        assert!(!RollbackId::from("/etc/passwd").is_path_safe());
    }

    #[test]
    fn checksum_ignores_updated_at() {
        let p = payload(json!({"entry": "index.js", "deps": ["a", "b"]}));
        let a = ModuleRecord::new("m", "1.0.0", ModuleStatus::Draft, p.clone());
        let b = ModuleRecord::new("m", "1.0.1", ModuleStatus::Testing, p)
            .with_updated_at(a.updated_at + chrono::Duration::days(3));
        assert!(a.same_content(&b));
    }

    #[test]
    fn tampered_payload_fails_verification() {
        let mut r = ModuleRecord::new("m", "1.0.0", ModuleStatus::Draft, payload(json!({"k": 1})));
        assert!(r.verify_checksum());
        r.payload.insert("k".into(), json!(2));
        assert!(!r.verify_checksum());
        r.set_payload(r.payload.clone());
        assert!(r.verify_checksum());
    }

    #[test]
    fn enums_use_screaming_case_on_the_wire() {
        assert_eq!(
            serde_json::to_string(&ModuleStatus::ProductionReady).unwrap(),
            "\"PRODUCTION_READY\""
        );
        assert_eq!(serde_json::to_string(&ConflictPolicy::SourceWins).unwrap(), "\"SOURCE_WINS\"");
    }

    #[test]
    fn policy_and_mode_parse_from_cli_tokens() {
        assert_eq!("source-wins".parse::<ConflictPolicy>().unwrap(), ConflictPolicy::SourceWins);
        assert_eq!("TARGET_WINS".parse::<ConflictPolicy>().unwrap(), ConflictPolicy::TargetWins);
        assert_eq!("incremental".parse::<SyncMode>().unwrap(), SyncMode::Incremental);
        assert!("sideways".parse::<SyncMode>().is_err());
    }

    #[test]
    fn sync_configuration_defaults_from_yaml() {
        let yaml = "name: nightly\nsource_environment: staging\ntarget_environment: production\n";
        let cfg: SyncConfiguration = serde_yaml::from_str(yaml).unwrap();
        assert!(cfg.enabled);
        assert_eq!(cfg.mode, SyncMode::Full);
        assert_eq!(cfg.conflict_resolution, ConflictPolicy::Manual);
        assert!(cfg.schedule.is_none());
    }
}
