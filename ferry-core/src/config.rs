//! `~/.ferry/config.yaml`: registries, execution tuning and named syncs.
//!
//! ```yaml
//! registries:
//!   staging:
//!     path: /srv/registries/staging
//! execution:
//!   concurrency: 4
//!   max_retries: 3
//!   backoff_ms: 200
//!   failure_threshold: 0.5
//! syncs:
//!   - name: staging-to-production
//!     source_environment: staging
//!     target_environment: production
//!     mode: INCREMENTAL
//!     conflict_resolution: SOURCE_WINS
//!     schedule:
//!       every_secs: 900
//! ```
//!
//! A missing file means "all defaults". Environments that are referenced but
//! not configured fall back to `~/.ferry/registries/<env>`.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::client::RegistrySet;
use crate::error::ConfigError;
use crate::file::FileRegistry;
use crate::paths;
use crate::types::{Environment, SyncConfiguration};

pub const MAX_CONCURRENCY: usize = 64;

/// Where one environment's registry lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub path: PathBuf,
}

/// Tuning knobs for module-level work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Concurrent module transfers within one phase.
    pub concurrency: usize,
    /// Retries for transient registry errors (attempts = retries + 1).
    pub max_retries: u32,
    /// First retry delay; doubles on each further retry.
    pub backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Failed fraction above which `execute` fails the plan.
    pub failure_threshold: f64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_retries: 3,
            backoff_ms: 200,
            max_backoff_ms: 5_000,
            failure_threshold: 0.5,
        }
    }
}

impl ExecutionConfig {
    /// `concurrency` clamped to `1..=MAX_CONCURRENCY`.
    pub fn effective_concurrency(&self) -> usize {
        self.concurrency.clamp(1, MAX_CONCURRENCY)
    }
}

/// Root of `config.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FerryConfig {
    #[serde(default)]
    pub registries: BTreeMap<Environment, RegistryConfig>,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub syncs: Vec<SyncConfiguration>,
}

impl FerryConfig {
    /// Reject values that would make the orchestrator misbehave.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let threshold = self.execution.failure_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ConfigError::Invalid(format!(
                "execution.failure_threshold must be within 0.0..=1.0, got {threshold}"
            )));
        }
        if self.execution.concurrency == 0 {
            return Err(ConfigError::Invalid(
                "execution.concurrency must be at least 1".to_string(),
            ));
        }

        let mut names = BTreeSet::new();
        for sync in &self.syncs {
            if !names.insert(sync.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate sync name '{}'",
                    sync.name
                )));
            }
            if sync.source_environment == sync.target_environment {
                return Err(ConfigError::Invalid(format!(
                    "sync '{}' has identical source and target '{}'",
                    sync.name, sync.source_environment
                )));
            }
            if sync.schedule.is_some_and(|s| s.every_secs == 0) {
                return Err(ConfigError::Invalid(format!(
                    "sync '{}' schedule.every_secs must be positive",
                    sync.name
                )));
            }
        }
        Ok(())
    }

    pub fn find_sync(&self, name: &str) -> Option<&SyncConfiguration> {
        self.syncs.iter().find(|s| s.name == name)
    }

    /// Directory backing `environment`.
    pub fn registry_dir_at(&self, home: &Path, environment: &Environment) -> PathBuf {
        self.registries
            .get(environment)
            .map(|r| r.path.clone())
            .unwrap_or_else(|| paths::default_registry_dir(home, environment))
    }

    /// File registries for every configured environment, every environment a
    /// sync mentions, and `extra`.
    pub fn open_registries_at<'a>(
        &self,
        home: &Path,
        extra: impl IntoIterator<Item = &'a Environment>,
    ) -> RegistrySet {
        let mut envs: BTreeSet<Environment> = self.registries.keys().cloned().collect();
        for sync in &self.syncs {
            envs.insert(sync.source_environment.clone());
            envs.insert(sync.target_environment.clone());
        }
        envs.extend(extra.into_iter().cloned());

        let mut set = RegistrySet::new();
        for env in envs {
            let dir = self.registry_dir_at(home, &env);
            set.insert(Arc::new(FileRegistry::new(env, dir)));
        }
        set
    }
}

// ---------------------------------------------------------------------------
// Load / save
// ---------------------------------------------------------------------------

/// Load `<home>/.ferry/config.yaml`, or defaults when absent.
pub fn load_at(home: &Path) -> Result<FerryConfig, ConfigError> {
    let path = paths::config_path(home);
    if !path.exists() {
        return Ok(FerryConfig::default());
    }
    let contents = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io {
        path: path.clone(),
        source: e,
    })?;
    let config: FerryConfig =
        serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse { path, source: e })?;
    config.validate()?;
    Ok(config)
}

/// Atomically write `<home>/.ferry/config.yaml`.
pub fn save_at(home: &Path, config: &FerryConfig) -> Result<(), ConfigError> {
    config.validate()?;
    let path = paths::config_path(home);
    let io = |path: &Path, e| ConfigError::Io {
        path: path.to_path_buf(),
        source: e,
    };
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| io(dir, e))?;
    }
    let yaml = serde_yaml::to_string(config)?;
    let tmp = path.with_extension("yaml.tmp");
    std::fs::write(&tmp, yaml).map_err(|e| io(&tmp, e))?;
    std::fs::rename(&tmp, &path).map_err(|e| io(&path, e))?;
    Ok(())
}
