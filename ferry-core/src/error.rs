//! Error types for ferry-core.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::{Environment, ModuleId, PlanId, RollbackId};

/// Errors surfaced by a [`crate::RegistryClient`].
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("module '{module_id}' not found in {environment}")]
    NotFound {
        environment: Environment,
        module_id: ModuleId,
    },

    /// `put` with `overwrite = false` found an existing record.
    #[error("module '{module_id}' already exists in {environment}")]
    AlreadyExists {
        environment: Environment,
        module_id: ModuleId,
    },

    #[error("request for '{module_id}' in {environment} timed out")]
    Timeout {
        environment: Environment,
        module_id: ModuleId,
    },

    #[error("registry {environment} unavailable: {reason}")]
    Unavailable {
        environment: Environment,
        reason: String,
    },

    #[error("no registry configured for environment '{environment}'")]
    UnknownEnvironment { environment: Environment },

    #[error("module id '{module_id}' cannot be stored in a file registry")]
    InvalidModuleId { module_id: ModuleId },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML serialization error (write path).
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Malformed record file: includes file path and line context from serde_yaml.
    #[error("failed to parse module record at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("registry backend error: {0}")]
    Backend(String),
}

impl RegistryError {
    /// Transient I/O conditions that a bounded retry may clear.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RegistryError::Timeout { .. } | RegistryError::Unavailable { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RegistryError::NotFound { .. })
    }
}

/// Errors from the durable plan / snapshot store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("state JSON error at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("plan '{plan_id}' not found")]
    PlanNotFound { plan_id: PlanId },

    #[error("no snapshot recorded for plan '{plan_id}'")]
    SnapshotNotFound { plan_id: PlanId },

    #[error("rollback point '{rollback_id}' not found")]
    RollbackNotFound { rollback_id: RollbackId },

    /// Rollback points are write-once.
    #[error("rollback point '{rollback_id}' already exists")]
    RollbackExists { rollback_id: RollbackId },

    /// Ids from the command line are joined into state paths.
    #[error("'{id}' is not a valid {kind} id")]
    InvalidId { kind: &'static str, id: String },
}

/// Errors loading or validating `config.yaml`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors encoding or decoding interchange documents.
#[derive(Debug, Error)]
pub enum SerializeError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON Lines error on line {line}: {source}")]
    Line {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("unsupported interchange format version {0}")]
    UnsupportedVersion(u32),

    #[error("unknown interchange format '{0}'; expected: json, yaml, jsonl")]
    UnknownFormat(String),
}

pub(crate) fn registry_io_err(path: impl Into<PathBuf>, source: std::io::Error) -> RegistryError {
    RegistryError::Io {
        path: path.into(),
        source,
    }
}

pub(crate) fn store_io_err(path: impl Into<PathBuf>, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.into(),
        source,
    }
}
