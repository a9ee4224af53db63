//! Ferry core library: domain types, registry contract, persistence, errors.
//!
//! Public API surface:
//! - [`types`] / [`plan`] / [`report`]: records, plans, snapshots, run reports
//! - [`client`]: the [`RegistryClient`] contract and [`RegistrySet`]
//! - [`memory`] / [`file`]: in-memory and file-backed registries
//! - [`config`]: `config.yaml` load / save
//! - [`store`]: durable plan and rollback state
//! - [`serializer`]: interchange documents
//! - [`error`]: error enums

pub mod checksum;
pub mod client;
pub mod config;
pub mod error;
pub mod file;
pub mod memory;
pub mod paths;
pub mod plan;
pub mod report;
pub mod serializer;
pub mod store;
pub mod types;

pub use checksum::{payload_checksum, Checksum};
pub use client::{get_optional, RegistryClient, RegistrySet};
pub use config::{ExecutionConfig, FerryConfig};
pub use error::{ConfigError, RegistryError, SerializeError, StoreError};
pub use file::FileRegistry;
pub use memory::MemoryRegistry;
pub use plan::{
    MigrationPlan, Phase, PhaseTransition, PlanOutcome, PlanSnapshot, RollbackPoint,
    RollbackScope, SnapshotEntry,
};
pub use report::{FailureCode, ModuleFailure, ReportSink, ReportSubject, RunReport};
pub use store::StateStore;
pub use types::{
    ConflictPolicy, ConflictRecord, Environment, ModuleId, ModuleRecord, ModuleStatus, Payload,
    PlanId, Resolution, RollbackId, Schedule, SyncConfiguration, SyncMode, SyncRunId,
};
