//! The registry contract the orchestrator consumes.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::RegistryError;
use crate::types::{Environment, ModuleId, ModuleRecord};

/// Read/write access to the module registry of one environment.
///
/// Every call is a suspension point. Implementations must not assume any
/// transaction spanning more than one module.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// The environment this client talks to.
    fn environment(&self) -> &Environment;

    /// Returns `Err(RegistryError::NotFound)` if the module is absent.
    async fn get(&self, module_id: &ModuleId) -> Result<ModuleRecord, RegistryError>;

    /// Store `record`. With `overwrite = false` an existing record yields
    /// `Err(RegistryError::AlreadyExists)`.
    async fn put(&self, record: &ModuleRecord, overwrite: bool) -> Result<(), RegistryError>;

    async fn list(&self) -> Result<BTreeSet<ModuleId>, RegistryError>;

    /// Returns `Err(RegistryError::NotFound)` if the module is absent.
    async fn delete(&self, module_id: &ModuleId) -> Result<(), RegistryError>;
}

/// `get` that maps `NotFound` to `Ok(None)`.
pub async fn get_optional(
    client: &dyn RegistryClient,
    module_id: &ModuleId,
) -> Result<Option<ModuleRecord>, RegistryError> {
    match client.get(module_id).await {
        Ok(record) => Ok(Some(record)),
        Err(err) if err.is_not_found() => Ok(None),
        Err(err) => Err(err),
    }
}

/// The registries reachable by this process, keyed by environment.
#[derive(Clone, Default)]
pub struct RegistrySet {
    clients: BTreeMap<Environment, Arc<dyn RegistryClient>>,
}

impl RegistrySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, client: Arc<dyn RegistryClient>) {
        self.clients.insert(client.environment().clone(), client);
    }

    pub fn with(mut self, client: Arc<dyn RegistryClient>) -> Self {
        self.insert(client);
        self
    }

    pub fn get(&self, environment: &Environment) -> Option<Arc<dyn RegistryClient>> {
        self.clients.get(environment).cloned()
    }

    /// Like [`RegistrySet::get`], failing with `UnknownEnvironment`.
    pub fn require(&self, environment: &Environment) -> Result<Arc<dyn RegistryClient>, RegistryError> {
        self.get(environment)
            .ok_or_else(|| RegistryError::UnknownEnvironment {
                environment: environment.clone(),
            })
    }

    pub fn contains(&self, environment: &Environment) -> bool {
        self.clients.contains_key(environment)
    }

    pub fn environments(&self) -> impl Iterator<Item = &Environment> {
        self.clients.keys()
    }
}

impl std::fmt::Debug for RegistrySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.clients.keys()).finish()
    }
}
