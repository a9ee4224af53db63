//! In-process registry with scripted fault injection.
//!
//! Backs dry runs and tests. Faults are queued per module and operation and
//! consumed one per call, so a test can say "the next two `get`s of
//! `qsocial` time out" and observe the retry policy at work.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::json;

use crate::client::RegistryClient;
use crate::error::RegistryError;
use crate::types::{Environment, ModuleId, ModuleRecord};

/// Registry operation a fault applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Get,
    Put,
    Delete,
}

/// Transient failure to inject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Timeout,
    Unavailable,
}

#[derive(Debug)]
struct Fault {
    op: Operation,
    kind: FaultKind,
    remaining: usize,
}

/// A registry held entirely in memory.
#[derive(Debug)]
pub struct MemoryRegistry {
    environment: Environment,
    records: Mutex<BTreeMap<ModuleId, ModuleRecord>>,
    faults: Mutex<HashMap<ModuleId, Vec<Fault>>>,
    mangled: Mutex<BTreeSet<ModuleId>>,
    attempts: Mutex<HashMap<(ModuleId, Operation), usize>>,
    offline: AtomicBool,
    writes: AtomicUsize,
}

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryRegistry {
    pub fn new(environment: impl Into<Environment>) -> Self {
        Self {
            environment: environment.into(),
            records: Mutex::new(BTreeMap::new()),
            faults: Mutex::new(HashMap::new()),
            mangled: Mutex::new(BTreeSet::new()),
            attempts: Mutex::new(HashMap::new()),
            offline: AtomicBool::new(false),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn with_records(self, records: impl IntoIterator<Item = ModuleRecord>) -> Self {
        for record in records {
            self.seed(record);
        }
        self
    }

    /// Insert a record directly, bypassing faults and write counting.
    pub fn seed(&self, record: ModuleRecord) {
        locked(&self.records).insert(record.module_id.clone(), record);
    }

    pub fn record(&self, module_id: &ModuleId) -> Option<ModuleRecord> {
        locked(&self.records).get(module_id).cloned()
    }

    pub fn records(&self) -> BTreeMap<ModuleId, ModuleRecord> {
        locked(&self.records).clone()
    }

    /// Fail the next `times` calls of `op` on `module_id` with `kind`.
    /// `usize::MAX` makes the fault permanent.
    pub fn inject_fault(&self, module_id: impl Into<ModuleId>, op: Operation, kind: FaultKind, times: usize) {
        locked(&self.faults)
            .entry(module_id.into())
            .or_default()
            .push(Fault {
                op,
                kind,
                remaining: times,
            });
    }

    pub fn clear_faults(&self) {
        locked(&self.faults).clear();
    }

    /// Every call fails with `Unavailable` while offline.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Alter the stored payload without updating the checksum, as storage
    /// corruption would.
    pub fn corrupt(&self, module_id: &ModuleId) {
        if let Some(record) = locked(&self.records).get_mut(module_id) {
            record.payload.insert("__corrupted".into(), json!(true));
        }
    }

    /// Make subsequent writes of `module_id` land with different content than
    /// requested, as a racing writer would.
    pub fn mangle_writes(&self, module_id: impl Into<ModuleId>) {
        locked(&self.mangled).insert(module_id.into());
    }

    /// Number of successful `put`s that changed stored state.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of calls (including failed ones) of `op` on `module_id`.
    pub fn attempts(&self, module_id: &ModuleId, op: Operation) -> usize {
        locked(&self.attempts)
            .get(&(module_id.clone(), op))
            .copied()
            .unwrap_or(0)
    }

    fn enter(&self, module_id: &ModuleId, op: Operation) -> Result<(), RegistryError> {
        *locked(&self.attempts).entry((module_id.clone(), op)).or_default() += 1;

        if self.offline.load(Ordering::SeqCst) {
            return Err(RegistryError::Unavailable {
                environment: self.environment.clone(),
                reason: "registry offline".to_string(),
            });
        }

        let mut faults = locked(&self.faults);
        let Some(queue) = faults.get_mut(module_id) else {
            return Ok(());
        };
        let Some(fault) = queue.iter_mut().find(|f| f.op == op && f.remaining > 0) else {
            return Ok(());
        };
        if fault.remaining != usize::MAX {
            fault.remaining -= 1;
        }
        match fault.kind {
            FaultKind::Timeout => Err(RegistryError::Timeout {
                environment: self.environment.clone(),
                module_id: module_id.clone(),
            }),
            FaultKind::Unavailable => Err(RegistryError::Unavailable {
                environment: self.environment.clone(),
                reason: format!("injected fault for '{module_id}'"),
            }),
        }
    }

    fn not_found(&self, module_id: &ModuleId) -> RegistryError {
        RegistryError::NotFound {
            environment: self.environment.clone(),
            module_id: module_id.clone(),
        }
    }
}

#[async_trait]
impl RegistryClient for MemoryRegistry {
    fn environment(&self) -> &Environment {
        &self.environment
    }

    async fn get(&self, module_id: &ModuleId) -> Result<ModuleRecord, RegistryError> {
        self.enter(module_id, Operation::Get)?;
        self.record(module_id)
            .ok_or_else(|| self.not_found(module_id))
    }

    async fn put(&self, record: &ModuleRecord, overwrite: bool) -> Result<(), RegistryError> {
        self.enter(&record.module_id, Operation::Put)?;
        let mut stored = record.clone();
        if locked(&self.mangled).contains(&record.module_id) {
            let mut payload = stored.payload.clone();
            payload.insert("__raced".into(), json!(true));
            stored.set_payload(payload);
        }

        let mut records = locked(&self.records);
        if !overwrite && records.contains_key(&record.module_id) {
            return Err(RegistryError::AlreadyExists {
                environment: self.environment.clone(),
                module_id: record.module_id.clone(),
            });
        }
        records.insert(stored.module_id.clone(), stored);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list(&self) -> Result<BTreeSet<ModuleId>, RegistryError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(RegistryError::Unavailable {
                environment: self.environment.clone(),
                reason: "registry offline".to_string(),
            });
        }
        Ok(locked(&self.records).keys().cloned().collect())
    }

    async fn delete(&self, module_id: &ModuleId) -> Result<(), RegistryError> {
        self.enter(module_id, Operation::Delete)?;
        match locked(&self.records).remove(module_id) {
            Some(_) => Ok(()),
            None => Err(self.not_found(module_id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ModuleStatus, Payload};

    fn record(id: &str) -> ModuleRecord {
        let mut p = Payload::new();
        p.insert("name".into(), json!(id));
        ModuleRecord::new(id, "1.0.0", ModuleStatus::Draft, p)
    }

    #[tokio::test]
    async fn put_without_overwrite_rejects_existing() {
        let reg = MemoryRegistry::new("staging").with_records([record("a")]);
        let err = reg.put(&record("a"), false).await.unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyExists { .. }));
        reg.put(&record("a"), true).await.unwrap();
        assert_eq!(reg.write_count(), 1);
    }

    #[tokio::test]
    async fn scripted_faults_are_consumed_in_order() {
        let reg = MemoryRegistry::new("staging").with_records([record("a")]);
        let id = ModuleId::from("a");
        reg.inject_fault("a", Operation::Get, FaultKind::Timeout, 2);
        assert!(reg.get(&id).await.unwrap_err().is_transient());
        assert!(reg.get(&id).await.unwrap_err().is_transient());
        assert!(reg.get(&id).await.is_ok());
        assert_eq!(reg.attempts(&id, Operation::Get), 3);
    }

    #[tokio::test]
    async fn corrupt_breaks_checksum() {
        let reg = MemoryRegistry::new("staging").with_records([record("a")]);
        let id = ModuleId::from("a");
        reg.corrupt(&id);
        assert!(!reg.get(&id).await.unwrap().verify_checksum());
    }

    #[tokio::test]
    async fn offline_registry_is_unavailable() {
        let reg = MemoryRegistry::new("staging");
        reg.set_offline(true);
        assert!(reg.list().await.unwrap_err().is_transient());
    }
}
