//! Per-module async mutexes shared by the transfer engine and the rollback
//! manager. Operations on different modules never contend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use ferry_core::ModuleId;

type LockMap = HashMap<ModuleId, Arc<AsyncMutex<()>>>;

#[derive(Debug, Clone, Default)]
pub struct ModuleLocks {
    inner: Arc<Mutex<LockMap>>,
}

/// Exclusive access to one module. The module's entry is dropped from the
/// table once nobody holds or waits for it.
#[derive(Debug)]
pub struct ModuleGuard {
    guard: Option<OwnedMutexGuard<()>>,
    module_id: ModuleId,
    table: Arc<Mutex<LockMap>>,
}

impl ModuleLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `module_id`. The table lock is released
    /// before waiting on the module lock.
    pub async fn acquire(&self, module_id: &ModuleId) -> ModuleGuard {
        let lock = table(&self.inner)
            .entry(module_id.clone())
            .or_default()
            .clone();
        ModuleGuard {
            guard: Some(lock.lock_owned().await),
            module_id: module_id.clone(),
            table: self.inner.clone(),
        }
    }

    /// Number of modules currently held or awaited.
    pub fn len(&self) -> usize {
        table(&self.inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for ModuleGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut map = table(&self.table);
        // Waiters hold a clone, and new ones need the table lock to get one.
        if map
            .get(&self.module_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            map.remove(&self.module_id);
        }
    }
}

fn table(m: &Mutex<LockMap>) -> MutexGuard<'_, LockMap> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
