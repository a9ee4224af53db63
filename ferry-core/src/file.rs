//! File-backed registry: one YAML document per module.
//!
//! # Storage layout
//!
//! ```text
//! <root>/                 (mode 0700, created on first write)
//!   <module_id>.yaml      (one file per module: mode 0600)
//! ```
//!
//! # API pattern
//!
//! The blocking `*_at(root, …)` functions do the file work and are usable
//! directly in tests; [`FileRegistry`] wraps them in `spawn_blocking` to
//! implement [`RegistryClient`].

use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::client::RegistryClient;
use crate::error::{registry_io_err, RegistryError};
use crate::types::{Environment, ModuleId, ModuleRecord};

// ---------------------------------------------------------------------------
// 1. Path helpers
// ---------------------------------------------------------------------------

/// `<root>/<module_id>.yaml`: pure, no I/O.
pub fn record_path_at(root: &Path, module_id: &ModuleId) -> Result<PathBuf, RegistryError> {
    if !module_id.is_path_safe() {
        return Err(RegistryError::InvalidModuleId {
            module_id: module_id.clone(),
        });
    }
    Ok(root.join(format!("{}.yaml", module_id.0)))
}

fn ensure_root(root: &Path) -> Result<(), RegistryError> {
    if !root.exists() {
        std::fs::create_dir_all(root).map_err(|e| registry_io_err(root, e))?;
        set_dir_permissions(root)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// 2. Load / list
// ---------------------------------------------------------------------------

/// Load one module record. `Ok(None)` if no file exists.
///
/// Malformed YAML is reported as `RegistryError::Parse` with the file path.
pub fn load_record_at(root: &Path, module_id: &ModuleId) -> Result<Option<ModuleRecord>, RegistryError> {
    let path = record_path_at(root, module_id)?;
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(registry_io_err(&path, err)),
    };
    serde_yaml::from_str(&contents)
        .map(Some)
        .map_err(|e| RegistryError::Parse { path, source: e })
}

/// Module ids with a record file under `root`, sorted.
pub fn list_records_at(root: &Path) -> Result<BTreeSet<ModuleId>, RegistryError> {
    if !root.exists() {
        return Ok(BTreeSet::new());
    }
    let entries = std::fs::read_dir(root).map_err(|e| registry_io_err(root, e))?;
    Ok(entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter_map(|e| {
            let name = e.file_name().to_string_lossy().into_owned();
            name.strip_suffix(".yaml").map(ModuleId::from)
        })
        .collect())
}

// ---------------------------------------------------------------------------
// 3. Save (atomic) / delete
// ---------------------------------------------------------------------------

/// Atomically write `record` to `<root>/<module_id>.yaml`.
///
/// Write flow: serialize → `.yaml.tmp` sibling → `chmod 0600` → `rename`.
/// With `overwrite = false` an existing file yields `AlreadyExists`.
pub fn save_record_at(root: &Path, record: &ModuleRecord, overwrite: bool) -> Result<(), RegistryError> {
    ensure_root(root)?;
    let path = record_path_at(root, &record.module_id)?;
    if !overwrite && path.exists() {
        return Err(RegistryError::AlreadyExists {
            environment: Environment::from(root.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()),
            module_id: record.module_id.clone(),
        });
    }
    let tmp_path = path.with_file_name(format!("{}.yaml.tmp", record.module_id.0));

    let yaml = serde_yaml::to_string(record)?;
    std::fs::write(&tmp_path, yaml).map_err(|e| registry_io_err(&tmp_path, e))?;
    set_file_permissions(&tmp_path)?;
    if let Err(e) = std::fs::rename(&tmp_path, &path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(registry_io_err(&path, e));
    }
    Ok(())
}

/// Remove a record file. `Ok(false)` if it did not exist.
pub fn delete_record_at(root: &Path, module_id: &ModuleId) -> Result<bool, RegistryError> {
    let path = record_path_at(root, module_id)?;
    match std::fs::remove_file(&path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(registry_io_err(&path, err)),
    }
}

// ---------------------------------------------------------------------------
// 4. RegistryClient
// ---------------------------------------------------------------------------

/// A registry environment stored as a directory of YAML files.
#[derive(Debug, Clone)]
pub struct FileRegistry {
    environment: Environment,
    root: PathBuf,
}

impl FileRegistry {
    pub fn new(environment: impl Into<Environment>, root: impl Into<PathBuf>) -> Self {
        Self {
            environment: environment.into(),
            root: root.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, RegistryError>
    where
        T: Send + 'static,
        F: FnOnce(PathBuf) -> Result<T, RegistryError> + Send + 'static,
    {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || f(root))
            .await
            .map_err(|err| RegistryError::Backend(format!("file registry task failed: {err}")))?
    }
}

#[async_trait]
impl RegistryClient for FileRegistry {
    fn environment(&self) -> &Environment {
        &self.environment
    }

    async fn get(&self, module_id: &ModuleId) -> Result<ModuleRecord, RegistryError> {
        let id = module_id.clone();
        let found = self.blocking(move |root| load_record_at(&root, &id)).await?;
        found.ok_or_else(|| RegistryError::NotFound {
            environment: self.environment.clone(),
            module_id: module_id.clone(),
        })
    }

    async fn put(&self, record: &ModuleRecord, overwrite: bool) -> Result<(), RegistryError> {
        let record = record.clone();
        let environment = self.environment.clone();
        self.blocking(move |root| {
            save_record_at(&root, &record, overwrite).map_err(|err| match err {
                RegistryError::AlreadyExists { module_id, .. } => {
                    RegistryError::AlreadyExists { environment, module_id }
                }
                other => other,
            })
        })
        .await?;
        tracing::debug!(environment = %self.environment, "wrote module record");
        Ok(())
    }

    async fn list(&self) -> Result<BTreeSet<ModuleId>, RegistryError> {
        self.blocking(move |root| list_records_at(&root)).await
    }

    async fn delete(&self, module_id: &ModuleId) -> Result<(), RegistryError> {
        let id = module_id.clone();
        let existed = self.blocking(move |root| delete_record_at(&root, &id)).await?;
        if existed {
            Ok(())
        } else {
            Err(RegistryError::NotFound {
                environment: self.environment.clone(),
                module_id: module_id.clone(),
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), RegistryError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
        .map_err(|e| registry_io_err(path, e))
}
#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), RegistryError> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), RegistryError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| registry_io_err(path, e))
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), RegistryError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
