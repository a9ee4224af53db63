//! Unified diff of one module across two registries, for `ferry diff`.

use serde_json::json;
use similar::TextDiff;

use ferry_core::{Checksum, ModuleId, ModuleRecord, RegistryClient};

use crate::error::TransferError;
use crate::transfer::TransferEngine;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleDiff {
    pub module_id: ModuleId,
    pub source_checksum: Option<Checksum>,
    pub target_checksum: Option<Checksum>,
    /// Empty when both sides have identical content.
    pub unified_diff: String,
}

impl ModuleDiff {
    pub fn is_identical(&self) -> bool {
        self.source_checksum.is_some() && self.source_checksum == self.target_checksum
    }
}

/// Pretty JSON of the parts of a record a reviewer cares about. Timestamps
/// and the checksum are left out so they never produce noise.
pub fn render_record(record: Option<&ModuleRecord>) -> String {
    let Some(record) = record else {
        return String::new();
    };
    let view = json!({
        "version": record.version,
        "status": record.status,
        "signature": record.signature,
        "payload": record.payload,
    });
    let mut text = serde_json::to_string_pretty(&view).unwrap_or_default();
    text.push('\n');
    text
}

pub fn diff_records(
    module_id: &ModuleId,
    source: Option<&ModuleRecord>,
    target: Option<&ModuleRecord>,
    source_label: &str,
    target_label: &str,
) -> ModuleDiff {
    let old = render_record(target);
    let new = render_record(source);
    let unified_diff = if old == new {
        String::new()
    } else {
        TextDiff::from_lines(&old, &new)
            .unified_diff()
            .header(
                &format!("{target_label}/{module_id}"),
                &format!("{source_label}/{module_id}"),
            )
            .context_radius(3)
            .to_string()
    };
    ModuleDiff {
        module_id: module_id.clone(),
        source_checksum: source.map(|r| r.checksum.clone()),
        target_checksum: target.map(|r| r.checksum.clone()),
        unified_diff,
    }
}

/// What syncing `module_id` from `source` would change in `target`.
/// Nothing is written.
pub async fn diff_module(
    engine: &TransferEngine,
    source: &dyn RegistryClient,
    target: &dyn RegistryClient,
    module_id: &ModuleId,
) -> Result<ModuleDiff, TransferError> {
    let s = engine.fetch(source, module_id).await?;
    let t = engine.fetch(target, module_id).await?;
    Ok(diff_records(
        module_id,
        s.as_ref(),
        t.as_ref(),
        source.environment().as_str(),
        target.environment().as_str(),
    ))
}
