//! Interchange documents for moving module records between tools.
//!
//! Three encodings are supported: a JSON document, the same document as
//! YAML, and JSON Lines (one bare record per line, no envelope).

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SerializeError;
use crate::types::{Environment, ModuleId, ModuleRecord};

pub const FORMAT_VERSION: u32 = 1;

/// Encoding of an interchange document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    #[default]
    Json,
    Yaml,
    JsonLines,
}

impl Format {
    /// Guess the format from a file extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()?.to_ascii_lowercase().as_str() {
            "json" => Some(Format::Json),
            "yaml" | "yml" => Some(Format::Yaml),
            "jsonl" | "ndjson" => Some(Format::JsonLines),
            _ => None,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Format::Json => "json",
            Format::Yaml => "yaml",
            Format::JsonLines => "jsonl",
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for Format {
    type Err = SerializeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Format::Json),
            "yaml" | "yml" => Ok(Format::Yaml),
            "jsonl" | "ndjson" | "json-lines" => Ok(Format::JsonLines),
            other => Err(SerializeError::UnknownFormat(other.to_string())),
        }
    }
}

/// Neutral envelope around exported records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterchangeDocument {
    pub format_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<Environment>,
    pub exported_at: DateTime<Utc>,
    pub records: Vec<ModuleRecord>,
}

impl InterchangeDocument {
    pub fn new(environment: Option<Environment>, records: Vec<ModuleRecord>) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            environment,
            exported_at: Utc::now(),
            records,
        }
    }

    /// Ids of records whose checksum does not match their payload.
    pub fn corrupted(&self) -> Vec<ModuleId> {
        self.records
            .iter()
            .filter(|r| !r.verify_checksum())
            .map(|r| r.module_id.clone())
            .collect()
    }
}

pub fn encode(doc: &InterchangeDocument, format: Format) -> Result<String, SerializeError> {
    match format {
        Format::Json => Ok(serde_json::to_string_pretty(doc)?),
        Format::Yaml => Ok(serde_yaml::to_string(doc)?),
        Format::JsonLines => {
            let mut out = String::new();
            for record in &doc.records {
                out.push_str(&serde_json::to_string(record)?);
                out.push('\n');
            }
            Ok(out)
        }
    }
}

pub fn decode(text: &str, format: Format) -> Result<InterchangeDocument, SerializeError> {
    let doc = match format {
        Format::Json => serde_json::from_str::<InterchangeDocument>(text)?,
        Format::Yaml => serde_yaml::from_str::<InterchangeDocument>(text)?,
        Format::JsonLines => {
            let mut records = Vec::new();
            for (idx, line) in text.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                let record = serde_json::from_str(line).map_err(|source| SerializeError::Line {
                    line: idx + 1,
                    source,
                })?;
                records.push(record);
            }
            InterchangeDocument::new(None, records)
        }
    };
    if doc.format_version != FORMAT_VERSION {
        return Err(SerializeError::UnsupportedVersion(doc.format_version));
    }
    Ok(doc)
}
