//! On-disk shapes for the state and lock files

use crate::types::ResourceKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// State file format version this build reads and writes.
pub const STATE_VERSION: &str = "1.0.0";

/// Bookkeeping for one applied resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: String,
    pub cli_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_file: Option<String>,
}

/// Last successfully applied state of one resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEntry {
    pub kind: ResourceKind,
    pub name: String,
    pub remote_id: String,
    /// Fingerprint of the configuration that was applied
    pub last_applied_hash: String,
    /// Hash of the remote representation returned by the provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen_remote_hash: Option<String>,
    /// Immutable type at last apply (agents)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    /// Names this resource referenced at last apply
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Configuration that was applied, used for field diffs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_applied_config: Option<Value>,
    pub metadata: EntryMetadata,
}

/// File-level bookkeeping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateMetadata {
    pub created_at: DateTime<Utc>,
    pub created_by_version: String,
    pub total_resources: usize,
    #[serde(default)]
    pub resource_counts: BTreeMap<String, usize>,
}

/// The whole state file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StateFile {
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resources: BTreeMap<String, StateEntry>,
    pub metadata: StateMetadata,
}

impl StateFile {
    /// A fresh, empty state.
    pub fn new(cli_version: &str) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            last_sync: None,
            resources: BTreeMap::new(),
            metadata: StateMetadata {
                created_at: Utc::now(),
                created_by_version: cli_version.to_string(),
                total_resources: 0,
                resource_counts: BTreeMap::new(),
            },
        }
    }

    /// Recompute totals from the resource map.
    pub fn refresh_counts(&mut self) {
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for entry in self.resources.values() {
            *counts.entry(entry.kind.as_str().to_string()).or_default() += 1;
        }
        self.metadata.total_resources = self.resources.len();
        self.metadata.resource_counts = counts;
    }

    /// Look up an entry by name.
    pub fn get(&self, name: &str) -> Option<&StateEntry> {
        self.resources.get(name)
    }
}

/// Operation holding the lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockOperation {
    Plan,
    Apply,
}

impl fmt::Display for LockOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plan => f.write_str("plan"),
            Self::Apply => f.write_str("apply"),
        }
    }
}

/// Contents of the lock file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockFile {
    pub pid: u32,
    pub created_at: DateTime<Utc>,
    pub operation: LockOperation,
    pub version: String,
    pub cwd: PathBuf,
}

/// Outcome of a mutating state operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResult {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OperationResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>, error: impl fmt::Display) -> Self {
        Self {
            success: false,
            message: message.into(),
            error: Some(error.to_string()),
        }
    }
}

/// Desired resources bucketed against state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateComparison {
    pub to_create: Vec<String>,
    /// Updates and replacements
    pub to_update: Vec<String>,
    pub to_delete: Vec<String>,
    pub no_change: Vec<String>,
    /// Left out of the plan: unresolved references, or deletes still in use
    #[serde(default)]
    pub blocked: Vec<String>,
}

impl StateComparison {
    /// Whether applying would change nothing.
    pub fn is_no_op(&self) -> bool {
        self.to_create.is_empty() && self.to_update.is_empty() && self.to_delete.is_empty()
    }
}
