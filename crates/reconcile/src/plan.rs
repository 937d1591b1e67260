//! Execution plans and signed plan files

use crate::config::ParsedConfig;
use crate::error::{Error, Result};
use crate::fingerprint::{fingerprint, sha256_hex};
use crate::state::store::{read_bounded, write_atomic};
use crate::state::MAX_FILE_SIZE;
use crate::types::{ChangeType, ResourceChange, ResourceDependency};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Plan file format version this build reads and writes.
pub const PLAN_VERSION: &str = "1.0.0";

/// Where and when a plan was generated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanMetadata {
    pub plan_id: String,
    pub created_at: DateTime<Utc>,
    pub cli_version: String,
    /// Fingerprint of the whole desired configuration
    pub config_hash: String,
    /// Hash of the plan body, excluding id and timestamp
    pub content_hash: String,
    pub base_directory: PathBuf,
    #[serde(default)]
    pub config_files: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WarningSeverity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for WarningSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        })
    }
}

/// Something the operator should know about before applying
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanWarning {
    /// Stable identifier, e.g. `dependency_cycle`
    pub code: String,
    pub severity: WarningSeverity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<String>,
}

impl PlanWarning {
    pub fn new(
        code: &str,
        severity: WarningSeverity,
        message: impl Into<String>,
        resources: Vec<String>,
    ) -> Self {
        Self {
            code: code.to_string(),
            severity,
            message: message.into(),
            resources,
        }
    }
}

/// Change counts for one kind, or for the whole plan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeCounts {
    pub to_create: usize,
    pub to_update: usize,
    pub to_replace: usize,
    pub to_delete: usize,
    pub no_change: usize,
}

impl ChangeCounts {
    fn add(&mut self, change_type: ChangeType) {
        match change_type {
            ChangeType::Create => self.to_create += 1,
            ChangeType::Update => self.to_update += 1,
            ChangeType::Replace => self.to_replace += 1,
            ChangeType::Delete => self.to_delete += 1,
            ChangeType::NoChange => self.no_change += 1,
        }
    }

    /// Everything except `no_change`.
    pub fn changes(&self) -> usize {
        self.to_create + self.to_update + self.to_replace + self.to_delete
    }
}

/// Totals overall and per kind
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub total_changes: usize,
    #[serde(flatten)]
    pub counts: ChangeCounts,
    pub by_kind: BTreeMap<String, ChangeCounts>,
}

impl PlanSummary {
    pub fn from_changes(changes: &[ResourceChange]) -> Self {
        let mut summary = Self::default();
        for change in changes {
            summary.counts.add(change.change_type);
            summary
                .by_kind
                .entry(change.kind.as_str().to_string())
                .or_default()
                .add(change.change_type);
        }
        summary.total_changes = summary.counts.changes();
        summary
    }
}

/// The output of planning: what would change, in what order, and why
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub metadata: PlanMetadata,
    /// Creates, updates and replaces in dependency order, then deletes
    pub changes: Vec<ResourceChange>,
    pub summary: PlanSummary,
    pub dependencies: Vec<ResourceDependency>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<PlanWarning>,
}

impl ExecutionPlan {
    /// Hash of everything that defines the plan except its id and timestamp.
    pub fn compute_content_hash(&self) -> String {
        #[derive(Serialize)]
        struct Body<'a> {
            cli_version: &'a str,
            config_hash: &'a str,
            base_directory: &'a Path,
            config_files: &'a [String],
            changes: &'a [ResourceChange],
            summary: &'a PlanSummary,
            dependencies: &'a [ResourceDependency],
            warnings: &'a [PlanWarning],
        }

        let body = Body {
            cli_version: &self.metadata.cli_version,
            config_hash: &self.metadata.config_hash,
            base_directory: &self.metadata.base_directory,
            config_files: &self.metadata.config_files,
            changes: &self.changes,
            summary: &self.summary,
            dependencies: &self.dependencies,
            warnings: &self.warnings,
        };
        let bytes = serde_json::to_vec(&body).unwrap_or_default();
        sha256_hex(&bytes)
    }

    /// Whether anything would change.
    pub fn has_changes(&self) -> bool {
        self.summary.total_changes > 0
    }

    pub fn get(&self, name: &str) -> Option<&ResourceChange> {
        self.changes.iter().find(|c| c.name == name)
    }

    /// Warnings at `error` severity; their resources are not in the plan.
    pub fn errors(&self) -> impl Iterator<Item = &PlanWarning> {
        self.warnings
            .iter()
            .filter(|w| w.severity == WarningSeverity::Error)
    }
}

/// Fingerprint of a whole desired configuration.
pub fn config_hash(config: &ParsedConfig) -> String {
    fingerprint(&config.to_value())
}

/// A plan as saved to disk, signed over its content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanFile {
    pub version: String,
    pub plan: ExecutionPlan,
    pub signature: String,
}

impl PlanFile {
    pub fn new(plan: ExecutionPlan) -> Result<Self> {
        let signature = Self::compute_signature(&plan)?;
        Ok(Self {
            version: PLAN_VERSION.to_string(),
            plan,
            signature,
        })
    }

    /// SHA-256 of the plan's compact JSON form.
    pub fn compute_signature(plan: &ExecutionPlan) -> Result<String> {
        Ok(sha256_hex(&serde_json::to_vec(plan)?))
    }

    /// Check the signature and the plan's own content hash.
    pub fn verify_signature(&self) -> Result<()> {
        let actual = Self::compute_signature(&self.plan)?;
        if actual != self.signature {
            return Err(Error::PlanSignatureMismatch {
                expected: self.signature.clone(),
                actual,
            });
        }
        let content = self.plan.compute_content_hash();
        if content != self.plan.metadata.content_hash {
            return Err(Error::validation(format!(
                "plan content hash {} does not match its changes ({content})",
                self.plan.metadata.content_hash
            )));
        }
        Ok(())
    }

    /// Check that the plan was generated from `config`.
    pub fn verify_config(&self, config: &ParsedConfig) -> Result<()> {
        let current = config_hash(config);
        if current != self.plan.metadata.config_hash {
            return Err(Error::PlanConfigMismatch {
                planned: self.plan.metadata.config_hash.clone(),
                current,
            });
        }
        Ok(())
    }

    /// Write atomically with owner-only permissions.
    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        write_atomic(path, &bytes)?;
        log::info!("Saved plan {} to {}", self.plan.metadata.plan_id, path.display());
        Ok(())
    }

    /// Load a plan file and verify its signature.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = read_bounded(path, MAX_FILE_SIZE)?;
        let raw: Value = serde_json::from_slice(&bytes).map_err(|e| {
            Error::validation(format!("{} is not valid JSON: {e}", path.display()))
        })?;
        let version = raw.get("version").and_then(Value::as_str).unwrap_or_default();
        if version != PLAN_VERSION {
            return Err(Error::UnsupportedVersion {
                what: "plan",
                found: version.to_string(),
                expected: PLAN_VERSION,
            });
        }

        let file: Self = serde_json::from_value(raw).map_err(|e| {
            Error::validation(format!("{} is not a plan file: {e}", path.display()))
        })?;
        file.verify_signature()?;
        log::debug!("Loaded plan {} from {}", file.plan.metadata.plan_id, path.display());
        Ok(file)
    }
}
