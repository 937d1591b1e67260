//! File-backed store of last-applied resource state

use super::compare;
use super::types::{
    EntryMetadata, OperationResult, STATE_VERSION, StateComparison, StateEntry, StateFile,
};
use super::{LOCK_FILE, MAX_FILE_SIZE, STATE_FILE, lock::ProcessProbe, lock::SystemProbe};
use crate::config::ParsedConfig;
use crate::context::RunContext;
use crate::error::{Error, Result};
use crate::types::ResourceKind;
use chrono::Utc;
use serde_json::Value;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;

#[cfg(unix)]
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};

/// Locks older than this are considered abandoned.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(5 * 60);

/// What a successful provider call leaves behind
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedResource {
    pub kind: ResourceKind,
    pub name: String,
    pub remote_id: String,
    pub applied_hash: String,
    pub remote_hash: Option<String>,
    pub config_file: Option<String>,
    pub resource_type: Option<String>,
    pub depends_on: Vec<String>,
    pub config: Option<Value>,
}

impl AppliedResource {
    pub fn new(
        kind: ResourceKind,
        name: impl Into<String>,
        remote_id: impl Into<String>,
        applied_hash: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            name: name.into(),
            remote_id: remote_id.into(),
            applied_hash: applied_hash.into(),
            remote_hash: None,
            config_file: None,
            resource_type: None,
            depends_on: Vec::new(),
            config: None,
        }
    }
}

/// State and lock files for one working directory
pub struct StateStore {
    pub(super) context: RunContext,
    state_dir: PathBuf,
    pub(super) stale_after: Duration,
    pub(super) probe: Box<dyn ProcessProbe>,
}

impl StateStore {
    pub fn new(context: &RunContext) -> Self {
        Self {
            state_dir: context.state_dir(),
            context: context.clone(),
            stale_after: DEFAULT_STALE_AFTER,
            probe: Box::new(SystemProbe),
        }
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Replace the process-existence probe used for lock staleness.
    pub fn with_probe(mut self, probe: impl ProcessProbe + 'static) -> Self {
        self.probe = Box::new(probe);
        self
    }

    pub fn context(&self) -> &RunContext {
        &self.context
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn state_path(&self) -> PathBuf {
        self.state_dir.join(STATE_FILE)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.state_dir.join(LOCK_FILE)
    }

    /// Load the state file, or an empty state if none exists yet.
    pub fn load_state(&self) -> Result<StateFile> {
        let path = self.state_path();
        if !path.exists() {
            log::debug!("No state file at {}, starting empty", path.display());
            return Ok(StateFile::new(&self.context.cli_version));
        }

        let bytes = read_bounded(&path, MAX_FILE_SIZE)?;
        let raw: Value = serde_json::from_slice(&bytes).map_err(|e| Error::StateCorruption {
            path: path.clone(),
            message: e.to_string(),
        })?;

        let version = raw
            .get("version")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::StateCorruption {
                path: path.clone(),
                message: "missing version field".to_string(),
            })?;
        if version != STATE_VERSION {
            return Err(Error::UnsupportedVersion {
                what: "state",
                found: version.to_string(),
                expected: STATE_VERSION,
            });
        }

        let state: StateFile = serde_json::from_value(raw).map_err(|e| {
            Error::validation(format!("{} has an unexpected shape: {e}", path.display()))
        })?;
        for (key, entry) in &state.resources {
            if key != &entry.name {
                return Err(Error::validation(format!(
                    "{}: entry '{key}' is named '{}'",
                    path.display(),
                    entry.name
                )));
            }
        }

        log::debug!(
            "Loaded {} resources from {}",
            state.resources.len(),
            path.display()
        );
        Ok(state)
    }

    /// Recount totals and write the state atomically.
    pub fn save_state(&self, state: &mut StateFile) -> OperationResult {
        state.refresh_counts();
        state.last_sync = Some(Utc::now());

        let path = self.state_path();
        let written = serde_json::to_vec_pretty(state)
            .map_err(Error::from)
            .and_then(|bytes| write_atomic(&path, &bytes));
        match written {
            Ok(()) => {
                log::debug!("Saved {} resources to {}", state.resources.len(), path.display());
                OperationResult::ok(format!("Saved {} resources", state.resources.len()))
            }
            Err(e) => OperationResult::failed("Failed to save state", e),
        }
    }

    /// Record a successful apply, keeping the original creation metadata.
    pub fn update_resource(&self, applied: AppliedResource) -> OperationResult {
        let mut state = match self.load_state() {
            Ok(state) => state,
            Err(e) => return OperationResult::failed("Failed to load state", e),
        };

        let now = Utc::now();
        let (created_at, created_by) = state.resources.get(&applied.name).map_or_else(
            || (now, self.context.created_by.clone()),
            |existing| {
                (
                    existing.metadata.created_at,
                    existing.metadata.created_by.clone(),
                )
            },
        );

        let name = applied.name.clone();
        state.resources.insert(
            applied.name.clone(),
            StateEntry {
                kind: applied.kind,
                name: applied.name,
                remote_id: applied.remote_id,
                last_applied_hash: applied.applied_hash,
                last_seen_remote_hash: applied.remote_hash,
                resource_type: applied.resource_type,
                depends_on: applied.depends_on,
                last_applied_config: applied.config,
                metadata: EntryMetadata {
                    created_at,
                    updated_at: now,
                    created_by,
                    cli_version: self.context.cli_version.clone(),
                    config_file: applied.config_file,
                },
            },
        );

        let saved = self.save_state(&mut state);
        if saved.success {
            OperationResult::ok(format!("Recorded {name}"))
        } else {
            saved
        }
    }

    /// Forget a resource. Forgetting an unknown name succeeds.
    pub fn remove_resource(&self, name: &str) -> OperationResult {
        let mut state = match self.load_state() {
            Ok(state) => state,
            Err(e) => return OperationResult::failed("Failed to load state", e),
        };
        if state.resources.remove(name).is_none() {
            return OperationResult::ok(format!("{name} is not in state"));
        }
        let saved = self.save_state(&mut state);
        if saved.success {
            OperationResult::ok(format!("Removed {name}"))
        } else {
            saved
        }
    }

    /// Bucket the desired configuration against stored state.
    pub fn compare_state(&self, config: &ParsedConfig) -> Result<StateComparison> {
        let state = self.load_state()?;
        compare::compare(&state, config)
    }

    /// Whether applying `config` would change nothing.
    pub fn is_no_op(&self, config: &ParsedConfig) -> Result<bool> {
        Ok(self.compare_state(config)?.is_no_op())
    }
}

/// Create `dir` (and parents) with owner-only permissions if missing.
pub(crate) fn ensure_private_dir(dir: &Path) -> Result<()> {
    if dir.as_os_str().is_empty() || dir.exists() {
        return Ok(());
    }
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(0o700);
    builder.create(dir)?;
    Ok(())
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

/// Write a temp file next to `path` with mode 0600 and sync it.
fn private_temp_file(path: &Path, contents: &[u8]) -> Result<NamedTempFile> {
    let dir = parent_dir(path);
    ensure_private_dir(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    #[cfg(unix)]
    tmp.as_file()
        .set_permissions(fs::Permissions::from_mode(0o600))?;
    Ok(tmp)
}

/// Replace `path` atomically: temp file in the same directory, then rename.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp = private_temp_file(path, contents)?;
    tmp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

/// Create `path` atomically only if it does not exist. Returns `false` when
/// another file is already there.
pub(crate) fn write_exclusive(path: &Path, contents: &[u8]) -> Result<bool> {
    let tmp = private_temp_file(path, contents)?;
    match tmp.persist_noclobber(path) {
        Ok(_) => Ok(true),
        Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(Error::Io(e.error)),
    }
}

/// Read a whole file, refusing anything larger than `limit` bytes.
pub(crate) fn read_bounded(path: &Path, limit: u64) -> Result<Vec<u8>> {
    let file = File::open(path)?;
    let size = file.metadata()?.len();
    let too_large = |size| Error::PayloadTooLarge {
        path: path.to_path_buf(),
        size,
        limit,
    };
    if size > limit {
        return Err(too_large(size));
    }

    let mut bytes = Vec::with_capacity(usize::try_from(size).unwrap_or_default());
    file.take(limit + 1).read_to_end(&mut bytes)?;
    let read = u64::try_from(bytes.len()).unwrap_or(u64::MAX);
    if read > limit {
        return Err(too_large(read));
    }
    Ok(bytes)
}
