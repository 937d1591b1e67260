//! Advisory cross-process lock backed by `.state/.lock`
//!
//! The lock file is created with a no-clobber rename, so two processes can
//! never both believe they created it. A lock is stale when it is older than
//! the store's threshold or its PID no longer exists; stale locks are removed
//! and acquisition is retried once.
//!
//! Removal renames the lock aside and checks it is still the one judged
//! stale before deleting it. A lock that changed hands in between is put
//! back and treated as held.

use super::LOCK_FILE;
use super::store::{StateStore, write_exclusive};
use super::types::{LockFile, LockOperation, OperationResult};
use crate::error::{Error, Result};
use crate::retry::{RetryConfig, with_retry};
use chrono::Utc;
use std::fs;
use std::io::ErrorKind;

/// OS process-existence check
pub trait ProcessProbe: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
}

/// Probe backed by `kill(pid, 0)`
pub struct SystemProbe;

impl ProcessProbe for SystemProbe {
    #[cfg(unix)]
    #[allow(unsafe_code)]
    fn is_alive(&self, pid: u32) -> bool {
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return false;
        };
        if pid <= 0 {
            return false;
        }
        // Signal 0 checks existence without delivering anything
        let rc = unsafe { libc::kill(pid, 0) };
        rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    #[cfg(not(unix))]
    fn is_alive(&self, _pid: u32) -> bool {
        true
    }
}

/// Current lock holder as seen by [`StateStore::read_lock`]
#[derive(Debug, Clone)]
pub struct LockStatus {
    pub lock: LockFile,
    pub age_secs: i64,
    pub holder_alive: bool,
    pub is_stale: bool,
}

impl LockStatus {
    fn conflict(&self) -> Error {
        Error::LockConflict {
            pid: self.lock.pid,
            operation: self.lock.operation.to_string(),
            created_at: self.lock.created_at.to_rfc3339(),
        }
    }
}

enum Attempt {
    Acquired,
    Held(LockStatus),
}

/// Removes the lock when dropped
#[must_use = "the lock is released when the guard is dropped"]
pub struct LockGuard<'a> {
    store: &'a StateStore,
    operation: LockOperation,
}

impl LockGuard<'_> {
    pub fn operation(&self) -> LockOperation {
        self.operation
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        let result = self.store.remove_lock();
        if !result.success {
            log::warn!(
                "Failed to release {} lock: {}",
                self.operation,
                result.error.unwrap_or(result.message)
            );
        }
    }
}

impl StateStore {
    /// Take the lock for `operation`.
    ///
    /// Fails without waiting when a live, non-stale lock exists; the message
    /// names the holder's PID and operation.
    pub fn create_lock(&self, operation: LockOperation) -> OperationResult {
        match self.try_lock(operation) {
            Ok(Attempt::Acquired) => OperationResult::ok(format!("Acquired {operation} lock")),
            Ok(Attempt::Held(status)) => OperationResult::failed(
                format!(
                    "Another {} operation is in progress (PID {}, started {}). \
                     Wait for it to finish, or remove {} if that process is gone",
                    status.lock.operation,
                    status.lock.pid,
                    status.lock.created_at.to_rfc3339(),
                    self.lock_path().display()
                ),
                status.conflict(),
            ),
            Err(e) => OperationResult::failed("Failed to create lock", e),
        }
    }

    /// [`create_lock`](Self::create_lock) with exponential backoff.
    pub fn acquire_lock_with_retry(
        &self,
        operation: LockOperation,
        retry: &RetryConfig,
    ) -> Result<()> {
        with_retry(retry, || match self.try_lock(operation)? {
            Attempt::Acquired => Ok(()),
            Attempt::Held(status) => Err(status.conflict()),
        })
    }

    /// Acquire the lock and release it when the guard drops.
    pub fn lock(&self, operation: LockOperation, retry: &RetryConfig) -> Result<LockGuard<'_>> {
        self.acquire_lock_with_retry(operation, retry)?;
        Ok(LockGuard {
            store: self,
            operation,
        })
    }

    /// Remove the lock file. Removing a missing lock succeeds.
    pub fn remove_lock(&self) -> OperationResult {
        match fs::remove_file(self.lock_path()) {
            Ok(()) => {
                log::debug!("Removed {}", self.lock_path().display());
                OperationResult::ok("Lock removed")
            }
            Err(e) if e.kind() == ErrorKind::NotFound => OperationResult::ok("No lock held"),
            Err(e) => OperationResult::failed("Failed to remove lock", e),
        }
    }

    /// Inspect the current lock, if any.
    pub fn read_lock(&self) -> Result<Option<LockStatus>> {
        let path = self.lock_path();
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let lock: LockFile = serde_json::from_slice(&bytes).map_err(|e| {
            Error::validation(format!("{} is not a valid lock file: {e}", path.display()))
        })?;

        let age = Utc::now().signed_duration_since(lock.created_at);
        let too_old = age.to_std().is_ok_and(|age| age > self.stale_after);
        let holder_alive = self.probe.is_alive(lock.pid);
        Ok(Some(LockStatus {
            age_secs: age.num_seconds(),
            holder_alive,
            is_stale: too_old || !holder_alive,
            lock,
        }))
    }

    fn try_lock(&self, operation: LockOperation) -> Result<Attempt> {
        let lock = LockFile {
            pid: std::process::id(),
            created_at: Utc::now(),
            operation,
            version: self.context.cli_version.clone(),
            cwd: self.context.working_dir.clone(),
        };
        let contents = serde_json::to_vec_pretty(&lock)?;
        let path = self.lock_path();

        for _ in 0..2 {
            if write_exclusive(&path, &contents)? {
                log::debug!("Acquired {operation} lock at {}", path.display());
                return Ok(Attempt::Acquired);
            }
            let discarded = match self.read_lock() {
                Ok(None) => true,
                Ok(Some(status)) if !status.is_stale => return Ok(Attempt::Held(status)),
                Ok(Some(status)) => {
                    log::warn!(
                        "Removing stale {} lock (PID {}, {}s old)",
                        status.lock.operation,
                        status.lock.pid,
                        status.age_secs
                    );
                    self.discard_lock(Some(&status.lock))?
                }
                Err(e) => {
                    log::warn!("Removing unreadable lock: {e}");
                    self.discard_lock(None)?
                }
            };
            if !discarded && let Some(status) = self.read_lock()? {
                return Ok(Attempt::Held(status));
            }
        }

        // Another process replaced the stale lock between our attempts
        match self.read_lock()? {
            Some(status) => Ok(Attempt::Held(status)),
            None => Err(Error::Other(format!(
                "lock at {} changed during acquisition",
                path.display()
            ))),
        }
    }

    /// Remove the lock only if it is still the one judged stale: `judged`,
    /// or an unparseable file when `None`. Returns `false` when the lock
    /// changed hands and was put back.
    fn discard_lock(&self, judged: Option<&LockFile>) -> Result<bool> {
        let path = self.lock_path();
        let aside = self
            .state_dir()
            .join(format!("{LOCK_FILE}.{}", uuid::Uuid::new_v4().simple()));
        match fs::rename(&path, &aside) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e.into()),
        }

        let moved: Option<LockFile> = fs::read(&aside)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok());
        let unchanged = match (judged, &moved) {
            (Some(judged), Some(moved)) => {
                judged.pid == moved.pid && judged.created_at == moved.created_at
            }
            (None, None) => true,
            _ => false,
        };
        if unchanged {
            fs::remove_file(&aside)?;
            return Ok(true);
        }

        log::debug!("Lock at {} changed hands, restoring it", path.display());
        match fs::hard_link(&aside, &path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                log::warn!(
                    "Could not restore lock at {}: a newer lock took its place",
                    path.display()
                );
            }
            Err(e) => {
                let _ = fs::remove_file(&aside);
                return Err(e.into());
            }
        }
        fs::remove_file(&aside)?;
        Ok(false)
    }
}
