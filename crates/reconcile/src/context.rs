//! Run context and callback traits
//!
//! These keep the engine free of any particular UI: the CLI supplies a
//! progress renderer, tests supply nothing.

use crate::executor::ResourceExecutionResult;
use crate::types::ResourceChange;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Cooperative cancellation flag shared between a run and whoever stops it
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. In-flight work finishes; nothing new starts.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Who is running, from where
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Version recorded in state, plan, and lock files
    pub cli_version: String,
    /// User recorded as `created_by` on state entries
    pub created_by: String,
    /// Directory holding `.state/`
    pub working_dir: PathBuf,
    pub cancel: CancelToken,
}

impl RunContext {
    /// Context for the current user with this crate's version.
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        let created_by = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            cli_version: env!("CARGO_PKG_VERSION").to_string(),
            created_by,
            working_dir: working_dir.into(),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cli_version(mut self, version: impl Into<String>) -> Self {
        self.cli_version = version.into();
        self
    }

    /// Directory holding the state and lock files.
    pub fn state_dir(&self) -> PathBuf {
        self.working_dir.join(crate::state::STATE_DIR)
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }
}

/// Progress callback for execution
///
/// All calls come from the thread that called [`crate::Executor::execute`].
pub trait ProgressCallback {
    /// Called once with the number of resources that will be attempted
    fn on_start(&mut self, total: usize);

    /// Called when a resource is handed to a worker
    fn on_resource_start(&mut self, change: &ResourceChange);

    /// Called when a resource finishes, fails, or is skipped
    fn on_resource_complete(&mut self, result: &ResourceExecutionResult);
}

/// No-op progress callback
pub struct NoProgress;

impl ProgressCallback for NoProgress {
    fn on_start(&mut self, _total: usize) {}
    fn on_resource_start(&mut self, _change: &ResourceChange) {}
    fn on_resource_complete(&mut self, _result: &ResourceExecutionResult) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_run_context_paths() {
        let ctx = RunContext::new("/work").with_cli_version("9.9.9");
        assert_eq!(ctx.cli_version, "9.9.9");
        assert_eq!(ctx.state_dir(), PathBuf::from("/work/.state"));
        assert!(!ctx.created_by.is_empty());
    }
}
