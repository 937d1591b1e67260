//! Persisted last-applied state and the cross-process lock
//!
//! Everything lives under `<workdir>/.state/`:
//!
//! - `state.json`: one [`StateEntry`] per applied resource, keyed by name
//! - `.lock`: present while a plan or apply is running
//!
//! Writes go through a temp file in the same directory and an atomic rename,
//! so a crash leaves either the old or the new file, never a torn one.

pub mod compare;
pub mod lock;
pub mod store;
pub mod types;

pub use compare::classify;
pub use lock::{LockGuard, LockStatus, ProcessProbe, SystemProbe};
pub use store::{AppliedResource, StateStore};
pub use types::{
    EntryMetadata, LockFile, LockOperation, OperationResult, StateComparison, StateEntry,
    StateFile, StateMetadata, STATE_VERSION,
};

/// Directory under the working directory holding state and lock
pub const STATE_DIR: &str = ".state";
/// State file name
pub const STATE_FILE: &str = "state.json";
/// Lock file name
pub const LOCK_FILE: &str = ".lock";
/// Largest state or plan file that will be read
pub const MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;
