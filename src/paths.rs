//! Working directory resolution
//!
//! # Resolution Priority
//!
//! 1. `--workdir` flag
//! 2. `CONVERGE_WORKDIR` environment variable (read by clap)
//! 3. The current directory
//!
//! State lives in `<workdir>/.state/`, settings in `<workdir>/converge.toml`.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Settings file name inside the working directory
pub const SETTINGS_FILE: &str = "converge.toml";

/// Resolve the working directory from the flag/env value.
pub fn workdir(flag: Option<&str>) -> Result<PathBuf> {
    if let Some(dir) = flag {
        let path = expand(dir);
        log::debug!("Using working directory {}", path.display());
        return Ok(path);
    }
    std::env::current_dir().context("Could not determine current directory")
}

/// Resolve a user-supplied path relative to the working directory.
pub fn resolve(workdir: &Path, path: &Path) -> PathBuf {
    let expanded = expand(&path.to_string_lossy());
    if expanded.is_absolute() {
        expanded
    } else {
        workdir.join(expanded)
    }
}

/// Expand ~ and environment variables in a path string.
pub fn expand(path: &str) -> PathBuf {
    let expanded = shellexpand::full(path).unwrap_or(std::borrow::Cow::Borrowed(path));
    PathBuf::from(expanded.as_ref())
}
