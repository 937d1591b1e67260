pub mod plan;
pub mod state;

use anyhow::Result;
use reconcile::{ParsedConfig, RunContext, StateStore};
use std::path::{Path, PathBuf};

use crate::Context;
use crate::config::{self, Settings};
use crate::paths;

/// Working directory, its settings and the run context built from them
pub struct Workspace {
    pub dir: PathBuf,
    pub settings: Settings,
    pub run: RunContext,
}

impl Workspace {
    pub fn open(ctx: &Context) -> Result<Self> {
        let dir = paths::workdir(ctx.workdir.as_deref())?;
        let settings = Settings::load(&dir)?;
        let run = RunContext::new(&dir).with_cli_version(env!("CARGO_PKG_VERSION"));
        Ok(Self { dir, settings, run })
    }

    pub fn store(&self) -> StateStore {
        StateStore::new(&self.run).with_stale_after(self.settings.lock.stale_after())
    }

    /// Load and merge `files`, returning the config and the file names as
    /// recorded in plan metadata.
    pub fn load_config(&self, files: &[PathBuf]) -> Result<(ParsedConfig, Vec<String>)> {
        let resolved: Vec<PathBuf> = files.iter().map(|f| paths::resolve(&self.dir, f)).collect();
        let config = config::load_configs(&resolved)?;
        let names = resolved.iter().map(|p| self.display(p)).collect();
        Ok((config, names))
    }

    /// Path relative to the working directory when it lies inside it.
    pub fn display(&self, path: &Path) -> String {
        path.strip_prefix(&self.dir)
            .unwrap_or(path)
            .display()
            .to_string()
    }
}
