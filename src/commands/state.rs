//! `status`, `state list/show/rm` and `unlock`

use anyhow::{Context as AnyhowContext, Result, bail};
use colored::Colorize;
use dialoguer::Confirm;
use reconcile::{Executor, LockOperation, ProviderRegistry, StateComparison};
use std::path::PathBuf;

use super::Workspace;
use crate::Context;
use crate::ui;

/// Show whether applied state matches the configuration.
pub fn status(ctx: &Context, configs: &[PathBuf]) -> Result<()> {
    let ws = Workspace::open(ctx)?;
    let (config, _) = ws.load_config(configs)?;
    let store = ws.store();

    let readiness = Executor::new(&store, ProviderRegistry::new()).can_execute();
    let comparison = store.compare_state(&config)?;

    ui::header("Status");
    ui::kv("workdir", &ws.dir.display().to_string());
    ui::kv("declared", &config.len().to_string());
    ui::kv("applied", &store.load_state()?.resources.len().to_string());

    print_bucket("To create", &comparison.to_create);
    print_bucket("To update", &comparison.to_update);
    print_bucket("To delete", &comparison.to_delete);
    print_bucket("Blocked", &comparison.blocked);
    if ctx.verbose > 0 {
        print_bucket("Unchanged", &comparison.no_change);
    }

    println!();
    if comparison.is_no_op() {
        ui::success(&format!("Converged ({} resources)", comparison.no_change.len()));
    } else {
        ui::info(&summary(&comparison));
    }
    if !comparison.blocked.is_empty() {
        ui::warn("Blocked resources are left out of plans; run `converge plan` for the reasons");
    }
    if !readiness.ready
        && let Some(reason) = readiness.reason
    {
        ui::warn(&reason);
    }
    Ok(())
}

fn print_bucket(title: &str, names: &[String]) {
    if names.is_empty() {
        return;
    }
    ui::section(&format!("{title} ({})", names.len()));
    for name in names {
        println!("  {name}");
    }
}

fn summary(comparison: &StateComparison) -> String {
    format!(
        "{} to create, {} to update, {} to delete",
        comparison.to_create.len(),
        comparison.to_update.len(),
        comparison.to_delete.len()
    )
}

/// List applied resources.
pub fn list(ctx: &Context) -> Result<()> {
    let ws = Workspace::open(ctx)?;
    let state = ws.store().load_state()?;

    if state.resources.is_empty() {
        ui::info("No resources have been applied yet");
        return Ok(());
    }

    ui::header(&format!("Applied resources ({})", state.resources.len()));
    let width = state.resources.keys().map(String::len).max().unwrap_or(0);
    for entry in state.resources.values() {
        println!(
            "  {}  {:<20}  {}  {}",
            format!("{:<width$}", entry.name).bold(),
            entry.kind.as_str(),
            ui::short_hash(&entry.last_applied_hash).dimmed(),
            entry.remote_id
        );
    }
    if let Some(last_sync) = state.last_sync {
        println!();
        ui::dim(&format!("Last sync {}", last_sync.to_rfc3339()));
    }
    Ok(())
}

/// Print one state entry as JSON.
pub fn show(ctx: &Context, name: &str) -> Result<()> {
    let ws = Workspace::open(ctx)?;
    let state = ws.store().load_state()?;
    let Some(entry) = state.get(name) else {
        bail!("'{name}' is not in state");
    };
    println!("{}", serde_json::to_string_pretty(entry)?);
    Ok(())
}

/// Forget a resource without touching it remotely.
pub fn rm(ctx: &Context, name: &str, yes: bool) -> Result<()> {
    let ws = Workspace::open(ctx)?;
    let store = ws.store();
    let _lock = store.lock(LockOperation::Apply, &ws.settings.lock.retry())?;

    if store.load_state()?.get(name).is_none() {
        bail!("'{name}' is not in state");
    }

    if !yes {
        let confirmed = Confirm::new()
            .with_prompt(format!(
                "Forget '{name}'? The remote resource is left as is and will be planned as a create"
            ))
            .default(false)
            .interact()
            .context("Failed to read confirmation")?;
        if !confirmed {
            ui::info("Cancelled");
            return Ok(());
        }
    }

    let result = store.remove_resource(name);
    if !result.success {
        bail!("{}: {}", result.message, result.error.unwrap_or_default());
    }
    ui::success(&format!("Removed '{name}' from state"));
    Ok(())
}

/// Remove a lock left behind by a crashed run.
pub fn unlock(ctx: &Context, force: bool) -> Result<()> {
    let ws = Workspace::open(ctx)?;
    let store = ws.store();

    let status = match store.read_lock() {
        Ok(Some(status)) => status,
        Ok(None) => {
            ui::info("No lock held");
            return Ok(());
        }
        Err(e) => {
            ui::warn(&format!("Lock file is unreadable: {e}"));
            return release(&store);
        }
    };

    ui::kv("operation", &status.lock.operation.to_string());
    ui::kv("pid", &status.lock.pid.to_string());
    ui::kv("started", &status.lock.created_at.to_rfc3339());
    ui::kv("age", &format!("{}s", status.age_secs));

    if !status.is_stale {
        if !force {
            bail!(
                "Lock is held by running process {} ({}); pass --force to remove it anyway",
                status.lock.pid,
                status.lock.operation
            );
        }
        let confirmed = Confirm::new()
            .with_prompt(format!(
                "Process {} still looks alive. Remove its lock anyway?",
                status.lock.pid
            ))
            .default(false)
            .interact()
            .context("Failed to read confirmation")?;
        if !confirmed {
            ui::info("Cancelled");
            return Ok(());
        }
    }

    release(&store)
}

fn release(store: &reconcile::StateStore) -> Result<()> {
    let result = store.remove_lock();
    if !result.success {
        bail!("{}: {}", result.message, result.error.unwrap_or_default());
    }
    ui::success("Lock removed");
    Ok(())
}
