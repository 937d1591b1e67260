//! `plan`, `show` and `verify`

use anyhow::{Context as AnyhowContext, Result};
use colored::Colorize;
use reconcile::{
    ChangeType, ExecutionPlan, FieldDiff, LockOperation, PlanFile, PlanOptions, ResourceChange,
    ResourceKind, generate_plan,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

use super::Workspace;
use crate::Context;
use crate::cli::PlanArgs;
use crate::paths;
use crate::ui;

/// Plan the configuration. Returns whether the plan has changes.
pub fn run(ctx: &Context, args: &PlanArgs) -> Result<bool> {
    let ws = Workspace::open(ctx)?;
    let (config, config_files) = ws.load_config(&args.config.configs)?;
    let store = ws.store();

    let options = PlanOptions {
        compute_diffs: ws.settings.plan.compute_diffs && !args.no_diff,
        redact_secrets: ws.settings.plan.redact_secrets && !args.show_secrets,
        check_drift: args.check_drift,
        base_directory: ws.dir.clone(),
        config_files,
    };

    let plan = {
        let _lock = store.lock(LockOperation::Plan, &ws.settings.lock.retry())?;
        generate_plan(&store, &config, &options)?
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
    } else {
        render(ctx, &plan);
    }

    if let Some(out) = &args.out {
        let path = paths::resolve(&ws.dir, out);
        let file = PlanFile::new(plan.clone())?;
        file.save(&path)
            .with_context(|| format!("Failed to save plan to {}", path.display()))?;
        if !ctx.quiet && !args.json {
            ui::success(&format!("Saved plan to {}", ws.display(&path)));
        }
    }

    Ok(plan.has_changes())
}

/// Render a saved plan after checking its signature.
pub fn show(ctx: &Context, path: &Path, json: bool) -> Result<()> {
    let ws = Workspace::open(ctx)?;
    let path = paths::resolve(&ws.dir, path);
    let file = PlanFile::load(&path).with_context(|| format!("Failed to load {}", path.display()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&file.plan)?);
    } else {
        render(ctx, &file.plan);
    }
    Ok(())
}

/// Check a saved plan against the current configuration and state.
pub fn verify(ctx: &Context, path: &Path, configs: &[std::path::PathBuf]) -> Result<()> {
    let ws = Workspace::open(ctx)?;
    let path = paths::resolve(&ws.dir, path);
    let file = PlanFile::load(&path).with_context(|| format!("Failed to load {}", path.display()))?;
    let (config, _) = ws.load_config(configs)?;

    file.verify_config(&config)?;

    let state = ws.store().load_state()?;
    let stale: Vec<&str> = file
        .plan
        .changes
        .iter()
        .filter(|c| state.get(&c.name).map(|e| &e.last_applied_hash) != c.current_hash.as_ref())
        .map(|c| c.name.as_str())
        .collect();
    if !stale.is_empty() {
        anyhow::bail!(
            "State changed since plan {} was generated: {}",
            file.plan.metadata.plan_id,
            stale.join(", ")
        );
    }

    let errors = file.plan.errors().count();
    if errors > 0 {
        ui::warn(&format!(
            "Plan carries {errors} error warning(s); run `converge show` for details"
        ));
    }
    ui::success(&format!(
        "Plan {} matches the configuration and current state",
        file.plan.metadata.plan_id
    ));
    Ok(())
}

fn render(ctx: &Context, plan: &ExecutionPlan) {
    let meta = &plan.metadata;
    ui::header(&format!("Plan {}", meta.plan_id));
    ui::kv("created", &meta.created_at.format("%Y-%m-%d %H:%M:%S UTC").to_string());
    if !meta.config_files.is_empty() {
        ui::kv("config", &meta.config_files.join(", "));
    }
    if ctx.verbose > 0 {
        ui::kv("config hash", &meta.config_hash);
        ui::kv("content hash", &meta.content_hash);
    }

    let mut by_kind: BTreeMap<ResourceKind, Vec<&ResourceChange>> = BTreeMap::new();
    for change in plan.changes.iter().filter(|c| c.change_type.is_change()) {
        by_kind.entry(change.kind).or_default().push(change);
    }

    for (kind, changes) in &by_kind {
        ui::section(&kind_title(*kind));
        for change in changes {
            render_change(change);
        }
    }

    if !plan.warnings.is_empty() {
        ui::section("Warnings");
        for warning in &plan.warnings {
            println!(
                "  [{}] {} {}",
                ui::severity(warning.severity),
                warning.message,
                format!("({})", warning.code).dimmed()
            );
        }
    }

    println!();
    let counts = &plan.summary.counts;
    if plan.has_changes() {
        println!(
            "{} {} to create, {} to update, {} to replace, {} to delete, {} unchanged.",
            "Plan:".bold(),
            counts.to_create.to_string().green(),
            counts.to_update.to_string().yellow(),
            counts.to_replace.to_string().magenta(),
            counts.to_delete.to_string().red(),
            counts.no_change
        );
    } else {
        ui::success(&format!(
            "No changes. {} resources match applied state.",
            counts.no_change
        ));
    }
}

fn kind_title(kind: ResourceKind) -> String {
    match kind {
        ResourceKind::NotificationChannel => "Notification channels".to_string(),
        ResourceKind::Watchlist => "Watchlists".to_string(),
        ResourceKind::CustomAgent => "Custom agents".to_string(),
    }
}

fn render_change(change: &ResourceChange) {
    let mut line = format!(
        "  {} {}",
        ui::change_symbol(change.change_type),
        change.name.bold()
    );
    if change.change_type != ChangeType::Create {
        line.push_str(&format!(" [{}]", ui::risk(change.risk_level)));
    }
    if !change.dependencies.is_empty() {
        line.push_str(
            &format!("  after {}", change.dependencies.join(", "))
                .dimmed()
                .to_string(),
        );
    }
    println!("{line}");

    for diff in change.field_diffs.iter().flatten() {
        println!("      {}", describe_diff(diff));
    }
}

fn describe_diff(diff: &FieldDiff) -> String {
    let old = diff.old_value.as_ref().map(short_value);
    let new = diff.new_value.as_ref().map(short_value);
    match (old, new) {
        (None, Some(new)) => format!("{} {}: {}", "+".green(), diff.path, new),
        (Some(old), None) => format!("{} {}: {}", "-".red(), diff.path, old.dimmed()),
        (Some(old), Some(new)) => format!(
            "{} {}: {} → {}",
            "~".yellow(),
            diff.path,
            old.dimmed(),
            new
        ),
        (None, None) => format!("{} {}", "~".yellow(), diff.path),
    }
}

/// Compact one-line rendering of a JSON value
fn short_value(value: &Value) -> String {
    const MAX: usize = 60;
    let text = match value {
        Value::String(s) => format!("\"{s}\""),
        other => other.to_string(),
    };
    if text.chars().count() > MAX {
        let cut: String = text.chars().take(MAX - 3).collect();
        format!("{cut}...")
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_short_value() {
        assert_eq!(short_value(&json!("abc")), "\"abc\"");
        assert_eq!(short_value(&json!(3)), "3");
        let long = short_value(&json!("x".repeat(100)));
        assert_eq!(long.chars().count(), 60);
        assert!(long.ends_with("..."));
    }

    #[test]
    fn test_describe_diff_shapes() {
        colored::control::set_override(false);
        let diff = FieldDiff {
            path: "config.threshold".into(),
            old_value: Some(json!(3)),
            new_value: Some(json!(5)),
            change_type: reconcile::types::FieldChangeType::Changed,
            is_sensitive: false,
        };
        assert_eq!(describe_diff(&diff), "~ config.threshold: 3 → 5");

        let added = FieldDiff {
            old_value: None,
            change_type: reconcile::types::FieldChangeType::Added,
            ..diff
        };
        assert_eq!(describe_diff(&added), "+ config.threshold: 5");
    }
}
