//! Planner - classifies desired resources against applied state
//!
//! Produces an [`ExecutionPlan`]: creates, updates and replaces in
//! dependency order (channels ahead of what references them), then deletes
//! in reverse dependency order. Resources whose references do not resolve
//! are left out and reported as `error` warnings, as are deletes of
//! resources that something left in place still references. Everything
//! else is still planned.

use crate::config::ParsedConfig;
use crate::diff::{DiffOptions, deep_compare};
use crate::error::{Error, Result};
use crate::fingerprint::fingerprint;
use crate::graph::DependencyGraph;
use crate::plan::{
    ExecutionPlan, PlanMetadata, PlanSummary, PlanWarning, WarningSeverity, config_hash,
};
use crate::state::compare::classify;
use crate::state::{StateEntry, StateFile, StateStore};
use crate::types::{ChangeType, ResourceChange, ResourceDependency, ResourceKind, RiskLevel};
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// Options for [`generate_plan`]
#[derive(Debug, Clone)]
pub struct PlanOptions {
    /// Attach field diffs to updates and replaces
    pub compute_diffs: bool,
    /// Redact sensitive values in field diffs
    pub redact_secrets: bool,
    /// Compare against live remote state (not available yet)
    pub check_drift: bool,
    pub base_directory: PathBuf,
    pub config_files: Vec<String>,
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self {
            compute_diffs: true,
            redact_secrets: true,
            check_drift: false,
            base_directory: PathBuf::from("."),
            config_files: Vec::new(),
        }
    }
}

/// Ordered changes before they are wrapped into a plan
pub(crate) struct Classified {
    pub changes: Vec<ResourceChange>,
    pub dependencies: Vec<ResourceDependency>,
    pub warnings: Vec<PlanWarning>,
    /// Names left out of the plan
    pub blocked: BTreeSet<String>,
}

/// Load state from `store` and plan `config` against it.
pub fn generate_plan(
    store: &StateStore,
    config: &ParsedConfig,
    options: &PlanOptions,
) -> Result<ExecutionPlan> {
    let state = store.load_state()?;
    plan_against(&state, config, options, &store.context().cli_version)
}

/// Plan `config` against an already loaded state.
pub fn plan_against(
    state: &StateFile,
    config: &ParsedConfig,
    options: &PlanOptions,
    cli_version: &str,
) -> Result<ExecutionPlan> {
    let Classified {
        changes,
        dependencies,
        mut warnings,
        ..
    } = classify_changes(state, config, options)?;

    if options.check_drift {
        // TODO: compare against live remote state once providers expose a read operation
        log::info!("Drift detection requested but not available; planning from local state");
        warnings.push(PlanWarning::new(
            "drift_check_unavailable",
            WarningSeverity::Info,
            "Drift detection is not available; the plan is based on local state only",
            Vec::new(),
        ));
    }

    let mut plan = ExecutionPlan {
        metadata: PlanMetadata {
            plan_id: uuid::Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            cli_version: cli_version.to_string(),
            config_hash: config_hash(config),
            content_hash: String::new(),
            base_directory: options.base_directory.clone(),
            config_files: options.config_files.clone(),
        },
        summary: PlanSummary::from_changes(&changes),
        changes,
        dependencies,
        warnings,
    };
    plan.metadata.content_hash = plan.compute_content_hash();

    log::info!(
        "Plan {}: {} to create, {} to update, {} to replace, {} to delete, {} unchanged",
        plan.metadata.plan_id,
        plan.summary.counts.to_create,
        plan.summary.counts.to_update,
        plan.summary.counts.to_replace,
        plan.summary.counts.to_delete,
        plan.summary.counts.no_change
    );
    Ok(plan)
}

/// Classify and order every resource in `config` and every orphaned state
/// entry. Shared by planning and `compare`.
pub(crate) fn classify_changes(
    state: &StateFile,
    config: &ParsedConfig,
    options: &PlanOptions,
) -> Result<Classified> {
    config.validate()?;

    let resources = config.resources();
    let declared: Vec<(ResourceKind, String)> =
        resources.iter().map(|r| (r.kind, r.name.clone())).collect();
    let references = config.references();
    let mut warnings = Vec::new();

    let excluded = unresolved(config, &declared, &references, &mut warnings);

    let included: Vec<(ResourceKind, String)> = declared
        .into_iter()
        .filter(|(_, name)| !excluded.contains(name))
        .collect();
    let mut dependencies: Vec<ResourceDependency> = references
        .into_iter()
        .filter(|r| !excluded.contains(&r.resource) && !excluded.contains(&r.depends_on))
        .collect();
    let graph = DependencyGraph::build(&included, &dependencies);

    if graph.has_cycles {
        for cycle in &graph.cycles {
            log::warn!("Dependency cycle: {}", cycle.join(" -> "));
            warnings.push(PlanWarning::new(
                "dependency_cycle",
                WarningSeverity::Warning,
                format!("Dependency cycle between {}", cycle.join(", ")),
                cycle.clone(),
            ));
        }
    }

    let diff_options = DiffOptions {
        redact_secrets: options.redact_secrets,
        ..Default::default()
    };

    let mut by_name: BTreeMap<String, ResourceChange> = BTreeMap::new();
    for resource in resources.iter().filter(|r| !excluded.contains(&r.name)) {
        let hash = fingerprint(&resource.config);
        let entry = state.get(&resource.name);
        let change_type = classify(
            entry,
            resource.kind,
            &hash,
            config.discriminator(&resource.name),
        );

        let mut change = ResourceChange::new(resource.kind, &resource.name, change_type);
        change.desired_hash = Some(hash);
        change.current_hash = entry.map(|e| e.last_applied_hash.clone());
        change.remote_id = entry.map(|e| e.remote_id.clone());
        change.previous_kind = entry.map(|e| e.kind).filter(|kind| *kind != resource.kind);

        if options.compute_diffs
            && matches!(change_type, ChangeType::Update | ChangeType::Replace)
            && let Some(previous) = entry.and_then(|e| e.last_applied_config.as_ref())
        {
            let diff = deep_compare(previous, &resource.config, &diff_options);
            if change_type == ChangeType::Update && !diff.has_differences {
                warnings.push(PlanWarning::new(
                    "diff_hidden",
                    WarningSeverity::Info,
                    format!(
                        "{} changed only in fields that diffs leave out \
                         (version, etag, pagination, _-prefixed keys, whitespace)",
                        resource.name
                    ),
                    vec![resource.name.clone()],
                ));
            }
            change.field_diffs = Some(diff.field_diffs);
        }

        if let Some(node) = graph.nodes.get(&resource.name) {
            change.dependencies.clone_from(&node.dependencies);
            change.dependents.clone_from(&node.dependents);
        }
        change.risk_level = assess_risk(&change);
        by_name.insert(resource.name.clone(), change);
    }

    let mut changes: Vec<ResourceChange> = graph
        .execution_order
        .iter()
        .filter_map(|name| by_name.remove(name))
        .collect();

    let (deletes, held) = plan_deletes(state, config, &mut changes, &mut warnings);
    changes.extend(deletes);
    dependencies.sort();

    let mut blocked = excluded;
    blocked.extend(held);
    Ok(Classified {
        changes,
        dependencies,
        warnings,
        blocked,
    })
}

/// Resources whose references do not resolve, plus everything that depends
/// on them.
fn unresolved(
    config: &ParsedConfig,
    declared: &[(ResourceKind, String)],
    references: &[ResourceDependency],
    warnings: &mut Vec<PlanWarning>,
) -> BTreeSet<String> {
    let mut excluded: BTreeSet<String> = BTreeSet::new();
    for reference in references {
        if config.get(&reference.depends_on).is_some() {
            continue;
        }
        let err = Error::MissingDependency {
            resource: reference.resource.clone(),
            kind: reference.depends_on_kind.to_string(),
            dependency: reference.depends_on.clone(),
        };
        log::warn!("{err}");
        warnings.push(PlanWarning::new(
            "missing_dependency",
            WarningSeverity::Error,
            format!("{err} and will not be planned"),
            vec![reference.resource.clone()],
        ));
        excluded.insert(reference.resource.clone());
    }
    if excluded.is_empty() {
        return excluded;
    }

    let full_graph = DependencyGraph::build(declared, references);
    let roots: Vec<String> = excluded.iter().cloned().collect();
    for root in roots {
        for dependent in full_graph.transitive_dependents(&root) {
            if excluded.insert(dependent.clone()) {
                warnings.push(PlanWarning::new(
                    "missing_dependency",
                    WarningSeverity::Error,
                    format!("{dependent} depends on {root}, which cannot be planned"),
                    vec![dependent],
                ));
            }
        }
    }
    excluded
}

/// DELETE changes for state entries no longer declared, in reverse
/// dependency order. Each delete waits for every planned change whose last
/// applied state referenced it.
///
/// An entry that something staying in place still references is held back
/// and returned as the second value.
fn plan_deletes(
    state: &StateFile,
    config: &ParsedConfig,
    changes: &mut [ResourceChange],
    warnings: &mut Vec<PlanWarning>,
) -> (Vec<ResourceChange>, BTreeSet<String>) {
    let orphans: Vec<&StateEntry> = state
        .resources
        .values()
        .filter(|entry| config.get(&entry.name).is_none())
        .collect();
    if orphans.is_empty() {
        return (Vec::new(), BTreeSet::new());
    }

    let held = still_referenced(state, &orphans, changes, warnings);
    let orphans: Vec<&StateEntry> = orphans
        .into_iter()
        .filter(|e| !held.contains(&e.name))
        .collect();

    let nodes: Vec<(ResourceKind, String)> =
        orphans.iter().map(|e| (e.kind, e.name.clone())).collect();
    let orphan_names: BTreeSet<&str> = orphans.iter().map(|e| e.name.as_str()).collect();
    let mut edges = Vec::new();
    for entry in &orphans {
        for dep in &entry.depends_on {
            if let Some(target) = state
                .get(dep)
                .filter(|t| orphan_names.contains(t.name.as_str()))
            {
                edges.push(ResourceDependency {
                    resource: entry.name.clone(),
                    resource_kind: entry.kind,
                    depends_on: target.name.clone(),
                    depends_on_kind: target.kind,
                });
            }
        }
    }
    let graph = DependencyGraph::build(&nodes, &edges);

    let mut deletes = Vec::with_capacity(orphans.len());
    for name in graph.execution_order.iter().rev() {
        let Some(entry) = state.get(name) else {
            continue;
        };
        let mut change = ResourceChange::new(entry.kind, name, ChangeType::Delete);
        change.current_hash = Some(entry.last_applied_hash.clone());
        change.remote_id = Some(entry.remote_id.clone());

        // Anything that referenced this resource goes first
        let referrers = graph
            .nodes
            .get(name)
            .map(|n| n.dependents.clone())
            .unwrap_or_default();
        for other in changes.iter_mut() {
            let referenced = state
                .get(&other.name)
                .is_some_and(|e| e.depends_on.contains(name));
            if referenced && other.change_type.is_change() {
                change.dependencies.push(other.name.clone());
                other.dependents.push(name.clone());
            }
        }
        change.dependencies.extend(referrers);
        change.dependents = graph
            .nodes
            .get(name)
            .map(|n| n.dependencies.clone())
            .unwrap_or_default();
        change.risk_level = assess_risk(&change);
        deletes.push(change);
    }
    (deletes, held)
}

/// Orphans that a state entry which is neither deleted nor changed in this
/// plan still lists in `depends_on`. Holding one back keeps what it
/// references too.
fn still_referenced(
    state: &StateFile,
    orphans: &[&StateEntry],
    changes: &[ResourceChange],
    warnings: &mut Vec<PlanWarning>,
) -> BTreeSet<String> {
    let changing: BTreeSet<&str> = changes
        .iter()
        .filter(|c| c.change_type.is_change())
        .map(|c| c.name.as_str())
        .collect();
    let orphan_names: BTreeSet<&str> = orphans.iter().map(|e| e.name.as_str()).collect();

    let mut held: BTreeSet<String> = BTreeSet::new();
    loop {
        let mut grew = false;
        for orphan in orphans {
            if held.contains(&orphan.name) {
                continue;
            }
            let users: Vec<&str> = state
                .resources
                .values()
                .filter(|other| other.depends_on.contains(&orphan.name))
                .filter(|other| {
                    let deleted =
                        orphan_names.contains(other.name.as_str()) && !held.contains(&other.name);
                    !deleted && !changing.contains(other.name.as_str())
                })
                .map(|other| other.name.as_str())
                .collect();
            if users.is_empty() {
                continue;
            }

            log::warn!(
                "Not deleting {}: still referenced by {}",
                orphan.name,
                users.join(", ")
            );
            warnings.push(PlanWarning::new(
                "delete_blocked",
                WarningSeverity::Error,
                format!(
                    "{} is still referenced by {} and will not be deleted",
                    orphan.name,
                    users.join(", ")
                ),
                vec![orphan.name.clone()],
            ));
            held.insert(orphan.name.clone());
            grew = true;
        }
        if !grew {
            return held;
        }
    }
}

fn assess_risk(change: &ResourceChange) -> RiskLevel {
    match change.change_type {
        ChangeType::Create | ChangeType::NoChange => RiskLevel::Low,
        ChangeType::Update if change.touches_secrets() => RiskLevel::Medium,
        ChangeType::Update => RiskLevel::Low,
        ChangeType::Replace => RiskLevel::High,
        ChangeType::Delete => RiskLevel::Medium,
    }
}
