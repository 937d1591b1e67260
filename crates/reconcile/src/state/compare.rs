//! Classification of desired resources against applied state

use super::types::{StateComparison, StateEntry, StateFile};
use crate::config::ParsedConfig;
use crate::error::Result;
use crate::fingerprint::fingerprints_equal;
use crate::planner::{PlanOptions, classify_changes};
use crate::types::{ChangeType, ResourceKind};

/// Classify one desired resource.
///
/// Absent from state is a create. An entry recorded under another kind is a
/// replace. A different hash is an update, unless the kind has an immutable
/// type and that type changed, which is also a replace.
pub fn classify(
    entry: Option<&StateEntry>,
    kind: ResourceKind,
    desired_hash: &str,
    desired_type: Option<&str>,
) -> ChangeType {
    let Some(entry) = entry else {
        return ChangeType::Create;
    };
    if entry.kind != kind {
        return ChangeType::Replace;
    }
    if fingerprints_equal(&entry.last_applied_hash, desired_hash) {
        return ChangeType::NoChange;
    }
    let type_changed = entry.kind.has_immutable_type()
        && matches!(
            (entry.resource_type.as_deref(), desired_type),
            (Some(old), Some(new)) if old != new
        );
    if type_changed {
        ChangeType::Replace
    } else {
        ChangeType::Update
    }
}

/// Bucket what a plan of `config` would do, in plan order.
pub fn compare(state: &StateFile, config: &ParsedConfig) -> Result<StateComparison> {
    let options = PlanOptions {
        compute_diffs: false,
        ..Default::default()
    };
    let classified = classify_changes(state, config, &options)?;

    let mut comparison = StateComparison::default();
    for change in classified.changes {
        let bucket = match change.change_type {
            ChangeType::Create => &mut comparison.to_create,
            ChangeType::Update | ChangeType::Replace => &mut comparison.to_update,
            ChangeType::NoChange => &mut comparison.no_change,
            ChangeType::Delete => &mut comparison.to_delete,
        };
        bucket.push(change.name);
    }
    comparison.blocked = classified.blocked.into_iter().collect();
    Ok(comparison)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_config;
    use crate::fingerprint::fingerprint;
    use crate::state::types::EntryMetadata;
    use chrono::Utc;

    fn entry(kind: ResourceKind, hash: &str, resource_type: Option<&str>) -> StateEntry {
        let now = Utc::now();
        StateEntry {
            kind,
            name: "r".into(),
            remote_id: "remote-1".into(),
            last_applied_hash: hash.into(),
            last_seen_remote_hash: None,
            resource_type: resource_type.map(String::from),
            depends_on: Vec::new(),
            last_applied_config: None,
            metadata: EntryMetadata {
                created_at: now,
                updated_at: now,
                created_by: "t".into(),
                cli_version: "0".into(),
                config_file: None,
            },
        }
    }

    #[test]
    fn test_classify() {
        use ResourceKind::CustomAgent as Agent;
        let agent = entry(Agent, "h1", Some("script"));
        assert_eq!(classify(None, Agent, "h1", None), ChangeType::Create);
        assert_eq!(classify(Some(&agent), Agent, "h1", Some("script")), ChangeType::NoChange);
        assert_eq!(classify(Some(&agent), Agent, "h2", Some("script")), ChangeType::Update);
        assert_eq!(classify(Some(&agent), Agent, "h2", Some("http")), ChangeType::Replace);
    }

    #[test]
    fn test_kind_change_is_replace_even_with_same_hash() {
        let watchlist = entry(ResourceKind::Watchlist, "h1", None);
        assert_eq!(
            classify(Some(&watchlist), ResourceKind::CustomAgent, "h1", Some("script")),
            ChangeType::Replace
        );
        assert_eq!(
            classify(Some(&watchlist), ResourceKind::CustomAgent, "h2", None),
            ChangeType::Replace
        );
    }

    #[test]
    fn test_type_change_only_matters_for_immutable_kinds() {
        let kind = ResourceKind::NotificationChannel;
        let channel = entry(kind, "h1", Some("slack"));
        assert_eq!(classify(Some(&channel), kind, "h2", Some("email")), ChangeType::Update);
    }

    #[test]
    fn test_compare_buckets() {
        let config = sample_config();
        let mut state = StateFile::new("0");
        let slack = config.get("test-slack").unwrap();
        let mut e = entry(ResourceKind::NotificationChannel, &fingerprint(&slack.config), None);
        e.name = "test-slack".into();
        state.resources.insert("test-slack".into(), e.clone());
        e.name = "orphan".into();
        e.kind = ResourceKind::Watchlist;
        state.resources.insert("orphan".into(), e);

        let comparison = compare(&state, &config).unwrap();
        assert_eq!(comparison.no_change, vec!["test-slack"]);
        assert_eq!(comparison.to_create, vec!["test-email", "disk-agent", "prod-hosts"]);
        assert_eq!(comparison.to_delete, vec!["orphan"]);
        assert!(comparison.blocked.is_empty());
        assert!(!comparison.is_no_op());
    }

    #[test]
    fn test_compare_skips_unresolved_references() {
        let mut config = sample_config();
        config
            .custom_agents
            .get_mut("disk-agent")
            .unwrap()
            .notification_channels
            .push("nope".into());

        let comparison = compare(&StateFile::new("0"), &config).unwrap();
        assert_eq!(comparison.to_create, vec!["test-email", "test-slack", "prod-hosts"]);
        assert_eq!(comparison.blocked, vec!["disk-agent"]);
    }
}
