//! Core types shared by the planner, state store and executor

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Kind of a managed resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Where alerts are delivered (Slack, email, webhook...)
    NotificationChannel,
    /// A monitored list with alerting rules
    Watchlist,
    /// A custom monitoring agent
    CustomAgent,
}

impl ResourceKind {
    /// All kinds in execution precedence order.
    pub const ALL: [ResourceKind; 3] = [
        ResourceKind::NotificationChannel,
        ResourceKind::Watchlist,
        ResourceKind::CustomAgent,
    ];

    /// Stable identifier used in state and plan files.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotificationChannel => "notification_channel",
            Self::Watchlist => "watchlist",
            Self::CustomAgent => "custom_agent",
        }
    }

    /// Ordering rank when dependency depth ties. Channels go first since
    /// everything else references them.
    pub fn precedence(&self) -> u8 {
        match self {
            Self::NotificationChannel => 0,
            Self::Watchlist | Self::CustomAgent => 1,
        }
    }

    /// Whether the remote side keys this kind by an immutable type, so a type
    /// change needs delete-then-create.
    pub fn has_immutable_type(&self) -> bool {
        matches!(self, Self::CustomAgent)
    }

    /// Parse the identifier written by [`ResourceKind::as_str`].
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One desired resource: the unit the planner fingerprints and classifies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Resource kind
    pub kind: ResourceKind,
    /// Logical name, unique across the configuration
    pub name: String,
    /// Validated configuration payload
    pub config: Value,
}

/// How a resource must change to reach the desired configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    /// Not in state yet
    Create,
    /// In state with a different hash
    Update,
    /// Immutable type changed: delete then create
    Replace,
    /// In state but no longer declared
    Delete,
    /// In state with the same hash
    NoChange,
}

impl ChangeType {
    /// Whether this change does something remotely.
    pub fn is_change(&self) -> bool {
        !matches!(self, Self::NoChange)
    }

    /// Short display symbol.
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Create => "+",
            Self::Update => "~",
            Self::Replace => "-/+",
            Self::Delete => "-",
            Self::NoChange => "=",
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Replace => "REPLACE",
            Self::Delete => "DELETE",
            Self::NoChange => "NO_CHANGE",
        };
        f.write_str(s)
    }
}

/// Risk attached to a planned change
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        };
        f.write_str(s)
    }
}

/// Kind of a single field-level difference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldChangeType {
    Added,
    Removed,
    Changed,
}

/// A field-level difference between two configurations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDiff {
    /// Dot-notation path (`alert_config.threshold`, `targets[2].address`)
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_value: Option<Value>,
    pub change_type: FieldChangeType,
    /// Field name looks like a credential
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_sensitive: bool,
}

/// A directed edge: `resource` needs `depends_on` to exist first
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceDependency {
    pub resource: String,
    pub resource_kind: ResourceKind,
    pub depends_on: String,
    pub depends_on_kind: ResourceKind,
}

/// A classified change for one resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceChange {
    pub kind: ResourceKind,
    pub name: String,
    /// Kind recorded in state when the name moved to another kind
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_kind: Option<ResourceKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
    pub change_type: ChangeType,
    /// Hash recorded in state at last apply
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_hash: Option<String>,
    /// Fingerprint of the desired configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desired_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field_diffs: Option<Vec<FieldDiff>>,
    /// Names that must be applied before this change
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Names that wait for this change
    #[serde(default)]
    pub dependents: Vec<String>,
    pub risk_level: RiskLevel,
}

impl ResourceChange {
    /// Create a change with no hashes, diffs or edges yet.
    pub fn new(kind: ResourceKind, name: impl Into<String>, change_type: ChangeType) -> Self {
        Self {
            kind,
            name: name.into(),
            previous_kind: None,
            remote_id: None,
            change_type,
            current_hash: None,
            desired_hash: None,
            field_diffs: None,
            dependencies: Vec::new(),
            dependents: Vec::new(),
            risk_level: RiskLevel::Low,
        }
    }

    /// Kind whose provider removes the existing remote resource.
    pub fn existing_kind(&self) -> ResourceKind {
        self.previous_kind.unwrap_or(self.kind)
    }

    /// Whether any field diff touches a sensitive field.
    pub fn touches_secrets(&self) -> bool {
        self.field_diffs
            .as_ref()
            .is_some_and(|diffs| diffs.iter().any(|d| d.is_sensitive))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip_identifier() {
        for kind in ResourceKind::ALL {
            assert_eq!(ResourceKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ResourceKind::parse("dashboard"), None);
    }

    #[test]
    fn test_channels_precede_referencing_kinds() {
        assert!(
            ResourceKind::NotificationChannel.precedence() < ResourceKind::Watchlist.precedence()
        );
        assert_eq!(
            ResourceKind::Watchlist.precedence(),
            ResourceKind::CustomAgent.precedence()
        );
    }

    #[test]
    fn test_change_type_serializes_uppercase() {
        let json = serde_json::to_string(&ChangeType::NoChange).unwrap();
        assert_eq!(json, "\"NO_CHANGE\"");
        let json = serde_json::to_string(&RiskLevel::Medium).unwrap();
        assert_eq!(json, "\"medium\"");
    }

    #[test]
    fn test_touches_secrets() {
        let mut change =
            ResourceChange::new(ResourceKind::NotificationChannel, "c", ChangeType::Update);
        assert!(!change.touches_secrets());
        change.field_diffs = Some(vec![FieldDiff {
            path: "config.token".into(),
            old_value: None,
            new_value: None,
            change_type: FieldChangeType::Changed,
            is_sensitive: true,
        }]);
        assert!(change.touches_secrets());
    }

    #[test]
    fn test_existing_kind_follows_moves() {
        let mut change = ResourceChange::new(ResourceKind::CustomAgent, "a", ChangeType::Replace);
        assert_eq!(change.existing_kind(), ResourceKind::CustomAgent);
        change.previous_kind = Some(ResourceKind::Watchlist);
        assert_eq!(change.existing_kind(), ResourceKind::Watchlist);
    }
}
