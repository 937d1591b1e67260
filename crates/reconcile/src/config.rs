//! Typed desired configuration
//!
//! The config-loading layer (file discovery, YAML, interpolation, schema
//! checks) hands the engine a [`ParsedConfig`]. Each kind is a typed struct
//! naming the fields the engine reads (references, immutable type) and
//! keeping the free-form remainder in a sorted JSON map, so hashing and
//! diffing never depend on map iteration order.

use crate::error::{Error, Result};
use crate::types::{ResourceConfig, ResourceDependency, ResourceKind};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};

/// Notification channel (Slack, email, webhook, ...)
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChannelSpec {
    #[serde(rename = "type")]
    pub channel_type: String,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

/// Alerting block of a watchlist
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AlertConfig {
    /// Channel names alerts are sent to
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notification_channels: Vec<String>,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

/// Watchlist
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WatchlistSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert_config: Option<AlertConfig>,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

/// Custom monitoring agent
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AgentSpec {
    /// Agent type; immutable once created remotely
    #[serde(rename = "type")]
    pub agent_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notification_channels: Vec<String>,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

/// The complete desired configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ParsedConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global: Option<Value>,
    #[serde(default)]
    pub notification_channels: BTreeMap<String, ChannelSpec>,
    #[serde(default)]
    pub watchlists: BTreeMap<String, WatchlistSpec>,
    #[serde(default)]
    pub custom_agents: BTreeMap<String, AgentSpec>,
}

impl ParsedConfig {
    /// Merge another config into this one. A name declared twice is an error.
    pub fn merge(&mut self, other: ParsedConfig) -> Result<()> {
        fn extend<T>(into: &mut BTreeMap<String, T>, from: BTreeMap<String, T>) -> Result<()> {
            for (name, spec) in from {
                if into.contains_key(&name) {
                    return Err(Error::validation(format!("'{name}' is declared more than once")));
                }
                into.insert(name, spec);
            }
            Ok(())
        }

        if other.global.is_some() {
            self.global = other.global;
        }
        extend(&mut self.notification_channels, other.notification_channels)?;
        extend(&mut self.watchlists, other.watchlists)?;
        extend(&mut self.custom_agents, other.custom_agents)?;
        Ok(())
    }

    /// Check that every name is unique across kinds.
    ///
    /// State is keyed by name alone, so a channel and a watchlist sharing a
    /// name would overwrite each other's entry.
    pub fn validate(&self) -> Result<()> {
        let mut seen: HashMap<&str, ResourceKind> = HashMap::new();
        let names = self
            .notification_channels
            .keys()
            .map(|n| (n, ResourceKind::NotificationChannel))
            .chain(self.watchlists.keys().map(|n| (n, ResourceKind::Watchlist)))
            .chain(self.custom_agents.keys().map(|n| (n, ResourceKind::CustomAgent)));

        for (name, kind) in names {
            if name.trim().is_empty() {
                return Err(Error::validation(format!("{kind} with an empty name")));
            }
            if let Some(other) = seen.insert(name.as_str(), kind) {
                return Err(Error::validation(format!(
                    "name '{name}' is used by both a {other} and a {kind}"
                )));
            }
        }
        Ok(())
    }

    /// Total number of declared resources.
    pub fn len(&self) -> usize {
        self.notification_channels.len() + self.watchlists.len() + self.custom_agents.len()
    }

    /// Whether nothing is declared.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every declared resource, channels first, each kind in name order.
    pub fn resources(&self) -> Vec<ResourceConfig> {
        let mut out = Vec::with_capacity(self.len());
        for (name, spec) in &self.notification_channels {
            out.push(resource(ResourceKind::NotificationChannel, name, spec));
        }
        for (name, spec) in &self.watchlists {
            out.push(resource(ResourceKind::Watchlist, name, spec));
        }
        for (name, spec) in &self.custom_agents {
            out.push(resource(ResourceKind::CustomAgent, name, spec));
        }
        out
    }

    /// Look up one declared resource by name.
    pub fn get(&self, name: &str) -> Option<ResourceConfig> {
        if let Some(spec) = self.notification_channels.get(name) {
            return Some(resource(ResourceKind::NotificationChannel, name, spec));
        }
        if let Some(spec) = self.watchlists.get(name) {
            return Some(resource(ResourceKind::Watchlist, name, spec));
        }
        self.custom_agents
            .get(name)
            .map(|spec| resource(ResourceKind::CustomAgent, name, spec))
    }

    /// Declared references from watchlists and agents to channels, in
    /// resource order. Unresolved names are included; the planner decides
    /// what to do with them.
    pub fn references(&self) -> Vec<ResourceDependency> {
        let mut edges = Vec::new();
        for (name, spec) in &self.watchlists {
            let channels = spec
                .alert_config
                .as_ref()
                .map(|a| a.notification_channels.as_slice())
                .unwrap_or_default();
            push_channel_edges(&mut edges, name, ResourceKind::Watchlist, channels);
        }
        for (name, spec) in &self.custom_agents {
            push_channel_edges(
                &mut edges,
                name,
                ResourceKind::CustomAgent,
                &spec.notification_channels,
            );
        }
        edges
    }

    /// Immutable type of a resource, when its kind has one.
    pub fn discriminator(&self, name: &str) -> Option<&str> {
        self.custom_agents.get(name).map(|a| a.agent_type.as_str())
    }

    /// The whole configuration as one JSON value.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

fn resource<T: Serialize>(kind: ResourceKind, name: &str, spec: &T) -> ResourceConfig {
    ResourceConfig {
        kind,
        name: name.to_string(),
        config: serde_json::to_value(spec).unwrap_or(Value::Null),
    }
}

fn push_channel_edges(
    edges: &mut Vec<ResourceDependency>,
    name: &str,
    kind: ResourceKind,
    channels: &[String],
) {
    for channel in channels {
        let dep = ResourceDependency {
            resource: name.to_string(),
            resource_kind: kind,
            depends_on: channel.clone(),
            depends_on_kind: ResourceKind::NotificationChannel,
        };
        if !edges.contains(&dep) {
            edges.push(dep);
        }
    }
}
