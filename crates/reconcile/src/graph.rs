//! Dependency graph over declared resources
//!
//! Edges point from a resource to what it needs (`watchlist -> channel`).
//! Depth is the longest dependency chain below a node; the execution order
//! sorts by depth, then kind precedence, then name. Cycles are detected
//! with Tarjan's algorithm and reported, never fatal: members of a cycle
//! share a depth and fall back to the same deterministic tie-break.

use crate::types::{ResourceDependency, ResourceKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One resource in the graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyNode {
    pub name: String,
    pub kind: ResourceKind,
    /// Names this node needs first
    pub dependencies: Vec<String>,
    /// Names that need this node
    pub dependents: Vec<String>,
    /// Longest path to a node with no dependencies
    pub depth: usize,
}

/// Graph plus its computed order and cycles
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyGraph {
    pub nodes: BTreeMap<String, DependencyNode>,
    pub execution_order: Vec<String>,
    pub has_cycles: bool,
    pub cycles: Vec<Vec<String>>,
}

impl DependencyGraph {
    /// Build a graph from resources and the edges between them.
    ///
    /// Edges whose endpoints are not in `resources` are ignored; resolving
    /// references is the caller's job.
    pub fn build(resources: &[(ResourceKind, String)], edges: &[ResourceDependency]) -> Self {
        let mut nodes: BTreeMap<String, DependencyNode> = resources
            .iter()
            .map(|(kind, name)| {
                (
                    name.clone(),
                    DependencyNode {
                        name: name.clone(),
                        kind: *kind,
                        dependencies: Vec::new(),
                        dependents: Vec::new(),
                        depth: 0,
                    },
                )
            })
            .collect();

        let mut unique: BTreeSet<(&str, &str)> = BTreeSet::new();
        for edge in edges {
            let (from, to) = (edge.resource.as_str(), edge.depends_on.as_str());
            if !nodes.contains_key(from) || !nodes.contains_key(to) || !unique.insert((from, to)) {
                continue;
            }
            if let Some(node) = nodes.get_mut(from) {
                node.dependencies.push(to.to_string());
            }
            if let Some(node) = nodes.get_mut(to) {
                node.dependents.push(from.to_string());
            }
        }
        for node in nodes.values_mut() {
            node.dependencies.sort();
            node.dependents.sort();
        }

        let mut graph = Self {
            nodes,
            ..Default::default()
        };
        graph.analyze();
        graph
    }

    /// Every node that transitively depends on `name`.
    pub fn transitive_dependents(&self, name: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![name.to_string()];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.nodes.get(&current) {
                for dependent in &node.dependents {
                    if seen.insert(dependent.clone()) {
                        stack.push(dependent.clone());
                    }
                }
            }
        }
        seen.remove(name);
        seen
    }

    fn analyze(&mut self) {
        let components = self.strongly_connected();

        // Tarjan emits a component only after every component it can reach,
        // so dependencies are always finished before their dependents.
        let mut component_of: BTreeMap<String, usize> = BTreeMap::new();
        for (i, component) in components.iter().enumerate() {
            for name in component {
                component_of.insert(name.clone(), i);
            }
        }

        let mut component_depth = vec![0usize; components.len()];
        for (i, component) in components.iter().enumerate() {
            let mut depth = 0;
            for name in component {
                for dep in &self.nodes[name].dependencies {
                    let c = component_of[dep];
                    if c != i {
                        depth = depth.max(component_depth[c] + 1);
                    }
                }
            }
            component_depth[i] = depth;

            let self_loop = component.len() == 1 && {
                let name = &component[0];
                self.nodes[name].dependencies.contains(name)
            };
            if component.len() > 1 || self_loop {
                let mut cycle = component.clone();
                cycle.sort();
                self.cycles.push(cycle);
            }
        }
        self.cycles.sort();
        self.has_cycles = !self.cycles.is_empty();

        for (name, node) in &mut self.nodes {
            node.depth = component_depth[component_of[name]];
        }

        let mut order: Vec<&DependencyNode> = self.nodes.values().collect();
        order.sort_by(|a, b| {
            (a.depth, a.kind.precedence(), &a.name).cmp(&(b.depth, b.kind.precedence(), &b.name))
        });
        self.execution_order = order.into_iter().map(|n| n.name.clone()).collect();
    }

    /// Iterative Tarjan over the dependency edges.
    fn strongly_connected(&self) -> Vec<Vec<String>> {
        struct Frame {
            node: usize,
            next_edge: usize,
        }

        let names: Vec<&String> = self.nodes.keys().collect();
        let position: BTreeMap<&str, usize> = names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.as_str(), i))
            .collect();
        let adjacency: Vec<Vec<usize>> = names
            .iter()
            .map(|n| {
                self.nodes[*n]
                    .dependencies
                    .iter()
                    .map(|d| position[d.as_str()])
                    .collect()
            })
            .collect();

        let count = names.len();
        let mut index = vec![usize::MAX; count];
        let mut lowlink = vec![0; count];
        let mut on_stack = vec![false; count];
        let mut stack: Vec<usize> = Vec::new();
        let mut next_index = 0;
        let mut components = Vec::new();

        for root in 0..count {
            if index[root] != usize::MAX {
                continue;
            }
            let mut frames = vec![Frame {
                node: root,
                next_edge: 0,
            }];
            index[root] = next_index;
            lowlink[root] = next_index;
            next_index += 1;
            stack.push(root);
            on_stack[root] = true;

            while let Some(frame) = frames.last_mut() {
                let v = frame.node;
                if let Some(&w) = adjacency[v].get(frame.next_edge) {
                    frame.next_edge += 1;
                    if index[w] == usize::MAX {
                        index[w] = next_index;
                        lowlink[w] = next_index;
                        next_index += 1;
                        stack.push(w);
                        on_stack[w] = true;
                        frames.push(Frame {
                            node: w,
                            next_edge: 0,
                        });
                    } else if on_stack[w] {
                        lowlink[v] = lowlink[v].min(index[w]);
                    }
                    continue;
                }

                frames.pop();
                if let Some(parent) = frames.last() {
                    lowlink[parent.node] = lowlink[parent.node].min(lowlink[v]);
                }
                if lowlink[v] == index[v] {
                    let mut component = Vec::new();
                    while let Some(w) = stack.pop() {
                        on_stack[w] = false;
                        component.push(names[w].clone());
                        if w == v {
                            break;
                        }
                    }
                    components.push(component);
                }
            }
        }
        components
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ResourceKind::{CustomAgent, NotificationChannel, Watchlist};

    fn edge(
        from: &str,
        from_kind: ResourceKind,
        to: &str,
        to_kind: ResourceKind,
    ) -> ResourceDependency {
        ResourceDependency {
            resource: from.into(),
            resource_kind: from_kind,
            depends_on: to.into(),
            depends_on_kind: to_kind,
        }
    }

    fn res(kind: ResourceKind, name: &str) -> (ResourceKind, String) {
        (kind, name.to_string())
    }

    #[test]
    fn test_channels_before_dependents() {
        let resources = vec![
            res(Watchlist, "a-watch"),
            res(CustomAgent, "agent"),
            res(NotificationChannel, "z-slack"),
            res(NotificationChannel, "email"),
        ];
        let edges = vec![
            edge("a-watch", Watchlist, "z-slack", NotificationChannel),
            edge("agent", CustomAgent, "email", NotificationChannel),
        ];
        let graph = DependencyGraph::build(&resources, &edges);

        assert!(!graph.has_cycles);
        assert_eq!(graph.execution_order, vec!["email", "z-slack", "a-watch", "agent"]);
        assert_eq!(graph.nodes["a-watch"].depth, 1);
        assert_eq!(graph.nodes["z-slack"].dependents, vec!["a-watch"]);
    }

    #[test]
    fn test_kind_precedence_breaks_depth_ties() {
        let resources = vec![res(Watchlist, "a"), res(NotificationChannel, "b")];
        let graph = DependencyGraph::build(&resources, &[]);
        assert_eq!(graph.execution_order, vec!["b", "a"]);
    }

    #[test]
    fn test_longest_path_depth() {
        let resources = vec![
            res(Watchlist, "top"),
            res(Watchlist, "mid"),
            res(NotificationChannel, "base"),
        ];
        let edges = vec![
            edge("top", Watchlist, "mid", Watchlist),
            edge("mid", Watchlist, "base", NotificationChannel),
            edge("top", Watchlist, "base", NotificationChannel),
        ];
        let graph = DependencyGraph::build(&resources, &edges);
        assert_eq!(graph.nodes["top"].depth, 2);
        assert_eq!(graph.execution_order, vec!["base", "mid", "top"]);
    }

    #[test]
    fn test_cycle_reported_not_fatal() {
        let resources = vec![
            res(Watchlist, "x"),
            res(Watchlist, "y"),
            res(NotificationChannel, "c"),
        ];
        let edges = vec![
            edge("x", Watchlist, "y", Watchlist),
            edge("y", Watchlist, "x", Watchlist),
            edge("x", Watchlist, "c", NotificationChannel),
        ];
        let graph = DependencyGraph::build(&resources, &edges);
        assert!(graph.has_cycles);
        assert_eq!(graph.cycles, vec![vec!["x".to_string(), "y".to_string()]]);
        assert_eq!(graph.execution_order, vec!["c", "x", "y"]);
    }

    #[test]
    fn test_self_loop_is_cycle() {
        let resources = vec![res(Watchlist, "x")];
        let edges = vec![edge("x", Watchlist, "x", Watchlist)];
        let graph = DependencyGraph::build(&resources, &edges);
        assert!(graph.has_cycles);
        assert_eq!(graph.execution_order, vec!["x"]);
    }

    #[test]
    fn test_unknown_edges_ignored() {
        let resources = vec![res(Watchlist, "x")];
        let edges = vec![edge("x", Watchlist, "missing", NotificationChannel)];
        let graph = DependencyGraph::build(&resources, &edges);
        assert!(graph.nodes["x"].dependencies.is_empty());
    }

    #[test]
    fn test_transitive_dependents() {
        let resources = vec![
            res(NotificationChannel, "c"),
            res(Watchlist, "w1"),
            res(Watchlist, "w2"),
        ];
        let edges = vec![
            edge("w1", Watchlist, "c", NotificationChannel),
            edge("w2", Watchlist, "w1", Watchlist),
        ];
        let graph = DependencyGraph::build(&resources, &edges);
        let deps: Vec<_> = graph.transitive_dependents("c").into_iter().collect();
        assert_eq!(deps, vec!["w1", "w2"]);
    }
}
