//! Logical to Concrete Edge Translation
//!
//! A logical connection may start or end on a proxy. Expansion follows
//! proxies through subpatch boundaries until it reaches native modules (or
//! the root destination) on both sides, and returns the cross product of
//! what it finds.
//!
//! ```text
//!   osc ──▶ [ input ──▶ gain ──▶ output ] ──▶ output(root)
//!                                   │
//!   ApiEdges:  osc:0 ─▶ gain:0      gain:0 ─▶ destination
//! ```

use crate::graph::{Connection, ConnectionId, ModuleBody, ModuleKey, PatchId, PatchTree};
use crate::port::{InputIndex, PortIndex};
use serde::Serialize;
use std::collections::HashSet;

/// Where a concrete edge lands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum EdgeTarget {
    /// Input port of a native module; parameter ports included
    Input { module: ModuleKey, input: PortIndex },
    /// The engine's root destination
    Destination,
}

/// A concrete edge between native modules, as the engine sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ApiEdge {
    pub source: ModuleKey,
    pub output: PortIndex,
    pub target: EdgeTarget,
}

impl ApiEdge {
    /// The physical output this edge leaves from
    pub fn output_key(&self) -> (ModuleKey, PortIndex) {
        (self.source, self.output)
    }
}

/// Backend work needed to remove one logical connection
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemovalPlan {
    /// Edges the connection expands to
    pub remove: Vec<ApiEdge>,
    /// Outputs that must be disconnected, each once
    pub cleared_outputs: Vec<(ModuleKey, PortIndex)>,
    /// Edges of other live connections that share a cleared output
    pub restore: Vec<ApiEdge>,
}

fn dedup<T: Copy + Eq + std::hash::Hash>(items: impl IntoIterator<Item = T>) -> Vec<T> {
    let mut seen = HashSet::new();
    items.into_iter().filter(|item| seen.insert(*item)).collect()
}

impl PatchTree {
    /// Expand one logical connection into concrete edges
    pub fn api_edges_for(&self, connection: ConnectionId) -> Vec<ApiEdge> {
        self.expand(connection, None)
    }

    /// Every concrete edge implied by the logical graph
    pub fn live_api_edges(&self) -> Vec<ApiEdge> {
        dedup(
            self.connections_with_nested(self.root())
                .into_iter()
                .flat_map(|id| self.expand(id, None)),
        )
    }

    /// Plan the backend side of removing `connection`
    ///
    /// The engine can only disconnect a whole output, so every edge that
    /// shares a cleared output and is still implied once `connection` is gone
    /// has to be connected again afterwards.
    pub fn removal_plan(&self, connection: ConnectionId) -> RemovalPlan {
        let remove = self.api_edges_for(connection);
        let cleared_outputs = dedup(remove.iter().map(ApiEdge::output_key));
        if cleared_outputs.is_empty() {
            return RemovalPlan {
                remove,
                ..RemovalPlan::default()
            };
        }

        let restore = dedup(
            self.connections_fed_by(&cleared_outputs)
                .into_iter()
                .filter(|&id| id != connection)
                .flat_map(|id| self.expand(id, Some(connection)))
                .filter(|edge| cleared_outputs.contains(&edge.output_key())),
        );

        RemovalPlan {
            remove,
            cleared_outputs,
            restore,
        }
    }

    /// Connections whose source side carries signal from one of `outputs`
    ///
    /// Walks forward from each native output through subpatch inputs and
    /// output proxies, so only connections that can expand to an edge leaving
    /// those outputs are visited.
    fn connections_fed_by(&self, outputs: &[(ModuleKey, PortIndex)]) -> Vec<ConnectionId> {
        let mut found = Vec::new();
        let mut seen = HashSet::new();
        let mut pending = outputs.to_vec();

        while let Some((module, output)) = pending.pop() {
            if !seen.insert((module, output)) {
                continue;
            }
            let Some(m) = self.module(module) else {
                continue;
            };

            for (id, c) in self.patch_connections(m.patch()) {
                if c.source() != module || c.source_output() != output {
                    continue;
                }
                found.push(id);

                let destination = c.destination();
                match self.module(destination).map(|d| (d.body(), d.patch())) {
                    Some((ModuleBody::Output, patch)) => {
                        let owner = self.patch(patch).and_then(|p| p.parent_module());
                        if let (Some(owner), Some(port)) = (owner, self.proxy_port(destination)) {
                            pending.push((owner, port));
                        }
                    }
                    Some((ModuleBody::Subpatch { child }, _)) => {
                        let proxy = c
                            .destination_input()
                            .port()
                            .and_then(|port| self.inputs(child).get(port as usize).copied());
                        if let Some(proxy) = proxy {
                            pending.push((proxy, 0));
                        }
                    }
                    _ => {}
                }
            }
        }

        dedup(found)
    }

    fn expand(&self, connection: ConnectionId, excluded: Option<ConnectionId>) -> Vec<ApiEdge> {
        let Some(c) = self.connection(connection) else {
            return Vec::new();
        };

        let walk = Walk {
            tree: self,
            excluded,
        };
        let sources = walk.sources_of(c.source(), c.source_output(), &mut Vec::new());
        let targets = walk.targets_of(c.destination(), c.destination_input(), &mut Vec::new());

        dedup(sources.iter().flat_map(|&(source, output)| {
            targets.iter().map(move |&target| ApiEdge {
                source,
                output,
                target,
            })
        }))
    }
}

/// Proxy traversal over a tree, optionally ignoring one connection
struct Walk<'a> {
    tree: &'a PatchTree,
    excluded: Option<ConnectionId>,
}

impl<'a> Walk<'a> {
    /// Connections of a patch that take part in this walk
    fn connections(&self, patch: PatchId) -> impl Iterator<Item = &'a Connection> {
        let excluded = self.excluded;
        self.tree
            .patch_connections(patch)
            .filter(move |(id, _)| Some(*id) != excluded)
            .map(|(_, c)| c)
    }

    /// Native outputs feeding `module:output`
    fn sources_of(
        &self,
        module: ModuleKey,
        output: PortIndex,
        visiting: &mut Vec<(ModuleKey, PortIndex)>,
    ) -> Vec<(ModuleKey, PortIndex)> {
        let tree = self.tree;
        let Some(m) = tree.module(module) else {
            return Vec::new();
        };
        if visiting.contains(&(module, output)) {
            return Vec::new();
        }
        visiting.push((module, output));

        let found = match m.body() {
            ModuleBody::Native { .. } => vec![(module, output)],
            ModuleBody::Output => Vec::new(),
            ModuleBody::Input => {
                // Whatever feeds the enclosing subpatch on this proxy's port
                let owner = tree.patch(m.patch()).and_then(|p| p.parent_module());
                match (owner, tree.proxy_port(module)) {
                    (Some(owner), Some(port)) => {
                        let outer = tree.module(owner).map(|o| o.patch());
                        outer
                            .into_iter()
                            .flat_map(|outer| self.connections(outer))
                            .filter(|c| {
                                c.destination() == owner
                                    && c.destination_input() == InputIndex::Port(port)
                            })
                            .map(|c| (c.source(), c.source_output()))
                            .collect::<Vec<_>>()
                            .into_iter()
                            .flat_map(|(s, o)| self.sources_of(s, o, visiting))
                            .collect()
                    }
                    _ => Vec::new(),
                }
            }
            ModuleBody::Subpatch { child } => {
                // Whatever feeds the matching output proxy inside
                match tree.outputs(child).get(output as usize) {
                    Some(&proxy) => self
                        .connections(child)
                        .filter(|c| c.destination() == proxy)
                        .map(|c| (c.source(), c.source_output()))
                        .collect::<Vec<_>>()
                        .into_iter()
                        .flat_map(|(s, o)| self.sources_of(s, o, visiting))
                        .collect(),
                    None => Vec::new(),
                }
            }
        };

        visiting.pop();
        found
    }

    /// Native inputs (or the destination) reached from `module:input`
    fn targets_of(
        &self,
        module: ModuleKey,
        input: InputIndex,
        visiting: &mut Vec<(ModuleKey, InputIndex)>,
    ) -> Vec<EdgeTarget> {
        let tree = self.tree;
        let Some(m) = tree.module(module) else {
            return Vec::new();
        };
        if visiting.contains(&(module, input)) {
            return Vec::new();
        }
        visiting.push((module, input));

        let found = match m.body() {
            ModuleBody::Native { .. } => input
                .port()
                .map(|input| EdgeTarget::Input { module, input })
                .into_iter()
                .collect(),
            ModuleBody::Input => Vec::new(),
            ModuleBody::Output if tree.is_root(m.patch()) => vec![EdgeTarget::Destination],
            ModuleBody::Output => {
                // Whatever the enclosing subpatch feeds from this proxy's port
                let owner = tree.patch(m.patch()).and_then(|p| p.parent_module());
                match (owner, tree.proxy_port(module)) {
                    (Some(owner), Some(port)) => {
                        let outer = tree.module(owner).map(|o| o.patch());
                        outer
                            .into_iter()
                            .flat_map(|outer| self.connections(outer))
                            .filter(|c| c.source() == owner && c.source_output() == port)
                            .map(|c| (c.destination(), c.destination_input()))
                            .collect::<Vec<_>>()
                            .into_iter()
                            .flat_map(|(d, i)| self.targets_of(d, i, visiting))
                            .collect()
                    }
                    _ => Vec::new(),
                }
            }
            ModuleBody::Subpatch { child } => {
                let proxy = input
                    .port()
                    .and_then(|port| tree.inputs(child).get(port as usize).copied());
                match proxy {
                    Some(proxy) => self
                        .connections(child)
                        .filter(|c| c.source() == proxy)
                        .map(|c| (c.destination(), c.destination_input()))
                        .collect::<Vec<_>>()
                        .into_iter()
                        .flat_map(|(d, i)| self.targets_of(d, i, visiting))
                        .collect(),
                    None => Vec::new(),
                }
            }
        };

        visiting.pop();
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::RecordingEngine;
    use crate::graph::{Graph, PatchId};
    use crate::registry::{ModuleRegistry, SUBPATCH_TYPE};

    fn detached() -> Graph<RecordingEngine> {
        Graph::detached(ModuleRegistry::new())
    }

    fn key(graph: &Graph<RecordingEngine>, patch: PatchId, id: &str) -> ModuleKey {
        graph.tree().module_by_id(patch, id).unwrap()
    }

    fn child_of(graph: &Graph<RecordingEngine>, patch: PatchId, id: &str) -> PatchId {
        graph.module(patch, id).unwrap().child_patch().unwrap()
    }

    #[test]
    fn test_native_to_native() {
        let mut graph = detached();
        let root = graph.root();
        graph.add_module(root, "osc", vec![]).unwrap();
        graph.add_module(root, "gain", vec![]).unwrap();
        let c = graph.add_connection(root, "osc_1", 0, "gain_1", 1).unwrap();

        assert_eq!(
            graph.tree().api_edges_for(c),
            vec![ApiEdge {
                source: key(&graph, root, "osc_1"),
                output: 0,
                target: EdgeTarget::Input {
                    module: key(&graph, root, "gain_1"),
                    input: 1,
                },
            }]
        );
    }

    #[test]
    fn test_passthrough_subpatch_composes_one_edge() {
        let mut graph = detached();
        let root = graph.root();
        graph.add_module(root, "osc", vec![]).unwrap();
        graph.add_module(root, SUBPATCH_TYPE, vec![]).unwrap();
        graph.add_module(root, "gain", vec![]).unwrap();
        let child = child_of(&graph, root, "subpatch_1");
        graph.add_connection(child, "input_1", 0, "output_1", 0).unwrap();

        let into = graph.add_connection(root, "osc_1", 0, "subpatch_1", 0).unwrap();
        let out_of = graph.add_connection(root, "subpatch_1", 0, "gain_1", 0).unwrap();

        let expected = ApiEdge {
            source: key(&graph, root, "osc_1"),
            output: 0,
            target: EdgeTarget::Input {
                module: key(&graph, root, "gain_1"),
                input: 0,
            },
        };
        assert_eq!(graph.tree().api_edges_for(into), vec![expected]);
        assert_eq!(graph.tree().api_edges_for(out_of), vec![expected]);
        assert_eq!(graph.tree().live_api_edges(), vec![expected]);
    }

    #[test]
    fn test_fan_out_inside_subpatch() {
        let mut graph = detached();
        let root = graph.root();
        graph.add_module(root, "osc", vec![]).unwrap();
        graph.add_module(root, SUBPATCH_TYPE, vec![]).unwrap();
        let child = child_of(&graph, root, "subpatch_1");
        graph.add_module(child, "gain", vec![]).unwrap();
        graph.add_module(child, "delay", vec![]).unwrap();
        graph.add_connection(child, "input_1", 0, "gain_1", 0).unwrap();
        graph.add_connection(child, "input_1", 0, "delay_1", 0).unwrap();

        let c = graph.add_connection(root, "osc_1", 0, "subpatch_1", 0).unwrap();
        let edges = graph.tree().api_edges_for(c);
        assert_eq!(edges.len(), 2);
        assert!(edges.iter().all(|e| e.source == key(&graph, root, "osc_1")));
    }

    #[test]
    fn test_unwired_proxy_expands_to_nothing() {
        let mut graph = detached();
        let root = graph.root();
        graph.add_module(root, "osc", vec![]).unwrap();
        graph.add_module(root, SUBPATCH_TYPE, vec![]).unwrap();
        let c = graph.add_connection(root, "osc_1", 0, "subpatch_1", 0).unwrap();
        assert!(graph.tree().api_edges_for(c).is_empty());
        assert_eq!(graph.tree().removal_plan(c), RemovalPlan::default());
    }

    #[test]
    fn test_nested_subpatches_reach_root_destination() {
        let mut graph = detached();
        let root = graph.root();
        graph.add_module(root, SUBPATCH_TYPE, vec![]).unwrap();
        graph.add_module(root, "output", vec![]).unwrap();
        let outer = child_of(&graph, root, "subpatch_1");
        graph.add_module(outer, SUBPATCH_TYPE, vec![]).unwrap();
        let inner = child_of(&graph, outer, "subpatch_1");
        graph.add_module(inner, "osc", vec![]).unwrap();

        graph.add_connection(inner, "osc_1", 0, "output_1", 0).unwrap();
        graph.add_connection(outer, "subpatch_1", 0, "output_1", 0).unwrap();
        graph
            .add_destination_connection("subpatch_1", 0, "output_1")
            .unwrap();

        assert_eq!(
            graph.tree().live_api_edges(),
            vec![ApiEdge {
                source: key(&graph, inner, "osc_1"),
                output: 0,
                target: EdgeTarget::Destination,
            }]
        );
    }

    #[test]
    fn test_feedback_through_subpatch_terminates() {
        let mut graph = detached();
        let root = graph.root();
        graph.add_module(root, SUBPATCH_TYPE, vec![]).unwrap();
        let child = child_of(&graph, root, "subpatch_1");
        graph.add_connection(child, "input_1", 0, "output_1", 0).unwrap();
        let c = graph
            .add_connection(root, "subpatch_1", 0, "subpatch_1", 0)
            .unwrap();
        assert!(graph.tree().api_edges_for(c).is_empty());
    }

    #[test]
    fn test_removal_plan_restores_siblings() {
        let mut graph = detached();
        let root = graph.root();
        graph.add_module(root, "osc", vec![]).unwrap();
        graph.add_module(root, "gain", vec![]).unwrap();
        graph.add_module(root, "delay", vec![]).unwrap();
        let to_gain = graph.add_connection(root, "osc_1", 0, "gain_1", 0).unwrap();
        graph.add_connection(root, "osc_1", 0, "delay_1", 0).unwrap();

        let osc = key(&graph, root, "osc_1");
        let plan = graph.tree().removal_plan(to_gain);
        assert_eq!(plan.cleared_outputs, vec![(osc, 0)]);
        assert_eq!(
            plan.restore,
            vec![ApiEdge {
                source: osc,
                output: 0,
                target: EdgeTarget::Input {
                    module: key(&graph, root, "delay_1"),
                    input: 0,
                },
            }]
        );
    }

    #[test]
    fn test_restore_scan_skips_unrelated_connections() {
        let mut graph = detached();
        let root = graph.root();
        graph.add_module(root, "osc", vec![]).unwrap();
        graph.add_module(root, "osc", vec![]).unwrap();
        graph.add_module(root, SUBPATCH_TYPE, vec![]).unwrap();
        graph.add_module(root, "delay", vec![]).unwrap();
        let child = child_of(&graph, root, "subpatch_1");
        graph.add_module(child, "gain", vec![]).unwrap();

        let into_sub = graph.add_connection(root, "osc_1", 0, "subpatch_1", 0).unwrap();
        let inner = graph.add_connection(child, "input_1", 0, "gain_1", 0).unwrap();
        let unrelated = graph.add_connection(root, "osc_2", 0, "delay_1", 0).unwrap();

        let osc = key(&graph, root, "osc_1");
        let fed = graph.tree().connections_fed_by(&[(osc, 0)]);
        assert!(fed.contains(&into_sub));
        assert!(fed.contains(&inner));
        assert!(!fed.contains(&unrelated));

        // Same answer as filtering the whole live expansion
        let plan = graph.tree().removal_plan(into_sub);
        assert!(plan.restore.is_empty());
        let extra = graph.add_connection(root, "osc_1", 0, "delay_1", 0).unwrap();
        let plan = graph.tree().removal_plan(extra);
        let mut expected: Vec<ApiEdge> = graph
            .tree()
            .live_api_edges()
            .into_iter()
            .filter(|edge| edge.output_key() == (osc, 0))
            .filter(|edge| !plan.remove.contains(edge))
            .collect();
        expected.sort_by_key(|edge| format!("{:?}", edge));
        let mut restore = plan.restore.clone();
        restore.sort_by_key(|edge| format!("{:?}", edge));
        assert_eq!(restore, expected);
        assert_eq!(restore.len(), 1);
    }

    #[test]
    fn test_removal_plan_keeps_duplicate_edge() {
        let mut graph = detached();
        let root = graph.root();
        graph.add_module(root, "osc", vec![]).unwrap();
        graph.add_module(root, "gain", vec![]).unwrap();
        let first = graph.add_connection(root, "osc_1", 0, "gain_1", 0).unwrap();
        graph.add_connection(root, "osc_1", 0, "gain_1", 0).unwrap();

        let plan = graph.tree().removal_plan(first);
        assert_eq!(plan.remove, plan.restore);
    }

    #[test]
    fn test_removal_plan_ignores_paths_through_removed_connection() {
        let mut graph = detached();
        let root = graph.root();
        graph.add_module(root, "osc", vec![]).unwrap();
        graph.add_module(root, SUBPATCH_TYPE, vec![]).unwrap();
        graph.add_module(root, "delay", vec![]).unwrap();
        let child = child_of(&graph, root, "subpatch_1");
        graph.add_module(child, "gain", vec![]).unwrap();
        let inner = graph.add_connection(child, "input_1", 0, "gain_1", 0).unwrap();
        graph.add_connection(root, "osc_1", 0, "subpatch_1", 0).unwrap();
        graph.add_connection(root, "osc_1", 0, "delay_1", 0).unwrap();

        let plan = graph.tree().removal_plan(inner);
        assert_eq!(plan.remove.len(), 1);
        assert_eq!(
            plan.restore,
            vec![ApiEdge {
                source: key(&graph, root, "osc_1"),
                output: 0,
                target: EdgeTarget::Input {
                    module: key(&graph, root, "delay_1"),
                    input: 0,
                },
            }]
        );
    }
}
