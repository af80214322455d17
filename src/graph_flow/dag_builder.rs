//! Merged dependency graph: explicit edges plus the implicit edges that
//! future references imply.

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::trace;

use super::future::FutureRegistry;
use super::graph::GraphDescription;
use crate::core::errors::{GraphError, Result};

/// Where a dependency edge came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// Declared in the edge list or a node's `depends_on`
    Explicit,
    /// Derived from a future reference
    Implicit,
}

/// Acyclic union of explicit and implicit edges
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    graph: DiGraph<String, EdgeKind>,
    indices: HashMap<String, NodeIndex>,
}

impl DependencyGraph {
    /// Merge edges and reject cycles
    pub fn build(description: &GraphDescription, futures: &FutureRegistry) -> Result<Self> {
        let mut graph = DiGraph::with_capacity(description.nodes.len(), description.edges.len());
        let mut indices = HashMap::with_capacity(description.nodes.len());
        for node in &description.nodes {
            let idx = graph.add_node(node.id.clone());
            indices.insert(node.id.clone(), idx);
        }

        // (from, to) -> kind; explicit wins over implicit for the same pair
        let mut merged: BTreeMap<(String, String), EdgeKind> = BTreeMap::new();
        let mut add = |from: &str, to: &str, kind: EdgeKind| {
            merged
                .entry((from.to_string(), to.to_string()))
                .and_modify(|existing| {
                    if kind == EdgeKind::Explicit {
                        *existing = EdgeKind::Explicit;
                    }
                })
                .or_insert(kind);
        };

        for edge in &description.edges {
            add(&edge.from, &edge.to, EdgeKind::Explicit);
        }
        for node in &description.nodes {
            for dep in &node.depends_on {
                add(dep, &node.id, EdgeKind::Explicit);
            }
        }

        // A node reading a future waits on every node the future resolves from
        for node in &description.nodes {
            for future_id in node.args.future_ids() {
                for origin in futures.terminal_origins(future_id)? {
                    add(&origin, &node.id, EdgeKind::Implicit);
                }
            }
        }

        // A future attached to one node but reading another orders them too
        for spec in &description.futures {
            let origins = futures.terminal_origins(&spec.id)?;
            if let Some(attached) = spec.attachment() {
                for origin in origins.iter().filter(|o| o.as_str() != attached) {
                    add(origin, attached, EdgeKind::Implicit);
                }
            }
        }

        for ((from, to), kind) in merged {
            let (Some(&a), Some(&b)) = (indices.get(&from), indices.get(&to)) else {
                return Err(GraphError::internal(format!(
                    "edge '{}' -> '{}' references a node outside the graph",
                    from, to
                )));
            };
            trace!(from = %from, to = %to, kind = ?kind, "Adding dependency edge");
            graph.add_edge(a, b, kind);
        }

        let deps = Self { graph, indices };
        if let Some(cycle) = deps.find_cycle() {
            return Err(GraphError::cyclic(cycle));
        }
        Ok(deps)
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    fn index(&self, node_id: &str) -> Option<NodeIndex> {
        self.indices.get(node_id).copied()
    }

    fn neighbors(&self, node_id: &str, dir: Direction) -> Vec<&str> {
        let Some(idx) = self.index(node_id) else {
            return Vec::new();
        };
        let mut ids: Vec<&str> = self
            .graph
            .neighbors_directed(idx, dir)
            .map(|n| self.graph[n].as_str())
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Direct predecessors, sorted
    pub fn predecessors(&self, node_id: &str) -> Vec<&str> {
        self.neighbors(node_id, Direction::Incoming)
    }

    /// Direct successors, sorted
    pub fn successors(&self, node_id: &str) -> Vec<&str> {
        self.neighbors(node_id, Direction::Outgoing)
    }

    pub fn in_degree(&self, node_id: &str) -> usize {
        self.index(node_id)
            .map(|idx| self.graph.neighbors_directed(idx, Direction::Incoming).count())
            .unwrap_or(0)
    }

    /// Nodes with no predecessors, in declaration order
    pub fn roots(&self) -> Vec<&str> {
        self.graph
            .node_indices()
            .filter(|&idx| {
                self.graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .map(|idx| self.graph[idx].as_str())
            .collect()
    }

    fn edges_of_kind(&self, kind: Option<EdgeKind>) -> Vec<(String, String)> {
        let mut edges: Vec<(String, String)> = self
            .graph
            .edge_references()
            .filter(|e| kind.map_or(true, |k| *e.weight() == k))
            .map(|e| {
                (
                    self.graph[e.source()].clone(),
                    self.graph[e.target()].clone(),
                )
            })
            .collect();
        edges.sort();
        edges
    }

    /// Every dependency edge as `(from, to)`, sorted and deduplicated
    pub fn merged_edges(&self) -> Vec<(String, String)> {
        self.edges_of_kind(None)
    }

    /// Edges that exist only because of future references
    pub fn implicit_edges(&self) -> Vec<(String, String)> {
        self.edges_of_kind(Some(EdgeKind::Implicit))
    }

    pub fn explicit_edges(&self) -> Vec<(String, String)> {
        self.edges_of_kind(Some(EdgeKind::Explicit))
    }

    /// A dependency-respecting order of all nodes
    pub fn topological_order(&self) -> Vec<&str> {
        let mut topo = petgraph::visit::Topo::new(&self.graph);
        let mut order = Vec::with_capacity(self.graph.node_count());
        while let Some(idx) = topo.next(&self.graph) {
            order.push(self.graph[idx].as_str());
        }
        order
    }

    /// Group nodes by longest distance from a root
    pub fn levels(&self) -> Vec<(usize, Vec<String>)> {
        let mut levels: Vec<Vec<String>> = Vec::new();
        let mut node_levels: HashMap<NodeIndex, usize> = HashMap::new();

        let mut topo = petgraph::visit::Topo::new(&self.graph);
        while let Some(idx) = topo.next(&self.graph) {
            let level = self
                .graph
                .edges_directed(idx, Direction::Incoming)
                .filter_map(|edge| node_levels.get(&edge.source()).map(|l| l + 1))
                .max()
                .unwrap_or(0);

            node_levels.insert(idx, level);
            while levels.len() <= level {
                levels.push(Vec::new());
            }
            levels[level].push(self.graph[idx].clone());
        }

        levels
            .into_iter()
            .enumerate()
            .map(|(level, mut nodes)| {
                nodes.sort();
                (level, nodes)
            })
            .collect()
    }

    /// Terminal node when the graph is one chain covering every node
    pub fn linear_chain_terminal(&self) -> Option<&str> {
        let n = self.graph.node_count();
        if n == 0 || self.graph.edge_count() != n - 1 {
            return None;
        }
        let roots = self.roots();
        if roots.len() != 1 {
            return None;
        }

        let mut current = self.index(roots[0])?;
        let mut seen = 1;
        loop {
            let mut next = self.graph.neighbors_directed(current, Direction::Outgoing);
            match (next.next(), next.next()) {
                (None, _) => break,
                (Some(succ), None) => {
                    if self
                        .graph
                        .neighbors_directed(succ, Direction::Incoming)
                        .count()
                        != 1
                    {
                        return None;
                    }
                    current = succ;
                    seen += 1;
                }
                (Some(_), Some(_)) => return None,
            }
        }

        (seen == n).then(|| self.graph[current].as_str())
    }

    /// Render as Graphviz DOT; implicit edges are dashed
    pub fn to_dot(&self) -> String {
        let mut dot = String::from("digraph Dependencies {\n");
        dot.push_str("  graph [rankdir=LR, nodesep=0.5, ranksep=1.0];\n");
        dot.push_str("  node [shape=box, style=rounded, fontname=\"Helvetica\"];\n\n");

        for idx in self.graph.node_indices() {
            dot.push_str(&format!("  \"{}\";\n", escape_dot(&self.graph[idx])));
        }
        if self.graph.edge_count() > 0 {
            dot.push('\n');
        }
        for (from, to) in self.merged_edges() {
            let kind = self
                .index(&from)
                .zip(self.index(&to))
                .and_then(|(a, b)| self.graph.find_edge(a, b))
                .map(|e| self.graph[e]);
            let style = match kind {
                Some(EdgeKind::Implicit) => " [style=dashed]",
                _ => "",
            };
            dot.push_str(&format!(
                "  \"{}\" -> \"{}\"{};\n",
                escape_dot(&from),
                escape_dot(&to),
                style
            ));
        }
        dot.push_str("}\n");
        dot
    }

    fn sorted_successors(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        let mut succs: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(idx, Direction::Outgoing)
            .collect();
        succs.sort_unstable();
        succs
    }

    /// First cycle found by an iterative DFS, as a closed node path
    fn find_cycle(&self) -> Option<Vec<String>> {
        let mut marks = vec![Mark::Unvisited; self.graph.node_count()];

        for start in self.graph.node_indices() {
            if marks[start.index()] != Mark::Unvisited {
                continue;
            }
            marks[start.index()] = Mark::OnPath(0);
            let mut path = vec![Frame {
                node: start,
                succs: self.sorted_successors(start),
                next: 0,
            }];

            while let Some(top) = path.last_mut() {
                let Some(&succ) = top.succs.get(top.next) else {
                    marks[top.node.index()] = Mark::Done;
                    path.pop();
                    continue;
                };
                top.next += 1;

                match marks[succ.index()] {
                    Mark::OnPath(depth) => {
                        let mut cycle: Vec<String> = path[depth..]
                            .iter()
                            .map(|frame| self.graph[frame.node].clone())
                            .collect();
                        cycle.push(self.graph[succ].clone());
                        return Some(cycle);
                    }
                    Mark::Unvisited => {
                        marks[succ.index()] = Mark::OnPath(path.len());
                        path.push(Frame {
                            node: succ,
                            succs: self.sorted_successors(succ),
                            next: 0,
                        });
                    }
                    Mark::Done => {}
                }
            }
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    /// Position on the current DFS path
    OnPath(usize),
    Done,
}

struct Frame {
    node: NodeIndex,
    succs: Vec<NodeIndex>,
    next: usize,
}

fn escape_dot(id: &str) -> String {
    id.replace('\\', "\\\\").replace('"', "\\\"")
}
