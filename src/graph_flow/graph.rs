//! Graph description (the serialisable node/edge/future lists) and the
//! validated, immutable [`Graph`] built from it.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::debug;

use super::dag_builder::DependencyGraph;
use super::future::{FutureDirective, FutureRegistry, FutureSpec};
use super::value::ValueTree;
use crate::core::config::PartialEngineConfig;
use crate::core::errors::{GraphError, Result};

/// A node in the graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// The unique identifier of the node
    pub id: String,
    /// Action name handed to the runner
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Raw arguments, possibly containing future markers
    #[serde(default)]
    pub args: ValueTree,
    /// Whether the node's result is exposed as a global output
    #[serde(default)]
    pub output: bool,
    /// Explicitly declared predecessors
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

impl NodeSpec {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            action: None,
            args: ValueTree::default(),
            output: false,
            depends_on: Vec::new(),
        }
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn with_args(mut self, args: ValueTree) -> Self {
        self.args = args;
        self
    }

    /// Set arguments from JSON wire form (`{"$future": id}` marks a future)
    pub fn with_json_args(mut self, args: Value) -> Self {
        self.args = ValueTree::from_json(args);
        self
    }

    pub fn as_output(mut self) -> Self {
        self.output = true;
        self
    }

    pub fn depends_on(mut self, node_id: impl Into<String>) -> Self {
        let node_id = node_id.into();
        if !self.depends_on.contains(&node_id) {
            self.depends_on.push(node_id);
        }
        self
    }
}

/// An explicit ordering edge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl EdgeSpec {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Flattened graph description, as shipped between processes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphDescription {
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
    #[serde(default)]
    pub futures: Vec<FutureSpec>,
    /// Overrides merged over the executor's config for runs of this graph
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<PartialEngineConfig>,
}

impl GraphDescription {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node
    pub fn node(mut self, node: NodeSpec) -> Self {
        self.nodes.push(node);
        self
    }

    /// Add an explicit edge `from -> to`
    pub fn edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.push(EdgeSpec::new(from, to));
        self
    }

    pub fn future(mut self, future: FutureSpec) -> Self {
        self.futures.push(future);
        self
    }

    pub fn with_config(mut self, config: PartialEngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Validate and build the graph
    pub fn build(self) -> Result<Graph> {
        Graph::from_description(self)
    }
}

/// A validated graph: unique node ids, resolvable references, acyclic merged dependencies
#[derive(Debug, Clone)]
pub struct Graph {
    description: GraphDescription,
    node_index: HashMap<String, usize>,
    futures: FutureRegistry,
    dependencies: DependencyGraph,
}

impl Graph {
    /// Validate a description and compute its merged dependency graph
    pub fn from_description(description: GraphDescription) -> Result<Self> {
        let node_index = index_nodes(&description.nodes)?;
        validate_edges(&description, &node_index)?;

        let mut futures = FutureRegistry::new();
        for spec in &description.futures {
            futures.insert(spec.clone())?;
        }
        validate_futures(&description, &node_index, &futures)?;

        let dependencies = DependencyGraph::build(&description, &futures)?;

        debug!(
            nodes = description.nodes.len(),
            futures = futures.len(),
            edges = dependencies.edge_count(),
            "Graph validated"
        );

        Ok(Self {
            description,
            node_index,
            futures,
            dependencies,
        })
    }

    pub fn description(&self) -> &GraphDescription {
        &self.description
    }

    /// Clone out the description this graph was built from
    pub fn to_description(&self) -> GraphDescription {
        self.description.clone()
    }

    pub fn nodes(&self) -> &[NodeSpec] {
        &self.description.nodes
    }

    pub fn node(&self, id: &str) -> Option<&NodeSpec> {
        self.node_index.get(id).map(|&i| &self.description.nodes[i])
    }

    pub fn contains_node(&self, id: &str) -> bool {
        self.node_index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.description.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.description.nodes.is_empty()
    }

    pub fn futures(&self) -> &FutureRegistry {
        &self.futures
    }

    pub fn dependencies(&self) -> &DependencyGraph {
        &self.dependencies
    }

    pub fn config_overrides(&self) -> Option<&PartialEngineConfig> {
        self.description.config.as_ref()
    }

    /// Nodes whose results populate the global-output map
    pub fn output_plan(&self, infer: bool) -> OutputPlan {
        let requested: Vec<String> = self
            .description
            .nodes
            .iter()
            .filter(|n| n.output)
            .map(|n| n.id.clone())
            .collect();

        if !requested.is_empty() {
            return OutputPlan::Requested(requested.into_iter().collect());
        }
        if infer {
            if let Some(terminal) = self.dependencies.linear_chain_terminal() {
                return OutputPlan::ChainTerminal(terminal.to_string());
            }
        }
        OutputPlan::Nothing
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.description)?)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.description)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let description: GraphDescription = serde_json::from_str(json)?;
        Self::from_description(description)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(&self.description)?)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let description: GraphDescription = serde_yaml::from_str(yaml)?;
        Self::from_description(description)
    }

    /// Loads a graph description from a YAML file
    pub fn load_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| GraphError::io(format!("read {}", path.display()), e))?;
        Self::from_yaml_str(&yaml)
    }
}

/// Which nodes contribute global outputs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputPlan {
    /// Nodes flagged `output`
    Requested(HashSet<String>),
    /// No node flagged; the graph is one chain and this is its last node
    ChainTerminal(String),
    Nothing,
}

fn index_nodes(nodes: &[NodeSpec]) -> Result<HashMap<String, usize>> {
    let mut index = HashMap::with_capacity(nodes.len());
    for (i, node) in nodes.iter().enumerate() {
        if node.id.is_empty() {
            return Err(GraphError::validation_field("node id cannot be empty", "nodes"));
        }
        if index.insert(node.id.clone(), i).is_some() {
            return Err(GraphError::validation_field(
                format!("duplicate node id '{}'", node.id),
                "nodes",
            ));
        }
    }
    Ok(index)
}

fn validate_edges(description: &GraphDescription, nodes: &HashMap<String, usize>) -> Result<()> {
    for edge in &description.edges {
        for end in [&edge.from, &edge.to] {
            if !nodes.contains_key(end) {
                return Err(GraphError::validation_field(
                    format!(
                        "edge '{}' -> '{}' references unknown node '{}'",
                        edge.from, edge.to, end
                    ),
                    "edges",
                ));
            }
        }
    }

    for node in &description.nodes {
        for dep in &node.depends_on {
            if !nodes.contains_key(dep) {
                return Err(GraphError::validation_field(
                    format!("node '{}' depends on unknown node '{}'", node.id, dep),
                    "depends_on",
                ));
            }
        }
    }
    Ok(())
}

fn validate_futures(
    description: &GraphDescription,
    nodes: &HashMap<String, usize>,
    futures: &FutureRegistry,
) -> Result<()> {
    for spec in &description.futures {
        if let Some(node) = &spec.node {
            if !nodes.contains_key(node) {
                return Err(GraphError::validation_field(
                    format!("future '{}' is attached to unknown node '{}'", spec.id, node),
                    "futures",
                ));
            }
        }

        match &spec.directive {
            FutureDirective::Trace { origin_node, .. } => {
                if !nodes.contains_key(origin_node) {
                    return Err(GraphError::validation_field(
                        format!("future '{}' traces unknown node '{}'", spec.id, origin_node),
                        "futures",
                    ));
                }
            }
            FutureDirective::Concat { .. } => {
                for nested in spec.directive.nested_futures() {
                    if !futures.contains(nested) {
                        return Err(GraphError::validation_field(
                            format!("future '{}' references unknown future '{}'", spec.id, nested),
                            "futures",
                        ));
                    }
                }
            }
        }
    }

    for node in &description.nodes {
        for future_id in node.args.future_ids() {
            if !futures.contains(future_id) {
                return Err(GraphError::validation_field(
                    format!(
                        "node '{}' references unknown future '{}'",
                        node.id, future_id
                    ),
                    "args",
                ));
            }
        }
    }
    Ok(())
}
