//! Per-run scheduling state: unmet-predecessor counters, node lifecycle,
//! and the results recorded so far. The executor keeps exactly one of these
//! behind a lock; every transition goes through it.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::action::NodeOutput;
use super::graph::{Graph, OutputPlan};
use super::resolver::ArgumentResolver;
use super::result::GraphResult;
use crate::core::errors::GraphError;

/// Node lifecycle within one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    /// Was running when another node failed and got dropped
    Cancelled,
}

impl NodeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// A node whose predecessors all completed, with its forward arguments
#[derive(Debug, Clone, PartialEq)]
pub struct ReadyNode {
    pub node_id: String,
    pub args: Value,
}

/// First failure of a run
#[derive(Debug)]
pub enum RunFailure {
    /// The runner returned an error
    Runner {
        node_id: String,
        error: anyhow::Error,
    },
    /// Forward arguments could not be resolved
    Resolution { node_id: String, error: GraphError },
}

impl RunFailure {
    pub fn node_id(&self) -> &str {
        match self {
            Self::Runner { node_id, .. } | Self::Resolution { node_id, .. } => node_id,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub pending: usize,
    pub ready: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

pub struct SchedulerState {
    graph: Arc<Graph>,
    initial_args: Value,
    output_plan: OutputPlan,
    unmet: HashMap<String, usize>,
    remaining: usize,
    admitting: bool,
    failure: Option<RunFailure>,
    result: GraphResult,
}

impl SchedulerState {
    pub fn new(
        graph: Arc<Graph>,
        run_id: impl Into<String>,
        initial_args: Value,
        output_plan: OutputPlan,
    ) -> Self {
        let mut result = GraphResult::new(run_id);
        let mut unmet = HashMap::with_capacity(graph.len());
        for node in graph.nodes() {
            unmet.insert(node.id.clone(), graph.dependencies().in_degree(&node.id));
            result.node_states.insert(node.id.clone(), NodeState::Pending);
        }

        Self {
            remaining: graph.len(),
            graph,
            initial_args,
            output_plan,
            unmet,
            admitting: true,
            failure: None,
            result,
        }
    }

    /// Mark every root ready and return them in declaration order
    pub fn seed(&mut self) -> Vec<ReadyNode> {
        let graph = Arc::clone(&self.graph);
        let mut ready = Vec::new();
        for root in graph.dependencies().roots() {
            match self.prepare(root) {
                Some(node) => ready.push(node),
                None => break,
            }
        }
        ready
    }

    fn prepare(&mut self, node_id: &str) -> Option<ReadyNode> {
        let graph = Arc::clone(&self.graph);
        let node = graph.node(node_id)?;
        let resolver = ArgumentResolver::new(graph.futures());
        let initial = (graph.dependencies().in_degree(node_id) == 0).then_some(&self.initial_args);

        match resolver.resolve_node_args(&node.args, &self.result.local, initial) {
            Ok(args) => {
                self.set_state(node_id, NodeState::Ready);
                Some(ReadyNode {
                    node_id: node_id.to_string(),
                    args,
                })
            }
            Err(error) => {
                warn!(node_id, error = %error, "Failed to resolve forward arguments");
                self.set_state(node_id, NodeState::Failed);
                self.stop_admitting(RunFailure::Resolution {
                    node_id: node_id.to_string(),
                    error,
                });
                None
            }
        }
    }

    fn set_state(&mut self, node_id: &str, state: NodeState) {
        if let Some(slot) = self.result.node_states.get_mut(node_id) {
            *slot = state;
        }
    }

    fn stop_admitting(&mut self, failure: RunFailure) {
        self.admitting = false;
        if self.failure.is_none() {
            self.failure = Some(failure);
        }
    }

    pub fn state(&self, node_id: &str) -> Option<NodeState> {
        self.result.state(node_id)
    }

    /// Claim a ready node for execution; refused once the run stopped admitting work
    pub fn start(&mut self, node_id: &str) -> bool {
        if !self.admitting || self.state(node_id) != Some(NodeState::Ready) {
            return false;
        }
        self.set_state(node_id, NodeState::Running);
        true
    }

    /// Record a completion and return successors that just became ready
    pub fn complete(&mut self, node_id: &str, output: NodeOutput) -> Vec<ReadyNode> {
        let NodeOutput {
            local,
            global,
            usage,
        } = output;

        match &self.output_plan {
            OutputPlan::Requested(ids) if ids.contains(node_id) => {
                let global = global.unwrap_or_else(|| local.clone());
                self.result.global.insert(node_id.to_string(), global);
            }
            OutputPlan::ChainTerminal(terminal) if terminal == node_id => {
                self.result.global.insert(node_id.to_string(), local.clone());
            }
            _ => {}
        }
        if let Some(usage) = usage {
            self.result.usage.insert(node_id.to_string(), usage);
        }
        self.result.local.insert(node_id.to_string(), local);
        self.set_state(node_id, NodeState::Completed);
        self.remaining = self.remaining.saturating_sub(1);

        if !self.admitting {
            return Vec::new();
        }

        let graph = Arc::clone(&self.graph);
        let mut ready = Vec::new();
        for succ in graph.dependencies().successors(node_id) {
            let Some(count) = self.unmet.get_mut(succ) else {
                continue;
            };
            *count = count.saturating_sub(1);
            if *count == 0 {
                debug!(node_id = succ, after = node_id, "Node ready");
                match self.prepare(succ) {
                    Some(node) => ready.push(node),
                    None => return Vec::new(),
                }
            }
        }
        ready
    }

    /// Record a runner failure; only the first one is kept
    pub fn fail(&mut self, node_id: &str, error: anyhow::Error) {
        self.set_state(node_id, NodeState::Failed);
        self.stop_admitting(RunFailure::Runner {
            node_id: node_id.to_string(),
            error,
        });
    }

    pub fn cancel(&mut self, node_id: &str) {
        self.set_state(node_id, NodeState::Cancelled);
    }

    /// Nothing more will be scheduled
    pub fn is_done(&self) -> bool {
        self.remaining == 0 || !self.admitting
    }

    pub fn has_failed(&self) -> bool {
        self.failure.is_some()
    }

    pub fn stats(&self) -> SchedulerStats {
        let mut stats = SchedulerStats::default();
        for state in self.result.node_states.values() {
            match state {
                NodeState::Pending => stats.pending += 1,
                NodeState::Ready => stats.ready += 1,
                NodeState::Running => stats.running += 1,
                NodeState::Completed => stats.completed += 1,
                NodeState::Failed => stats.failed += 1,
                NodeState::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    /// Take the recorded result and first failure out of the state
    pub fn take_outcome(&mut self) -> (GraphResult, Option<RunFailure>) {
        let run_id = self.result.run_id.clone();
        let result = std::mem::replace(&mut self.result, GraphResult::new(run_id));
        (result, self.failure.take())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph_flow::future::{AccessPath, FutureSpec};
    use crate::graph_flow::graph::{GraphDescription, NodeSpec};
    use serde_json::json;

    fn diamond() -> Arc<Graph> {
        Arc::new(
            GraphDescription::new()
                .node(NodeSpec::new("a"))
                .node(NodeSpec::new("b").with_json_args(json!({"v": {"$future": "fa"}})))
                .node(NodeSpec::new("c").depends_on("a"))
                .node(NodeSpec::new("d").depends_on("b").depends_on("c").as_output())
                .future(FutureSpec::trace("fa", "a", AccessPath::root().key("v")))
                .build()
                .unwrap(),
        )
    }

    fn state(graph: Arc<Graph>) -> SchedulerState {
        let plan = graph.output_plan(true);
        SchedulerState::new(graph, "run", json!({"seed": 1}), plan)
    }

    #[test]
    fn test_seed_returns_roots_with_initial_args() {
        let mut st = state(diamond());
        let ready = st.seed();
        assert_eq!(
            ready,
            vec![ReadyNode {
                node_id: "a".into(),
                args: json!({"seed": 1})
            }]
        );
        assert_eq!(st.state("a"), Some(NodeState::Ready));
        assert_eq!(st.state("d"), Some(NodeState::Pending));
    }

    #[test]
    fn test_join_waits_for_all_predecessors() {
        let mut st = state(diamond());
        st.seed();
        assert!(st.start("a"));

        let ready = st.complete("a", NodeOutput::new(json!({"v": 5})));
        let ids: Vec<&str> = ready.iter().map(|r| r.node_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert_eq!(ready[0].args, json!({"v": 5}));

        assert!(st.start("b"));
        assert!(st.complete("b", NodeOutput::new(json!(1))).is_empty());
        assert!(st.start("c"));
        let ready = st.complete("c", NodeOutput::new(json!(2)));
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].node_id, "d");

        assert!(st.start("d"));
        st.complete("d", NodeOutput::new(json!("l")).with_global(json!("g")));
        assert!(st.is_done());

        let (result, failure) = st.take_outcome();
        assert!(failure.is_none());
        assert!(result.is_success());
        assert_eq!(result.global("d"), Some(&json!("g")));
        assert_eq!(result.local("d"), Some(&json!("l")));
    }

    #[test]
    fn test_failure_stops_admission() {
        let mut st = state(diamond());
        st.seed();
        st.start("a");
        st.complete("a", NodeOutput::new(json!({"v": 5})));
        st.start("b");
        st.start("c");
        st.fail("b", anyhow::anyhow!("boom"));

        assert!(st.is_done());
        assert!(st.complete("c", NodeOutput::new(json!(2))).is_empty());
        assert_eq!(st.state("d"), Some(NodeState::Pending));

        let stats = st.stats();
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.failed, 1);

        let (result, failure) = st.take_outcome();
        assert_eq!(failure.map(|f| f.node_id().to_string()), Some("b".to_string()));
        assert_eq!(result.local("a"), Some(&json!({"v": 5})));
    }

    #[test]
    fn test_resolution_failure_is_recorded() {
        let mut st = state(diamond());
        st.seed();
        st.start("a");
        let ready = st.complete("a", NodeOutput::new(json!({"other": 1})));

        assert!(ready.is_empty());
        assert_eq!(st.state("b"), Some(NodeState::Failed));
        let (_, failure) = st.take_outcome();
        assert!(matches!(
            failure,
            Some(RunFailure::Resolution {
                error: GraphError::PathNotFound { .. },
                ..
            })
        ));
    }

    #[test]
    fn test_start_requires_ready() {
        let mut st = state(diamond());
        st.seed();
        assert!(!st.start("d"));
        assert!(st.start("a"));
        assert!(!st.start("a"));
    }
}
