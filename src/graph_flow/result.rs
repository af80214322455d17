use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use super::scheduler::NodeState;

/// Outcome of one graph run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphResult {
    pub run_id: String,
    /// Node id → local result, in completion order
    pub local: Map<String, Value>,
    /// Output node id → global result
    pub global: Map<String, Value>,
    /// Node id → usage record, for nodes whose runner reported one
    #[serde(default)]
    pub usage: Map<String, Value>,
    /// Final lifecycle state of every node
    pub node_states: BTreeMap<String, NodeState>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl GraphResult {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            local: Map::new(),
            global: Map::new(),
            usage: Map::new(),
            node_states: BTreeMap::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn local(&self, node_id: &str) -> Option<&Value> {
        self.local.get(node_id)
    }

    pub fn global(&self, node_id: &str) -> Option<&Value> {
        self.global.get(node_id)
    }

    pub fn usage(&self, node_id: &str) -> Option<&Value> {
        self.usage.get(node_id)
    }

    pub fn state(&self, node_id: &str) -> Option<NodeState> {
        self.node_states.get(node_id).copied()
    }

    /// True when every node completed
    pub fn is_success(&self) -> bool {
        self.node_states
            .values()
            .all(|s| matches!(s, NodeState::Completed))
    }

    /// Ids of completed nodes, in completion order
    pub fn completed_nodes(&self) -> impl Iterator<Item = &str> {
        self.local.keys().map(|k| k.as_str())
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.finished_at
            .map(|end| (end - self.started_at).num_milliseconds())
    }

    pub(crate) fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }
}
