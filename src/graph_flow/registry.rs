//! Name-keyed registry of [`NodeAction`]s that acts as a [`NodeRunner`].

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

use super::action::{NodeAction, NodeCtx, NodeOutput, NodeRunner};
use super::graph::Graph;
use crate::core::errors::{GraphError, Result};

/// Registry for node actions
#[derive(Clone, Default)]
pub struct ActionRegistry {
    actions: Arc<DashMap<String, Arc<dyn NodeAction>>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an action under its own name, replacing any previous one
    pub fn register(&self, action: Arc<dyn NodeAction>) {
        self.actions.insert(action.name().to_string(), action);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn NodeAction>> {
        self.actions.get(name).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    /// List all registered action names, sorted
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.actions.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Fail if any node lacks an action or names one that isn't registered
    pub fn validate_actions(&self, graph: &Graph) -> Result<()> {
        let mut problems = Vec::new();
        for node in graph.nodes() {
            match &node.action {
                None => problems.push(format!("node '{}' has no action", node.id)),
                Some(action) if !self.contains(action) => problems.push(format!(
                    "node '{}' uses unregistered action '{}'",
                    node.id, action
                )),
                Some(_) => {}
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(GraphError::validation_field(problems.join("; "), "action"))
        }
    }
}

#[async_trait]
impl NodeRunner for ActionRegistry {
    async fn run(&self, ctx: NodeCtx) -> anyhow::Result<NodeOutput> {
        let name = ctx
            .action
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("Node '{}' has no action", ctx.node_id))?;
        let action = self
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("Action '{}' not registered", name))?;

        action.validate_args(&ctx.args)?;
        action.execute(&ctx).await
    }
}
