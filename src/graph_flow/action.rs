//! Node runners: the pluggable unit of work the executor calls once per node.

use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;

/// Context handed to a runner (immutable, clonable)
#[derive(Debug, Clone)]
pub struct NodeCtx {
    pub run_id: String,
    pub node_id: String,
    /// Action name declared on the node, if any
    pub action: Option<String>,
    /// Fully resolved forward arguments
    pub args: Value,
}

impl NodeCtx {
    pub fn new(run_id: impl Into<String>, node_id: impl Into<String>, args: Value) -> Self {
        Self {
            run_id: run_id.into(),
            node_id: node_id.into(),
            action: None,
            args,
        }
    }

    pub fn with_action(mut self, action: Option<String>) -> Self {
        self.action = action;
        self
    }

    /// Get argument value by key
    pub fn get_arg<T: serde::de::DeserializeOwned>(&self, key: &str) -> anyhow::Result<T> {
        let value = self
            .args
            .get(key)
            .ok_or_else(|| anyhow::anyhow!("Argument '{}' not found", key))?;
        serde_json::from_value(value.clone())
            .map_err(|e| anyhow::anyhow!("Failed to deserialize argument '{}': {}", key, e))
    }

    /// Get optional argument value
    pub fn get_arg_opt<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> anyhow::Result<Option<T>> {
        match self.args.get(key) {
            Some(value) if !value.is_null() => {
                let parsed = serde_json::from_value(value.clone()).map_err(|e| {
                    anyhow::anyhow!("Failed to deserialize argument '{}': {}", key, e)
                })?;
                Ok(Some(parsed))
            }
            _ => Ok(None),
        }
    }
}

/// What a runner produced for one node
#[derive(Debug, Clone, PartialEq)]
pub struct NodeOutput {
    /// Recorded as the node's local result; futures trace into it
    pub local: Value,
    /// Published for output nodes instead of `local` when set
    pub global: Option<Value>,
    pub usage: Option<Value>,
}

impl NodeOutput {
    pub fn new(local: Value) -> Self {
        Self {
            local,
            global: None,
            usage: None,
        }
    }

    pub fn with_global(mut self, global: Value) -> Self {
        self.global = Some(global);
        self
    }

    pub fn with_usage(mut self, usage: Value) -> Self {
        self.usage = Some(usage);
        self
    }
}

impl From<Value> for NodeOutput {
    fn from(local: Value) -> Self {
        NodeOutput::new(local)
    }
}

/// Executes one node given its resolved arguments
#[async_trait]
pub trait NodeRunner: Send + Sync {
    async fn run(&self, ctx: NodeCtx) -> anyhow::Result<NodeOutput>;
}

/// Adapts an async closure into a [`NodeRunner`]
pub struct FnRunner<F> {
    func: F,
}

impl<F> FnRunner<F> {
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F, Fut> NodeRunner for FnRunner<F>
where
    F: Fn(NodeCtx) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<NodeOutput>> + Send + 'static,
{
    async fn run(&self, ctx: NodeCtx) -> anyhow::Result<NodeOutput> {
        (self.func)(ctx).await
    }
}

/// Shorthand for [`FnRunner::new`]
pub fn runner_fn<F, Fut>(func: F) -> FnRunner<F>
where
    F: Fn(NodeCtx) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<NodeOutput>> + Send + 'static,
{
    FnRunner::new(func)
}

/// A named action, dispatched by [`ActionRegistry`](super::registry::ActionRegistry)
#[async_trait]
pub trait NodeAction: Send + Sync {
    /// Get the name of this action
    fn name(&self) -> &str;

    async fn execute(&self, ctx: &NodeCtx) -> anyhow::Result<NodeOutput>;

    /// Optional: reject arguments before the action runs
    fn validate_args(&self, _args: &Value) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Returns its arguments as the local result
pub struct EchoAction;

#[async_trait]
impl NodeAction for EchoAction {
    fn name(&self) -> &str {
        "echo"
    }

    async fn execute(&self, ctx: &NodeCtx) -> anyhow::Result<NodeOutput> {
        tracing::debug!("Echo action: {} with args: {}", ctx.node_id, ctx.args);
        Ok(NodeOutput::new(ctx.args.clone()))
    }
}
