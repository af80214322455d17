use anyhow::{Context, Result};
use async_trait::async_trait;
use dagrun::{
    ActionRegistry, EngineConfig, Graph, GraphExecutor, LoggingEventSink, NodeAction, NodeCtx,
    NodeOutput,
};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

// Example NodeAction implementations

struct Add;

#[async_trait]
impl NodeAction for Add {
    fn name(&self) -> &str {
        "add"
    }

    async fn execute(&self, ctx: &NodeCtx) -> Result<NodeOutput> {
        let num1: f64 = ctx.get_arg("num1")?;
        let num2: f64 = ctx.get_arg("num2")?;
        Ok(NodeOutput::new(json!({ "result": num1 + num2 })))
    }
}

struct Square;

#[async_trait]
impl NodeAction for Square {
    fn name(&self) -> &str {
        "square"
    }

    async fn execute(&self, ctx: &NodeCtx) -> Result<NodeOutput> {
        let value: f64 = ctx.get_arg("value")?;
        Ok(NodeOutput::new(json!({ "result": value * value })))
    }
}

struct Triple;

#[async_trait]
impl NodeAction for Triple {
    fn name(&self) -> &str {
        "triple"
    }

    async fn execute(&self, ctx: &NodeCtx) -> Result<NodeOutput> {
        let value: f64 = ctx
            .get_arg("value")
            .context("triple needs a numeric 'value'")?;
        let label: Option<String> = ctx.get_arg_opt("label")?;
        Ok(NodeOutput::new(json!({ "result": value * 3.0, "label": label })))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("pipeline.yaml"));
    let graph = Graph::load_yaml_file(&path)
        .with_context(|| format!("loading {}", path.display()))?;

    let registry = ActionRegistry::new();
    registry.register(Arc::new(Add));
    registry.register(Arc::new(Square));
    registry.register(Arc::new(Triple));
    registry.validate_actions(&graph)?;

    info!(levels = ?graph.dependencies().levels(), "Graph loaded");

    let executor = GraphExecutor::new(EngineConfig::default())?
        .with_event_sink(Arc::new(LoggingEventSink));
    let result = executor
        .execute(graph, json!({ "num1": 10.0, "num2": 20.0 }), Arc::new(registry))
        .await?;

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
