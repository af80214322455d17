//! End-to-end execution tests for the graph engine

use async_trait::async_trait;
use dagrun::{
    AccessPath, ChannelEventSink, ConcatItem, EngineConfig, FutureSpec, Graph, GraphDescription,
    GraphError, GraphExecutor, NodeCtx, NodeOutput, NodeRunner, NodeSpec, NodeState, RunEvent,
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Echoes its arguments plus `node`, logging start/end markers
#[derive(Default)]
struct ScriptedRunner {
    log: Mutex<Vec<String>>,
    calls: AtomicUsize,
    fail_on: Option<String>,
    delays_ms: HashMap<String, u64>,
}

impl ScriptedRunner {
    fn failing_on(node_id: &str) -> Self {
        Self {
            fail_on: Some(node_id.to_string()),
            ..Default::default()
        }
    }

    fn with_delay(mut self, node_id: &str, ms: u64) -> Self {
        self.delays_ms.insert(node_id.to_string(), ms);
        self
    }

    fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn position(&self, entry: &str) -> Option<usize> {
        self.log().iter().position(|e| e == entry)
    }

    fn started(&self, node_id: &str) -> bool {
        self.position(&format!("start:{node_id}")).is_some()
    }
}

#[async_trait]
impl NodeRunner for ScriptedRunner {
    async fn run(&self, ctx: NodeCtx) -> anyhow::Result<NodeOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.log.lock().unwrap().push(format!("start:{}", ctx.node_id));

        if let Some(ms) = self.delays_ms.get(&ctx.node_id) {
            tokio::time::sleep(Duration::from_millis(*ms)).await;
        }
        if self.fail_on.as_deref() == Some(ctx.node_id.as_str()) {
            anyhow::bail!("node {} exploded", ctx.node_id);
        }

        let mut local = match ctx.args {
            Value::Object(map) => map,
            other => {
                let mut map = serde_json::Map::new();
                map.insert("args".into(), other);
                map
            }
        };
        local.insert("node".into(), json!(ctx.node_id));

        self.log.lock().unwrap().push(format!("end:{}", ctx.node_id));
        Ok(NodeOutput::new(Value::Object(local)))
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn executor(workers: usize) -> GraphExecutor {
    GraphExecutor::new(EngineConfig::default().with_max_workers(workers)).unwrap()
}

/// a -> b -> c where b reads a.num and c reads b.node
fn chain() -> Graph {
    GraphDescription::new()
        .node(NodeSpec::new("a").with_json_args(json!({"num": 1})))
        .node(NodeSpec::new("b").with_json_args(json!({"num": {"$future": "a_num"}})))
        .node(NodeSpec::new("c").with_json_args(json!({"from": {"$future": "b_node"}})))
        .future(FutureSpec::trace("a_num", "a", AccessPath::root().key("num")))
        .future(FutureSpec::trace("b_node", "b", AccessPath::root().key("node")))
        .build()
        .unwrap()
}

/// a fans out to b and c, d joins them
fn diamond() -> Graph {
    GraphDescription::new()
        .node(NodeSpec::new("a").with_json_args(json!({"num": 1})))
        .node(NodeSpec::new("b").with_json_args(json!({"num": {"$future": "a_num"}})))
        .node(NodeSpec::new("c").with_json_args(json!({"num": {"$future": "a_num"}})))
        .node(
            NodeSpec::new("d")
                .with_json_args(json!({"joined": {"$future": "bc"}}))
                .as_output(),
        )
        .future(FutureSpec::trace("a_num", "a", AccessPath::root().key("num")))
        .future(FutureSpec::trace("b_node", "b", AccessPath::root().key("node")))
        .future(FutureSpec::trace("c_node", "c", AccessPath::root().key("node")))
        .future(FutureSpec::concat(
            "bc",
            vec![
                ConcatItem::future("b_node"),
                ConcatItem::literal("+"),
                ConcatItem::future("c_node"),
            ],
        ))
        .build()
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_nodes_start_after_all_predecessors() {
    init_tracing();
    let graph = Arc::new(diamond());
    let runner = Arc::new(ScriptedRunner::default().with_delay("b", 20).with_delay("c", 5));

    executor(4)
        .execute(Arc::clone(&graph), json!({}), runner.clone())
        .await
        .unwrap();

    for (from, to) in graph.dependencies().merged_edges() {
        let end = runner.position(&format!("end:{from}")).unwrap();
        let start = runner.position(&format!("start:{to}")).unwrap();
        assert!(end < start, "{to} started before {from} finished");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_chain_results_are_deterministic() {
    let graph = Arc::new(chain());
    let mut seen = Vec::new();
    for workers in 1..=4 {
        let runner = Arc::new(ScriptedRunner::default());
        let result = executor(workers)
            .execute(Arc::clone(&graph), json!({}), runner)
            .await
            .unwrap();
        seen.push(result.local);
    }

    assert_eq!(seen[0]["b"], json!({"num": 1, "node": "b"}));
    assert_eq!(seen[0]["c"], json!({"from": "b", "node": "c"}));
    for run in &seen[1..] {
        assert_eq!(run, &seen[0]);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_repeated_runs_agree() {
    let graph = Arc::new(
        GraphDescription::new()
            .node(NodeSpec::new("a").with_json_args(json!({"num": 1})))
            .node(
                NodeSpec::new("b").with_json_args(json!({"num": {"$future": "a_num"}, "str": "b"})),
            )
            .node(NodeSpec::new("c").with_json_args(json!({"str": {"$future": "c_str"}})))
            .future(FutureSpec::trace("a_num", "a", AccessPath::root().key("num")))
            .future(FutureSpec::trace("b_str", "b", AccessPath::root().key("str")))
            .future(FutureSpec::concat(
                "c_str",
                vec![ConcatItem::future("b_str"), ConcatItem::future("a_num")],
            ))
            .build()
            .unwrap(),
    );

    let mut runs = Vec::new();
    for _ in 0..5 {
        let result = executor(3)
            .execute(Arc::clone(&graph), json!({}), Arc::new(ScriptedRunner::default()))
            .await
            .unwrap();
        runs.push((result.local, result.global));
    }

    assert_eq!(runs[0].0["c"], json!({"str": "b1", "node": "c"}));
    assert!(runs.iter().all(|run| run == &runs[0]));
}

#[tokio::test]
async fn test_cycle_rejected_before_any_run() {
    let err = GraphDescription::new()
        .node(NodeSpec::new("a").depends_on("c"))
        .node(NodeSpec::new("b").depends_on("a"))
        .node(NodeSpec::new("c").depends_on("b"))
        .build()
        .unwrap_err();

    assert!(err.is_rejection());
    match err {
        GraphError::CyclicDependency { cycle } => {
            assert_eq!(cycle.first(), cycle.last());
            assert!(cycle.contains(&"b".to_string()));
        }
        other => panic!("expected a cycle, got {other}"),
    }
}

#[test]
fn test_future_cycle_through_arguments_rejected() {
    let err = GraphDescription::new()
        .node(NodeSpec::new("a").with_json_args(json!({"x": {"$future": "from_b"}})))
        .node(NodeSpec::new("b").with_json_args(json!({"x": {"$future": "from_a"}})))
        .future(FutureSpec::trace("from_a", "a", AccessPath::root()))
        .future(FutureSpec::trace("from_b", "b", AccessPath::root()))
        .build()
        .unwrap_err();

    assert!(matches!(err, GraphError::CyclicDependency { .. }));
}

#[tokio::test]
async fn test_linear_chain_infers_terminal_output() {
    let runner = Arc::new(ScriptedRunner::default());
    let result = executor(2)
        .execute(chain(), json!({}), runner)
        .await
        .unwrap();

    assert_eq!(result.global.len(), 1);
    assert_eq!(result.global("c"), result.local("c"));
    assert!(result.is_success());
}

#[tokio::test]
async fn test_inference_can_be_disabled() {
    let exec = GraphExecutor::new(EngineConfig::default().with_infer_outputs(false)).unwrap();
    let result = exec
        .execute(chain(), json!({}), Arc::new(ScriptedRunner::default()))
        .await
        .unwrap();
    assert!(result.global.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_diamond_runs_each_node_once_for_any_pool_size() {
    let graph = Arc::new(diamond());
    for workers in 1..=6 {
        let runner = Arc::new(ScriptedRunner::default());
        let result = executor(workers)
            .execute(Arc::clone(&graph), json!({}), runner.clone())
            .await
            .unwrap();

        assert_eq!(runner.calls.load(Ordering::SeqCst), 4, "workers = {workers}");
        assert_eq!(result.local.len(), 4);
        assert_eq!(result.global("d"), Some(&json!({"joined": "b+c", "node": "d"})));
        assert_eq!(result.state("d"), Some(NodeState::Completed));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failure_keeps_partial_results() {
    init_tracing();
    let runner = Arc::new(
        ScriptedRunner::failing_on("b")
            .with_delay("b", 50)
            .with_delay("c", 2000),
    );
    let err = executor(4)
        .execute(diamond(), json!({}), runner.clone())
        .await
        .unwrap_err();

    assert_eq!(err.failed_node(), Some("b"));
    assert!(err.to_string().contains("node b exploded"));
    assert!(!runner.started("d"));

    let partial = err.partial_result().unwrap();
    assert_eq!(partial.local("a"), Some(&json!({"num": 1, "node": "a"})));
    assert_eq!(partial.state("b"), Some(NodeState::Failed));
    assert_eq!(partial.state("c"), Some(NodeState::Cancelled));
    assert_eq!(partial.state("d"), Some(NodeState::Pending));
    assert!(!partial.is_success());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_in_flight_nodes_drain_without_cancellation() {
    let exec = GraphExecutor::new(
        EngineConfig::default()
            .with_max_workers(4)
            .with_cancel_in_flight(false),
    )
    .unwrap();
    let runner = Arc::new(
        ScriptedRunner::failing_on("b")
            .with_delay("b", 20)
            .with_delay("c", 100),
    );

    let err = exec
        .execute(diamond(), json!({}), runner.clone())
        .await
        .unwrap_err();
    let partial = err.partial_result().unwrap();

    assert_eq!(partial.state("c"), Some(NodeState::Completed));
    assert!(partial.local("c").is_some());
    assert!(!runner.started("d"));
}

#[tokio::test]
async fn test_concat_of_traces() {
    let graph = GraphDescription::new()
        .node(NodeSpec::new("a").with_json_args(json!({"num": 1})))
        .node(NodeSpec::new("b").with_json_args(json!({"nested": [{"k": "x"}, {"k": "y"}]})))
        .node(NodeSpec::new("c").with_json_args(json!({"label": {"$future": "label"}})))
        .future(FutureSpec::trace("a_num", "a", AccessPath::parse("num").unwrap()))
        .future(FutureSpec::trace("b_str", "b", AccessPath::parse("nested[1].k").unwrap()))
        .future(FutureSpec::concat(
            "label",
            vec![
                ConcatItem::future("b_str"),
                ConcatItem::literal("-"),
                ConcatItem::future("a_num"),
            ],
        ))
        .build()
        .unwrap();

    let result = executor(2)
        .execute(graph, json!({}), Arc::new(ScriptedRunner::default()))
        .await
        .unwrap();
    assert_eq!(result.local("c"), Some(&json!({"label": "y-1", "node": "c"})));
}

#[tokio::test]
async fn test_missing_path_fails_run() {
    let graph = GraphDescription::new()
        .node(NodeSpec::new("a").with_json_args(json!({"num": 1})))
        .node(NodeSpec::new("b").with_json_args(json!({"x": {"$future": "deep"}})))
        .future(FutureSpec::trace("deep", "a", AccessPath::parse("num.missing").unwrap()))
        .build()
        .unwrap();

    let runner = Arc::new(ScriptedRunner::default());
    let err = executor(2)
        .execute(graph, json!({}), runner.clone())
        .await
        .unwrap_err();

    assert!(matches!(err, GraphError::PathNotFound { .. }));
    assert!(!runner.started("b"));

    let partial = err.partial_result().unwrap();
    assert_eq!(partial.local("a"), Some(&json!({"num": 1, "node": "a"})));
    assert_eq!(partial.state("b"), Some(NodeState::Failed));
}

#[tokio::test]
async fn test_long_chain_runs_to_completion() {
    let mut desc = GraphDescription::new().node(NodeSpec::new("n0"));
    for i in 1..20_000 {
        desc = desc.node(NodeSpec::new(format!("n{i}")).depends_on(format!("n{}", i - 1)));
    }
    let graph = desc.build().unwrap();
    assert_eq!(graph.dependencies().topological_order().len(), 20_000);

    let runner = Arc::new(ScriptedRunner::default());
    let result = executor(2)
        .execute(graph, json!({}), runner.clone())
        .await
        .unwrap();

    assert_eq!(runner.calls.load(Ordering::SeqCst), 20_000);
    assert_eq!(result.global("n19999"), Some(&json!({"node": "n19999"})));
}

#[tokio::test]
async fn test_deeply_nested_concat_resolves() {
    let mut desc = GraphDescription::new()
        .node(NodeSpec::new("a").with_json_args(json!({"tag": "x"})))
        .node(NodeSpec::new("b").with_json_args(json!({"label": {"$future": "c600"}})))
        .future(FutureSpec::trace("c0", "a", AccessPath::root().key("tag")));
    for i in 1..=600 {
        desc = desc.future(FutureSpec::concat(
            format!("c{i}"),
            vec![ConcatItem::future(format!("c{}", i - 1)), ConcatItem::literal(".")],
        ));
    }

    let result = executor(2)
        .execute(desc.build().unwrap(), json!({}), Arc::new(ScriptedRunner::default()))
        .await
        .unwrap();

    let expected = format!("x{}", ".".repeat(600));
    assert_eq!(result.local("b"), Some(&json!({"label": expected, "node": "b"})));
}

/// Tracks the highest number of runners in flight at once
#[derive(Default)]
struct PeakRunner {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl NodeRunner for PeakRunner {
    async fn run(&self, ctx: NodeCtx) -> anyhow::Result<NodeOutput> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(NodeOutput::new(json!(ctx.node_id)))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_worker_pool_bounds_concurrency() {
    let mut desc = GraphDescription::new();
    for i in 0..20 {
        desc = desc.node(NodeSpec::new(format!("w{i}")));
    }
    let runner = Arc::new(PeakRunner::default());

    let result = executor(3)
        .execute(desc.build().unwrap(), json!({}), runner.clone())
        .await
        .unwrap();

    assert_eq!(result.local.len(), 20);
    assert_eq!(runner.peak.load(Ordering::SeqCst), 3);
    assert_eq!(runner.in_flight.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_initial_args_reach_roots_only() {
    let runner = Arc::new(ScriptedRunner::default());
    let result = executor(1)
        .execute(chain(), json!({"num": 99, "seed": "s"}), runner)
        .await
        .unwrap();

    assert_eq!(result.local("a"), Some(&json!({"num": 1, "seed": "s", "node": "a"})));
    assert_eq!(result.local("b"), Some(&json!({"num": 1, "node": "b"})));
}

#[tokio::test]
async fn test_events_bracket_the_run() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let exec = executor(2).with_event_sink(Arc::new(ChannelEventSink::new(tx)));
    let result = exec
        .execute(diamond(), json!({}), Arc::new(ScriptedRunner::default()))
        .await
        .unwrap();
    drop(exec);

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }

    assert!(matches!(
        events.first().map(|e| &e.event),
        Some(RunEvent::RunStarted { node_count: 4, .. })
    ));
    assert!(matches!(
        events.last().map(|e| &e.event),
        Some(RunEvent::RunFinished { success: true, completed: 4 })
    ));
    let started = events
        .iter()
        .filter(|e| matches!(e.event, RunEvent::NodeStarted { .. }))
        .count();
    assert_eq!(started, 4);
    assert!(events.iter().all(|e| e.run_id == result.run_id));
    let mut sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
    sequences.sort_unstable();
    sequences.dedup();
    assert_eq!(sequences.len(), events.len());
}
