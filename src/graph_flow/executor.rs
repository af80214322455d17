//! Worker-pool executor.
//!
//! A run seeds the root nodes into an unbounded queue and starts
//! `max_workers` loops that share its receiver. Each completion updates the
//! [`SchedulerState`] under one lock and enqueues whatever became ready in
//! the same critical section. The first failure stops admission and, when
//! `cancel_in_flight` is set, drops the runners still in progress.

use futures::FutureExt;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::action::{NodeCtx, NodeRunner};
use super::events::{EventSink, RunEmitter, RunEvent};
use super::graph::Graph;
use super::result::GraphResult;
use super::scheduler::{ReadyNode, RunFailure, SchedulerState};
use crate::core::config::EngineConfig;
use crate::core::errors::{GraphError, Result};

/// Runs validated graphs against a [`NodeRunner`]
#[derive(Clone, Default)]
pub struct GraphExecutor {
    config: EngineConfig,
    event_sink: Option<Arc<dyn EventSink>>,
}

impl GraphExecutor {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            event_sink: None,
        })
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = Some(sink);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Execute every node once, respecting dependencies
    ///
    /// Root nodes receive `initial_args` shallow-merged under their own
    /// arguments. On a runner failure the error carries the partial result.
    pub async fn execute(
        &self,
        graph: impl Into<Arc<Graph>>,
        initial_args: Value,
        runner: Arc<dyn NodeRunner>,
    ) -> Result<GraphResult> {
        self.execute_until(graph, initial_args, runner, CancellationToken::new())
            .await
    }

    /// Like [`execute`](Self::execute), but stops early once `cancel` fires
    #[instrument(name = "graph_run", skip_all)]
    pub async fn execute_until(
        &self,
        graph: impl Into<Arc<Graph>>,
        initial_args: Value,
        runner: Arc<dyn NodeRunner>,
        cancel: CancellationToken,
    ) -> Result<GraphResult> {
        let graph: Arc<Graph> = graph.into();
        let config = match graph.config_overrides() {
            Some(overrides) => EngineConfig::merge(&self.config, overrides)?,
            None => self.config.clone(),
        };

        let run_id = Uuid::new_v4().to_string();
        let emitter = RunEmitter::new(run_id.clone(), self.event_sink.clone());

        if graph.is_empty() {
            emitter.emit(RunEvent::RunFinished {
                success: true,
                completed: 0,
            });
            let mut result = GraphResult::new(run_id);
            result.finish();
            return Ok(result);
        }

        let workers = config.max_workers.min(graph.len());
        info!(run_id = %run_id, workers, "Starting graph run");
        emitter.emit(RunEvent::RunStarted {
            node_count: graph.len(),
            workers,
        });

        let plan = graph.output_plan(config.infer_outputs);
        let mut state = SchedulerState::new(Arc::clone(&graph), run_id.clone(), initial_args, plan);
        let (tx, rx) = mpsc::unbounded_channel();
        let stop = cancel.child_token();
        for node in state.seed() {
            let _ = tx.send(node);
        }
        if state.is_done() {
            stop.cancel();
        }

        let run = Arc::new(RunContext {
            run_id,
            graph,
            config,
            runner,
            state: Mutex::new(state),
            queue_tx: tx,
            queue_rx: Mutex::new(rx),
            stop,
            abort: cancel.child_token(),
            emitter,
        });

        let handles: Vec<_> = (0..workers)
            .map(|worker| tokio::spawn(worker_loop(Arc::clone(&run), worker)))
            .collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task ended abnormally");
            }
        }

        let (mut result, failure) = run.state.lock().await.take_outcome();
        result.finish();
        run.emitter.emit(RunEvent::RunFinished {
            success: failure.is_none(),
            completed: result.local.len(),
        });

        match failure {
            None if cancel.is_cancelled() && !result.is_success() => {
                warn!(run_id = %run.run_id, "Graph run cancelled");
                let operation = format!("graph run {}", run.run_id);
                Err(GraphError::cancelled(operation).with_partial(result))
            }
            None => {
                info!(
                    run_id = %run.run_id,
                    completed = result.local.len(),
                    "Graph run finished"
                );
                Ok(result)
            }
            Some(RunFailure::Runner { node_id, error }) => {
                warn!(run_id = %run.run_id, node_id = %node_id, "Graph run failed");
                Err(GraphError::node_execution(node_id, error, result))
            }
            Some(RunFailure::Resolution { node_id, error }) => {
                warn!(
                    run_id = %run.run_id,
                    node_id = %node_id,
                    error = %error,
                    "Graph run failed resolving arguments"
                );
                Err(error.with_partial(result))
            }
        }
    }
}

struct RunContext {
    run_id: String,
    graph: Arc<Graph>,
    config: EngineConfig,
    runner: Arc<dyn NodeRunner>,
    state: Mutex<SchedulerState>,
    queue_tx: UnboundedSender<ReadyNode>,
    queue_rx: Mutex<UnboundedReceiver<ReadyNode>>,
    /// Fires when nothing more will be scheduled
    stop: CancellationToken,
    /// Fires on the first failure
    abort: CancellationToken,
    emitter: RunEmitter,
}

async fn worker_loop(run: Arc<RunContext>, worker: usize) {
    debug!(worker, "Worker started");
    loop {
        let next = {
            let mut rx = run.queue_rx.lock().await;
            tokio::select! {
                biased;
                _ = run.stop.cancelled() => None,
                node = rx.recv() => node,
            }
        };
        let Some(node) = next else {
            break;
        };
        run.execute_node(node, worker).await;
    }
    debug!(worker, "Worker stopped");
}

impl RunContext {
    async fn execute_node(&self, node: ReadyNode, worker: usize) {
        let ReadyNode { node_id, args } = node;
        if !self.state.lock().await.start(&node_id) {
            debug!(node_id = %node_id, "Skipping node; run no longer admitting work");
            return;
        }

        self.emitter.emit(RunEvent::NodeStarted {
            node_id: node_id.clone(),
            worker,
        });
        let action = self.graph.node(&node_id).and_then(|n| n.action.clone());
        let ctx = NodeCtx::new(self.run_id.clone(), node_id.clone(), args).with_action(action);

        let started = Instant::now();
        let call = AssertUnwindSafe(self.runner.run(ctx)).catch_unwind();
        let outcome = if self.config.cancel_in_flight {
            tokio::select! {
                res = call => Some(res),
                _ = self.abort.cancelled() => None,
            }
        } else {
            Some(call.await)
        };

        let outcome = outcome.map(|res| {
            res.unwrap_or_else(|_| Err(anyhow::anyhow!("runner panicked")))
        });

        match outcome {
            Some(Ok(output)) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                let mut state = self.state.lock().await;
                let ready = state.complete(&node_id, output);
                for next in ready {
                    let _ = self.queue_tx.send(next);
                }
                debug!(node_id = %node_id, duration_ms, "Node completed");
                self.emitter.emit(RunEvent::NodeCompleted {
                    node_id,
                    duration_ms,
                });
                if state.is_done() {
                    if state.has_failed() {
                        self.abort.cancel();
                    }
                    self.stop.cancel();
                }
            }
            Some(Err(err)) => {
                error!(node_id = %node_id, error = %err, "Node failed");
                self.emitter.emit(RunEvent::NodeFailed {
                    node_id: node_id.clone(),
                    error: err.to_string(),
                });
                self.state.lock().await.fail(&node_id, err);
                self.abort.cancel();
                self.stop.cancel();
            }
            None => {
                debug!(node_id = %node_id, "Node cancelled");
                self.state.lock().await.cancel(&node_id);
                self.emitter.emit(RunEvent::NodeCancelled { node_id });
            }
        }
    }
}
