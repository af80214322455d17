//! Execution events emitted while a graph runs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

/// What happened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RunEvent {
    RunStarted {
        node_count: usize,
        workers: usize,
    },
    NodeStarted {
        node_id: String,
        worker: usize,
    },
    NodeCompleted {
        node_id: String,
        duration_ms: u64,
    },
    NodeFailed {
        node_id: String,
        error: String,
    },
    /// A running node was dropped after another node failed
    NodeCancelled {
        node_id: String,
    },
    RunFinished {
        success: bool,
        completed: usize,
    },
}

/// Event envelope with metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    /// Per-run, strictly increasing
    pub sequence: u64,
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub event: RunEvent,
}

/// Event sink trait for emitting events
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &ExecutionEvent);
}

/// Writes every event to the debug log
pub struct LoggingEventSink;

impl EventSink for LoggingEventSink {
    fn emit(&self, event: &ExecutionEvent) {
        tracing::debug!(run_id = %event.run_id, seq = event.sequence, "Event: {:?}", event.event);
    }
}

/// Forwards events into an unbounded channel; a closed receiver is ignored
pub struct ChannelEventSink {
    tx: UnboundedSender<ExecutionEvent>,
}

impl ChannelEventSink {
    pub fn new(tx: UnboundedSender<ExecutionEvent>) -> Self {
        Self { tx }
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, event: &ExecutionEvent) {
        let _ = self.tx.send(event.clone());
    }
}

/// Stamps events for one run and hands them to the sink
pub(crate) struct RunEmitter {
    run_id: String,
    sequence: AtomicU64,
    sink: Option<Arc<dyn EventSink>>,
}

impl RunEmitter {
    pub(crate) fn new(run_id: impl Into<String>, sink: Option<Arc<dyn EventSink>>) -> Self {
        Self {
            run_id: run_id.into(),
            sequence: AtomicU64::new(0),
            sink,
        }
    }

    pub(crate) fn emit(&self, event: RunEvent) {
        if let Some(sink) = &self.sink {
            let envelope = ExecutionEvent {
                sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
                run_id: self.run_id.clone(),
                timestamp: Utc::now(),
                event,
            };
            sink.emit(&envelope);
        }
    }
}
