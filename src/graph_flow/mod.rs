//! Graph execution engine: values and futures, graph construction, and the
//! concurrent scheduler that runs it.

pub mod action;
pub mod dag_builder;
pub mod events;
pub mod executor;
pub mod future;
pub mod graph;
pub mod registry;
pub mod resolver;
pub mod result;
pub mod scheduler;
pub mod value;

pub use action::{runner_fn, EchoAction, FnRunner, NodeAction, NodeCtx, NodeOutput, NodeRunner};
pub use dag_builder::{DependencyGraph, EdgeKind};
pub use events::{ChannelEventSink, EventSink, ExecutionEvent, LoggingEventSink, RunEvent};
pub use executor::GraphExecutor;
pub use future::{
    stringify, AccessPath, ConcatItem, FutureDirective, FutureRegistry, FutureSpec, PathSegment,
};
pub use graph::{EdgeSpec, Graph, GraphDescription, NodeSpec, OutputPlan};
pub use registry::ActionRegistry;
pub use resolver::{merge_initial_args, ArgumentResolver};
pub use result::GraphResult;
pub use scheduler::{NodeState, SchedulerStats};
pub use value::{ValueTree, FUTURE_MARKER_KEY};
