// Core infrastructure modules
pub mod core;

// Graph construction and concurrent execution
pub mod graph_flow;

// Re-exports for convenience
pub use crate::core::config::{EngineConfig, PartialEngineConfig};
pub use crate::core::errors::{GraphError, Result};
pub use graph_flow::*;
