// Ambient infrastructure shared by the graph engine

pub mod config;
pub mod errors;

// Re-export commonly used types
pub use config::{EngineConfig, PartialEngineConfig};
pub use errors::{GraphError, Result};
