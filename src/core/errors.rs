use std::fmt;
use thiserror::Error;

use crate::graph_flow::result::GraphResult;

/// Unified error type for graph construction and execution
#[derive(Debug, Error)]
pub enum GraphError {
    /// Malformed graph description (duplicate ids, dangling references)
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    /// The merged dependency graph contains a cycle
    #[error("Cyclic dependency: {}", CyclePath(.cycle))]
    CyclicDependency { cycle: Vec<String> },

    /// A trace was resolved before its origin produced output
    #[error("Future '{future_id}' references node '{node_id}' which has no recorded output")]
    MissingOriginOutput {
        future_id: String,
        node_id: String,
        /// Set when raised mid-run
        partial: Option<Box<GraphResult>>,
    },

    /// A trace's access path does not exist in the origin's output
    #[error("Future '{future_id}': path '{path}' not found in output of node '{node_id}'")]
    PathNotFound {
        future_id: String,
        node_id: String,
        path: String,
        partial: Option<Box<GraphResult>>,
    },

    /// A node runner failed; carries whatever completed before the failure
    #[error("Node '{node_id}' failed: {source}")]
    NodeExecution {
        node_id: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
        partial: Box<GraphResult>,
    },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// Serialization errors
    #[error("Serialization failed: {format}")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// IO errors
    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// The run was cancelled before it could finish
    #[error("Operation was cancelled: {operation}")]
    Cancelled {
        operation: String,
        partial: Option<Box<GraphResult>>,
    },

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

struct CyclePath<'a>(&'a [String]);

impl fmt::Display for CyclePath<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join(" -> "))
    }
}

impl GraphError {
    /// Create a validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
            field: None,
        }
    }

    /// Create a validation error pointing at a specific field
    pub fn validation_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Validation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
        }
    }

    /// Create a configuration error pointing at a specific field
    pub fn configuration_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Configuration {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn cyclic(cycle: Vec<String>) -> Self {
        Self::CyclicDependency { cycle }
    }

    /// Create a serialization error
    pub fn serialization<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        format: S,
        source: E,
    ) -> Self {
        Self::Serialization {
            format: format.into(),
            source: Box::new(source),
        }
    }

    /// Create an IO error
    pub fn io<S: Into<String>>(operation: S, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    /// Create a cancellation error
    pub fn cancelled<S: Into<String>>(operation: S) -> Self {
        Self::Cancelled {
            operation: operation.into(),
            partial: None,
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Wrap a runner failure together with the results recorded so far
    pub fn node_execution<S: Into<String>>(
        node_id: S,
        source: anyhow::Error,
        partial: GraphResult,
    ) -> Self {
        Self::NodeExecution {
            node_id: node_id.into(),
            source: source.into(),
            partial: Box::new(partial),
        }
    }

    /// Attach the results recorded so far to an error raised mid-run
    ///
    /// Only run-time variants carry a partial result; others are returned
    /// unchanged.
    pub fn with_partial(mut self, result: GraphResult) -> Self {
        match &mut self {
            Self::MissingOriginOutput { partial, .. }
            | Self::PathNotFound { partial, .. }
            | Self::Cancelled { partial, .. } => *partial = Some(Box::new(result)),
            Self::NodeExecution { partial, .. } => *partial = Box::new(result),
            _ => {}
        }
        self
    }

    /// Results recorded before the run stopped, if this error came from a run
    pub fn partial_result(&self) -> Option<&GraphResult> {
        match self {
            Self::NodeExecution { partial, .. } => Some(partial.as_ref()),
            Self::MissingOriginOutput { partial, .. }
            | Self::PathNotFound { partial, .. }
            | Self::Cancelled { partial, .. } => partial.as_deref(),
            _ => None,
        }
    }

    /// Id of the node whose runner failed
    pub fn failed_node(&self) -> Option<&str> {
        match self {
            Self::NodeExecution { node_id, .. } => Some(node_id.as_str()),
            _ => None,
        }
    }

    /// True for errors raised before any node was started
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. } | Self::CyclicDependency { .. } | Self::Configuration { .. }
        )
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::CyclicDependency { .. } => "cycle",
            Self::MissingOriginOutput { .. } => "missing_origin",
            Self::PathNotFound { .. } => "path_not_found",
            Self::NodeExecution { .. } => "node_execution",
            Self::Configuration { .. } => "configuration",
            Self::Serialization { .. } => "serialization",
            Self::Io { .. } => "io",
            Self::Cancelled { .. } => "cancelled",
            Self::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, GraphError>;

impl From<std::io::Error> for GraphError {
    fn from(err: std::io::Error) -> Self {
        Self::io("io_operation", err)
    }
}

impl From<serde_json::Error> for GraphError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("json", err)
    }
}

impl From<serde_yaml::Error> for GraphError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization("yaml", err)
    }
}
