use serde::{Deserialize, Serialize};
use std::path::Path;

use super::errors::{GraphError, Result};

/// Upper bound for the worker pool size
pub const MAX_WORKERS_LIMIT: usize = 1024;

fn default_max_workers() -> usize {
    4
}

fn default_true() -> bool {
    true
}

/// Configuration for graph execution behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of worker loops pulling from the shared task queue
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Drop in-flight runner futures on the first failure instead of letting them finish
    #[serde(default = "default_true")]
    pub cancel_in_flight: bool,
    /// Promote the terminal node of a linear chain to the sole global output
    #[serde(default = "default_true")]
    pub infer_outputs: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            cancel_in_flight: true,
            infer_outputs: true,
        }
    }
}

impl EngineConfig {
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    pub fn with_cancel_in_flight(mut self, cancel: bool) -> Self {
        self.cancel_in_flight = cancel;
        self
    }

    pub fn with_infer_outputs(mut self, infer: bool) -> Self {
        self.infer_outputs = infer;
        self
    }

    /// Validates configuration values
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(GraphError::configuration_field(
                "max_workers must be greater than 0",
                "max_workers",
            ));
        }
        if self.max_workers > MAX_WORKERS_LIMIT {
            return Err(GraphError::configuration_field(
                format!("max_workers cannot exceed {}", MAX_WORKERS_LIMIT),
                "max_workers",
            ));
        }
        Ok(())
    }

    /// Merges two configurations, with `override_with` taking precedence
    pub fn merge(base: &Self, override_with: &PartialEngineConfig) -> Result<Self> {
        let merged = Self {
            max_workers: override_with.max_workers.unwrap_or(base.max_workers),
            cancel_in_flight: override_with
                .cancel_in_flight
                .unwrap_or(base.cancel_in_flight),
            infer_outputs: override_with.infer_outputs.unwrap_or(base.infer_outputs),
        };

        merged.validate()?;
        Ok(merged)
    }

    /// Parse a configuration from YAML text
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a YAML file
    pub fn load_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| GraphError::io(format!("read {}", path.display()), e))?;
        Self::from_yaml_str(&yaml)
    }
}

/// Per-graph overrides; unset fields fall back to the executor's config
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartialEngineConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_workers: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_in_flight: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infer_outputs: Option<bool>,
}
