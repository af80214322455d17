//! Turns a node's raw [`ValueTree`] into concrete forward arguments.

use serde_json::{Map, Value};

use super::future::FutureRegistry;
use super::value::ValueTree;
use crate::core::errors::Result;

/// Resolves future markers against the local outputs recorded so far
pub struct ArgumentResolver<'a> {
    futures: &'a FutureRegistry,
}

impl<'a> ArgumentResolver<'a> {
    pub fn new(futures: &'a FutureRegistry) -> Self {
        Self { futures }
    }

    /// Replace every future marker, keeping the tree's shape and key order
    pub fn resolve(&self, tree: &ValueTree, outputs: &Map<String, Value>) -> Result<Value> {
        match tree {
            ValueTree::Literal(value) => Ok(value.clone()),
            ValueTree::Map(entries) => {
                let mut map = Map::with_capacity(entries.len());
                for (key, value) in entries {
                    map.insert(key.clone(), self.resolve(value, outputs)?);
                }
                Ok(Value::Object(map))
            }
            ValueTree::Sequence(items) => items
                .iter()
                .map(|item| self.resolve(item, outputs))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            ValueTree::Future(id) => self.futures.resolve(id, outputs),
        }
    }

    /// Resolve a node's arguments; root nodes also receive the run's initial arguments
    pub fn resolve_node_args(
        &self,
        tree: &ValueTree,
        outputs: &Map<String, Value>,
        initial: Option<&Value>,
    ) -> Result<Value> {
        let resolved = self.resolve(tree, outputs)?;
        Ok(match initial {
            Some(initial) => merge_initial_args(initial, resolved),
            None => resolved,
        })
    }
}

/// Shallow merge: initial entries first, the node's own keys override
pub fn merge_initial_args(initial: &Value, own: Value) -> Value {
    match (initial, own) {
        (Value::Object(base), Value::Object(own)) => {
            let mut merged = base.clone();
            for (key, value) in own {
                merged.insert(key, value);
            }
            Value::Object(merged)
        }
        (_, own) => own,
    }
}
