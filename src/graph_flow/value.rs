//! Argument trees with embedded future markers.
//!
//! A node's raw arguments are a [`ValueTree`]: literals, ordered maps,
//! sequences, and [`ValueTree::Future`] markers that point into the future
//! registry. On the wire a tree is plain JSON where an object holding exactly
//! one `"$future"` string entry is a marker.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Object key that marks a future reference in the JSON wire form
pub const FUTURE_MARKER_KEY: &str = "$future";

/// Raw argument data for a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub enum ValueTree {
    /// A scalar passed through unchanged
    Literal(Value),
    /// Keyed entries in insertion order
    Map(Vec<(String, ValueTree)>),
    Sequence(Vec<ValueTree>),
    /// Placeholder resolved from the future registry at run time
    Future(String),
}

impl Default for ValueTree {
    fn default() -> Self {
        ValueTree::Map(Vec::new())
    }
}

impl ValueTree {
    pub fn literal(value: impl Into<Value>) -> Self {
        ValueTree::Literal(value.into())
    }

    pub fn future(future_id: impl Into<String>) -> Self {
        ValueTree::Future(future_id.into())
    }

    /// Build a map from `(key, tree)` pairs, keeping their order
    pub fn map<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, ValueTree)>,
    {
        ValueTree::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn sequence<I: IntoIterator<Item = ValueTree>>(items: I) -> Self {
        ValueTree::Sequence(items.into_iter().collect())
    }

    /// Convert plain JSON, recognising `{"$future": "<id>"}` markers
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Object(map) => {
                if map.len() == 1 {
                    if let Some(Value::String(id)) = map.get(FUTURE_MARKER_KEY) {
                        return ValueTree::Future(id.clone());
                    }
                }
                ValueTree::Map(
                    map.into_iter()
                        .map(|(k, v)| (k, ValueTree::from_json(v)))
                        .collect(),
                )
            }
            Value::Array(items) => {
                ValueTree::Sequence(items.into_iter().map(ValueTree::from_json).collect())
            }
            scalar => ValueTree::Literal(scalar),
        }
    }

    /// Render back to the JSON wire form
    pub fn to_json(&self) -> Value {
        match self {
            ValueTree::Literal(v) => v.clone(),
            ValueTree::Map(entries) => {
                let mut map = Map::with_capacity(entries.len());
                for (k, v) in entries {
                    map.insert(k.clone(), v.to_json());
                }
                Value::Object(map)
            }
            ValueTree::Sequence(items) => Value::Array(items.iter().map(|v| v.to_json()).collect()),
            ValueTree::Future(id) => {
                let mut map = Map::with_capacity(1);
                map.insert(FUTURE_MARKER_KEY.to_string(), Value::String(id.clone()));
                Value::Object(map)
            }
        }
    }

    /// Every future id embedded in the tree, in document order
    pub fn future_ids(&self) -> Vec<&str> {
        let mut ids = Vec::new();
        self.collect_future_ids(&mut ids);
        ids
    }

    fn collect_future_ids<'a>(&'a self, ids: &mut Vec<&'a str>) {
        match self {
            ValueTree::Literal(_) => {}
            ValueTree::Map(entries) => {
                for (_, v) in entries {
                    v.collect_future_ids(ids);
                }
            }
            ValueTree::Sequence(items) => {
                for v in items {
                    v.collect_future_ids(ids);
                }
            }
            ValueTree::Future(id) => ids.push(id),
        }
    }

    pub fn has_futures(&self) -> bool {
        match self {
            ValueTree::Literal(_) => false,
            ValueTree::Map(entries) => entries.iter().any(|(_, v)| v.has_futures()),
            ValueTree::Sequence(items) => items.iter().any(|v| v.has_futures()),
            ValueTree::Future(_) => true,
        }
    }

    /// Look up a top-level map entry
    pub fn get(&self, key: &str) -> Option<&ValueTree> {
        match self {
            ValueTree::Map(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }
}

impl From<Value> for ValueTree {
    fn from(value: Value) -> Self {
        ValueTree::from_json(value)
    }
}

impl From<ValueTree> for Value {
    fn from(tree: ValueTree) -> Self {
        tree.to_json()
    }
}
