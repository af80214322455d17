//! Future directives: deferred values that resolve against completed node outputs.
//!
//! A [`FutureDirective::Trace`] reads a recorded node output and descends an
//! [`AccessPath`] into it. A [`FutureDirective::Concat`] joins literal and
//! future items into one string, following nested futures.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

use crate::core::errors::{GraphError, Result};

/// One step of an access path
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    /// Sequence index: `[0]`
    Index(usize),
    /// Map key: `.field`
    Key(String),
}

/// Ordered lookup steps into a node output
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccessPath(pub Vec<PathSegment>);

impl AccessPath {
    pub fn new(segments: Vec<PathSegment>) -> Self {
        Self(segments)
    }

    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.0.push(PathSegment::Key(key.into()));
        self
    }

    pub fn index(mut self, index: usize) -> Self {
        self.0.push(PathSegment::Index(index));
        self
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parse dotted/bracketed text into a path
    ///
    /// Examples:
    /// - "nested[1].k" → [Key("nested"), Index(1), Key("k")]
    /// - "$.items.0" → [Key("items"), Index(0)]
    pub fn parse(text: &str) -> Result<Self> {
        let body = if let Some(rest) = text.strip_prefix("$.") {
            rest
        } else if text == "$" {
            return Ok(Self::root());
        } else {
            text
        };

        if body.is_empty() {
            return Ok(Self::root());
        }

        let unsupported =
            || GraphError::validation_field(format!("unsupported access path '{}'", text), "path");

        let mut segments = Vec::new();
        for part in body.split('.') {
            if part.is_empty() {
                return Err(unsupported());
            }

            let (field, mut brackets) = match part.find('[') {
                Some(pos) => (&part[..pos], &part[pos..]),
                None => (part, ""),
            };

            if !field.is_empty() {
                match field.parse::<usize>() {
                    Ok(index) if brackets.is_empty() => segments.push(PathSegment::Index(index)),
                    _ => segments.push(PathSegment::Key(field.to_string())),
                }
            }

            // one or more trailing `[n]` groups, e.g. grid[0][2]
            while !brackets.is_empty() {
                let close = brackets.find(']').ok_or_else(unsupported)?;
                if !brackets.starts_with('[') {
                    return Err(unsupported());
                }
                let index: usize = brackets[1..close].parse().map_err(|_| unsupported())?;
                segments.push(PathSegment::Index(index));
                brackets = &brackets[close + 1..];
            }
        }

        Ok(Self(segments))
    }

    /// Descend into `value`; keys only match maps, indices only match sequences
    pub fn lookup<'v>(&self, value: &'v Value) -> Option<&'v Value> {
        let mut current = value;
        for segment in &self.0 {
            current = match (segment, current) {
                (PathSegment::Key(key), Value::Object(map)) => map.get(key)?,
                (PathSegment::Index(idx), Value::Array(items)) => items.get(*idx)?,
                _ => return None,
            };
        }
        Some(current)
    }
}

impl fmt::Display for AccessPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "$");
        }
        for (i, segment) in self.0.iter().enumerate() {
            match segment {
                PathSegment::Key(key) if i == 0 => write!(f, "{}", key)?,
                PathSegment::Key(key) => write!(f, ".{}", key)?,
                PathSegment::Index(idx) => write!(f, "[{}]", idx)?,
            }
        }
        Ok(())
    }
}

/// One element of a concat directive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcatItem {
    Literal(Value),
    Future(String),
}

impl ConcatItem {
    pub fn literal(value: impl Into<Value>) -> Self {
        ConcatItem::Literal(value.into())
    }

    pub fn future(id: impl Into<String>) -> Self {
        ConcatItem::Future(id.into())
    }
}

/// How a future resolves
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FutureDirective {
    /// Read `origin_node`'s local output and follow `path`
    Trace {
        origin_node: String,
        #[serde(default)]
        path: AccessPath,
    },
    /// Join items into a string
    Concat { items: Vec<ConcatItem> },
}

impl FutureDirective {
    /// Future ids this directive refers to directly
    pub fn nested_futures(&self) -> impl Iterator<Item = &str> {
        let items: &[ConcatItem] = match self {
            FutureDirective::Trace { .. } => &[],
            FutureDirective::Concat { items } => items,
        };
        items.iter().filter_map(|item| match item {
            ConcatItem::Future(id) => Some(id.as_str()),
            ConcatItem::Literal(_) => None,
        })
    }
}

/// A registered future
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FutureSpec {
    pub id: String,
    /// Node whose output this future is attached to; defaults to a trace's origin
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    pub directive: FutureDirective,
}

impl FutureSpec {
    pub fn trace(id: impl Into<String>, origin_node: impl Into<String>, path: AccessPath) -> Self {
        Self {
            id: id.into(),
            node: None,
            directive: FutureDirective::Trace {
                origin_node: origin_node.into(),
                path,
            },
        }
    }

    pub fn concat(id: impl Into<String>, items: Vec<ConcatItem>) -> Self {
        Self {
            id: id.into(),
            node: None,
            directive: FutureDirective::Concat { items },
        }
    }

    /// Attach the future to a node's output
    pub fn attached_to(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }

    /// The node this future belongs to, if any
    pub fn attachment(&self) -> Option<&str> {
        match (&self.node, &self.directive) {
            (Some(node), _) => Some(node.as_str()),
            (None, FutureDirective::Trace { origin_node, .. }) => Some(origin_node.as_str()),
            (None, FutureDirective::Concat { .. }) => None,
        }
    }
}

/// Canonical text used when a non-string value is concatenated
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Future id → spec lookup table
#[derive(Debug, Clone, Default)]
pub struct FutureRegistry {
    futures: HashMap<String, FutureSpec>,
}

impl FutureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a future; fails on a duplicate id
    pub fn insert(&mut self, spec: FutureSpec) -> Result<()> {
        if self.futures.contains_key(&spec.id) {
            return Err(GraphError::validation_field(
                format!("duplicate future id '{}'", spec.id),
                "futures",
            ));
        }
        self.futures.insert(spec.id.clone(), spec);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&FutureSpec> {
        self.futures.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.futures.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.futures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.futures.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FutureSpec> {
        self.futures.values()
    }

    fn lookup(&self, id: &str) -> Result<&FutureSpec> {
        self.futures
            .get(id)
            .ok_or_else(|| GraphError::validation(format!("unknown future '{}'", id)))
    }

    /// Resolve one future against the local outputs recorded so far
    ///
    /// Nested concats are resolved bottom-up with an explicit stack; each
    /// future is evaluated at most once per call.
    pub fn resolve(&self, future_id: &str, outputs: &Map<String, Value>) -> Result<Value> {
        let mut resolved: HashMap<&str, Value> = HashMap::new();
        let mut expanded: HashSet<&str> = HashSet::new();
        let mut pending: Vec<&str> = vec![future_id];

        while let Some(&id) = pending.last() {
            if resolved.contains_key(id) {
                pending.pop();
                continue;
            }

            let directive = &self.lookup(id)?.directive;
            let value = match directive {
                FutureDirective::Trace { origin_node, path } => {
                    trace_value(id, origin_node, path, outputs)?
                }
                FutureDirective::Concat { items } => {
                    let mut missing: Vec<&str> = Vec::new();
                    for nested in directive.nested_futures() {
                        if !resolved.contains_key(nested) && !missing.contains(&nested) {
                            missing.push(nested);
                        }
                    }
                    if !missing.is_empty() {
                        // expanded but unresolved means it is an ancestor on the stack
                        let looped =
                            !expanded.insert(id) || missing.iter().any(|m| expanded.contains(m));
                        if looped {
                            return Err(self.concat_cycle(future_id, id));
                        }
                        pending.extend(missing);
                        continue;
                    }

                    let mut joined = String::new();
                    for item in items {
                        match item {
                            ConcatItem::Literal(value) => joined.push_str(&stringify(value)),
                            ConcatItem::Future(nested) => {
                                if let Some(value) = resolved.get(nested.as_str()) {
                                    joined.push_str(&stringify(value));
                                }
                            }
                        }
                    }
                    Value::String(joined)
                }
            };
            resolved.insert(id, value);
            pending.pop();
        }

        resolved
            .remove(future_id)
            .ok_or_else(|| GraphError::internal(format!("future '{}' did not resolve", future_id)))
    }

    fn concat_cycle(&self, root: &str, at: &str) -> GraphError {
        match self.terminal_origins(root) {
            Err(err) => err,
            Ok(_) => GraphError::internal(format!("future '{}' refers back to itself", at)),
        }
    }

    /// Nodes a future ultimately reads from, following nested futures
    ///
    /// Fails with [`GraphError::CyclicDependency`] naming the futures on a
    /// concat loop.
    pub fn terminal_origins(&self, future_id: &str) -> Result<BTreeSet<String>> {
        let mut origins = BTreeSet::new();
        let mut on_path: HashMap<&str, usize> = HashMap::new();
        let mut done: HashSet<&str> = HashSet::new();
        let mut path: Vec<(&str, Vec<&str>, usize)> = Vec::new();

        let root = self.lookup(future_id)?;
        on_path.insert(future_id, 0);
        path.push((future_id, root.directive.nested_futures().collect(), 0));
        if let FutureDirective::Trace { origin_node, .. } = &root.directive {
            origins.insert(origin_node.clone());
        }

        while let Some((id, nested, next)) = path.last_mut() {
            let id: &str = *id;
            let Some(&child) = nested.get(*next) else {
                on_path.remove(id);
                done.insert(id);
                path.pop();
                continue;
            };
            *next += 1;

            if let Some(&depth) = on_path.get(child) {
                let mut cycle: Vec<String> =
                    path[depth..].iter().map(|(id, _, _)| id.to_string()).collect();
                cycle.push(child.to_string());
                return Err(GraphError::cyclic(cycle));
            }
            if done.contains(child) {
                continue;
            }

            let spec = self.lookup(child)?;
            match &spec.directive {
                FutureDirective::Trace { origin_node, .. } => {
                    origins.insert(origin_node.clone());
                    done.insert(child);
                }
                FutureDirective::Concat { .. } => {
                    on_path.insert(child, path.len());
                    path.push((child, spec.directive.nested_futures().collect(), 0));
                }
            }
        }
        Ok(origins)
    }
}

fn trace_value(
    future_id: &str,
    origin_node: &str,
    path: &AccessPath,
    outputs: &Map<String, Value>,
) -> Result<Value> {
    let origin_output = outputs
        .get(origin_node)
        .ok_or_else(|| GraphError::MissingOriginOutput {
            future_id: future_id.to_string(),
            node_id: origin_node.to_string(),
            partial: None,
        })?;
    path.lookup(origin_output)
        .cloned()
        .ok_or_else(|| GraphError::PathNotFound {
            future_id: future_id.to_string(),
            node_id: origin_node.to_string(),
            path: path.to_string(),
            partial: None,
        })
}
