// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Dotted field-path traversal over decoded message trees.
//!
//! A path such as `tags.service_alias` is walked one segment at a time. Maps are
//! indexed by segment, single-element lists are unwrapped, and multi-element lists
//! either fan out across their elements or fail, depending on `allow_list`.

use std::fmt;

use serde_json::{Map, Value};
use tracing::trace;

use crate::errors::ResolveError;

pub const PATH_DELIMITER: char = '.';

/// A parsed, reusable field path. Never contains empty segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    #[must_use]
    pub fn parse(path: &str) -> Self {
        let segments = path
            .split(PATH_DELIMITER)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        FieldPath { segments }
    }

    /// A one-segment path for a literal key, which may itself contain `.`.
    #[must_use]
    pub fn key(key: &str) -> Self {
        let segments = if key.is_empty() {
            Vec::new()
        } else {
            vec![key.to_string()]
        };
        FieldPath { segments }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    #[must_use]
    pub fn first(&self) -> Option<&str> {
        self.segments.first().map(String::as_str)
    }

    fn prefix(&self, depth: usize) -> String {
        self.segments[..depth.min(self.segments.len())].join(".")
    }
}

impl From<&str> for FieldPath {
    fn from(path: &str) -> Self {
        FieldPath::parse(path)
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("."))
    }
}

/// The value found at the end of a path.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    /// Missing path, `null`, empty string or empty list.
    Empty,
    Scalar(String),
    /// Multi-element leaf list, or the gathered results of a fan-out.
    List(Vec<String>),
    /// Maps are kept whole.
    Map(Map<String, Value>),
}

impl Resolved {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, Resolved::Empty)
    }

    /// Flat text form, used for substitution and filter matching.
    #[must_use]
    pub fn to_text(&self) -> String {
        match self {
            Resolved::Empty => String::new(),
            Resolved::Scalar(s) => s.clone(),
            Resolved::List(items) => items.join(","),
            Resolved::Map(map) => Value::Object(map.clone()).to_string(),
        }
    }

    fn from_strings(mut items: Vec<String>) -> Self {
        match items.len() {
            0 => Resolved::Empty,
            1 => Resolved::Scalar(items.remove(0)),
            _ => Resolved::List(items),
        }
    }

    fn from_leaf(node: &Value) -> Self {
        match node {
            Value::Object(map) => Resolved::Map(map.clone()),
            Value::Array(items) => Self::from_strings(items.iter().filter_map(leaf_text).collect()),
            other => leaf_text(other).map_or(Resolved::Empty, Resolved::Scalar),
        }
    }
}

fn leaf_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn unwrap_single(mut node: &Value) -> &Value {
    while let Value::Array(items) = node {
        if items.len() != 1 {
            break;
        }
        node = &items[0];
    }
    node
}

/// Some producers ship a JSON document serialized inside a string field.
fn embedded_document(text: &str) -> Option<Value> {
    let trimmed = text.trim_start();
    if !(trimmed.starts_with('{') || trimmed.starts_with('[')) {
        return None;
    }
    serde_json::from_str::<Value>(text)
        .ok()
        .filter(|v| v.is_object() || v.is_array())
}

/// Resolves `path` against `value` without modifying it.
pub fn resolve(value: &Value, path: &FieldPath, allow_list: bool) -> Result<Resolved, ResolveError> {
    if path.is_empty() {
        return Ok(Resolved::Empty);
    }
    walk(value, path, 0, allow_list)
}

/// Resolves `path` and, if a value was found, removes the terminal key from its parent map
/// so later extraction steps cannot reuse it.
///
/// The value is read on an immutable walk first; removal is a separate pass over the same
/// path indexes, so the returned value never aliases the mutated tree. Keys nested inside a
/// string-embedded document are read but not removed.
pub fn resolve_consume(
    value: &mut Value,
    path: &FieldPath,
    allow_list: bool,
) -> Result<Resolved, ResolveError> {
    let resolved = resolve(value, path, allow_list)?;
    if !resolved.is_empty() {
        remove_terminal(value, path.segments());
    }
    Ok(resolved)
}

fn walk(
    value: &Value,
    path: &FieldPath,
    depth: usize,
    allow_list: bool,
) -> Result<Resolved, ResolveError> {
    let node = unwrap_single(value);
    let Some(segment) = path.segments().get(depth) else {
        return Ok(Resolved::from_leaf(node));
    };

    match node {
        Value::Object(map) => match map.get(segment) {
            Some(next) => walk(next, path, depth + 1, allow_list),
            None => Ok(Resolved::Empty),
        },
        Value::Array(items) if items.is_empty() => Ok(Resolved::Empty),
        Value::Array(items) => {
            if !allow_list {
                return Err(ResolveError::AmbiguousCollection {
                    path: path.prefix(depth),
                });
            }
            trace!("fanning out '{}' across {} elements", path, items.len());
            gather(items, path, depth)
        }
        Value::String(text) => match embedded_document(text) {
            Some(document) => walk(&document, path, depth, allow_list),
            None => Ok(Resolved::Empty),
        },
        _ => Ok(Resolved::Empty),
    }
}

fn gather(items: &[Value], path: &FieldPath, depth: usize) -> Result<Resolved, ResolveError> {
    let mut gathered = Vec::with_capacity(items.len());
    for item in items {
        match walk(item, path, depth, true)? {
            Resolved::Empty => {}
            Resolved::Scalar(s) => gathered.push(s),
            Resolved::List(list) => gathered.extend(list),
            Resolved::Map(map) => gathered.push(Value::Object(map).to_string()),
        }
    }
    Ok(Resolved::from_strings(gathered))
}

fn remove_terminal(node: &mut Value, segments: &[String]) {
    let Some((head, rest)) = segments.split_first() else {
        return;
    };
    match node {
        Value::Array(items) => {
            for item in items.iter_mut() {
                remove_terminal(item, segments);
            }
        }
        Value::Object(map) => {
            if rest.is_empty() {
                map.remove(head);
            } else if let Some(next) = map.get_mut(head) {
                remove_terminal(next, rest);
            }
        }
        _ => {}
    }
}
