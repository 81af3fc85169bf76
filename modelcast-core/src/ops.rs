//! Mutation operations over a JSON document.
//!
//! An operation list is the only way the shared model changes. The same list
//! is applied to the server's canonical document and replayed on every
//! client replica, so application must be deterministic.
//!
//! ```text
//!  [$clearAll, $set a.b = 1, $circularAppend log ← "x" (max 3)]
//!        │
//!        ▼
//!   validate all ──▸ apply in order ──▸ Document'
//! ```
//!
//! A batch is validated in full before the first operation touches the
//! document, so a rejected batch leaves the document exactly as it was.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The shared model: a JSON object keyed by strings.
pub type Document = Map<String, Value>;

/// Every `type` tag the engine understands.
pub const KNOWN_TYPES: &[&str] = &[
    "$clearAll",
    "$set",
    "$merge",
    "$shallowAssign",
    "$circularAppend",
    "$deleteKeys",
];

/// Errors raised while parsing or applying operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OperationError {
    #[error("Unsupported operation type: {0}")]
    UnsupportedType(String),

    #[error("Malformed operation: {0}")]
    Malformed(String),

    #[error("Operation {op} requires a non-empty keyPath")]
    MissingKeyPath { op: &'static str },

    #[error("Invalid keyPath '{0}'")]
    InvalidKeyPath(String),

    #[error("Operation {op} requires an object value, got {found}")]
    NotAnObject { op: &'static str, found: &'static str },

    #[error("Operation #{index} failed: {source}")]
    InBatch {
        index: usize,
        source: Box<OperationError>,
    },
}

impl OperationError {
    fn at(self, index: usize) -> Self {
        OperationError::InBatch {
            index,
            source: Box::new(self),
        }
    }
}

/// A single mutation of the document.
///
/// Serialized with an internal `type` tag and camelCase fields, e.g.
/// `{"type":"$set","keyPath":"a.b","value":1}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Operation {
    /// Remove every top-level key.
    #[serde(rename = "$clearAll")]
    ClearAll,

    /// Set `value` at `key_path`, creating intermediate objects.
    #[serde(rename = "$set", rename_all = "camelCase")]
    Set {
        #[serde(default)]
        key_path: Option<String>,
        #[serde(default)]
        value: Value,
    },

    /// Deep-merge an object into the object at `key_path`.
    #[serde(rename = "$merge", rename_all = "camelCase")]
    Merge {
        #[serde(default)]
        key_path: Option<String>,
        #[serde(default)]
        value: Value,
    },

    /// Copy the value's own keys onto the object at `key_path` (root if none).
    #[serde(rename = "$shallowAssign", rename_all = "camelCase")]
    ShallowAssign {
        #[serde(default)]
        key_path: Option<String>,
        #[serde(default)]
        value: Value,
    },

    /// Append to a bounded array, evicting the oldest entries.
    #[serde(rename = "$circularAppend", rename_all = "camelCase")]
    CircularAppend {
        key_path: String,
        #[serde(default)]
        value: Value,
        max_size: usize,
    },

    /// Remove keys from the object at `key_path` (root if none).
    #[serde(rename = "$deleteKeys", rename_all = "camelCase")]
    DeleteKeys {
        #[serde(default)]
        key_path: Option<String>,
        #[serde(default)]
        key_list: Vec<String>,
    },
}

impl Operation {
    pub fn clear_all() -> Self {
        Operation::ClearAll
    }

    pub fn set(key_path: impl Into<String>, value: impl Into<Value>) -> Self {
        Operation::Set {
            key_path: Some(key_path.into()),
            value: value.into(),
        }
    }

    pub fn merge(key_path: impl Into<String>, value: impl Into<Value>) -> Self {
        Operation::Merge {
            key_path: Some(key_path.into()),
            value: value.into(),
        }
    }

    /// Shallow assign; `None` targets the document root.
    pub fn shallow_assign(key_path: Option<String>, value: impl Into<Value>) -> Self {
        Operation::ShallowAssign {
            key_path,
            value: value.into(),
        }
    }

    pub fn circular_append(
        key_path: impl Into<String>,
        value: impl Into<Value>,
        max_size: usize,
    ) -> Self {
        Operation::CircularAppend {
            key_path: key_path.into(),
            value: value.into(),
            max_size,
        }
    }

    /// Delete keys; `None` targets the document root.
    pub fn delete_keys<I, S>(key_path: Option<String>, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Operation::DeleteKeys {
            key_path,
            key_list: keys.into_iter().map(Into::into).collect(),
        }
    }

    /// The wire tag of this operation.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::ClearAll => "$clearAll",
            Operation::Set { .. } => "$set",
            Operation::Merge { .. } => "$merge",
            Operation::ShallowAssign { .. } => "$shallowAssign",
            Operation::CircularAppend { .. } => "$circularAppend",
            Operation::DeleteKeys { .. } => "$deleteKeys",
        }
    }

    /// Parse one operation from raw JSON.
    ///
    /// Unknown `type` tags are reported as [`OperationError::UnsupportedType`]
    /// rather than a generic decode failure.
    pub fn from_value(value: &Value) -> Result<Self, OperationError> {
        let tag = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| OperationError::Malformed("missing string \"type\" tag".into()))?;
        if !KNOWN_TYPES.contains(&tag) {
            return Err(OperationError::UnsupportedType(tag.to_string()));
        }
        serde_json::from_value(value.clone()).map_err(|e| OperationError::Malformed(e.to_string()))
    }

    /// Check every precondition that does not depend on document contents.
    pub fn validate(&self) -> Result<(), OperationError> {
        match self {
            Operation::ClearAll => Ok(()),
            Operation::Set { key_path, .. } => match key_path.as_deref() {
                None | Some("") => Err(OperationError::MissingKeyPath { op: self.name() }),
                Some(path) => split_key_path(path).map(|_| ()),
            },
            Operation::Merge { key_path, value } | Operation::ShallowAssign { key_path, value } => {
                if !value.is_object() {
                    return Err(OperationError::NotAnObject {
                        op: self.name(),
                        found: json_kind(value),
                    });
                }
                optional_key_path(key_path.as_deref()).map(|_| ())
            }
            Operation::CircularAppend { key_path, .. } => {
                if key_path.is_empty() {
                    return Err(OperationError::MissingKeyPath { op: self.name() });
                }
                split_key_path(key_path).map(|_| ())
            }
            Operation::DeleteKeys { key_path, .. } => {
                optional_key_path(key_path.as_deref()).map(|_| ())
            }
        }
    }
}

/// The two-operation batch that resets a replica to `document`.
pub fn full_refresh(document: &Document) -> Vec<Operation> {
    vec![
        Operation::ClearAll,
        Operation::ShallowAssign {
            key_path: None,
            value: Value::Object(document.clone()),
        },
    ]
}

/// Apply `ops` to `document` in order.
///
/// The whole list is validated first; on error nothing has been applied.
pub fn apply_operations(document: &mut Document, ops: &[Operation]) -> Result<(), OperationError> {
    for (index, op) in ops.iter().enumerate() {
        op.validate().map_err(|e| e.at(index))?;
    }
    for op in ops {
        apply_one(document, op);
    }
    Ok(())
}

/// Parse a JSON array of operations and apply it.
pub fn apply_json_operations(document: &mut Document, ops: &Value) -> Result<(), OperationError> {
    let list = ops
        .as_array()
        .ok_or_else(|| OperationError::Malformed("operation list must be an array".into()))?;
    let parsed = list
        .iter()
        .enumerate()
        .map(|(index, raw)| Operation::from_value(raw).map_err(|e| e.at(index)))
        .collect::<Result<Vec<_>, _>>()?;
    apply_operations(document, &parsed)
}

/// Read the value at a dot-delimited path.
pub fn get_path<'a>(document: &'a Document, key_path: &str) -> Option<&'a Value> {
    let mut segments = key_path.split('.');
    let mut current = document.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

// Only called on validated operations.
fn apply_one(document: &mut Document, op: &Operation) {
    match op {
        Operation::ClearAll => document.clear(),

        Operation::Set { key_path, value } => {
            let path = key_path.as_deref().unwrap_or_default();
            let segments: Vec<&str> = path.split('.').collect();
            match slot_mut(document, &segments) {
                Some(slot) => *slot = value.clone(),
                None => skipped("$set", Some(path)),
            }
        }

        Operation::Merge { key_path, value } => {
            if let Value::Object(source) = value {
                match target_object(document, key_path.as_deref()) {
                    Some(target) => deep_merge(target, source),
                    None => skipped("$merge", key_path.as_deref()),
                }
            }
        }

        Operation::ShallowAssign { key_path, value } => {
            if let Value::Object(source) = value {
                let Some(target) = target_object(document, key_path.as_deref()) else {
                    skipped("$shallowAssign", key_path.as_deref());
                    return;
                };
                for (key, item) in source {
                    target.insert(key.clone(), item.clone());
                }
            }
        }

        Operation::CircularAppend {
            key_path,
            value,
            max_size,
        } => {
            let segments: Vec<&str> = key_path.split('.').collect();
            let Some(slot) = slot_mut(document, &segments) else {
                skipped("$circularAppend", Some(key_path.as_str()));
                return;
            };
            if !slot.is_array() {
                *slot = Value::Array(Vec::new());
            }
            if let Value::Array(items) = slot {
                match value {
                    Value::Array(values) => items.extend(values.iter().cloned()),
                    other => items.push(other.clone()),
                }
                if items.len() > *max_size {
                    let excess = items.len() - *max_size;
                    items.drain(..excess);
                }
            }
        }

        Operation::DeleteKeys { key_path, key_list } => {
            let target = match key_path.as_deref().filter(|p| !p.is_empty()) {
                None => Some(document),
                Some(path) => {
                    let segments: Vec<&str> = path.split('.').collect();
                    lookup_mut(document, &segments).and_then(Value::as_object_mut)
                }
            };
            if let Some(map) = target {
                for key in key_list {
                    map.remove(key);
                }
            }
        }
    }
}

fn split_key_path(path: &str) -> Result<Vec<&str>, OperationError> {
    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(OperationError::InvalidKeyPath(path.to_string()));
    }
    Ok(segments)
}

fn optional_key_path(path: Option<&str>) -> Result<Option<Vec<&str>>, OperationError> {
    match path {
        None | Some("") => Ok(None),
        Some(p) => split_key_path(p).map(Some),
    }
}

fn skipped(op: &str, key_path: Option<&str>) {
    log::warn!(
        "{op} at {:?} addresses an array with a non-index segment, skipped",
        key_path.unwrap_or_default()
    );
}

/// Object at `key_path`, or the root when the path is absent.
/// Missing or non-object targets are replaced by an empty object.
fn target_object<'a>(
    document: &'a mut Document,
    key_path: Option<&str>,
) -> Option<&'a mut Map<String, Value>> {
    match key_path.filter(|p| !p.is_empty()) {
        None => Some(document),
        Some(path) => {
            let segments: Vec<&str> = path.split('.').collect();
            slot_mut(document, &segments).map(object_mut)
        }
    }
}

/// Slot at `segments`, creating intermediates as needed.
///
/// Arrays along the way are kept: an index past the end pads with nulls,
/// and a non-index segment yields `None` instead of replacing the array.
fn slot_mut<'a>(document: &'a mut Document, segments: &[&str]) -> Option<&'a mut Value> {
    let (first, rest) = segments.split_first()?;
    let mut current = document.entry(first.to_string()).or_insert(Value::Null);
    for segment in rest {
        current = child_slot(current, segment)?;
    }
    Some(current)
}

fn child_slot<'a>(value: &'a mut Value, segment: &str) -> Option<&'a mut Value> {
    match value {
        Value::Array(items) => {
            let index = segment.parse::<usize>().ok()?;
            if index >= items.len() {
                items.resize(index + 1, Value::Null);
            }
            items.get_mut(index)
        }
        other => Some(
            object_mut(other)
                .entry(segment.to_string())
                .or_insert(Value::Null),
        ),
    }
}

fn object_mut(value: &mut Value) -> &mut Map<String, Value> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    match value {
        Value::Object(map) => map,
        _ => unreachable!("value was just replaced with an object"),
    }
}

fn lookup_mut<'a>(document: &'a mut Document, segments: &[&str]) -> Option<&'a mut Value> {
    let (first, rest) = segments.split_first()?;
    let mut current = document.get_mut(*first)?;
    for segment in rest {
        current = match current {
            Value::Object(map) => map.get_mut(*segment)?,
            Value::Array(items) => items.get_mut(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

// Arrays are replaced, not merged index-wise.
fn deep_merge(target: &mut Map<String, Value>, source: &Map<String, Value>) {
    for (key, incoming) in source {
        match (target.get_mut(key), incoming) {
            (Some(Value::Object(existing)), Value::Object(nested)) => deep_merge(existing, nested),
            _ => {
                target.insert(key.clone(), incoming.clone());
            }
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
