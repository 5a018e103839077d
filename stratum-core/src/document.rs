//! Schema-less document type with dotted-path addressing.
//!
//! A [`Document`] is an insertion-ordered map from field name to JSON value.
//! Paths such as `"address.city"` or `"tags.0"` traverse nested documents
//! and arrays transparently.

use crate::{StratumResult, ValidationError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Separator between path segments.
pub const PATH_SEPARATOR: char = '.';

/// A schema-less record keyed by field name.
///
/// Equality is deep structural equality over entries and does not depend on
/// field order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document {
    fields: Map<String, Value>,
}

impl Document {
    /// Create an empty document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a document from a JSON value, which must be an object.
    pub fn from_value(value: Value) -> StratumResult<Self> {
        match value {
            Value::Object(fields) => Ok(Self { fields }),
            other => Err(ValidationError::InvalidValue {
                field: "document".to_string(),
                reason: format!("expected a JSON object, got {}", json_kind(&other)),
            }
            .into()),
        }
    }

    /// Convert into a JSON object value.
    pub fn into_value(self) -> Value {
        Value::Object(self.fields)
    }

    /// Borrow the top-level fields.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Number of top-level fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Look up a value by dotted path.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split(PATH_SEPARATOR);
        let first = segments.next()?;
        let mut current = self.fields.get(first)?;
        for segment in segments {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Whether a value exists at the dotted path.
    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Set a value at the dotted path, creating intermediate documents as
    /// needed. Returns the previous value, if any.
    ///
    /// Numeric segments index into existing arrays; an index equal to the
    /// array length appends.
    pub fn put(&mut self, path: &str, value: impl Into<Value>) -> StratumResult<Option<Value>> {
        let segments = split_path(path)?;
        put_in_map(&mut self.fields, &segments, value.into())
            .map_err(|reason| invalid_path(path, reason))
    }

    /// Remove the value at the dotted path, pruning intermediate documents
    /// left empty by the removal.
    pub fn remove(&mut self, path: &str) -> Option<Value> {
        let segments: Vec<&str> = path.split(PATH_SEPARATOR).collect();
        if segments.iter().any(|s| s.is_empty()) {
            return None;
        }
        remove_from_map(&mut self.fields, &segments)
    }

    /// All leaf paths in dotted form, in field order.
    ///
    /// Arrays are leaves; their elements are not expanded.
    pub fn fields(&self) -> Vec<String> {
        let mut out = Vec::new();
        collect_paths(&self.fields, None, &mut out);
        out
    }

    /// Iterate over top-level entries.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }
}

impl From<Map<String, Value>> for Document {
    fn from(fields: Map<String, Value>) -> Self {
        Self { fields }
    }
}

impl TryFrom<Value> for Document {
    type Error = crate::StratumError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Document::from_value(value)
    }
}

impl From<Document> for Value {
    fn from(doc: Document) -> Self {
        doc.into_value()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Document {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            fields: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

// ============================================================================
// PATH HELPERS
// ============================================================================

fn split_path(path: &str) -> StratumResult<Vec<&str>> {
    if path.is_empty() {
        return Err(invalid_path(path, "path is empty".to_string()));
    }
    let segments: Vec<&str> = path.split(PATH_SEPARATOR).collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(invalid_path(path, "path has an empty segment".to_string()));
    }
    Ok(segments)
}

fn invalid_path(path: &str, reason: String) -> crate::StratumError {
    ValidationError::InvalidPath {
        path: path.to_string(),
        reason,
    }
    .into()
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

fn put_in_map(
    map: &mut Map<String, Value>,
    segments: &[&str],
    value: Value,
) -> Result<Option<Value>, String> {
    let (head, rest) = match segments.split_first() {
        Some(split) => split,
        None => return Err("path is empty".to_string()),
    };
    if rest.is_empty() {
        return Ok(map.insert((*head).to_string(), value));
    }
    let child = map
        .entry((*head).to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    put_in_value(child, head, rest, value)
}

fn put_in_value(
    target: &mut Value,
    name: &str,
    segments: &[&str],
    value: Value,
) -> Result<Option<Value>, String> {
    if target.is_null() {
        *target = Value::Object(Map::new());
    }
    match target {
        Value::Object(map) => put_in_map(map, segments, value),
        Value::Array(items) => {
            let (head, rest) = match segments.split_first() {
                Some(split) => split,
                None => return Err("path is empty".to_string()),
            };
            let index = head
                .parse::<usize>()
                .map_err(|_| format!("segment {head:?} does not index array {name:?}"))?;
            if rest.is_empty() {
                if index < items.len() {
                    return Ok(Some(std::mem::replace(&mut items[index], value)));
                }
                if index == items.len() {
                    items.push(value);
                    return Ok(None);
                }
                return Err(format!(
                    "index {index} out of bounds for array {name:?} of length {}",
                    items.len()
                ));
            }
            let len = items.len();
            let item = items
                .get_mut(index)
                .ok_or_else(|| format!("index {index} out of bounds for array {name:?} of length {len}"))?;
            put_in_value(item, head, rest, value)
        }
        other => Err(format!(
            "field {name:?} holds a {} and cannot contain {:?}",
            json_kind(other),
            segments[0]
        )),
    }
}

fn remove_from_map(map: &mut Map<String, Value>, segments: &[&str]) -> Option<Value> {
    let (head, rest) = segments.split_first()?;
    if rest.is_empty() {
        return map.shift_remove(*head);
    }
    let child = map.get_mut(*head)?;
    let removed = remove_from_value(child, rest);
    if removed.is_some() && matches!(child, Value::Object(m) if m.is_empty()) {
        map.shift_remove(*head);
    }
    removed
}

fn remove_from_value(target: &mut Value, segments: &[&str]) -> Option<Value> {
    match target {
        Value::Object(map) => remove_from_map(map, segments),
        Value::Array(items) => {
            let (head, rest) = segments.split_first()?;
            let index = head.parse::<usize>().ok()?;
            if rest.is_empty() {
                (index < items.len()).then(|| items.remove(index))
            } else {
                remove_from_value(items.get_mut(index)?, rest)
            }
        }
        _ => None,
    }
}

fn collect_paths(map: &Map<String, Value>, prefix: Option<&str>, out: &mut Vec<String>) {
    for (key, value) in map {
        let path = match prefix {
            Some(prefix) => format!("{prefix}{PATH_SEPARATOR}{key}"),
            None => key.clone(),
        };
        match value {
            Value::Object(nested) if !nested.is_empty() => collect_paths(nested, Some(&path), out),
            _ => out.push(path),
        }
    }
}
