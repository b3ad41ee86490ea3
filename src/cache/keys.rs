//! Request keys and tags.
//!
//! A [`RequestKey`] names one cacheable read: an [`Endpoint`] such as
//! `GET /leaves` plus a JSON parameter object. Parameters compare and hash by a
//! canonical rendering with sorted object keys, so `{"a":1,"b":2}` and
//! `{"b":2,"a":1}` address the same entry.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde_json::Value;
use thiserror::Error;

/// Programmer errors raised while building keys, queries, or mutations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("endpoint `{0}` must look like `METHOD /path`")]
    MalformedEndpoint(String),
    #[error("unsupported HTTP method `{0}`")]
    UnknownMethod(String),
    #[error("parameters must be a JSON object, got {0}")]
    InvalidParams(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

impl FromStr for Method {
    type Err = KeyError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            "DELETE" => Ok(Self::Delete),
            _ => Err(KeyError::UnknownMethod(value.to_string())),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Method plus path, written as `GET /leaves`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    method: Method,
    path: String,
}

impl Endpoint {
    pub fn new(method: Method, path: impl Into<String>) -> Result<Self, KeyError> {
        let path = path.into();
        if !path.starts_with('/') {
            return Err(KeyError::MalformedEndpoint(format!("{method} {path}")));
        }
        Ok(Self { method, path })
    }

    pub fn parse(value: &str) -> Result<Self, KeyError> {
        let mut parts = value.split_whitespace();
        let (Some(method), Some(path), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(KeyError::MalformedEndpoint(value.to_string()));
        };
        Self::new(method.parse()?, path)
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl FromStr for Endpoint {
    type Err = KeyError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}

/// Request parameters with order-independent equality.
#[derive(Debug, Clone)]
pub struct Params {
    value: Value,
    canonical: String,
}

impl Params {
    /// Accepts a JSON object; `null` is treated as "no parameters".
    pub fn new(value: Value) -> Result<Self, KeyError> {
        let value = match value {
            Value::Null => Value::Object(serde_json::Map::new()),
            Value::Object(_) => value,
            Value::Bool(_) => return Err(KeyError::InvalidParams("a boolean")),
            Value::Number(_) => return Err(KeyError::InvalidParams("a number")),
            Value::String(_) => return Err(KeyError::InvalidParams("a string")),
            Value::Array(_) => return Err(KeyError::InvalidParams("an array")),
        };
        let mut canonical = String::new();
        write_canonical(&value, &mut canonical);
        Ok(Self { value, canonical })
    }

    pub fn empty() -> Self {
        Self {
            value: Value::Object(serde_json::Map::new()),
            canonical: "{}".to_string(),
        }
    }

    pub fn as_value(&self) -> &Value {
        &self.value
    }

    pub fn is_empty(&self) -> bool {
        self.value.as_object().is_none_or(|map| map.is_empty())
    }

    /// Renders the parameters as URL query pairs, sorted by name.
    ///
    /// Strings pass through, other scalars are stringified, arrays repeat the
    /// name once per element, nested objects are sent as JSON text and nulls
    /// are skipped.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        let Some(map) = self.value.as_object() else {
            return Vec::new();
        };
        let mut names: Vec<&String> = map.keys().collect();
        names.sort();

        let mut pairs = Vec::new();
        for name in names {
            match &map[name.as_str()] {
                Value::Null => {}
                Value::Array(items) => {
                    for item in items {
                        if let Some(text) = scalar_text(item) {
                            pairs.push((name.clone(), text));
                        }
                    }
                }
                other => {
                    if let Some(text) = scalar_text(other) {
                        pairs.push((name.clone(), text));
                    }
                }
            }
        }
        pairs
    }
}

impl Default for Params {
    fn default() -> Self {
        Self::empty()
    }
}

impl PartialEq for Params {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for Params {}

impl Hash for Params {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

impl fmt::Display for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        Value::Bool(_) | Value::Number(_) => Some(value.to_string()),
        Value::Array(_) | Value::Object(_) => {
            let mut text = String::new();
            write_canonical(value, &mut text);
            Some(text)
        }
    }
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (index, (name, inner)) in entries.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(name.clone()).to_string());
                out.push(':');
                write_canonical(inner, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Identifies one cacheable read.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
    endpoint: Endpoint,
    params: Params,
}

impl RequestKey {
    pub fn new(endpoint: Endpoint, params: Params) -> Self {
        Self { endpoint, params }
    }

    /// Builds a key from `"METHOD /path"` and a JSON parameter object.
    pub fn parse(endpoint: &str, params: Value) -> Result<Self, KeyError> {
        Ok(Self::new(Endpoint::parse(endpoint)?, Params::new(params)?))
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn params(&self) -> &Params {
        &self.params
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.params.is_empty() {
            write!(f, "{}", self.endpoint)
        } else {
            write!(f, "{} {}", self.endpoint, self.params)
        }
    }
}

/// Opaque invalidation label such as `Leaves` or `Project:123`.
///
/// Matching is exact: invalidating `Project` does not touch entries that only
/// provide `Project:123`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(String);

impl Tag {
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    /// `Tag::with_id("Project", 123)` is `Project:123`.
    pub fn with_id(kind: &str, id: impl fmt::Display) -> Self {
        Self(format!("{kind}:{id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Tag {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Tag {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&Tag> for Tag {
    fn from(value: &Tag) -> Self {
        value.clone()
    }
}
