//! Write operations and their invalidation declarations.

use std::collections::HashSet;
use std::fmt;

use serde_json::Value;
use uuid::Uuid;

use super::keys::{Endpoint, KeyError, Params, Tag};

/// A write against the backend plus the tags it invalidates on success.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    endpoint: Endpoint,
    params: Params,
    body: Option<Value>,
    invalidates: HashSet<Tag>,
}

impl Mutation {
    pub fn new(endpoint: &str) -> Result<Self, KeyError> {
        Ok(Self {
            endpoint: Endpoint::parse(endpoint)?,
            params: Params::empty(),
            body: None,
            invalidates: HashSet::new(),
        })
    }

    pub fn params(mut self, params: Value) -> Result<Self, KeyError> {
        self.params = Params::new(params)?;
        Ok(self)
    }

    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn invalidates<I, T>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Tag>,
    {
        self.invalidates.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn params_ref(&self) -> &Params {
        &self.params
    }

    pub fn body_ref(&self) -> Option<&Value> {
        self.body.as_ref()
    }

    pub fn invalidated_tags(&self) -> &HashSet<Tag> {
        &self.invalidates
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
    Pending,
    Success,
    Error,
}

impl MutationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for MutationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracks one in-progress mutation for logging. Never cached.
#[derive(Debug, Clone)]
pub struct MutationRecord {
    pub id: Uuid,
    pub endpoint: Endpoint,
    pub status: MutationStatus,
    pub invalidates: HashSet<Tag>,
}

impl MutationRecord {
    pub(crate) fn start(mutation: &Mutation) -> Self {
        Self {
            id: Uuid::new_v4(),
            endpoint: mutation.endpoint.clone(),
            status: MutationStatus::Pending,
            invalidates: mutation.invalidates.clone(),
        }
    }

    pub(crate) fn finish(&mut self, status: MutationStatus) {
        self.status = status;
    }

    /// Tags rendered as a sorted, comma-separated list for log fields.
    pub(crate) fn tag_list(&self) -> String {
        let mut tags: Vec<&str> = self.invalidates.iter().map(Tag::as_str).collect();
        tags.sort_unstable();
        tags.join(",")
    }
}
