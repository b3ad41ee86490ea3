use std::collections::HashSet;

use serde_json::Value;

use super::keys::{KeyError, Params, RequestKey, Tag};

/// A subscription request: which read to perform and which tags it provides.
///
/// Tags are attached when the entry is first created; later subscriptions to
/// the same key with different tags do not retag it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    key: RequestKey,
    tags: HashSet<Tag>,
}

impl Query {
    /// A parameterless read of `endpoint` (`"GET /leaves"`).
    pub fn new(endpoint: &str) -> Result<Self, KeyError> {
        Ok(Self::from_key(RequestKey::parse(endpoint, Value::Null)?))
    }

    pub fn from_key(key: RequestKey) -> Self {
        Self {
            key,
            tags: HashSet::new(),
        }
    }

    pub fn params(self, params: Value) -> Result<Self, KeyError> {
        let key = RequestKey::new(self.key.endpoint().clone(), Params::new(params)?);
        Ok(Self { key, ..self })
    }

    pub fn provides<I, T>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Tag>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn key(&self) -> &RequestKey {
        &self.key
    }

    pub fn tags(&self) -> &HashSet<Tag> {
        &self.tags
    }

    pub(crate) fn into_parts(self) -> (RequestKey, HashSet<Tag>) {
        (self.key, self.tags)
    }
}
