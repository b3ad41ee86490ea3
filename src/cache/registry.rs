//! Bidirectional tag registry.
//!
//! Tracks which request keys carry which tags so that invalidating a tag can
//! find every affected entry, and so that evicting an entry can drop its tag
//! mappings. The registry lives inside the cache state lock; it does no
//! locking of its own.

use std::collections::{HashMap, HashSet};

use super::keys::{RequestKey, Tag};

#[derive(Debug, Default)]
pub(crate) struct TagRegistry {
    tag_to_keys: HashMap<Tag, HashSet<RequestKey>>,
    key_to_tags: HashMap<RequestKey, HashSet<Tag>>,
}

impl TagRegistry {
    #[cfg(test)]
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Records the tags an entry was created with.
    pub(crate) fn register(&mut self, key: &RequestKey, tags: &HashSet<Tag>) {
        for tag in tags {
            self.tag_to_keys
                .entry(tag.clone())
                .or_default()
                .insert(key.clone());
        }
        self.key_to_tags.insert(key.clone(), tags.clone());
    }

    /// All keys carrying at least one of `tags`.
    pub(crate) fn keys_for_tags<'a>(
        &self,
        tags: impl IntoIterator<Item = &'a Tag>,
    ) -> HashSet<RequestKey> {
        let mut keys = HashSet::new();
        for tag in tags {
            if let Some(tagged) = self.tag_to_keys.get(tag) {
                keys.extend(tagged.iter().cloned());
            }
        }
        keys
    }

    #[cfg(test)]
    pub(crate) fn tags_for_key(&self, key: &RequestKey) -> HashSet<Tag> {
        self.key_to_tags.get(key).cloned().unwrap_or_default()
    }

    /// Drops a key and every tag mapping that pointed at it.
    pub(crate) fn unregister(&mut self, key: &RequestKey) {
        if let Some(tags) = self.key_to_tags.remove(key) {
            for tag in tags {
                if let Some(keys) = self.tag_to_keys.get_mut(&tag) {
                    keys.remove(key);
                    if keys.is_empty() {
                        self.tag_to_keys.remove(&tag);
                    }
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn tag_count(&self) -> usize {
        self.tag_to_keys.len()
    }

    #[cfg(test)]
    pub(crate) fn key_count(&self) -> usize {
        self.key_to_tags.len()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn key(endpoint: &str, page: u32) -> RequestKey {
        RequestKey::parse(endpoint, json!({ "page": page })).expect("key")
    }

    fn tags(labels: &[&str]) -> HashSet<Tag> {
        labels.iter().map(|label| Tag::new(*label)).collect()
    }

    #[test]
    fn register_and_lookup() {
        let mut registry = TagRegistry::new();
        let leaves = key("GET /leaves", 1);

        registry.register(&leaves, &tags(&["Leaves"]));

        let found = registry.keys_for_tags([&Tag::new("Leaves")]);
        assert!(found.contains(&leaves));
        assert!(registry.tags_for_key(&leaves).contains(&Tag::new("Leaves")));
    }

    #[test]
    fn lookup_unions_across_tags() {
        let mut registry = TagRegistry::new();
        let leaves = key("GET /leaves", 1);
        let clients = key("GET /clients", 1);
        let tasks = key("GET /tasks", 1);

        registry.register(&leaves, &tags(&["Leaves"]));
        registry.register(&clients, &tags(&["Clients"]));
        registry.register(&tasks, &tags(&["Tasks", "Project:9"]));

        let found = registry.keys_for_tags([&Tag::new("Leaves"), &Tag::new("Project:9")]);
        assert_eq!(found.len(), 2);
        assert!(found.contains(&leaves));
        assert!(found.contains(&tasks));
        assert!(!found.contains(&clients));
    }

    #[test]
    fn tag_matching_is_exact() {
        let mut registry = TagRegistry::new();
        let project = key("GET /projects/123", 1);
        registry.register(&project, &tags(&["Project:123"]));

        assert!(registry.keys_for_tags([&Tag::new("Project")]).is_empty());
    }

    #[test]
    fn unregister_cleans_up_mappings() {
        let mut registry = TagRegistry::new();
        let leaves = key("GET /leaves", 1);

        registry.register(&leaves, &tags(&["Leaves", "Dashboard"]));
        assert_eq!(registry.key_count(), 1);
        assert_eq!(registry.tag_count(), 2);

        registry.unregister(&leaves);
        assert_eq!(registry.key_count(), 0);
        assert_eq!(registry.tag_count(), 0);
    }

    #[test]
    fn unregister_keeps_other_keys_under_shared_tag() {
        let mut registry = TagRegistry::new();
        let first = key("GET /leaves", 1);
        let second = key("GET /leaves", 2);
        registry.register(&first, &tags(&["Leaves"]));
        registry.register(&second, &tags(&["Leaves"]));

        registry.unregister(&first);

        let found = registry.keys_for_tags([&Tag::new("Leaves")]);
        assert_eq!(found.len(), 1);
        assert!(found.contains(&second));
    }

    #[test]
    fn untagged_key_is_tracked_without_tags() {
        let mut registry = TagRegistry::new();
        let me = key("GET /me", 1);
        registry.register(&me, &HashSet::new());

        assert_eq!(registry.key_count(), 1);
        assert_eq!(registry.tag_count(), 0);
        assert!(registry.tags_for_key(&me).is_empty());
    }
}
