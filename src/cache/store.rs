//! Process-wide query cache.
//!
//! All entries and the tag registry sit behind one mutex. Every lock section
//! is synchronous and short; fetches run on spawned tasks and re-enter the
//! lock only to commit their result.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use metrics::{counter, histogram};
use serde_json::Value;
use tokio::runtime::Handle;
use tracing::{Instrument, debug, debug_span, info, warn};

use crate::identity::IdentitySource;
use crate::util::lock::mutex_lock;

use super::backend::{Backend, BackendError, BackendRequest};
use super::config::QueryCacheConfig;
use super::entry::{CacheEntry, CommitOutcome, EntryInfo, QueryState};
use super::error::QueryError;
use super::keys::{RequestKey, Tag};
use super::mutation::{Mutation, MutationRecord, MutationStatus};
use super::query::Query;
use super::registry::TagRegistry;
use super::subscription::Subscription;

const SOURCE: &str = "cache::store";

/// Deduplicating, tag-invalidated cache of backend reads.
///
/// Cheap to clone; clones share the same entries.
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<CacheInner>,
}

pub(crate) struct CacheInner {
    config: QueryCacheConfig,
    backend: Arc<dyn Backend>,
    identity: IdentitySource,
    state: Mutex<CacheState>,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<RequestKey, CacheEntry>,
    registry: TagRegistry,
    /// Source of fetch sequence numbers and eviction epochs. Never reused,
    /// so a late fetch or timer can't match an entry recreated under the
    /// same key.
    ticket: u64,
}

fn next_ticket(ticket: &mut u64) -> u64 {
    *ticket += 1;
    *ticket
}

impl QueryCache {
    pub fn new(
        config: QueryCacheConfig,
        backend: Arc<dyn Backend>,
        identity: IdentitySource,
    ) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                config,
                backend,
                identity,
                state: Mutex::new(CacheState::default()),
            }),
        }
    }

    pub fn identity(&self) -> &IdentitySource {
        &self.inner.identity
    }

    /// Subscribes to a read, creating the entry and issuing a fetch when
    /// needed.
    ///
    /// Returns immediately with whatever is cached; a fetch for a missing,
    /// stale or failed entry runs in the background. Concurrent subscribers
    /// share one in-flight fetch. Must be called within a Tokio runtime for
    /// fetches to run.
    pub fn subscribe(&self, query: Query) -> Subscription {
        let (key, tags) = query.into_parts();

        let (receiver, fetch) = {
            let mut guard = mutex_lock(&self.inner.state, SOURCE, "subscribe");
            let CacheState {
                entries,
                registry,
                ticket,
            } = &mut *guard;

            let entry = match entries.entry(key.clone()) {
                Entry::Occupied(occupied) => occupied.into_mut(),
                Entry::Vacant(vacant) => {
                    registry.register(&key, &tags);
                    debug!(key = %key, tags = tags.len(), "Cache entry created");
                    vacant.insert(CacheEntry::new(key.clone(), tags))
                }
            };
            entry.subscribers += 1;

            let fetch = if entry.needs_fetch() {
                let seq = next_ticket(ticket);
                entry.begin_fetch(seq);
                Some(seq)
            } else {
                if entry.is_fetching() {
                    counter!("portal_query_coalesced_total").increment(1);
                    debug!(key = %key, "Joined in-flight fetch");
                }
                None
            };
            (entry.watch(), fetch)
        };

        if let Some(seq) = fetch {
            spawn_fetch(&self.inner, key.clone(), seq);
        }
        Subscription::new(Arc::clone(&self.inner), key, receiver)
    }

    /// Executes one write and, on success, invalidates its declared tags
    /// before returning.
    ///
    /// A failed mutation leaves the cache untouched.
    pub async fn mutate(&self, mutation: Mutation) -> Result<Value, QueryError> {
        let Some(user) = self.inner.identity.current() else {
            counter!("portal_mutation_total", "outcome" => "rejected").increment(1);
            warn!(
                endpoint = %mutation.endpoint(),
                "Mutation rejected: no signed-in user"
            );
            return Err(QueryError::MissingIdentity(mutation.endpoint().clone()));
        };

        let mut record = MutationRecord::start(&mutation);
        info!(
            mutation_id = %record.id,
            endpoint = %record.endpoint,
            user = %user,
            invalidates = %record.tag_list(),
            status = %record.status,
            "Mutation issued"
        );

        let request = BackendRequest::new(
            mutation.endpoint(),
            mutation.params_ref(),
            mutation.body_ref().cloned(),
        );
        match self.inner.backend.execute(request).await {
            Ok(value) => {
                record.finish(MutationStatus::Success);
                let invalidated = self.invalidate_tags(&record.invalidates);
                counter!("portal_mutation_total", "outcome" => "success").increment(1);
                info!(
                    mutation_id = %record.id,
                    endpoint = %record.endpoint,
                    status = %record.status,
                    invalidated,
                    "Mutation succeeded"
                );
                Ok(value)
            }
            Err(error) => {
                record.finish(MutationStatus::Error);
                counter!("portal_mutation_total", "outcome" => "error").increment(1);
                warn!(
                    mutation_id = %record.id,
                    endpoint = %record.endpoint,
                    status = %record.status,
                    error = %error,
                    "Mutation failed"
                );
                Err(QueryError::Backend(error))
            }
        }
    }

    /// Marks every entry carrying any of `tags` stale and refetches the ones
    /// with subscribers. Returns how many entries were marked.
    ///
    /// All matching entries are stale before the first refetch is issued.
    pub fn invalidate_tags<I, T>(&self, tags: I) -> usize
    where
        I: IntoIterator<Item = T>,
        T: Into<Tag>,
    {
        let tags: Vec<Tag> = tags.into_iter().map(Into::into).collect();

        let (marked, fetches) = {
            let mut guard = mutex_lock(&self.inner.state, SOURCE, "invalidate_tags");
            let CacheState {
                entries,
                registry,
                ticket,
            } = &mut *guard;

            let keys = registry.keys_for_tags(&tags);
            for key in &keys {
                if let Some(entry) = entries.get_mut(key) {
                    entry.mark_stale();
                }
            }

            let mut fetches = Vec::new();
            for key in &keys {
                if let Some(entry) = entries.get_mut(key)
                    && entry.subscribers > 0
                {
                    let seq = next_ticket(ticket);
                    entry.begin_fetch(seq);
                    fetches.push((key.clone(), seq));
                }
            }
            (keys.len(), fetches)
        };

        counter!("portal_query_invalidated_total").increment(marked as u64);
        debug!(
            tags = ?tags.iter().map(Tag::as_str).collect::<Vec<_>>(),
            marked,
            refetching = fetches.len(),
            "Tags invalidated"
        );
        for (key, seq) in fetches {
            spawn_fetch(&self.inner, key, seq);
        }
        marked
    }

    /// Drops idle entries and refetches the rest. Used when the signed-in
    /// user changes so nothing fetched for the previous user stays fresh.
    pub fn reset(&self) -> usize {
        let (evicted, fetches) = {
            let mut guard = mutex_lock(&self.inner.state, SOURCE, "reset");
            let CacheState {
                entries,
                registry,
                ticket,
            } = &mut *guard;

            let idle: Vec<RequestKey> = entries
                .iter()
                .filter(|(_, entry)| entry.subscribers == 0)
                .map(|(key, _)| key.clone())
                .collect();
            for key in &idle {
                entries.remove(key);
                registry.unregister(key);
            }

            for entry in entries.values_mut() {
                entry.mark_stale();
            }
            let mut fetches = Vec::with_capacity(entries.len());
            for (key, entry) in entries.iter_mut() {
                let seq = next_ticket(ticket);
                entry.begin_fetch(seq);
                fetches.push((key.clone(), seq));
            }
            (idle.len(), fetches)
        };

        counter!("portal_query_evict_total").increment(evicted as u64);
        info!(evicted, refetching = fetches.len(), "Query cache reset");
        for (key, seq) in fetches {
            spawn_fetch(&self.inner, key, seq);
        }
        evicted
    }

    pub fn snapshot(&self, key: &RequestKey) -> Option<Arc<QueryState>> {
        mutex_lock(&self.inner.state, SOURCE, "snapshot")
            .entries
            .get(key)
            .map(CacheEntry::snapshot)
    }

    pub fn entry_info(&self, key: &RequestKey) -> Option<EntryInfo> {
        mutex_lock(&self.inner.state, SOURCE, "entry_info")
            .entries
            .get(key)
            .map(CacheEntry::info)
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.inner.state, SOURCE, "len").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheInner {
    /// Decrements the subscriber count and schedules eviction once it
    /// reaches zero.
    pub(crate) fn unsubscribe(self: Arc<Self>, key: &RequestKey) {
        let epoch = {
            let mut guard = mutex_lock(&self.state, SOURCE, "unsubscribe");
            let CacheState {
                entries, ticket, ..
            } = &mut *guard;
            let Some(entry) = entries.get_mut(key) else {
                return;
            };
            entry.subscribers = entry.subscribers.saturating_sub(1);
            if entry.subscribers > 0 {
                return;
            }
            entry.eviction_epoch = next_ticket(ticket);
            entry.eviction_epoch
        };

        let keep_for = self.config.keep_unused_for;
        if keep_for.is_zero() {
            self.evict_if_idle(key, epoch);
            return;
        }
        let Ok(handle) = Handle::try_current() else {
            self.evict_if_idle(key, epoch);
            return;
        };

        debug!(key = %key, keep_for_ms = keep_for.as_millis() as u64, "Eviction scheduled");
        let weak: Weak<CacheInner> = Arc::downgrade(&self);
        let key = key.clone();
        handle.spawn(async move {
            tokio::time::sleep(keep_for).await;
            if let Some(inner) = weak.upgrade() {
                inner.evict_if_idle(&key, epoch);
            }
        });
    }

    fn evict_if_idle(&self, key: &RequestKey, epoch: u64) -> bool {
        let mut guard = mutex_lock(&self.state, SOURCE, "evict");
        let CacheState {
            entries, registry, ..
        } = &mut *guard;

        let idle = entries
            .get(key)
            .is_some_and(|entry| entry.subscribers == 0 && entry.eviction_epoch == epoch);
        if !idle {
            return false;
        }
        entries.remove(key);
        registry.unregister(key);
        counter!("portal_query_evict_total").increment(1);
        debug!(key = %key, "Cache entry evicted");
        true
    }

    fn commit(&self, key: &RequestKey, seq: u64, result: Result<Value, BackendError>) {
        if let Err(error) = &result {
            warn!(key = %key, seq, error = %error, "Fetch failed");
        }

        let mut guard = mutex_lock(&self.state, SOURCE, "commit");
        let Some(entry) = guard.entries.get_mut(key) else {
            debug!(key = %key, seq, "Fetch result dropped: entry evicted");
            return;
        };
        match entry.commit(seq, result) {
            CommitOutcome::Applied => {
                debug!(
                    key = %entry.key,
                    seq,
                    status = entry.snapshot().status.as_str(),
                    "Fetch committed"
                );
            }
            CommitOutcome::Superseded => {
                counter!("portal_query_superseded_total").increment(1);
                debug!(key = %key, seq, "Fetch superseded by a newer request");
            }
        }
    }
}

fn spawn_fetch(inner: &Arc<CacheInner>, key: RequestKey, seq: u64) {
    counter!("portal_query_fetch_total").increment(1);
    debug!(key = %key, seq, "Fetch issued");

    let Ok(handle) = Handle::try_current() else {
        inner.commit(
            &key,
            seq,
            Err(BackendError::transport("no async runtime available to run the fetch")),
        );
        return;
    };

    let inner = Arc::clone(inner);
    let span = debug_span!("query_fetch", key = %key, seq);
    handle.spawn(
        async move {
            let request = BackendRequest::new(key.endpoint(), key.params(), None);
            let started = Instant::now();
            let result = inner.backend.execute(request).await;
            histogram!("portal_query_fetch_ms").record(started.elapsed().as_secs_f64() * 1000.0);
            inner.commit(&key, seq, result);
        }
        .instrument(span),
    );
}
