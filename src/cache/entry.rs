//! Cache entries and the snapshots they publish.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::watch;

use super::backend::BackendError;
use super::keys::{RequestKey, Tag};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryStatus {
    Uninitialized,
    Loading,
    Success,
    Error,
}

impl QueryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Loading => "loading",
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

/// Immutable view of one entry at a point in time.
///
/// Every change to an entry publishes a fresh `Arc<QueryState>`, so readers
/// always see `status`, `data` and `error` from the same update.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryState {
    pub status: QueryStatus,
    /// Last successfully fetched value. Survives failed refetches.
    pub data: Option<Value>,
    /// Error from the most recent fetch, cleared by the next success.
    pub error: Option<BackendError>,
    /// Set by tag invalidation until a fetch issued afterwards succeeds.
    pub is_stale: bool,
    /// A fetch for this entry is in flight.
    pub is_fetching: bool,
    pub last_fetched_at: Option<OffsetDateTime>,
}

impl Default for QueryState {
    fn default() -> Self {
        Self {
            status: QueryStatus::Uninitialized,
            data: None,
            error: None,
            is_stale: false,
            is_fetching: false,
            last_fetched_at: None,
        }
    }
}

/// What a consumer should render for a [`QueryState`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum QueryOutcome<'a> {
    /// Nothing fetched yet and nothing in flight.
    Idle,
    /// First fetch in flight; no data to show.
    Loading,
    Ready { data: &'a Value, refreshing: bool },
    /// Fetch failed. `last_good` distinguishes "error with stale data" from
    /// "error, no data yet".
    Failed {
        error: &'a BackendError,
        last_good: Option<&'a Value>,
    },
}

impl QueryState {
    pub fn outcome(&self) -> QueryOutcome<'_> {
        match (self.status, &self.error, &self.data) {
            (QueryStatus::Error, Some(error), data) => QueryOutcome::Failed {
                error,
                last_good: data.as_ref(),
            },
            (_, _, Some(data)) => QueryOutcome::Ready {
                data,
                refreshing: self.is_fetching,
            },
            (QueryStatus::Uninitialized, _, None) if !self.is_fetching => QueryOutcome::Idle,
            _ => QueryOutcome::Loading,
        }
    }

    /// No fetch is in flight for this entry.
    pub fn is_settled(&self) -> bool {
        !self.is_fetching && self.status != QueryStatus::Loading
    }
}

/// Diagnostic view of one entry.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryInfo {
    pub state: Arc<QueryState>,
    pub subscriber_count: usize,
    pub tags: HashSet<Tag>,
}

/// Result of trying to commit a fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CommitOutcome {
    Applied,
    /// A newer fetch was issued after this one; its result wins.
    Superseded,
}

/// Mutable per-key bookkeeping. Lives inside the cache state lock.
#[derive(Debug)]
pub(crate) struct CacheEntry {
    pub(crate) key: RequestKey,
    pub(crate) tags: HashSet<Tag>,
    pub(crate) subscribers: usize,
    /// Bumped whenever the subscriber count drops to zero; a pending
    /// eviction only fires if the epoch it captured is still current.
    pub(crate) eviction_epoch: u64,
    state: QueryState,
    publisher: watch::Sender<Arc<QueryState>>,
    /// Sequence number of the most recently issued fetch.
    issued_seq: u64,
    in_flight: Option<u64>,
    /// `issued_seq` at the time of the last invalidation.
    stale_mark: Option<u64>,
}

impl CacheEntry {
    pub(crate) fn new(key: RequestKey, tags: HashSet<Tag>) -> Self {
        let state = QueryState::default();
        let (publisher, _) = watch::channel(Arc::new(state.clone()));
        Self {
            key,
            tags,
            subscribers: 0,
            eviction_epoch: 0,
            state,
            publisher,
            issued_seq: 0,
            in_flight: None,
            stale_mark: None,
        }
    }

    pub(crate) fn watch(&self) -> watch::Receiver<Arc<QueryState>> {
        self.publisher.subscribe()
    }

    pub(crate) fn snapshot(&self) -> Arc<QueryState> {
        Arc::clone(&self.publisher.borrow())
    }

    pub(crate) fn info(&self) -> EntryInfo {
        EntryInfo {
            state: self.snapshot(),
            subscriber_count: self.subscribers,
            tags: self.tags.clone(),
        }
    }

    /// Whether a new subscriber should trigger a fetch.
    ///
    /// A fetch already in flight that was issued after the last invalidation
    /// covers the request, so concurrent subscribers share it.
    pub(crate) fn needs_fetch(&self) -> bool {
        if let Some(seq) = self.in_flight
            && self.stale_mark.is_none_or(|mark| seq > mark)
        {
            return false;
        }
        self.state.is_stale || self.state.data.is_none() || self.state.status == QueryStatus::Error
    }

    pub(crate) fn is_fetching(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Records a new fetch with sequence `seq` and publishes the loading state.
    ///
    /// `seq` must be greater than every sequence issued before it.
    pub(crate) fn begin_fetch(&mut self, seq: u64) {
        self.issued_seq = seq;
        self.in_flight = Some(seq);
        if self.state.data.is_none() {
            self.state.status = QueryStatus::Loading;
        }
        self.state.is_fetching = true;
        self.publish();
    }

    pub(crate) fn mark_stale(&mut self) {
        self.stale_mark = Some(self.issued_seq);
        if !self.state.is_stale {
            self.state.is_stale = true;
            self.publish();
        }
    }

    /// Applies the result of fetch `seq` if it is the most recently issued one.
    pub(crate) fn commit(
        &mut self,
        seq: u64,
        result: Result<Value, BackendError>,
    ) -> CommitOutcome {
        if seq != self.issued_seq {
            return CommitOutcome::Superseded;
        }
        self.in_flight = None;
        self.state.is_fetching = false;
        self.state.last_fetched_at = Some(OffsetDateTime::now_utc());
        match result {
            Ok(data) => {
                self.state.status = QueryStatus::Success;
                self.state.data = Some(data);
                self.state.error = None;
                if self.stale_mark.is_none_or(|mark| seq > mark) {
                    self.state.is_stale = false;
                    self.stale_mark = None;
                }
            }
            Err(error) => {
                self.state.status = QueryStatus::Error;
                self.state.error = Some(error);
            }
        }
        self.publish();
        CommitOutcome::Applied
    }

    fn publish(&self) {
        self.publisher.send_replace(Arc::new(self.state.clone()));
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn entry() -> CacheEntry {
        let key = RequestKey::parse("GET /leaves", json!({ "page": 1 })).expect("key");
        CacheEntry::new(key, HashSet::from([Tag::new("Leaves")]))
    }

    #[test]
    fn new_entry_needs_fetch_and_is_idle() {
        let entry = entry();
        assert!(entry.needs_fetch());
        assert_eq!(entry.snapshot().outcome(), QueryOutcome::Idle);
    }

    #[test]
    fn in_flight_fetch_is_shared() {
        let mut entry = entry();
        entry.begin_fetch(1);

        assert!(!entry.needs_fetch());
        assert_eq!(entry.snapshot().status, QueryStatus::Loading);
        assert_eq!(entry.snapshot().outcome(), QueryOutcome::Loading);
    }

    #[test]
    fn success_publishes_data() {
        let mut entry = entry();
        entry.begin_fetch(1);

        let outcome = entry.commit(1, Ok(json!({ "items": [1] })));

        assert_eq!(outcome, CommitOutcome::Applied);
        let state = entry.snapshot();
        assert_eq!(state.status, QueryStatus::Success);
        assert_eq!(state.data, Some(json!({ "items": [1] })));
        assert!(state.is_settled());
        assert!(state.last_fetched_at.is_some());
        assert!(!entry.needs_fetch());
    }

    #[test]
    fn older_fetch_is_superseded_by_newer_issue() {
        let mut entry = entry();
        entry.begin_fetch(1);
        entry.begin_fetch(2);

        assert_eq!(entry.commit(2, Ok(json!("second"))), CommitOutcome::Applied);
        assert_eq!(entry.commit(1, Ok(json!("first"))), CommitOutcome::Superseded);
        assert_eq!(entry.snapshot().data, Some(json!("second")));
    }

    #[test]
    fn older_fetch_arriving_first_is_also_superseded() {
        let mut entry = entry();
        entry.begin_fetch(1);
        entry.begin_fetch(2);

        assert_eq!(entry.commit(1, Ok(json!("first"))), CommitOutcome::Superseded);
        assert!(entry.snapshot().is_fetching);
        assert_eq!(entry.commit(2, Ok(json!("second"))), CommitOutcome::Applied);
        assert_eq!(entry.snapshot().data, Some(json!("second")));
    }

    #[test]
    fn failure_keeps_last_good_data() {
        let mut entry = entry();
        entry.begin_fetch(1);
        entry.commit(1, Ok(json!({ "items": [] })));

        entry.mark_stale();
        entry.begin_fetch(2);
        let error = BackendError::http(500, "boom", None);
        entry.commit(2, Err(error.clone()));

        let state = entry.snapshot();
        assert_eq!(state.status, QueryStatus::Error);
        assert_eq!(state.data, Some(json!({ "items": [] })));
        assert_eq!(
            state.outcome(),
            QueryOutcome::Failed {
                error: &error,
                last_good: Some(&json!({ "items": [] })),
            }
        );
    }

    #[test]
    fn failure_without_data_has_no_last_good() {
        let mut entry = entry();
        entry.begin_fetch(1);
        let error = BackendError::transport("refused");
        entry.commit(1, Err(error.clone()));

        assert_eq!(
            entry.snapshot().outcome(),
            QueryOutcome::Failed {
                error: &error,
                last_good: None,
            }
        );
        assert!(entry.needs_fetch());
    }

    #[test]
    fn invalidation_during_flight_requires_new_fetch() {
        let mut entry = entry();
        entry.begin_fetch(1);
        entry.mark_stale();

        assert!(entry.needs_fetch());

        // The pre-invalidation fetch lands but does not clear staleness.
        entry.commit(1, Ok(json!("old")));
        let state = entry.snapshot();
        assert!(state.is_stale);
        assert_eq!(state.data, Some(json!("old")));
        assert!(entry.needs_fetch());

        entry.begin_fetch(2);
        entry.commit(2, Ok(json!("new")));
        assert!(!entry.snapshot().is_stale);
        assert!(!entry.needs_fetch());
    }

    #[test]
    fn refetch_with_data_reports_refreshing() {
        let mut entry = entry();
        entry.begin_fetch(1);
        entry.commit(1, Ok(json!(1)));
        entry.mark_stale();
        entry.begin_fetch(2);

        let state = entry.snapshot();
        assert_eq!(state.status, QueryStatus::Success);
        assert_eq!(
            state.outcome(),
            QueryOutcome::Ready {
                data: &json!(1),
                refreshing: true,
            }
        );
    }
}
