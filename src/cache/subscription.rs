use std::sync::Arc;

use tokio::sync::watch;

use super::entry::QueryState;
use super::keys::RequestKey;
use super::store::CacheInner;

/// Live view of one cache entry. Dropping it unsubscribes.
pub struct Subscription {
    cache: Arc<CacheInner>,
    key: RequestKey,
    receiver: watch::Receiver<Arc<QueryState>>,
}

impl Subscription {
    pub(crate) fn new(
        cache: Arc<CacheInner>,
        key: RequestKey,
        receiver: watch::Receiver<Arc<QueryState>>,
    ) -> Self {
        Self {
            cache,
            key,
            receiver,
        }
    }

    pub fn key(&self) -> &RequestKey {
        &self.key
    }

    /// The latest published state.
    pub fn state(&self) -> Arc<QueryState> {
        Arc::clone(&self.receiver.borrow())
    }

    /// Waits for the next state change. `None` once the entry is gone.
    pub async fn changed(&mut self) -> Option<Arc<QueryState>> {
        self.receiver.changed().await.ok()?;
        Some(Arc::clone(&self.receiver.borrow_and_update()))
    }

    /// Waits until no fetch is in flight and returns that state.
    pub async fn settled(&mut self) -> Arc<QueryState> {
        let settled = self
            .receiver
            .wait_for(|state| state.is_settled())
            .await
            .map(|state| Arc::clone(&state));
        settled.unwrap_or_else(|_| self.state())
    }
}

/// Dropping the last subscription to an entry starts its
/// `keep_unused_for` countdown. Outside a Tokio runtime no timer can run, so
/// the entry is evicted at once instead.
impl Drop for Subscription {
    fn drop(&mut self) {
        Arc::clone(&self.cache).unsubscribe(&self.key);
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("state", &self.state())
            .finish()
    }
}
