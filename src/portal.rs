//! Wiring between identity, the event channel and the query cache.
//!
//! The channel never touches the cache on its own. The notification handler
//! registered here is the only coupling: each pushed notification bumps the
//! unread badge and invalidates the notification tags so subscribed
//! notification lists refetch.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::cache::{KeyError, Query, QueryCache, Tag};
use crate::channel::{EventChannel, EventHandler};
use crate::identity::IdentitySource;
use crate::types::{NOTIFICATION_EVENT, NotificationEvent, UserId};

/// Unread notification badge.
#[derive(Debug, Clone)]
pub struct UnreadCounter {
    sender: Arc<watch::Sender<u64>>,
}

impl UnreadCounter {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(0);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn get(&self) -> u64 {
        *self.sender.borrow()
    }

    pub fn increment(&self) -> u64 {
        let mut value = 0;
        self.sender.send_modify(|count| {
            *count = count.saturating_add(1);
            value = *count;
        });
        value
    }

    pub fn mark_all_read(&self) {
        self.sender.send_if_modified(|count| std::mem::take(count) != 0);
    }

    pub fn watch(&self) -> watch::Receiver<u64> {
        self.sender.subscribe()
    }
}

impl Default for UnreadCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Which pushed event counts as a notification and what it invalidates.
#[derive(Debug, Clone, PartialEq)]
pub struct PortalConfig {
    pub notification_event: String,
    pub notification_tags: Vec<Tag>,
    /// Read used for the notification list, e.g. `GET /notifications`.
    pub notifications_endpoint: String,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            notification_event: NOTIFICATION_EVENT.to_string(),
            notification_tags: vec![Tag::new("Notifications")],
            notifications_endpoint: "GET /notifications".to_string(),
        }
    }
}

impl From<&crate::config::PortalSettings> for PortalConfig {
    fn from(settings: &crate::config::PortalSettings) -> Self {
        Self {
            notification_event: settings.notification_event.clone(),
            notification_tags: settings
                .notification_tags
                .iter()
                .map(|tag| Tag::new(tag.as_str()))
                .collect(),
            notifications_endpoint: settings.notifications_endpoint.clone(),
        }
    }
}

/// Keeps the channel session and the cache in step with the signed-in user.
#[derive(Clone)]
pub struct PortalSync {
    cache: QueryCache,
    channel: EventChannel,
    unread: UnreadCounter,
    config: Arc<PortalConfig>,
}

impl PortalSync {
    pub fn new(cache: QueryCache, channel: EventChannel, config: PortalConfig) -> Self {
        Self {
            cache,
            channel,
            unread: UnreadCounter::new(),
            config: Arc::new(config),
        }
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    pub fn channel(&self) -> &EventChannel {
        &self.channel
    }

    pub fn identity(&self) -> &IdentitySource {
        self.cache.identity()
    }

    pub fn unread(&self) -> &UnreadCounter {
        &self.unread
    }

    /// The notification list query, tagged so pushed notifications refresh it.
    pub fn notifications_query(&self) -> Result<Query, KeyError> {
        Ok(Query::new(&self.config.notifications_endpoint)?
            .provides(self.config.notification_tags.iter()))
    }

    /// Follows identity changes until the identity source is dropped.
    ///
    /// Applies the current identity first, so a user signed in before
    /// `start` still gets a session.
    pub fn start(&self) -> JoinHandle<()> {
        let portal = self.clone();
        let mut identity = self.identity().watch();
        tokio::spawn(
            async move {
                let current = identity.borrow_and_update().clone();
                portal.apply_identity(current).await;
                while identity.changed().await.is_ok() {
                    let current = identity.borrow_and_update().clone();
                    portal.apply_identity(current).await;
                }
                debug!("Identity source dropped; portal sync stopped");
            }
            .instrument(info_span!("portal_sync")),
        )
    }

    /// Opens, switches or closes the channel for `user`.
    pub async fn apply_identity(&self, user: Option<UserId>) {
        let Some(user) = user else {
            let had_session = self.channel.current_user().is_some();
            self.channel.close().await;
            if had_session {
                self.cache.reset();
                self.unread.mark_all_read();
                info!("Signed out; channel closed and cache reset");
            }
            return;
        };

        let previous = self.channel.current_user();
        if previous.as_ref() == Some(&user) && self.channel.state().is_live() {
            return;
        }

        // The old session must be gone before the reset, and the new handler
        // in place before the new session connects.
        if previous.is_some_and(|previous| previous != user) {
            self.channel.close().await;
            self.cache.reset();
            self.unread.mark_all_read();
            info!(user = %user, "Switched user; cache reset");
        }
        let handlers = vec![(
            self.config.notification_event.clone(),
            self.notification_handler(),
        )];
        self.channel.open_with(user, handlers).await;
    }

    fn notification_handler(&self) -> EventHandler {
        let cache = self.cache.clone();
        let unread = self.unread.clone();
        let tags = self.config.notification_tags.clone();
        Arc::new(move |data: &Value| {
            cache.invalidate_tags(&tags);
            match serde_json::from_value::<NotificationEvent>(data.clone()) {
                Ok(event) => {
                    let count = unread.increment();
                    debug!(kind = %event.kind, unread = count, "Notification received");
                }
                Err(error) => {
                    warn!(error = %error, "Notification payload did not decode");
                }
            }
        })
    }
}
