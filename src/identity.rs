//! Current user identity.
//!
//! Both the query cache and the event channel follow this value: the cache
//! refuses mutations while it is empty, and [`PortalSync`](crate::portal::PortalSync)
//! opens or closes the channel whenever it changes.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use crate::types::UserId;

/// Shared, observable `Option<UserId>`. Clones observe the same value.
#[derive(Debug, Clone)]
pub struct IdentitySource {
    sender: Arc<watch::Sender<Option<UserId>>>,
}

impl IdentitySource {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(None);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn with_user(user: impl Into<UserId>) -> Self {
        let source = Self::new();
        source.login(user);
        source
    }

    /// Sets the current user. Watchers are only notified when the user
    /// actually changes.
    pub fn login(&self, user: impl Into<UserId>) {
        let user = user.into();
        let changed = self.sender.send_if_modified(|current| {
            if current.as_ref() == Some(&user) {
                return false;
            }
            *current = Some(user.clone());
            true
        });
        if changed {
            info!(user = %user, "Identity set");
        }
    }

    pub fn logout(&self) {
        let changed = self.sender.send_if_modified(|current| current.take().is_some());
        if changed {
            info!("Identity cleared");
        }
    }

    pub fn current(&self) -> Option<UserId> {
        self.sender.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Option<UserId>> {
        self.sender.subscribe()
    }
}

impl Default for IdentitySource {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_logged_out() {
        assert_eq!(IdentitySource::new().current(), None);
    }

    #[test]
    fn clones_share_state() {
        let source = IdentitySource::new();
        let clone = source.clone();

        source.login("u1");
        assert_eq!(clone.current(), Some(UserId::from("u1")));

        clone.logout();
        assert_eq!(source.current(), None);
    }

    #[tokio::test]
    async fn same_user_does_not_notify() {
        let source = IdentitySource::with_user("u1");
        let mut watcher = source.watch();
        watcher.borrow_and_update();

        source.login("u1");
        assert!(!watcher.has_changed().expect("sender alive"));

        source.login("u2");
        assert!(watcher.has_changed().expect("sender alive"));
        assert_eq!(*watcher.borrow_and_update(), Some(UserId::from("u2")));
    }

    #[tokio::test]
    async fn logout_when_logged_out_is_silent() {
        let source = IdentitySource::new();
        let mut watcher = source.watch();
        watcher.borrow_and_update();

        source.logout();
        assert!(!watcher.has_changed().expect("sender alive"));
    }
}
