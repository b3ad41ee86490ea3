//! Portal Event Channel
//!
//! One push session per signed-in user. The session task connects, declares
//! the user with a `join` event, dispatches inbound events to the handlers
//! registered on that session, and reconnects with exponential backoff when
//! the connection drops. Events sent during an outage are lost.
//!
//! Channel failures are state, never errors: callers watch
//! [`ConnectionState`] and handlers only ever see decoded events.

mod backoff;
mod handlers;
mod state;
mod transport;

use std::sync::{Arc, Mutex};

use metrics::counter;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::types::{JOIN_EVENT, JoinRequest, UserId};
use crate::util::lock::mutex_lock;

pub use backoff::{Jitter, ReconnectPolicy};
pub use handlers::{EventHandler, HandlerId};
pub use state::ConnectionState;
pub use transport::{PushConnection, PushTransport, TransportError};

use handlers::HandlerRegistry;

const SOURCE: &str = "channel";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("cannot register `{event}` handler: no channel session is open")]
    NoSession { event: String },
}

/// Handle to the push channel. Clones share the same session.
#[derive(Clone)]
pub struct EventChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    transport: Arc<dyn PushTransport>,
    policy: ReconnectPolicy,
    state: Arc<watch::Sender<ConnectionState>>,
    /// Serializes `open` and `close` so teardown of one session always
    /// finishes before the next one starts.
    lifecycle: tokio::sync::Mutex<()>,
    session: Mutex<Option<ActiveSession>>,
}

struct ActiveSession {
    user: UserId,
    handlers: Arc<HandlerRegistry>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl EventChannel {
    pub fn new(transport: Arc<dyn PushTransport>, policy: ReconnectPolicy) -> Self {
        let (state, _) = watch::channel(ConnectionState::Closed);
        Self {
            inner: Arc::new(ChannelInner {
                transport,
                policy,
                state: Arc::new(state),
                lifecycle: tokio::sync::Mutex::new(()),
                session: Mutex::new(None),
            }),
        }
    }

    /// Opens a session for `user`.
    ///
    /// A no-op while a session for the same user is live. A session for a
    /// different user is torn down completely (handlers cleared, transport
    /// closed, task finished) before the new one starts connecting.
    pub async fn open(&self, user: impl Into<UserId>) {
        self.open_with(user, Vec::new()).await;
    }

    /// Like [`open`](Self::open), but `initial` handlers are registered on the new
    /// session before its task starts, so they see every event from the
    /// first connection on.
    ///
    /// Returns `false` when a live session for `user` already existed; its
    /// handlers are left as they are and `initial` is dropped.
    pub async fn open_with(
        &self,
        user: impl Into<UserId>,
        initial: Vec<(String, EventHandler)>,
    ) -> bool {
        let user = user.into();
        let _lifecycle = self.inner.lifecycle.lock().await;

        let previous = {
            let mut session = mutex_lock(&self.inner.session, SOURCE, "open");
            if let Some(active) = session.as_ref()
                && active.user == user
                && !active.task.is_finished()
            {
                debug!(user = %user, state = %self.state(), "Channel already open for user");
                return false;
            }
            session.take()
        };
        if let Some(previous) = previous {
            teardown(&self.inner.state, previous, "identity changed").await;
        }

        let handlers = Arc::new(HandlerRegistry::default());
        for (event, handler) in initial {
            let id = handlers.add(&event, handler);
            debug!(event = %event, handler_id = ?id, "Event handler registered");
        }
        let (shutdown, shutdown_rx) = watch::channel(false);
        set_state(&self.inner.state, ConnectionState::Connecting);

        let session = SessionTask {
            transport: Arc::clone(&self.inner.transport),
            policy: self.inner.policy,
            state: Arc::clone(&self.inner.state),
            handlers: Arc::clone(&handlers),
            user: user.clone(),
            shutdown: shutdown_rx,
        };
        let span = info_span!("channel_session", user = %user);
        let task = tokio::spawn(session.run().instrument(span));

        *mutex_lock(&self.inner.session, SOURCE, "open") = Some(ActiveSession {
            user,
            handlers,
            shutdown,
            task,
        });
        true
    }

    /// Registers `handler` for `event` on the current session.
    ///
    /// Handlers for one event run in registration order. They are dropped
    /// when the session closes, so they never observe another user's events.
    pub fn on<F>(&self, event: &str, handler: F) -> Result<HandlerId, ChannelError>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let session = mutex_lock(&self.inner.session, SOURCE, "on");
        let Some(active) = session.as_ref() else {
            return Err(ChannelError::NoSession {
                event: event.to_string(),
            });
        };
        let id = active.handlers.add(event, Arc::new(handler));
        debug!(event, handler_id = ?id, "Event handler registered");
        Ok(id)
    }

    /// Removes a handler. Returns `false` if it was already gone.
    pub fn off(&self, id: HandlerId) -> bool {
        mutex_lock(&self.inner.session, SOURCE, "off")
            .as_ref()
            .is_some_and(|active| active.handlers.remove(id))
    }

    /// Closes the session, cancelling any pending reconnect. Safe to call
    /// repeatedly.
    pub async fn close(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let session = mutex_lock(&self.inner.session, SOURCE, "close").take();
        match session {
            Some(active) => teardown(&self.inner.state, active, "closed").await,
            None => {
                set_state(&self.inner.state, ConnectionState::Closed);
                debug!("Channel already closed");
            }
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn current_user(&self) -> Option<UserId> {
        mutex_lock(&self.inner.session, SOURCE, "current_user")
            .as_ref()
            .map(|active| active.user.clone())
    }

    pub fn handler_count(&self) -> usize {
        mutex_lock(&self.inner.session, SOURCE, "handler_count")
            .as_ref()
            .map_or(0, |active| active.handlers.len())
    }
}

async fn teardown(
    state: &watch::Sender<ConnectionState>,
    session: ActiveSession,
    reason: &'static str,
) {
    let ActiveSession {
        user,
        handlers,
        shutdown,
        task,
    } = session;

    handlers.clear();
    shutdown.send_replace(true);
    if let Err(error) = task.await {
        warn!(user = %user, error = %error, "Channel session task ended abnormally");
    }
    set_state(state, ConnectionState::Closed);
    info!(user = %user, reason, "Channel session closed");
}

fn set_state(state: &watch::Sender<ConnectionState>, next: ConnectionState) {
    let mut previous = next;
    let changed = state.send_if_modified(|current| {
        if *current == next {
            return false;
        }
        previous = std::mem::replace(current, next);
        true
    });
    if changed {
        debug!(from = %previous, to = %next, "Channel state changed");
    }
}

/// Everything the background session needs. Holds no reference back to the
/// channel, so dropping the last [`EventChannel`] drops the shutdown sender
/// and ends the task.
struct SessionTask {
    transport: Arc<dyn PushTransport>,
    policy: ReconnectPolicy,
    state: Arc<watch::Sender<ConnectionState>>,
    handlers: Arc<HandlerRegistry>,
    user: UserId,
    shutdown: watch::Receiver<bool>,
}

impl SessionTask {
    async fn run(mut self) {
        let mut attempt: u32 = 0;
        loop {
            set_state(&self.state, ConnectionState::Connecting);
            let connected = tokio::select! {
                _ = stop_requested(&mut self.shutdown) => return,
                result = connect_and_join(self.transport.as_ref(), &self.user) => result,
            };

            match connected {
                Ok(mut connection) => {
                    attempt = 0;
                    set_state(&self.state, ConnectionState::Open);
                    info!(user = %self.user, "Channel open");

                    let lost = tokio::select! {
                        _ = stop_requested(&mut self.shutdown) => None,
                        error = pump(&mut *connection, &self.handlers) => Some(error),
                    };
                    match lost {
                        None => {
                            connection.disconnect().await;
                            return;
                        }
                        Some(error) => {
                            warn!(user = %self.user, error = %error, "Channel connection lost");
                        }
                    }
                }
                Err(error) => {
                    warn!(user = %self.user, attempt, error = %error, "Channel connect failed");
                }
            }

            set_state(&self.state, ConnectionState::Reconnecting);
            let delay = self.policy.delay(attempt, &mut rand::rng());
            attempt = attempt.saturating_add(1);
            counter!("portal_channel_reconnect_total").increment(1);
            info!(
                user = %self.user,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Channel reconnect scheduled"
            );
            tokio::select! {
                _ = stop_requested(&mut self.shutdown) => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

/// Resolves once shutdown is requested or the channel handle is gone.
async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn connect_and_join(
    transport: &dyn PushTransport,
    user: &UserId,
) -> Result<Box<dyn PushConnection>, TransportError> {
    let mut connection = transport.connect(user).await?;
    let join = serde_json::to_value(JoinRequest {
        user_id: user.clone(),
    })
    .map_err(|error| TransportError::Protocol(error.to_string()))?;
    connection.emit(JOIN_EVENT, join).await?;
    Ok(connection)
}

/// Dispatches inbound events until the connection fails.
async fn pump(connection: &mut dyn PushConnection, handlers: &HandlerRegistry) -> TransportError {
    loop {
        match connection.recv().await {
            Ok(envelope) => {
                counter!("portal_channel_event_total", "event" => envelope.event.clone())
                    .increment(1);
                let ran = handlers.dispatch(&envelope.event, &envelope.data);
                debug!(event = %envelope.event, handlers = ran, "Channel event dispatched");
            }
            Err(TransportError::Protocol(reason)) => {
                warn!(reason = %reason, "Skipping undecodable channel frame");
            }
            Err(error) => return error,
        }
    }
}
