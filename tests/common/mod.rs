#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use portal_sync::cache::{Backend, BackendError, BackendRequest, QueryCache, QueryCacheConfig};
use portal_sync::channel::{
    ConnectionState, EventChannel, Jitter, PushConnection, PushTransport, ReconnectPolicy,
    TransportError,
};
use portal_sync::identity::IdentitySource;
use portal_sync::types::{PushEnvelope, UserId};
use serde_json::{Value, json};
use tokio::sync::mpsc;

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(5);

struct Reply {
    delay: Duration,
    result: Result<Value, BackendError>,
}

/// Scripted REST backend.
///
/// Replies are queued per `"METHOD /path"`. A call with nothing queued
/// answers `{"route": ..., "call": n}` at once, where `n` counts calls to
/// that route.
#[derive(Default)]
pub struct MockBackend {
    calls: Mutex<Vec<BackendRequest>>,
    replies: Mutex<HashMap<String, VecDeque<Reply>>>,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn respond(&self, route: &str, delay: Duration, result: Result<Value, BackendError>) {
        self.replies
            .lock()
            .expect("replies lock")
            .entry(route.to_string())
            .or_default()
            .push_back(Reply { delay, result });
    }

    pub fn calls(&self) -> Vec<BackendRequest> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn calls_to(&self, route: &str) -> usize {
        self.calls()
            .iter()
            .filter(|request| route_of(request) == route)
            .count()
    }
}

fn route_of(request: &BackendRequest) -> String {
    format!("{} {}", request.method, request.path)
}

#[async_trait]
impl Backend for MockBackend {
    async fn execute(&self, request: BackendRequest) -> Result<Value, BackendError> {
        let route = route_of(&request);
        let (call, reply) = {
            let mut calls = self.calls.lock().expect("calls lock");
            calls.push(request);
            let call = calls.iter().filter(|req| route_of(req) == route).count();
            let reply = self
                .replies
                .lock()
                .expect("replies lock")
                .get_mut(&route)
                .and_then(VecDeque::pop_front);
            (call, reply)
        };

        match reply {
            Some(Reply { delay, result }) => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                result
            }
            None => Ok(json!({ "route": route, "call": call })),
        }
    }
}

pub fn cache_with(backend: Arc<MockBackend>, keep_unused_for: Duration) -> QueryCache {
    QueryCache::new(
        QueryCacheConfig { keep_unused_for },
        backend,
        IdentitySource::new(),
    )
}

pub fn signed_in_cache(backend: Arc<MockBackend>, user: &str) -> QueryCache {
    QueryCache::new(
        QueryCacheConfig::default(),
        backend,
        IdentitySource::with_user(user),
    )
}

enum Inbound {
    Event(PushEnvelope),
    Garbage(String),
    Drop,
}

#[derive(Default)]
struct TransportLog {
    connects: AtomicUsize,
    failing_connects: AtomicUsize,
    disconnects: AtomicUsize,
    live: Mutex<Option<mpsc::UnboundedSender<Inbound>>>,
    greetings: Mutex<Vec<PushEnvelope>>,
    emitted: Mutex<Vec<(UserId, PushEnvelope)>>,
    history: Mutex<Vec<String>>,
}

impl TransportLog {
    fn record(&self, line: String) {
        self.history.lock().expect("history lock").push(line);
    }
}

/// In-memory push transport. Each connect replaces the "live" connection
/// that [`MockTransport::push`] writes to.
#[derive(Clone, Default)]
pub struct MockTransport {
    log: Arc<TransportLog>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` connect attempts fail.
    pub fn fail_next_connects(&self, count: usize) {
        self.log.failing_connects.store(count, Ordering::SeqCst);
    }

    /// Queues an event that every new connection delivers right after
    /// connecting, ahead of anything pushed later.
    pub fn greet_with(&self, event: &str, data: Value) {
        self.log
            .greetings
            .lock()
            .expect("greetings lock")
            .push(PushEnvelope::new(event, data));
    }

    /// Delivers an event on the live connection. `false` if none is live.
    pub fn push(&self, event: &str, data: Value) -> bool {
        self.send(Inbound::Event(PushEnvelope::new(event, data)))
    }

    pub fn push_garbage(&self, frame: &str) -> bool {
        self.send(Inbound::Garbage(frame.to_string()))
    }

    /// Simulates the server dropping the live connection.
    pub fn drop_connection(&self) -> bool {
        self.send(Inbound::Drop)
    }

    fn send(&self, inbound: Inbound) -> bool {
        self.log
            .live
            .lock()
            .expect("live lock")
            .as_ref()
            .is_some_and(|sender| sender.send(inbound).is_ok())
    }

    pub fn connect_count(&self) -> usize {
        self.log.connects.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> usize {
        self.log.disconnects.load(Ordering::SeqCst)
    }

    pub fn emitted(&self) -> Vec<(UserId, PushEnvelope)> {
        self.log.emitted.lock().expect("emitted lock").clone()
    }

    /// `connect:<user>`, `join:<user>` and `disconnect:<user>` lines in
    /// the order they happened.
    pub fn history(&self) -> Vec<String> {
        self.log.history.lock().expect("history lock").clone()
    }
}

#[async_trait]
impl PushTransport for MockTransport {
    async fn connect(&self, user: &UserId) -> Result<Box<dyn PushConnection>, TransportError> {
        self.log.connects.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .log
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                left.checked_sub(1)
            })
            .is_ok();
        if failing {
            self.log.record(format!("refused:{user}"));
            return Err(TransportError::Connect("connection refused".to_string()));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        for greeting in self.log.greetings.lock().expect("greetings lock").iter() {
            let _ = sender.send(Inbound::Event(greeting.clone()));
        }
        *self.log.live.lock().expect("live lock") = Some(sender);
        self.log.record(format!("connect:{user}"));
        Ok(Box::new(MockConnection {
            user: user.clone(),
            inbound: receiver,
            log: Arc::clone(&self.log),
        }))
    }
}

struct MockConnection {
    user: UserId,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    log: Arc<TransportLog>,
}

#[async_trait]
impl PushConnection for MockConnection {
    async fn recv(&mut self) -> Result<PushEnvelope, TransportError> {
        match self.inbound.recv().await {
            Some(Inbound::Event(envelope)) => Ok(envelope),
            Some(Inbound::Garbage(frame)) => Err(TransportError::Protocol(frame)),
            Some(Inbound::Drop) | None => Err(TransportError::Closed("dropped".to_string())),
        }
    }

    async fn emit(&mut self, event: &str, data: Value) -> Result<(), TransportError> {
        self.log.record(format!("{event}:{}", self.user));
        self.log
            .emitted
            .lock()
            .expect("emitted lock")
            .push((self.user.clone(), PushEnvelope::new(event, data)));
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.log.disconnects.fetch_add(1, Ordering::SeqCst);
        self.log.record(format!("disconnect:{}", self.user));
    }
}

pub fn fixed_policy() -> ReconnectPolicy {
    ReconnectPolicy {
        base: Duration::from_secs(1),
        cap: Duration::from_secs(30),
        jitter: Jitter::None,
    }
}

pub fn channel_with(transport: &MockTransport) -> EventChannel {
    EventChannel::new(Arc::new(transport.clone()), fixed_policy())
}

pub async fn wait_for_state(channel: &EventChannel, wanted: ConnectionState) {
    let mut states = channel.watch_state();
    tokio::time::timeout(WAIT, states.wait_for(|state| *state == wanted))
        .await
        .unwrap_or_else(|_| panic!("channel never reached {wanted}"))
        .expect("channel state sender alive");
}

/// Polls `condition` until it holds.
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let poll = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(WAIT, poll)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}
