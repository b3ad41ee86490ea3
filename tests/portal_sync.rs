mod common;

use std::sync::Arc;
use std::time::Duration;

use portal_sync::cache::{Query, QueryCache, QueryCacheConfig, Tag};
use portal_sync::channel::ConnectionState;
use portal_sync::identity::IdentitySource;
use portal_sync::portal::{PortalConfig, PortalSync};
use portal_sync::types::UserId;
use serde_json::json;
use tokio::time::timeout;

use common::{MockBackend, MockTransport, WAIT, channel_with, wait_for_state, wait_until};

struct Harness {
    backend: Arc<MockBackend>,
    transport: MockTransport,
    identity: IdentitySource,
    portal: PortalSync,
}

fn harness() -> Harness {
    let backend = MockBackend::new();
    let transport = MockTransport::new();
    let identity = IdentitySource::new();
    let cache = QueryCache::new(
        QueryCacheConfig {
            keep_unused_for: Duration::from_secs(60),
        },
        backend.clone(),
        identity.clone(),
    );
    let portal = PortalSync::new(cache, channel_with(&transport), PortalConfig::default());
    Harness {
        backend,
        transport,
        identity,
        portal,
    }
}

async fn signed_in(harness: &Harness, user: &str) {
    harness.identity.login(user);
    let channel = harness.portal.channel().clone();
    let expected = UserId::from(user);
    wait_until("session for the signed-in user", || {
        channel.current_user().as_ref() == Some(&expected) && channel.handler_count() == 1
    })
    .await;
    wait_for_state(harness.portal.channel(), ConnectionState::Open).await;
}

async fn unread_reaches(harness: &Harness, count: u64) {
    let mut unread = harness.portal.unread().watch();
    timeout(WAIT, unread.wait_for(|value| *value == count))
        .await
        .expect("unread count in time")
        .expect("unread sender alive");
}

#[tokio::test]
async fn notification_bumps_unread_and_refreshes_list() {
    let harness = harness();
    let sync = harness.portal.start();
    signed_in(&harness, "u1").await;

    let query = harness.portal.notifications_query().expect("query");
    assert!(query.tags().contains(&Tag::new("Notifications")));
    let mut notifications = harness.portal.cache().subscribe(query);
    notifications.settled().await;
    assert_eq!(harness.backend.calls_to("GET /notifications"), 1);

    assert!(harness.transport.push(
        "notification",
        json!({
            "type": "leave_request",
            "payload": { "leaveId": 5 },
            "serverTimestamp": "2026-03-02T09:15:00Z"
        })
    ));
    unread_reaches(&harness, 1).await;

    let refreshed = notifications.settled().await;
    assert_eq!(
        refreshed.data,
        Some(json!({ "route": "GET /notifications", "call": 2 }))
    );
    assert!(!refreshed.is_stale);

    sync.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn notification_sent_right_after_join_is_counted() {
    for _ in 0..50 {
        let harness = harness();
        harness
            .transport
            .greet_with("notification", json!({ "type": "leave_request" }));

        harness
            .portal
            .apply_identity(Some(UserId::from("u1")))
            .await;

        unread_reaches(&harness, 1).await;
        harness.portal.channel().close().await;
    }
}

#[tokio::test]
async fn malformed_notification_still_invalidates() {
    let harness = harness();
    let sync = harness.portal.start();
    signed_in(&harness, "u1").await;

    let mut notifications = harness
        .portal
        .cache()
        .subscribe(harness.portal.notifications_query().expect("query"));
    notifications.settled().await;

    assert!(harness.transport.push("notification", json!("not an object")));
    let backend = harness.backend.clone();
    wait_until("notification refetch", || {
        backend.calls_to("GET /notifications") == 2
    })
    .await;
    assert_eq!(harness.portal.unread().get(), 0);

    sync.abort();
}

#[tokio::test]
async fn switching_user_resets_session_cache_and_badge() {
    let harness = harness();
    let sync = harness.portal.start();
    signed_in(&harness, "u1").await;

    let idle = Query::new("GET /clients").expect("query");
    let mut clients = harness.portal.cache().subscribe(idle.clone());
    clients.settled().await;
    drop(clients);
    harness.transport.push("notification", json!({ "type": "task_assigned" }));
    unread_reaches(&harness, 1).await;

    signed_in(&harness, "u2").await;

    assert_eq!(harness.portal.unread().get(), 0);
    assert!(harness.portal.cache().snapshot(idle.key()).is_none());
    assert_eq!(
        harness.transport.history(),
        vec![
            "connect:u1",
            "join:u1",
            "disconnect:u1",
            "connect:u2",
            "join:u2",
        ]
    );

    sync.abort();
}

#[tokio::test]
async fn sign_out_closes_the_channel() {
    let harness = harness();
    let sync = harness.portal.start();
    signed_in(&harness, "u1").await;

    harness.identity.logout();
    wait_until("session closed", || {
        harness.portal.channel().current_user().is_none()
    })
    .await;

    assert_eq!(harness.portal.channel().state(), ConnectionState::Closed);
    assert_eq!(harness.transport.disconnect_count(), 1);

    sync.abort();
}

#[tokio::test]
async fn user_signed_in_before_start_gets_a_session() {
    let harness = harness();
    harness.identity.login("u1");

    let sync = harness.portal.start();
    wait_for_state(harness.portal.channel(), ConnectionState::Open).await;

    assert_eq!(
        harness.portal.channel().current_user(),
        Some(UserId::from("u1"))
    );
    sync.abort();
}
