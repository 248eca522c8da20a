//! Integration tests for presence fan-out and typing relay.

use courier_relay::{Relay, RelayConfig, RelayEvent, TypingNotice};
use tokio::time::{timeout, Duration};
use uuid::Uuid;

#[tokio::test]
async fn test_join_and_leave_fan_out() {
    let relay = Relay::open(RelayConfig::for_testing()).unwrap();
    let mut watcher = relay.connect_observer("watcher").await;
    let alice = relay.connect_observer("alice-laptop").await;
    let bob = relay.connect_observer("bob-phone").await;

    relay
        .presence_join(alice.observer_id(), "u1", "Alice")
        .await;
    let online = relay.presence_join(bob.observer_id(), "u2", "Bob").await;
    assert_eq!(online.len(), 2);

    relay.disconnect_observer(alice.observer_id()).await;

    let mut updates = Vec::new();
    for _ in 0..3 {
        match timeout(Duration::from_secs(2), watcher.recv()).await.unwrap() {
            Some(RelayEvent::PresenceUpdate(list)) => {
                updates.push(list.into_iter().map(|e| e.user_id).collect::<Vec<_>>())
            }
            other => panic!("Expected PresenceUpdate, got {other:?}"),
        }
    }
    assert_eq!(
        updates,
        vec![
            vec!["u1".to_string()],
            vec!["u1".to_string(), "u2".to_string()],
            vec!["u2".to_string()],
        ]
    );

    let online: Vec<_> = relay.online_users().await.into_iter().map(|e| e.user_id).collect();
    assert_eq!(online, vec!["u2"]);

    relay.shutdown().await;
}

#[tokio::test]
async fn test_observer_without_presence_leaves_silently() {
    let relay = Relay::open(RelayConfig::for_testing()).unwrap();
    let mut watcher = relay.connect_observer("watcher").await;
    let lurker = relay.connect_observer("lurker").await;

    relay.disconnect_observer(lurker.observer_id()).await;

    let nothing = timeout(Duration::from_millis(100), watcher.recv()).await;
    assert!(nothing.is_err(), "no presence event expected");
    assert_eq!(relay.broadcaster().observer_count().await, 1);

    relay.shutdown().await;
}

#[tokio::test]
async fn test_typing_skips_sender() {
    let relay = Relay::open(RelayConfig::for_testing()).unwrap();
    let mut alice = relay.connect_observer("alice").await;
    let mut bob = relay.connect_observer("bob").await;
    let conversation_id = Uuid::new_v4();

    let notice = TypingNotice::started(conversation_id, "u1", "Alice");
    assert!(relay.typing(alice.observer_id(), notice.clone()).await);

    let event = timeout(Duration::from_secs(2), bob.recv()).await.unwrap();
    assert_eq!(event, Some(RelayEvent::Typing(notice)));

    let own = timeout(Duration::from_millis(100), alice.recv()).await;
    assert!(own.is_err(), "sender must not see its own typing notice");

    relay.shutdown().await;
}

#[tokio::test]
async fn test_typing_burst_is_throttled() {
    let relay = Relay::open(RelayConfig::for_testing()).unwrap();
    let alice = relay.connect_observer("alice").await;
    let mut bob = relay.connect_observer("bob").await;
    let conversation_id = Uuid::new_v4();

    let mut relayed = 0;
    for _ in 0..10 {
        if relay
            .typing(
                alice.observer_id(),
                TypingNotice::started(conversation_id, "u1", "Alice"),
            )
            .await
        {
            relayed += 1;
        }
    }
    assert_eq!(relayed, 1);

    // Stopping always goes through
    assert!(
        relay
            .typing(
                alice.observer_id(),
                TypingNotice::stopped(conversation_id, "u1", "Alice"),
            )
            .await
    );

    let first = timeout(Duration::from_secs(2), bob.recv()).await.unwrap();
    assert!(matches!(first, Some(RelayEvent::Typing(n)) if n.is_typing));
    let second = timeout(Duration::from_secs(2), bob.recv()).await.unwrap();
    assert!(matches!(second, Some(RelayEvent::Typing(n)) if !n.is_typing));

    relay.shutdown().await;
}

#[tokio::test]
async fn test_typing_resumes_after_interval() {
    let config = RelayConfig {
        typing_throttle_ms: 30,
        ..RelayConfig::for_testing()
    };
    let relay = Relay::open(config).unwrap();
    let alice = relay.connect_observer("alice").await;
    let conversation_id = Uuid::new_v4();
    let notice = TypingNotice::started(conversation_id, "u1", "Alice");

    assert!(relay.typing(alice.observer_id(), notice.clone()).await);
    assert!(!relay.typing(alice.observer_id(), notice.clone()).await);

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(relay.typing(alice.observer_id(), notice).await);

    relay.shutdown().await;
}
