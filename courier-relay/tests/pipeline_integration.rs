//! Integration tests for the message pipeline: submit, commit, edit,
//! delete and listing, over both ledgers.

use courier_relay::{
    DeliveryJob, ErrorKind, JobState, Member, NewConversation, Relay, RelayConfig, RelayError,
    RelayEvent, StoreConfig,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::{timeout, Duration};

fn alice() -> Member {
    Member::new("u1", "Alice")
}

fn bob() -> Member {
    Member::new("u2", "Bob")
}

fn durable_config(path: &std::path::Path) -> RelayConfig {
    RelayConfig {
        storage: Some(StoreConfig::for_testing(path)),
        ..RelayConfig::for_testing()
    }
}

#[tokio::test]
async fn test_submitted_message_is_listed_exactly_once() {
    let relay = Relay::open(RelayConfig::for_testing()).unwrap();
    let conv = relay
        .create_conversation(NewConversation::direct(alice(), bob()))
        .await
        .unwrap();

    let message = relay
        .submit_message(DeliveryJob::new(conv.id, "u1", "hello"))
        .await
        .unwrap();

    let listed = relay.list_messages(conv.id).await.unwrap();
    assert_eq!(listed, vec![message.clone()]);
    assert_eq!(listed[0].sender_id, "u1");
    assert_eq!(listed[0].body, "hello");
    assert!(listed[0].sent_at > 0);

    relay.shutdown().await;
}

#[tokio::test]
async fn test_sequential_submits_list_in_submit_order() {
    let relay = Relay::open(RelayConfig::for_testing()).unwrap();
    let conv = relay
        .create_conversation(NewConversation::direct(alice(), bob()))
        .await
        .unwrap();

    for i in 0..20 {
        relay
            .submit_message(DeliveryJob::new(conv.id, "u1", format!("msg {i}")))
            .await
            .unwrap();
    }

    let bodies: Vec<String> = relay
        .list_messages(conv.id)
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.body)
        .collect();
    let expected: Vec<String> = (0..20).map(|i| format!("msg {i}")).collect();
    assert_eq!(bodies, expected);

    relay.shutdown().await;
}

#[tokio::test]
async fn test_invalid_submits_are_rejected_without_retry() {
    let relay = Relay::open(RelayConfig::for_testing()).unwrap();
    let conv = relay
        .create_conversation(NewConversation::direct(alice(), bob()))
        .await
        .unwrap();

    let err = relay
        .submit_message(DeliveryJob::new(uuid::Uuid::new_v4(), "u1", "lost"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = relay
        .submit_message(DeliveryJob::new(conv.id, "u1", "   "))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    assert!(relay.list_messages(conv.id).await.unwrap().is_empty());
    assert_eq!(relay.queue_stats().retried, 0);
    assert_eq!(relay.queue_stats().failed, 2);

    relay.shutdown().await;
}

#[tokio::test]
async fn test_edit_then_delete_scenario() {
    let relay = Relay::open(RelayConfig::for_testing()).unwrap();
    let conv = relay
        .create_conversation(NewConversation::group(
            "Planning",
            vec![alice(), bob(), Member::new("u3", "Carol")],
        ))
        .await
        .unwrap();
    let mut sub = relay.connect_observer("watcher").await;

    let posted = relay
        .submit_message(DeliveryJob::new(conv.id, "u1", "Kickoff at 2 PM"))
        .await
        .unwrap();
    let edited = relay
        .update_message(conv.id, posted.id, "Kickoff at 3 PM")
        .await
        .unwrap();
    assert_eq!(edited.id, posted.id);
    assert_eq!(edited.sent_at, posted.sent_at);
    assert_eq!(relay.list_messages(conv.id).await.unwrap()[0].body, "Kickoff at 3 PM");

    let removed = relay.delete_message(conv.id, posted.id).await.unwrap();
    assert_eq!(removed.body, "Kickoff at 3 PM");
    assert!(relay.list_messages(conv.id).await.unwrap().is_empty());

    // A second edit or delete finds nothing
    let err = relay
        .update_message(conv.id, posted.id, "Kickoff at 4 PM")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    let err = relay.delete_message(conv.id, posted.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let mut names = Vec::new();
    for _ in 0..3 {
        let event = timeout(Duration::from_secs(2), sub.recv())
            .await
            .expect("event within timeout")
            .expect("subscription open");
        names.push(event.name());
    }
    assert_eq!(names, vec!["message:created", "message:updated", "message:deleted"]);

    relay.shutdown().await;
}

#[tokio::test]
async fn test_message_edit_requires_matching_conversation() {
    let relay = Relay::open(RelayConfig::for_testing()).unwrap();
    let first = relay
        .create_conversation(NewConversation::direct(alice(), bob()))
        .await
        .unwrap();
    let second = relay
        .create_conversation(NewConversation::direct(alice(), Member::new("u3", "Carol")))
        .await
        .unwrap();

    let message = relay
        .submit_message(DeliveryJob::new(first.id, "u1", "only here"))
        .await
        .unwrap();

    let err = relay
        .update_message(second.id, message.id, "moved?")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(relay.list_messages(first.id).await.unwrap()[0].body, "only here");

    relay.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_submits_all_committed_once() {
    let relay = Arc::new(Relay::open(RelayConfig::for_testing()).unwrap());
    let conv = relay
        .create_conversation(NewConversation::direct(alice(), bob()))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..50 {
        let relay = relay.clone();
        handles.push(tokio::spawn(async move {
            relay
                .submit_message(DeliveryJob::new(conv.id, "u2", format!("burst {i}")))
                .await
        }));
    }

    let mut ids = HashSet::new();
    for handle in handles {
        let message = handle.await.unwrap().unwrap();
        assert!(ids.insert(message.id), "message id handed out twice");
    }

    let listed = relay.list_messages(conv.id).await.unwrap();
    assert_eq!(listed.len(), 50);
    assert!(listed.windows(2).all(|w| w[0].sent_at <= w[1].sent_at));
    let listed_ids: HashSet<_> = listed.iter().map(|m| m.id).collect();
    assert_eq!(listed_ids, ids);

    relay.shutdown().await;
}

#[tokio::test]
async fn test_enqueue_then_poll_until_resolved() {
    let relay = Relay::open(RelayConfig::for_testing()).unwrap();
    let conv = relay
        .create_conversation(NewConversation::direct(alice(), bob()))
        .await
        .unwrap();

    let token = relay
        .enqueue_message(DeliveryJob::new(conv.id, "u1", "fire and forget"))
        .await
        .unwrap();

    let message = timeout(Duration::from_secs(2), async {
        loop {
            match relay.poll_message(token).unwrap() {
                JobState::Pending => tokio::time::sleep(Duration::from_millis(5)).await,
                JobState::Completed(message) => break message,
                JobState::Failed(e) => panic!("delivery failed: {e}"),
            }
        }
    })
    .await
    .expect("job resolves");
    assert_eq!(message.body, "fire and forget");

    // Reported once, then forgotten
    assert!(matches!(relay.poll_message(token), Err(RelayError::Queue(_))));

    relay.shutdown().await;
}

#[tokio::test]
async fn test_list_conversations_for_member() {
    let relay = Relay::open(RelayConfig::for_testing()).unwrap();
    let direct = relay
        .create_conversation(NewConversation::direct(alice(), bob()))
        .await
        .unwrap();
    let group = relay
        .create_conversation(NewConversation::group(
            "Team",
            vec![bob(), Member::new("u3", "Carol")],
        ))
        .await
        .unwrap();

    let for_alice: Vec<_> = relay
        .list_conversations("u1")
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.id)
        .collect();
    assert_eq!(for_alice, vec![direct.id]);

    let for_bob: HashSet<_> = relay
        .list_conversations("u2")
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.id)
        .collect();
    assert_eq!(for_bob, HashSet::from([direct.id, group.id]));

    assert!(relay.list_conversations("nobody").await.unwrap().is_empty());

    relay.shutdown().await;
}

#[tokio::test]
async fn test_durable_messages_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();

    let (conv_id, first_id) = {
        let relay = Relay::open(durable_config(dir.path())).unwrap();
        let conv = relay
            .create_conversation(NewConversation::direct(alice(), bob()))
            .await
            .unwrap();
        let first = relay
            .submit_message(DeliveryJob::new(conv.id, "u1", "persisted"))
            .await
            .unwrap();
        relay
            .submit_message(DeliveryJob::new(conv.id, "u2", "me too"))
            .await
            .unwrap();
        relay.shutdown().await;
        (conv.id, first.id)
    };

    let relay = Relay::open(durable_config(dir.path())).unwrap();
    let conv = relay.get_conversation(conv_id).await.unwrap();
    assert_eq!(conv.members, vec![alice(), bob()]);

    let listed = relay.list_messages(conv_id).await.unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].id, first_id);
    assert_eq!(listed[0].body, "persisted");
    assert_eq!(listed[1].body, "me too");

    relay.shutdown().await;
}

#[tokio::test]
async fn test_durable_conversation_delete_cascades() {
    let dir = tempfile::tempdir().unwrap();
    let relay = Relay::open(durable_config(dir.path())).unwrap();

    let doomed = relay
        .create_conversation(NewConversation::direct(alice(), bob()))
        .await
        .unwrap();
    let kept = relay
        .create_conversation(NewConversation::direct(alice(), Member::new("u3", "Carol")))
        .await
        .unwrap();
    for i in 0..5 {
        relay
            .submit_message(DeliveryJob::new(doomed.id, "u1", format!("gone {i}")))
            .await
            .unwrap();
    }
    relay
        .submit_message(DeliveryJob::new(kept.id, "u1", "still here"))
        .await
        .unwrap();

    assert_eq!(relay.delete_conversation(doomed.id).await.unwrap(), 5);

    let err = relay.get_conversation(doomed.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    let err = relay.list_messages(doomed.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(relay.list_messages(kept.id).await.unwrap().len(), 1);

    // The conversation is gone, so new messages are invalid input
    let err = relay
        .submit_message(DeliveryJob::new(doomed.id, "u1", "too late"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    relay.shutdown().await;
}

#[tokio::test]
async fn test_submit_after_shutdown_is_queue_error() {
    let relay = Relay::open(RelayConfig::for_testing()).unwrap();
    let conv = relay
        .create_conversation(NewConversation::direct(alice(), bob()))
        .await
        .unwrap();
    relay.shutdown().await;

    let err = relay
        .submit_message(DeliveryJob::new(conv.id, "u1", "anyone?"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Queue);
}

#[tokio::test]
async fn test_commit_event_carries_committed_record() {
    let relay = Relay::open(RelayConfig::for_testing()).unwrap();
    let conv = relay
        .create_conversation(NewConversation::direct(alice(), bob()))
        .await
        .unwrap();
    let mut sub = relay.connect_observer("bob-phone").await;

    let message = relay
        .submit_message(DeliveryJob::new(conv.id, "u1", "ping"))
        .await
        .unwrap();

    let event = timeout(Duration::from_secs(2), sub.recv()).await.unwrap();
    assert_eq!(event, Some(RelayEvent::MessageCreated(message)));

    relay.shutdown().await;
}

async fn race_edits_against_delete(relay: Arc<Relay>) {
    let conv = relay
        .create_conversation(NewConversation::direct(alice(), bob()))
        .await
        .unwrap();
    let message = relay
        .submit_message(DeliveryJob::new(conv.id, "u1", "original"))
        .await
        .unwrap();
    let deleted = Arc::new(AtomicBool::new(false));

    let mut edits = Vec::new();
    for i in 0..16 {
        let relay = relay.clone();
        let deleted = deleted.clone();
        edits.push(tokio::spawn(async move {
            let body = format!("edit {i}");
            let after_delete = deleted.load(Ordering::SeqCst);
            let result = relay.update_message(conv.id, message.id, &body).await;
            (body, after_delete, result)
        }));
    }
    let delete = {
        let relay = relay.clone();
        let deleted = deleted.clone();
        tokio::spawn(async move {
            let removed = relay.delete_message(conv.id, message.id).await;
            if removed.is_ok() {
                deleted.store(true, Ordering::SeqCst);
            }
            removed
        })
    };

    let removed = delete.await.unwrap().unwrap();
    let mut bodies = HashSet::from(["original".to_string()]);
    for edit in edits {
        let (body, after_delete, result) = edit.await.unwrap();
        match result {
            Ok(updated) => {
                assert!(!after_delete, "edit applied after delete returned");
                assert_eq!(updated.body, body);
                bodies.insert(body);
            }
            Err(e) => assert_eq!(e.kind(), ErrorKind::NotFound),
        }
    }
    assert!(bodies.contains(&removed.body));
    assert!(relay.list_messages(conv.id).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_edits_race_delete_memory() {
    let relay = Arc::new(Relay::open(RelayConfig::for_testing()).unwrap());
    race_edits_against_delete(relay.clone()).await;
    relay.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_edits_race_delete_durable() {
    let dir = tempfile::tempdir().unwrap();
    let relay = Arc::new(Relay::open(durable_config(dir.path())).unwrap());
    race_edits_against_delete(relay.clone()).await;
    relay.shutdown().await;
}
