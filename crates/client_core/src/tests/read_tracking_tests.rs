use std::time::Duration;

use super::*;
use backend::MemoryBackend;

use crate::test_support::text_message;

fn tracker() -> (Arc<MemoryBackend>, ReadTracker) {
    let backend = Arc::new(MemoryBackend::new());
    let chat_backend: Arc<dyn ChatBackend> = backend.clone();
    (backend, ReadTracker::new(chat_backend))
}

#[tokio::test]
async fn empty_conversation_is_reported_once() {
    let (backend, tracker) = tracker();
    let conversation_id = ConversationId::new();
    let user_id = UserId::new();

    assert!(tracker
        .mark_read(conversation_id, user_id, None)
        .await
        .expect("first mark"));
    assert!(!tracker
        .mark_read(conversation_id, user_id, None)
        .await
        .expect("second mark"));

    assert_eq!(backend.read_marks().await, vec![(conversation_id, user_id)]);
}

#[tokio::test]
async fn new_message_triggers_another_report() {
    let (backend, tracker) = tracker();
    let conversation_id = ConversationId::new();
    let user_id = UserId::new();
    let first = text_message(conversation_id, UserId::new(), "first", 0);
    let second = text_message(conversation_id, UserId::new(), "second", 5);

    for marker in [&first, &first, &second, &second] {
        tracker
            .mark_read(conversation_id, user_id, Some(ReadMarker::of(marker)))
            .await
            .expect("mark");
    }

    assert_eq!(backend.read_marks().await.len(), 2);
    assert_eq!(
        tracker.last_reported(conversation_id, user_id).await,
        Some(ReadMarker::of(&second))
    );
}

#[tokio::test]
async fn marks_are_tracked_per_user() {
    let (backend, tracker) = tracker();
    let conversation_id = ConversationId::new();

    tracker
        .mark_read(conversation_id, UserId::new(), None)
        .await
        .expect("first user");
    tracker
        .mark_read(conversation_id, UserId::new(), None)
        .await
        .expect("second user");

    assert_eq!(backend.read_marks().await.len(), 2);
}

#[tokio::test]
async fn failed_report_is_retried_next_time() {
    let (backend, tracker) = tracker();
    let conversation_id = ConversationId::new();
    let user_id = UserId::new();
    backend.set_offline(true).await;

    assert!(tracker
        .mark_read(conversation_id, user_id, None)
        .await
        .is_err());
    assert_eq!(tracker.last_reported(conversation_id, user_id).await, None);

    backend.set_offline(false).await;
    assert!(tracker
        .mark_read(conversation_id, user_id, None)
        .await
        .expect("retry"));
}

#[tokio::test]
async fn unread_count_skips_own_and_already_reported_messages() {
    let (_backend, tracker) = tracker();
    let conversation_id = ConversationId::new();
    let me = UserId::new();
    let peer = UserId::new();
    let messages = vec![
        text_message(conversation_id, peer, "a", 0),
        text_message(conversation_id, me, "b", 1),
        text_message(conversation_id, peer, "c", 2),
    ];

    assert_eq!(tracker.unread_count(conversation_id, me, &messages).await, 2);

    tracker
        .mark_read(conversation_id, me, Some(ReadMarker::of(&messages[1])))
        .await
        .expect("mark");

    assert_eq!(tracker.unread_count(conversation_id, me, &messages).await, 1);
}

#[tokio::test]
async fn concurrent_marks_for_same_message_report_once() {
    let (backend, tracker) = tracker();
    let tracker = Arc::new(tracker);
    let conversation_id = ConversationId::new();
    let user_id = UserId::new();
    let marker = Some(ReadMarker::of(&text_message(
        conversation_id,
        UserId::new(),
        "first",
        0,
    )));
    backend.hold_read_marks(true);

    let first = tokio::spawn({
        let tracker = tracker.clone();
        async move { tracker.mark_read(conversation_id, user_id, marker).await }
    });
    tokio::time::timeout(Duration::from_secs(2), async {
        while backend.mark_read_calls().await == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("first mark reached the backend");

    assert!(!tracker
        .mark_read(conversation_id, user_id, marker)
        .await
        .expect("second mark"));
    backend.hold_read_marks(false);
    assert!(first.await.expect("join").expect("first mark"));

    assert_eq!(backend.mark_read_calls().await, 1);
    assert_eq!(tracker.last_reported(conversation_id, user_id).await, marker);
}
