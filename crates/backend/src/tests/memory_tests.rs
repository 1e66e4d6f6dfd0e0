use super::*;
use chrono::{DateTime, TimeZone};
use shared::domain::{ConversationKind, MessageKind};
use tokio::sync::mpsc;

fn at(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 10, minute, 0)
        .single()
        .expect("valid timestamp")
}

fn conversation() -> Conversation {
    Conversation {
        id: ConversationId::new(),
        kind: ConversationKind::Direct,
        name: None,
        avatar_url: None,
        participants: Vec::new(),
        created_at: at(0),
    }
}

fn message(conversation_id: ConversationId, minute: u32) -> Message {
    Message {
        id: MessageId::new(),
        conversation_id,
        sender_id: UserId::new(),
        content: Some(format!("message at {minute}")),
        kind: MessageKind::Text,
        media_url: None,
        created_at: at(minute),
        status: DeliveryStatus::Sent,
    }
}

#[tokio::test]
async fn fetch_messages_pages_backwards_from_cursor() {
    let backend = MemoryBackend::new();
    let conversation = conversation();
    backend.seed_conversation(conversation.clone()).await;
    let seeded = [1, 2, 3, 4, 5].map(|minute| message(conversation.id, minute));
    for message in &seeded {
        backend.seed_message(message.clone()).await;
    }

    let latest = backend
        .fetch_messages(conversation.id, MessagePage::latest(2))
        .await
        .expect("latest page");
    assert_eq!(latest, seeded[3..].to_vec());

    let older = backend
        .fetch_messages(conversation.id, MessagePage::before(2, seeded[3].id))
        .await
        .expect("older page");
    assert_eq!(older, seeded[1..3].to_vec());
}

#[tokio::test]
async fn insert_message_echoes_to_open_channels() {
    let backend = MemoryBackend::new();
    let conversation = conversation();
    backend.seed_conversation(conversation.clone()).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    backend
        .open_channel(ChannelTopic::Conversation(conversation.id), tx)
        .await
        .expect("open");

    let stored = backend
        .insert_message(NewMessage {
            conversation_id: conversation.id,
            sender_id: UserId::new(),
            content: Some("hi".to_string()),
            kind: MessageKind::Text,
            media_url: None,
        })
        .await
        .expect("insert");

    match rx.recv().await.expect("echo") {
        RealtimeEvent::MessageInserted { message } => assert_eq!(message, stored),
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn offline_backend_rejects_with_network_error() {
    let backend = MemoryBackend::new();
    let conversation = conversation();
    backend.seed_conversation(conversation.clone()).await;
    backend.set_offline(true).await;

    let err = backend
        .fetch_messages(conversation.id, MessagePage::latest(10))
        .await
        .expect_err("offline");
    assert!(err.is_transient());
}

#[tokio::test]
async fn failing_close_still_releases_channel() {
    let backend = MemoryBackend::new();
    let topic = ChannelTopic::Conversation(ConversationId::new());
    let (tx, _rx) = mpsc::unbounded_channel();
    let handle = backend.open_channel(topic, tx).await.expect("open");
    backend.fail_channel_close(true).await;

    assert!(backend.close_channel(handle).await.is_err());
    assert_eq!(backend.active_channel_count(topic).await, 0);
}
