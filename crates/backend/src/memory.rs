use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use shared::{
    domain::{ConversationId, DeliveryStatus, MessageId, UserId},
    error::BackendError,
    protocol::{ChannelTopic, Conversation, Message, MessagePage, NewMessage, RealtimeEvent},
};
use tokio::sync::{watch, Mutex};
use tracing::debug;

use crate::{ChannelHandle, ChatBackend, EventSender, MediaStorage};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredUpload {
    pub bucket: String,
    pub path: String,
    pub content_type: String,
    pub size_bytes: usize,
}

#[derive(Default)]
struct MemoryState {
    conversations: HashMap<ConversationId, Conversation>,
    messages: HashMap<ConversationId, Vec<Message>>,
    channels: HashMap<u64, (ChannelTopic, EventSender)>,
    next_channel_id: u64,
    read_marks: Vec<(ConversationId, UserId)>,
    uploads: Vec<StoredUpload>,
    insert_calls: usize,
    fetch_calls: usize,
    open_channel_calls: usize,
    mark_read_calls: usize,
    offline: bool,
    fail_channel_close: bool,
    fail_message_fetches: bool,
}

/// Backend kept entirely in process memory. Inserted messages are echoed to
/// every open channel of their conversation, like the hosted service does.
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    open_gate: watch::Sender<bool>,
    fetch_gate: watch::Sender<bool>,
    read_gate: watch::Sender<bool>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (open_gate, _) = watch::channel(false);
        let (fetch_gate, _) = watch::channel(false);
        let (read_gate, _) = watch::channel(false);
        Self {
            state: Mutex::new(MemoryState::default()),
            open_gate,
            fetch_gate,
            read_gate,
        }
    }

    pub async fn seed_conversation(&self, conversation: Conversation) {
        let mut guard = self.state.lock().await;
        guard.messages.entry(conversation.id).or_default();
        guard.conversations.insert(conversation.id, conversation);
    }

    pub async fn seed_message(&self, message: Message) {
        let mut guard = self.state.lock().await;
        let messages = guard.messages.entry(message.conversation_id).or_default();
        let index = messages.partition_point(|existing| existing.created_at <= message.created_at);
        messages.insert(index, message);
    }

    /// Every call fails with a network error while offline.
    pub async fn set_offline(&self, offline: bool) {
        self.state.lock().await.offline = offline;
    }

    pub async fn fail_channel_close(&self, fail: bool) {
        self.state.lock().await.fail_channel_close = fail;
    }

    /// Message page fetches fail with a rejection; other calls still work.
    pub async fn fail_message_fetches(&self, fail: bool) {
        self.state.lock().await.fail_message_fetches = fail;
    }

    /// While held, `fetch_messages` suspends until released.
    pub fn hold_message_fetches(&self, held: bool) {
        self.fetch_gate.send_replace(held);
    }

    /// While held, `mark_read` suspends until released.
    pub fn hold_read_marks(&self, held: bool) {
        self.read_gate.send_replace(held);
    }

    /// While held, `open_channel` suspends until released.
    pub fn hold_channel_opens(&self, held: bool) {
        self.open_gate.send_replace(held);
    }

    pub async fn publish(&self, topic: ChannelTopic, event: RealtimeEvent) -> usize {
        let mut guard = self.state.lock().await;
        publish_locked(&mut guard, topic, event)
    }

    pub async fn active_channel_count(&self, topic: ChannelTopic) -> usize {
        self.state
            .lock()
            .await
            .channels
            .values()
            .filter(|(channel_topic, _)| *channel_topic == topic)
            .count()
    }

    pub async fn open_channel_calls(&self) -> usize {
        self.state.lock().await.open_channel_calls
    }

    pub async fn insert_calls(&self) -> usize {
        self.state.lock().await.insert_calls
    }

    pub async fn fetch_calls(&self) -> usize {
        self.state.lock().await.fetch_calls
    }

    pub async fn mark_read_calls(&self) -> usize {
        self.state.lock().await.mark_read_calls
    }

    pub async fn read_marks(&self) -> Vec<(ConversationId, UserId)> {
        self.state.lock().await.read_marks.clone()
    }

    pub async fn uploads(&self) -> Vec<StoredUpload> {
        self.state.lock().await.uploads.clone()
    }

    pub async fn stored_messages(&self, conversation_id: ConversationId) -> Vec<Message> {
        self.state
            .lock()
            .await
            .messages
            .get(&conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    async fn ensure_online(&self, operation: &str) -> Result<(), BackendError> {
        if self.state.lock().await.offline {
            return Err(BackendError::Network(format!("{operation}: backend unreachable")));
        }
        Ok(())
    }
}

fn publish_locked(state: &mut MemoryState, topic: ChannelTopic, event: RealtimeEvent) -> usize {
    let mut delivered = 0;
    state.channels.retain(|_, (channel_topic, sender)| {
        if *channel_topic != topic {
            return true;
        }
        if sender.send(event.clone()).is_ok() {
            delivered += 1;
            true
        } else {
            false
        }
    });
    delivered
}

#[async_trait]
impl ChatBackend for MemoryBackend {
    async fn fetch_conversation(&self, id: ConversationId) -> Result<Conversation, BackendError> {
        self.ensure_online("fetch_conversation").await?;
        self.state
            .lock()
            .await
            .conversations
            .get(&id)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(format!("conversation {id}")))
    }

    async fn fetch_messages(
        &self,
        conversation_id: ConversationId,
        page: MessagePage,
    ) -> Result<Vec<Message>, BackendError> {
        {
            self.state.lock().await.fetch_calls += 1;
        }
        let mut gate = self.fetch_gate.subscribe();
        let _ = gate.wait_for(|held| !*held).await;

        self.ensure_online("fetch_messages").await?;
        let guard = self.state.lock().await;
        if guard.fail_message_fetches {
            return Err(BackendError::Rejected(format!(
                "fetch_messages: refused for {conversation_id}"
            )));
        }
        let Some(messages) = guard.messages.get(&conversation_id) else {
            return Err(BackendError::NotFound(format!(
                "conversation {conversation_id}"
            )));
        };
        let end = match page.before {
            Some(before) => messages
                .iter()
                .position(|message| message.id == before)
                .ok_or_else(|| BackendError::Rejected(format!("unknown cursor {before}")))?,
            None => messages.len(),
        };
        let start = end.saturating_sub(page.limit as usize);
        Ok(messages[start..end].to_vec())
    }

    async fn insert_message(&self, record: NewMessage) -> Result<Message, BackendError> {
        self.ensure_online("insert_message").await?;
        let mut guard = self.state.lock().await;
        guard.insert_calls += 1;
        let Some(messages) = guard.messages.get_mut(&record.conversation_id) else {
            return Err(BackendError::NotFound(format!(
                "conversation {}",
                record.conversation_id
            )));
        };

        let mut created_at = Utc::now();
        if let Some(last) = messages.last() {
            if created_at <= last.created_at {
                created_at = last.created_at + Duration::milliseconds(1);
            }
        }
        let message = Message {
            id: MessageId::new(),
            conversation_id: record.conversation_id,
            sender_id: record.sender_id,
            content: record.content,
            kind: record.kind,
            media_url: record.media_url,
            created_at,
            status: DeliveryStatus::Sent,
        };
        messages.push(message.clone());

        let echoed = publish_locked(
            &mut guard,
            ChannelTopic::Conversation(message.conversation_id),
            RealtimeEvent::MessageInserted {
                message: message.clone(),
            },
        );
        debug!(
            conversation_id = %message.conversation_id,
            message_id = %message.id,
            echoed,
            "memory: stored message"
        );
        Ok(message)
    }

    async fn mark_read(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<(), BackendError> {
        {
            self.state.lock().await.mark_read_calls += 1;
        }
        let mut gate = self.read_gate.subscribe();
        let _ = gate.wait_for(|held| !*held).await;

        self.ensure_online("mark_read").await?;
        let mut guard = self.state.lock().await;
        guard.read_marks.push((conversation_id, user_id));

        let mut updated = Vec::new();
        if let Some(messages) = guard.messages.get_mut(&conversation_id) {
            for message in messages.iter_mut() {
                if message.sender_id != user_id && message.status < DeliveryStatus::Read {
                    message.status = DeliveryStatus::Read;
                    updated.push(message.clone());
                }
            }
        }
        for message in updated {
            publish_locked(
                &mut guard,
                ChannelTopic::Conversation(conversation_id),
                RealtimeEvent::MessageUpdated { message },
            );
        }
        Ok(())
    }

    async fn open_channel(
        &self,
        topic: ChannelTopic,
        events: EventSender,
    ) -> Result<ChannelHandle, BackendError> {
        {
            let mut guard = self.state.lock().await;
            guard.open_channel_calls += 1;
        }
        let mut gate = self.open_gate.subscribe();
        let _ = gate.wait_for(|held| !*held).await;

        self.ensure_online("open_channel").await?;
        let mut guard = self.state.lock().await;
        guard.next_channel_id += 1;
        let id = guard.next_channel_id;
        guard.channels.insert(id, (topic, events));
        Ok(ChannelHandle { id, topic })
    }

    async fn close_channel(&self, handle: ChannelHandle) -> Result<(), BackendError> {
        let mut guard = self.state.lock().await;
        // The channel is gone either way; the failure flag only affects the reply.
        let removed = guard.channels.remove(&handle.id);
        if guard.fail_channel_close {
            return Err(BackendError::Network(format!(
                "close_channel: no acknowledgement for {}",
                handle.topic
            )));
        }
        match removed {
            Some(_) => Ok(()),
            None => Err(BackendError::NotFound(format!("channel {}", handle.id))),
        }
    }
}

#[async_trait]
impl MediaStorage for MemoryBackend {
    async fn upload_file(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, BackendError> {
        self.ensure_online("upload_file").await?;
        self.state.lock().await.uploads.push(StoredUpload {
            bucket: bucket.to_string(),
            path: path.to_string(),
            content_type: content_type.to_string(),
            size_bytes: bytes.len(),
        });
        Ok(format!("memory://{bucket}/{path}"))
    }
}

#[cfg(test)]
#[path = "tests/memory_tests.rs"]
mod tests;
