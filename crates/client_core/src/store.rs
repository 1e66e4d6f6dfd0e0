use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use backend::ChatBackend;
use chrono::FixedOffset;
use shared::{
    domain::{ConversationId, MediaKind, MessageKind, UserId},
    protocol::{ChannelTopic, Conversation, Message, MessagePage, NewMessage, RealtimeEvent},
};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::{
    config::ChatSettings,
    error::ChatError,
    read_tracking::{ReadMarker, ReadTracker},
    subscriptions::{RealtimeSink, Subscription, SubscriptionManager},
    timeline::{build_timeline, TimelineEntry, TimelineOrder},
    ClientEvent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MergeOutcome {
    Inserted,
    Updated,
    Unchanged,
}

/// Upserts by id into an ascending sequence. Known ids only ever move their
/// status forward; new ids land after every message with an equal or earlier
/// timestamp.
pub(crate) fn merge_message(messages: &mut Vec<Message>, message: Message) -> MergeOutcome {
    if let Some(existing) = messages.iter_mut().find(|cached| cached.id == message.id) {
        if message.status > existing.status {
            existing.status = message.status;
            return MergeOutcome::Updated;
        }
        return MergeOutcome::Unchanged;
    }
    let index = messages.partition_point(|cached| cached.created_at <= message.created_at);
    messages.insert(index, message);
    MergeOutcome::Inserted
}

struct ConversationCache {
    conversation: Option<Conversation>,
    messages: Vec<Message>,
    loads_in_flight: usize,
    has_more: bool,
    references: usize,
    released_at: Option<u64>,
}

impl ConversationCache {
    fn released(at: u64) -> Self {
        Self {
            conversation: None,
            messages: Vec::new(),
            loads_in_flight: 0,
            has_more: true,
            references: 0,
            released_at: Some(at),
        }
    }

    /// Returns true when this is the only load running.
    fn begin_load(&mut self) -> bool {
        self.loads_in_flight += 1;
        self.loads_in_flight == 1
    }

    /// Returns true when no other load is still running.
    fn finish_load(&mut self) -> bool {
        self.loads_in_flight = self.loads_in_flight.saturating_sub(1);
        self.loads_in_flight == 0
    }

    fn merge_all(&mut self, fetched: Vec<Message>) -> usize {
        fetched
            .into_iter()
            .map(|message| merge_message(&mut self.messages, message))
            .filter(|outcome| *outcome != MergeOutcome::Unchanged)
            .count()
    }
}

#[derive(Default)]
struct StoreState {
    conversations: HashMap<ConversationId, ConversationCache>,
    active: Option<ConversationId>,
    release_clock: u64,
}

impl StoreState {
    fn entry(&mut self, conversation_id: ConversationId) -> &mut ConversationCache {
        self.release_clock += 1;
        let clock = self.release_clock;
        self.conversations
            .entry(conversation_id)
            .or_insert_with(|| ConversationCache::released(clock))
    }

    fn clear_active_if(&mut self, conversation_id: ConversationId) -> bool {
        if self.active != Some(conversation_id) {
            return false;
        }
        self.active = None;
        true
    }

    fn evict_released(&mut self, retained: usize) -> Vec<ConversationId> {
        let mut released = self
            .conversations
            .iter()
            .filter(|(id, cache)| {
                cache.references == 0 && cache.loads_in_flight == 0 && self.active != Some(**id)
            })
            .filter_map(|(id, cache)| cache.released_at.map(|at| (at, *id)))
            .collect::<Vec<_>>();
        if released.len() <= retained {
            return Vec::new();
        }
        released.sort_unstable();
        let excess = released.len() - retained;
        let evicted = released
            .into_iter()
            .take(excess)
            .map(|(_, id)| id)
            .collect::<Vec<_>>();
        for id in &evicted {
            self.conversations.remove(id);
        }
        evicted
    }
}

pub struct MessageStore {
    backend: Arc<dyn ChatBackend>,
    subscriptions: Arc<SubscriptionManager>,
    read_tracker: ReadTracker,
    page_size: u32,
    retained_conversations: usize,
    inner: Mutex<StoreState>,
    events: broadcast::Sender<ClientEvent>,
}

impl MessageStore {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        subscriptions: Arc<SubscriptionManager>,
        settings: &ChatSettings,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        Self {
            read_tracker: ReadTracker::new(backend.clone()),
            backend,
            subscriptions,
            page_size: settings.page_size.max(1),
            retained_conversations: settings.retained_conversations,
            inner: Mutex::new(StoreState::default()),
            events,
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Takes a reference on the conversation and makes it the active one.
    /// Metadata is fetched only when it is not cached yet.
    pub async fn open_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Conversation, ChatError> {
        let cached = self
            .inner
            .lock()
            .await
            .conversations
            .get(&conversation_id)
            .and_then(|cache| cache.conversation.clone());
        let (conversation, fetched) = match cached {
            Some(conversation) => (conversation, false),
            None => (
                self.backend
                    .fetch_conversation(conversation_id)
                    .await?
                    .normalize(),
                true,
            ),
        };

        {
            let mut guard = self.inner.lock().await;
            let cache = guard.entry(conversation_id);
            cache.references += 1;
            cache.released_at = None;
            if fetched || cache.conversation.is_none() {
                cache.conversation = Some(conversation.clone());
            }
            let references = cache.references;
            guard.active = Some(conversation_id);
            debug!(%conversation_id, references, "store: opened conversation");
        }
        if fetched {
            let _ = self.events.send(ClientEvent::ConversationChanged {
                conversation: conversation.clone(),
            });
        }
        Ok(conversation)
    }

    pub async fn close_conversation(&self, conversation_id: ConversationId) {
        let mut guard = self.inner.lock().await;
        guard.release_clock += 1;
        let clock = guard.release_clock;
        let Some(cache) = guard.conversations.get_mut(&conversation_id) else {
            return;
        };
        if cache.references == 0 {
            return;
        }
        cache.references -= 1;
        if cache.references == 0 {
            cache.released_at = Some(clock);
            debug!(%conversation_id, "store: released conversation");
        }
        let evicted = guard.evict_released(self.retained_conversations);
        if !evicted.is_empty() {
            info!(evicted = evicted.len(), "store: evicted released conversations");
        }
    }

    /// Fetches the newest page and merges it. Returns how many cached
    /// messages were added or updated.
    pub async fn load_messages(&self, conversation_id: ConversationId) -> Result<usize, ChatError> {
        let started = {
            let mut guard = self.inner.lock().await;
            let started = guard.entry(conversation_id).begin_load();
            guard.evict_released(self.retained_conversations);
            started
        };
        if started {
            let _ = self.events.send(ClientEvent::LoadingChanged {
                conversation_id,
                loading: true,
            });
        }

        let result = self
            .backend
            .fetch_messages(conversation_id, MessagePage::latest(self.page_size))
            .await;
        self.apply_page(conversation_id, result).await
    }

    /// Fetches the page before the oldest cached message. Returns 0 without
    /// a backend call once the history is exhausted.
    pub async fn load_older_messages(
        &self,
        conversation_id: ConversationId,
    ) -> Result<usize, ChatError> {
        let (cursor, started) = {
            let mut guard = self.inner.lock().await;
            let Some(cache) = guard.conversations.get_mut(&conversation_id) else {
                return Err(ChatError::NotLoaded(conversation_id));
            };
            if !cache.has_more {
                return Ok(0);
            }
            match cache.messages.first().map(|oldest| oldest.id) {
                Some(oldest) => (oldest, cache.begin_load()),
                None => {
                    drop(guard);
                    return self.load_messages(conversation_id).await;
                }
            }
        };
        if started {
            let _ = self.events.send(ClientEvent::LoadingChanged {
                conversation_id,
                loading: true,
            });
        }

        let result = self
            .backend
            .fetch_messages(conversation_id, MessagePage::before(self.page_size, cursor))
            .await;
        self.apply_page(conversation_id, result).await
    }

    async fn apply_page(
        &self,
        conversation_id: ConversationId,
        result: Result<Vec<Message>, shared::error::BackendError>,
    ) -> Result<usize, ChatError> {
        let (outcome, settled) = {
            let mut guard = self.inner.lock().await;
            match guard.conversations.get_mut(&conversation_id) {
                Some(cache) => {
                    let settled = cache.finish_load();
                    let outcome = result.map(|fetched| {
                        if fetched.len() < self.page_size as usize {
                            cache.has_more = false;
                        }
                        Some(cache.merge_all(fetched))
                    });
                    (outcome, settled)
                }
                None => (result.map(|_| None), true),
            }
        };
        if settled {
            let _ = self.events.send(ClientEvent::LoadingChanged {
                conversation_id,
                loading: false,
            });
        }

        match outcome {
            Ok(Some(changed)) => {
                debug!(%conversation_id, changed, "store: merged page");
                if changed > 0 {
                    let _ = self
                        .events
                        .send(ClientEvent::MessagesChanged { conversation_id });
                }
                Ok(changed)
            }
            Ok(None) => {
                debug!(%conversation_id, "store: dropped page for evicted conversation");
                Ok(0)
            }
            Err(err) => {
                warn!(%conversation_id, "store: failed to load messages: {err}");
                Err(err.into())
            }
        }
    }

    /// Persists the trimmed text. On failure the original text comes back
    /// inside `ChatError::SendFailed` and the cache is untouched.
    pub async fn send_text_message(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        text: &str,
    ) -> Result<Message, ChatError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        let record = NewMessage {
            conversation_id,
            sender_id,
            content: Some(trimmed.to_string()),
            kind: MessageKind::Text,
            media_url: None,
        };
        match self.backend.insert_message(record).await {
            Ok(message) => Ok(self.apply_sent(message).await),
            Err(source) => {
                warn!(%conversation_id, "store: failed to send text message: {source}");
                Err(ChatError::SendFailed {
                    text: text.to_string(),
                    source,
                })
            }
        }
    }

    pub async fn send_media_message(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        media_url: &str,
        kind: MediaKind,
    ) -> Result<Message, ChatError> {
        let media_url = media_url.trim();
        if media_url.is_empty() {
            return Err(ChatError::EmptyMediaUrl);
        }
        let record = NewMessage {
            conversation_id,
            sender_id,
            content: None,
            kind: kind.into(),
            media_url: Some(media_url.to_string()),
        };
        match self.backend.insert_message(record).await {
            Ok(message) => Ok(self.apply_sent(message).await),
            Err(err) => {
                warn!(%conversation_id, ?kind, "store: failed to send media message: {err}");
                Err(err.into())
            }
        }
    }

    async fn apply_sent(&self, message: Message) -> Message {
        let conversation_id = message.conversation_id;
        let outcome = {
            let mut guard = self.inner.lock().await;
            guard
                .conversations
                .get_mut(&conversation_id)
                .map(|cache| merge_message(&mut cache.messages, message.clone()))
        };
        match outcome {
            Some(MergeOutcome::Unchanged) => {}
            Some(_) => {
                let _ = self
                    .events
                    .send(ClientEvent::MessagesChanged { conversation_id });
            }
            None => debug!(%conversation_id, "store: sent message for uncached conversation"),
        }
        info!(%conversation_id, message_id = %message.id, "store: message sent");
        let _ = self.events.send(ClientEvent::MessageSent {
            message: message.clone(),
        });
        message
    }

    /// Returns whether the backend was told; repeated calls without new
    /// messages are skipped.
    pub async fn mark_as_read(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<bool, ChatError> {
        let latest = self
            .inner
            .lock()
            .await
            .conversations
            .get(&conversation_id)
            .and_then(|cache| cache.messages.last().map(ReadMarker::of));
        let reported = self
            .read_tracker
            .mark_read(conversation_id, user_id, latest)
            .await?;
        if reported {
            let _ = self.events.send(ClientEvent::ReadStateChanged {
                conversation_id,
                user_id,
            });
        }
        Ok(reported)
    }

    pub async fn subscribe_messages(
        self: &Arc<Self>,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<bool, ChatError> {
        let subscription = Subscription {
            topic: ChannelTopic::Conversation(conversation_id),
            user_id,
        };
        let sink: Arc<dyn RealtimeSink> = self.clone();
        Ok(self.subscriptions.subscribe(subscription, sink).await?)
    }

    pub async fn unsubscribe_messages(&self, conversation_id: ConversationId) -> bool {
        self.subscriptions
            .unsubscribe(ChannelTopic::Conversation(conversation_id))
            .await
    }

    pub async fn subscribe_conversation_list(
        self: &Arc<Self>,
        user_id: UserId,
    ) -> Result<bool, ChatError> {
        let subscription = Subscription {
            topic: ChannelTopic::ConversationList(user_id),
            user_id,
        };
        let sink: Arc<dyn RealtimeSink> = self.clone();
        Ok(self.subscriptions.subscribe(subscription, sink).await?)
    }

    pub async fn clear_active_conversation(&self) {
        let mut guard = self.inner.lock().await;
        guard.active = None;
        guard.evict_released(self.retained_conversations);
    }

    /// Drops the active pointer if it still names `conversation_id`; a
    /// different conversation opened in the meantime stays active.
    pub async fn release_active(&self, conversation_id: ConversationId) -> bool {
        self.inner.lock().await.clear_active_if(conversation_id)
    }

    pub async fn active_conversation(&self) -> Option<ConversationId> {
        self.inner.lock().await.active
    }

    pub async fn is_cached(&self, conversation_id: ConversationId) -> bool {
        self.inner
            .lock()
            .await
            .conversations
            .contains_key(&conversation_id)
    }

    pub async fn messages(&self, conversation_id: ConversationId) -> Vec<Message> {
        self.inner
            .lock()
            .await
            .conversations
            .get(&conversation_id)
            .map(|cache| cache.messages.clone())
            .unwrap_or_default()
    }

    pub async fn conversation(&self, conversation_id: ConversationId) -> Option<Conversation> {
        self.inner
            .lock()
            .await
            .conversations
            .get(&conversation_id)
            .and_then(|cache| cache.conversation.clone())
    }

    pub async fn is_loading(&self, conversation_id: ConversationId) -> bool {
        self.inner
            .lock()
            .await
            .conversations
            .get(&conversation_id)
            .is_some_and(|cache| cache.loads_in_flight > 0)
    }

    pub async fn has_more_history(&self, conversation_id: ConversationId) -> bool {
        self.inner
            .lock()
            .await
            .conversations
            .get(&conversation_id)
            .is_some_and(|cache| cache.has_more)
    }

    pub async fn timeline(
        &self,
        conversation_id: ConversationId,
        offset: FixedOffset,
        order: TimelineOrder,
    ) -> Vec<TimelineEntry> {
        let messages = self.messages(conversation_id).await;
        build_timeline(&messages, offset, order)
    }

    pub async fn unread_count(&self, conversation_id: ConversationId, user_id: UserId) -> usize {
        let messages = self.messages(conversation_id).await;
        self.read_tracker
            .unread_count(conversation_id, user_id, &messages)
            .await
    }

    /// Returns the merge outcome and whether the conversation is the active one.
    async fn apply_incoming(&self, message: Message) -> Option<(MergeOutcome, bool)> {
        let conversation_id = message.conversation_id;
        let outcome = {
            let mut guard = self.inner.lock().await;
            let active = guard.active == Some(conversation_id);
            guard
                .conversations
                .get_mut(&conversation_id)
                .map(|cache| (merge_message(&mut cache.messages, message), active))
        };
        match outcome {
            Some((MergeOutcome::Unchanged, _)) => {}
            Some(_) => {
                let _ = self
                    .events
                    .send(ClientEvent::MessagesChanged { conversation_id });
            }
            None => debug!(%conversation_id, "store: ignoring event for uncached conversation"),
        }
        outcome
    }

    async fn apply_conversation_update(&self, conversation: Conversation) {
        let conversation = conversation.normalize();
        {
            let mut guard = self.inner.lock().await;
            if let Some(cache) = guard.conversations.get_mut(&conversation.id) {
                cache.conversation = Some(conversation.clone());
            }
        }
        let _ = self
            .events
            .send(ClientEvent::ConversationChanged { conversation });
    }
}

#[async_trait]
impl RealtimeSink for MessageStore {
    async fn deliver(&self, subscription: &Subscription, event: RealtimeEvent) {
        match event {
            RealtimeEvent::MessageInserted { message } | RealtimeEvent::MessageUpdated { message }
                if matches!(
                    subscription.topic,
                    ChannelTopic::Conversation(expected) if expected != message.conversation_id
                ) =>
            {
                warn!(
                    message_id = %message.id,
                    "store: dropping event for conversation {} on topic={}",
                    message.conversation_id,
                    subscription.topic
                );
            }
            RealtimeEvent::MessageInserted { message } => {
                let conversation_id = message.conversation_id;
                let from_peer = message.sender_id != subscription.user_id;
                if let Some((MergeOutcome::Inserted, true)) = self.apply_incoming(message).await {
                    if from_peer {
                        let user_id = subscription.user_id;
                        if let Err(err) = self.mark_as_read(conversation_id, user_id).await {
                            warn!(%conversation_id, "store: failed to mark incoming message read: {err}");
                            let _ = self.events.send(ClientEvent::Error(format!(
                                "failed to mark conversation read: {err}"
                            )));
                        }
                    }
                }
            }
            RealtimeEvent::MessageUpdated { message } => {
                self.apply_incoming(message).await;
            }
            RealtimeEvent::ConversationUpdated { conversation } => {
                self.apply_conversation_update(conversation).await;
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
