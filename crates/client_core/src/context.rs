use std::sync::Arc;

use backend::{ChatBackend, MediaStorage, MissingMediaStorage};
use shared::{
    domain::{ConversationId, UserId},
    protocol::Conversation,
};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::{
    config::ChatSettings,
    error::ChatError,
    store::MessageStore,
    subscriptions::SubscriptionManager,
    upload::StorageUploadGateway,
    voice::{AudioRecorder, MissingAudioRecorder, MissingPreviewPlayer, PreviewPlayer, VoiceCapture},
    ClientEvent,
};

/// Everything one signed-in session needs, wired together explicitly.
pub struct ChatContext {
    settings: ChatSettings,
    store: Arc<MessageStore>,
    subscriptions: Arc<SubscriptionManager>,
    voice: VoiceCapture,
    events: broadcast::Sender<ClientEvent>,
}

impl ChatContext {
    pub fn new(settings: ChatSettings, backend: Arc<dyn ChatBackend>) -> Self {
        Self::new_with_dependencies(
            settings,
            backend,
            Arc::new(MissingMediaStorage),
            Arc::new(MissingAudioRecorder),
            Arc::new(MissingPreviewPlayer),
        )
    }

    pub fn new_with_dependencies(
        settings: ChatSettings,
        backend: Arc<dyn ChatBackend>,
        media: Arc<dyn MediaStorage>,
        recorder: Arc<dyn AudioRecorder>,
        player: Arc<dyn PreviewPlayer>,
    ) -> Self {
        let settings = settings.normalized();
        let (events, _) = broadcast::channel(settings.event_capacity);
        let subscriptions = Arc::new(SubscriptionManager::new(backend.clone()));
        let store = Arc::new(MessageStore::new(
            backend,
            subscriptions.clone(),
            &settings,
            events.clone(),
        ));
        let uploader = Arc::new(StorageUploadGateway::new(
            media,
            settings.media_bucket.clone(),
        ));
        let voice = VoiceCapture::new(recorder, player, uploader, store.clone(), events.clone());
        Self {
            settings,
            store,
            subscriptions,
            voice,
            events,
        }
    }

    pub fn settings(&self) -> &ChatSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<MessageStore> {
        &self.store
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionManager> {
        &self.subscriptions
    }

    pub fn voice(&self) -> &VoiceCapture {
        &self.voice
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Opens the conversation, starts realtime delivery, loads the newest
    /// page and reports it read. A failed read mark does not fail the screen.
    pub async fn open_screen(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Conversation, ChatError> {
        let conversation = self.store.open_conversation(conversation_id).await?;
        if let Err(err) = self.store.subscribe_messages(conversation_id, user_id).await {
            self.abandon_screen(conversation_id).await;
            return Err(err);
        }
        if let Err(err) = self.store.load_messages(conversation_id).await {
            self.store.unsubscribe_messages(conversation_id).await;
            self.abandon_screen(conversation_id).await;
            return Err(err);
        }
        if let Err(err) = self.store.mark_as_read(conversation_id, user_id).await {
            warn!(%conversation_id, "chat: failed to mark conversation read: {err}");
        }
        info!(%conversation_id, %user_id, "chat: screen opened");
        Ok(conversation)
    }

    pub async fn close_screen(&self, conversation_id: ConversationId) {
        self.store.unsubscribe_messages(conversation_id).await;
        self.store.release_active(conversation_id).await;
        self.voice.shutdown().await;
        self.store.close_conversation(conversation_id).await;
        info!(%conversation_id, "chat: screen closed");
    }

    async fn abandon_screen(&self, conversation_id: ConversationId) {
        self.store.release_active(conversation_id).await;
        self.store.close_conversation(conversation_id).await;
        warn!(%conversation_id, "chat: screen open rolled back");
    }

    pub async fn subscribe_conversation_list(&self, user_id: UserId) -> Result<bool, ChatError> {
        self.store.subscribe_conversation_list(user_id).await
    }

    pub async fn shutdown(&self) {
        self.voice.shutdown().await;
        self.subscriptions.unsubscribe_all().await;
        self.store.clear_active_conversation().await;
        info!("chat: context shut down");
    }
}

#[cfg(test)]
#[path = "tests/context_tests.rs"]
mod tests;
