use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use backend::{ChatBackend, MemoryBackend};
use chrono::{DateTime, TimeZone, Utc};
use shared::{
    domain::{ConversationId, ConversationKind, DeliveryStatus, MessageId, MessageKind, UserId},
    error::BackendError,
    protocol::{Conversation, Message, Participant},
};
use tokio::sync::{broadcast, Notify};

use crate::{
    config::ChatSettings,
    error::ChatError,
    store::MessageStore,
    subscriptions::SubscriptionManager,
    upload::MediaUploader,
    voice::{AudioRecorder, PreviewPlayer, RecordedClip},
    ClientEvent,
};

pub(crate) fn at(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 10, minute, 0)
        .single()
        .expect("timestamp")
}

pub(crate) fn participant(user_id: UserId, name: &str, minute: u32) -> Participant {
    Participant {
        user_id,
        display_name: name.to_string(),
        avatar_url: Some(format!("https://avatars.test/{name}.png")),
        joined_at: at(minute),
    }
}

pub(crate) fn direct_conversation(me: UserId, peer: UserId) -> Conversation {
    Conversation {
        id: ConversationId::new(),
        kind: ConversationKind::Direct,
        name: None,
        avatar_url: None,
        participants: vec![participant(peer, "sam", 1), participant(me, "alex", 0)],
        created_at: at(0),
    }
}

pub(crate) fn text_message(
    conversation_id: ConversationId,
    sender_id: UserId,
    content: &str,
    minute: u32,
) -> Message {
    Message {
        id: MessageId::new(),
        conversation_id,
        sender_id,
        content: Some(content.to_string()),
        kind: MessageKind::Text,
        media_url: None,
        created_at: at(minute),
        status: DeliveryStatus::Sent,
    }
}

pub(crate) fn drain_events(events: &mut broadcast::Receiver<ClientEvent>) -> Vec<ClientEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

pub(crate) struct StoreHarness {
    pub backend: Arc<MemoryBackend>,
    pub subscriptions: Arc<SubscriptionManager>,
    pub store: Arc<MessageStore>,
    pub events: broadcast::Receiver<ClientEvent>,
    pub conversation_id: ConversationId,
    pub me: UserId,
    pub peer: UserId,
    /// Sent by the peer at 10:00.
    pub m1: Message,
    /// Sent by `me` at 10:05.
    pub m2: Message,
}

impl StoreHarness {
    pub(crate) async fn new(settings: ChatSettings) -> Self {
        let backend = Arc::new(MemoryBackend::new());
        let me = UserId::new();
        let peer = UserId::new();
        let conversation = direct_conversation(me, peer);
        let conversation_id = conversation.id;
        let m1 = text_message(conversation_id, peer, "hey, are you coming tonight?", 0);
        let m2 = text_message(conversation_id, me, "on my way", 5);
        backend.seed_conversation(conversation).await;
        backend.seed_message(m1.clone()).await;
        backend.seed_message(m2.clone()).await;

        let chat_backend: Arc<dyn ChatBackend> = backend.clone();
        let (events_tx, events) = broadcast::channel(256);
        let subscriptions = Arc::new(SubscriptionManager::new(chat_backend.clone()));
        let store = Arc::new(MessageStore::new(
            chat_backend,
            subscriptions.clone(),
            &settings,
            events_tx,
        ));
        Self {
            backend,
            subscriptions,
            store,
            events,
            conversation_id,
            me,
            peer,
            m1,
            m2,
        }
    }

    /// Opens and loads the seeded conversation.
    pub(crate) async fn opened(settings: ChatSettings) -> Self {
        let harness = Self::new(settings).await;
        harness
            .store
            .open_conversation(harness.conversation_id)
            .await
            .expect("open conversation");
        harness
            .store
            .load_messages(harness.conversation_id)
            .await
            .expect("load messages");
        harness
    }
}

pub(crate) struct ScriptedRecorder {
    permission: bool,
    pub permission_query_fails: AtomicBool,
    clip: RecordedClip,
    calls: StdMutex<Vec<&'static str>>,
}

impl ScriptedRecorder {
    pub(crate) fn new(permission: bool) -> Self {
        Self {
            permission,
            permission_query_fails: AtomicBool::new(false),
            clip: RecordedClip {
                path: PathBuf::from("/tmp/voice-note.m4a"),
                duration: Duration::from_secs(7),
            },
            calls: StdMutex::new(Vec::new()),
        }
    }

    pub(crate) fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().expect("recorder calls").clone()
    }

    fn record(&self, call: &'static str) {
        self.calls.lock().expect("recorder calls").push(call);
    }
}

#[async_trait]
impl AudioRecorder for ScriptedRecorder {
    async fn request_permission(&self) -> Result<bool> {
        self.record("permission");
        if self.permission_query_fails.load(Ordering::SeqCst) {
            return Err(anyhow!("permission service unavailable"));
        }
        Ok(self.permission)
    }

    async fn start(&self) -> Result<()> {
        self.record("start");
        Ok(())
    }

    async fn stop(&self) -> Result<RecordedClip> {
        self.record("stop");
        Ok(self.clip.clone())
    }

    async fn cancel(&self) -> Result<()> {
        self.record("cancel");
        Ok(())
    }

    fn elapsed(&self) -> Duration {
        Duration::from_secs(3)
    }
}

#[derive(Default)]
pub(crate) struct ScriptedPlayer {
    pub at_end: AtomicBool,
    calls: StdMutex<Vec<&'static str>>,
}

impl ScriptedPlayer {
    pub(crate) fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().expect("player calls").clone()
    }

    fn record(&self, call: &'static str) {
        self.calls.lock().expect("player calls").push(call);
    }
}

#[async_trait]
impl PreviewPlayer for ScriptedPlayer {
    async fn load(&self, _path: &Path) -> Result<()> {
        self.record("load");
        Ok(())
    }

    async fn play(&self) -> Result<()> {
        self.record("play");
        Ok(())
    }

    async fn pause(&self) -> Result<()> {
        self.record("pause");
        Ok(())
    }

    async fn seek_to_start(&self) -> Result<()> {
        self.record("seek_to_start");
        self.at_end.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn is_at_end(&self) -> Result<bool> {
        self.record("is_at_end");
        Ok(self.at_end.load(Ordering::SeqCst))
    }

    async fn unload(&self) -> Result<()> {
        self.record("unload");
        Ok(())
    }
}

/// Uploader double that can be held mid-upload or told to fail once.
#[derive(Default)]
pub(crate) struct GatedUploader {
    pub calls: AtomicUsize,
    pub fail_next: AtomicBool,
    gate: Option<Arc<Notify>>,
}

impl GatedUploader {
    pub(crate) fn gated(gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaUploader for GatedUploader {
    async fn upload(
        &self,
        conversation_id: ConversationId,
        _path: &Path,
    ) -> Result<String, ChatError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(ChatError::Backend(BackendError::Network(
                "storage unreachable".to_string(),
            )));
        }
        Ok(format!("https://media.test/{conversation_id}/clip-{call}.m4a"))
    }
}
