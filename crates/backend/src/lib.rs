use async_trait::async_trait;
use shared::{
    domain::{ConversationId, UserId},
    error::BackendError,
    protocol::{ChannelTopic, Conversation, Message, MessagePage, NewMessage, RealtimeEvent},
};
use tokio::sync::mpsc;

pub mod http;
pub mod memory;

pub use http::HttpBackend;
pub use memory::MemoryBackend;

pub type EventSender = mpsc::UnboundedSender<RealtimeEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<RealtimeEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelHandle {
    pub id: u64,
    pub topic: ChannelTopic,
}

#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn fetch_conversation(&self, id: ConversationId) -> Result<Conversation, BackendError>;
    async fn fetch_messages(
        &self,
        conversation_id: ConversationId,
        page: MessagePage,
    ) -> Result<Vec<Message>, BackendError>;
    async fn insert_message(&self, record: NewMessage) -> Result<Message, BackendError>;
    async fn mark_read(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<(), BackendError>;
    async fn open_channel(
        &self,
        topic: ChannelTopic,
        events: EventSender,
    ) -> Result<ChannelHandle, BackendError>;
    async fn close_channel(&self, handle: ChannelHandle) -> Result<(), BackendError>;
}

#[async_trait]
pub trait MediaStorage: Send + Sync {
    async fn upload_file(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, BackendError>;
}

pub struct MissingMediaStorage;

#[async_trait]
impl MediaStorage for MissingMediaStorage {
    async fn upload_file(
        &self,
        bucket: &str,
        _path: &str,
        _bytes: Vec<u8>,
        _content_type: &str,
    ) -> Result<String, BackendError> {
        Err(BackendError::Rejected(format!(
            "media storage is unavailable for bucket {bucket}"
        )))
    }
}
