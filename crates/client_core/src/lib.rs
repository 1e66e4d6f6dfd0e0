use shared::{
    domain::{ConversationId, UserId},
    protocol::{Conversation, Message},
};

pub mod config;
pub mod context;
pub mod error;
pub mod read_tracking;
pub mod store;
pub mod subscriptions;
pub mod timeline;
pub mod upload;
pub mod voice;

pub use config::{load_settings, ChatSettings};
pub use context::ChatContext;
pub use error::ChatError;
pub use read_tracking::ReadTracker;
pub use store::MessageStore;
pub use subscriptions::{RealtimeSink, Subscription, SubscriptionManager, SubscriptionState};
pub use timeline::{build_timeline, TimelineEntry, TimelineOrder};
pub use upload::{MediaUploader, StorageUploadGateway};
pub use voice::{
    AudioRecorder, PlaybackState, PreviewPlayer, RecordedClip, SendOutcome, StartOutcome,
    VoiceCapture, VoiceError, VoicePhase,
};

#[derive(Debug, Clone)]
pub enum ClientEvent {
    MessagesChanged {
        conversation_id: ConversationId,
    },
    LoadingChanged {
        conversation_id: ConversationId,
        loading: bool,
    },
    /// Emitted once per confirmed send. Gallery and story features hang off
    /// this instead of the send path.
    MessageSent {
        message: Message,
    },
    ConversationChanged {
        conversation: Conversation,
    },
    ReadStateChanged {
        conversation_id: ConversationId,
        user_id: UserId,
    },
    VoiceStateChanged(VoicePhase),
    Warning(String),
    Error(String),
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;
