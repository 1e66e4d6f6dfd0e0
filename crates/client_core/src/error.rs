use std::path::PathBuf;

use shared::{domain::ConversationId, error::BackendError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("message text must not be empty")]
    EmptyMessage,
    #[error("media url must not be empty")]
    EmptyMediaUrl,
    #[error("conversation {0} has no cached history")]
    NotLoaded(ConversationId),
    /// Carries the unsent text back so the compose field can be restored.
    #[error("failed to send message: {source}")]
    SendFailed {
        text: String,
        #[source]
        source: BackendError,
    },
    #[error("failed to read media file '{}': {source}", path.display())]
    MediaFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl ChatError {
    pub fn backend_error(&self) -> Option<&BackendError> {
        match self {
            ChatError::SendFailed { source, .. } => Some(source),
            ChatError::Backend(source) => Some(source),
            _ => None,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.backend_error().is_some_and(BackendError::is_transient)
    }
}
