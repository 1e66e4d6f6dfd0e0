use std::{path::Path, sync::Arc};

use async_trait::async_trait;
use backend::MediaStorage;
use shared::domain::ConversationId;
use tracing::info;
use uuid::Uuid;

use crate::error::ChatError;

/// Turns a local media file into a durable URL.
#[async_trait]
pub trait MediaUploader: Send + Sync {
    async fn upload(&self, conversation_id: ConversationId, path: &Path)
        -> Result<String, ChatError>;
}

pub struct StorageUploadGateway {
    storage: Arc<dyn MediaStorage>,
    bucket: String,
}

impl StorageUploadGateway {
    pub fn new(storage: Arc<dyn MediaStorage>, bucket: impl Into<String>) -> Self {
        Self {
            storage,
            bucket: bucket.into(),
        }
    }
}

#[async_trait]
impl MediaUploader for StorageUploadGateway {
    async fn upload(
        &self,
        conversation_id: ConversationId,
        path: &Path,
    ) -> Result<String, ChatError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source| ChatError::MediaFile {
                path: path.to_path_buf(),
                source,
            })?;
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);
        let object_path = match &extension {
            Some(ext) => format!("{conversation_id}/{}.{ext}", Uuid::new_v4()),
            None => format!("{conversation_id}/{}", Uuid::new_v4()),
        };
        let content_type = content_type_for(extension.as_deref());
        let size_bytes = bytes.len();

        let url = self
            .storage
            .upload_file(&self.bucket, &object_path, bytes, content_type)
            .await?;
        info!(
            %conversation_id,
            size_bytes,
            "upload: stored {}/{object_path} as {content_type}",
            self.bucket
        );
        Ok(url)
    }
}

pub(crate) fn content_type_for(extension: Option<&str>) -> &'static str {
    match extension {
        Some("m4a") => "audio/mp4",
        Some("aac") => "audio/aac",
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("mp4") => "video/mp4",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
#[path = "tests/upload_tests.rs"]
mod tests;
