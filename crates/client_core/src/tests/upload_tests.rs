use super::*;
use backend::MemoryBackend;
use shared::error::BackendError;

fn gateway() -> (Arc<MemoryBackend>, StorageUploadGateway) {
    let backend = Arc::new(MemoryBackend::new());
    let storage: Arc<dyn MediaStorage> = backend.clone();
    (backend, StorageUploadGateway::new(storage, "chat-media"))
}

#[test]
fn content_type_follows_extension() {
    assert_eq!(content_type_for(Some("m4a")), "audio/mp4");
    assert_eq!(content_type_for(Some("jpeg")), "image/jpeg");
    assert_eq!(content_type_for(Some("mp4")), "video/mp4");
    assert_eq!(content_type_for(Some("heic")), "application/octet-stream");
    assert_eq!(content_type_for(None), "application/octet-stream");
}

#[tokio::test]
async fn uploads_file_under_conversation_prefix() {
    let (backend, gateway) = gateway();
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("Recording.M4A");
    tokio::fs::write(&path, b"clip").await.expect("write clip");
    let conversation_id = ConversationId::new();

    let url = gateway
        .upload(conversation_id, &path)
        .await
        .expect("upload");

    let uploads = backend.uploads().await;
    assert_eq!(uploads.len(), 1);
    let upload = &uploads[0];
    assert_eq!(upload.bucket, "chat-media");
    assert!(upload.path.starts_with(&format!("{conversation_id}/")));
    assert!(upload.path.ends_with(".m4a"));
    assert_eq!(upload.content_type, "audio/mp4");
    assert_eq!(upload.size_bytes, 4);
    assert_eq!(url, format!("memory://chat-media/{}", upload.path));
}

#[tokio::test]
async fn missing_file_is_reported_without_upload() {
    let (backend, gateway) = gateway();
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("gone.m4a");

    let err = gateway
        .upload(ConversationId::new(), &path)
        .await
        .expect_err("missing file");

    assert!(matches!(err, ChatError::MediaFile { path: failed, .. } if failed == path));
    assert!(backend.uploads().await.is_empty());
}

#[tokio::test]
async fn storage_failure_is_a_backend_error() {
    let (backend, gateway) = gateway();
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("photo.png");
    tokio::fs::write(&path, b"png").await.expect("write photo");
    backend.set_offline(true).await;

    let err = gateway
        .upload(ConversationId::new(), &path)
        .await
        .expect_err("offline");

    assert!(matches!(err, ChatError::Backend(BackendError::Network(_))));
}
