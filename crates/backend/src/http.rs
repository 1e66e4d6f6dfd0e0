use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use reqwest::{header::CONTENT_TYPE, Client, RequestBuilder, Response};
use serde::{de::DeserializeOwned, Serialize};
use shared::{
    domain::{ConversationId, MessageId, UserId},
    error::{ApiError, BackendError, ErrorCode},
    protocol::{
        ChannelTopic, Conversation, Message, MessagePage, NewMessage, RealtimeEvent,
        UploadResponse,
    },
};
use tokio::{
    sync::{oneshot, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message as Frame};
use tracing::{debug, warn};
use url::Url;

use crate::{ChannelHandle, ChatBackend, EventSender, MediaStorage};

const CHANNEL_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

struct ChannelTask {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

#[derive(Serialize)]
struct ListMessagesQuery {
    limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    before: Option<MessageId>,
}

#[derive(Serialize)]
struct MarkReadQuery {
    user_id: UserId,
}

pub struct HttpBackend {
    http: Client,
    server_url: String,
    access_token: Option<String>,
    channels: Mutex<HashMap<u64, ChannelTask>>,
    next_channel_id: AtomicU64,
}

impl HttpBackend {
    pub fn new(server_url: &str, access_token: Option<String>) -> Result<Self, BackendError> {
        let server_url = server_url.trim().trim_end_matches('/').to_string();
        if !server_url.starts_with("http://") && !server_url.starts_with("https://") {
            return Err(BackendError::Rejected(format!(
                "server_url must start with http:// or https://, got '{server_url}'"
            )));
        }
        Ok(Self {
            http: Client::new(),
            server_url,
            access_token,
            channels: Mutex::new(HashMap::new()),
            next_channel_id: AtomicU64::new(0),
        })
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.access_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    fn realtime_url(&self, topic: ChannelTopic) -> Result<Url, BackendError> {
        let ws_url = if let Some(rest) = self.server_url.strip_prefix("https://") {
            format!("wss://{rest}/realtime")
        } else if let Some(rest) = self.server_url.strip_prefix("http://") {
            format!("ws://{rest}/realtime")
        } else {
            return Err(BackendError::Rejected(format!(
                "cannot derive websocket url from '{}'",
                self.server_url
            )));
        };
        let mut url = Url::parse(&ws_url)
            .map_err(|err| BackendError::Rejected(format!("invalid realtime url: {err}")))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("topic", &topic.to_string());
            if let Some(token) = &self.access_token {
                query.append_pair("access_token", token);
            }
        }
        Ok(url)
    }
}

fn network(err: reqwest::Error) -> BackendError {
    BackendError::Network(err.to_string())
}

pub(crate) fn map_status(status: u16, message: String) -> BackendError {
    match status {
        401 | 403 => BackendError::Unauthorized(message),
        404 => BackendError::NotFound(message),
        400 | 409 | 422 => BackendError::Rejected(message),
        _ => BackendError::Status { status, message },
    }
}

async fn check_status(response: Response) -> Result<Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(error_from_body(status.as_u16(), body))
}

/// A structured error body decides the variant; internal codes and
/// unparseable bodies fall back to the status code.
pub(crate) fn error_from_body(status: u16, body: String) -> BackendError {
    match serde_json::from_str::<ApiError>(&body) {
        Ok(err) if err.code != ErrorCode::Internal => err.into(),
        Ok(err) => map_status(status, err.message),
        Err(_) => map_status(status, body),
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, BackendError> {
    check_status(response)
        .await?
        .json()
        .await
        .map_err(|err| BackendError::InvalidResponse(err.to_string()))
}

#[async_trait]
impl ChatBackend for HttpBackend {
    async fn fetch_conversation(&self, id: ConversationId) -> Result<Conversation, BackendError> {
        let response = self
            .authorized(
                self.http
                    .get(format!("{}/conversations/{id}", self.server_url)),
            )
            .send()
            .await
            .map_err(network)?;
        decode(response).await
    }

    async fn fetch_messages(
        &self,
        conversation_id: ConversationId,
        page: MessagePage,
    ) -> Result<Vec<Message>, BackendError> {
        let response = self
            .authorized(
                self.http
                    .get(format!(
                        "{}/conversations/{conversation_id}/messages",
                        self.server_url
                    ))
                    .query(&ListMessagesQuery {
                        limit: page.limit,
                        before: page.before,
                    }),
            )
            .send()
            .await
            .map_err(network)?;
        decode(response).await
    }

    async fn insert_message(&self, record: NewMessage) -> Result<Message, BackendError> {
        let response = self
            .authorized(
                self.http
                    .post(format!("{}/messages", self.server_url))
                    .json(&record),
            )
            .send()
            .await
            .map_err(network)?;
        decode(response).await
    }

    async fn mark_read(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<(), BackendError> {
        let response = self
            .authorized(
                self.http
                    .post(format!(
                        "{}/conversations/{conversation_id}/read",
                        self.server_url
                    ))
                    .query(&MarkReadQuery { user_id }),
            )
            .send()
            .await
            .map_err(network)?;
        check_status(response).await?;
        Ok(())
    }

    async fn open_channel(
        &self,
        topic: ChannelTopic,
        events: EventSender,
    ) -> Result<ChannelHandle, BackendError> {
        let url = self.realtime_url(topic)?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| BackendError::Network(format!("failed to connect websocket: {err}")))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let (shutdown, mut shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        let _ = ws_writer.send(Frame::Close(None)).await;
                        break;
                    }
                    frame = ws_reader.next() => match frame {
                        Some(Ok(Frame::Text(text))) => {
                            match serde_json::from_str::<RealtimeEvent>(&text) {
                                Ok(event) => {
                                    if events.send(event).is_err() {
                                        break;
                                    }
                                }
                                Err(err) => {
                                    warn!("realtime: dropping malformed event topic={topic}: {err}");
                                }
                            }
                        }
                        Some(Ok(Frame::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            warn!("realtime: websocket receive failed topic={topic}: {err}");
                            break;
                        }
                    }
                }
            }
            debug!("realtime: channel task finished topic={topic}");
        });

        let id = self.next_channel_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.channels
            .lock()
            .await
            .insert(id, ChannelTask { shutdown, task });
        Ok(ChannelHandle { id, topic })
    }

    async fn close_channel(&self, handle: ChannelHandle) -> Result<(), BackendError> {
        let Some(channel) = self.channels.lock().await.remove(&handle.id) else {
            return Err(BackendError::NotFound(format!("channel {}", handle.id)));
        };
        // The task may already have exited after a server-side close.
        let _ = channel.shutdown.send(());
        let mut task = channel.task;
        if tokio::time::timeout(CHANNEL_CLOSE_TIMEOUT, &mut task)
            .await
            .is_err()
        {
            task.abort();
            return Err(BackendError::Network(format!(
                "timed out closing channel {}",
                handle.topic
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl MediaStorage for HttpBackend {
    async fn upload_file(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, BackendError> {
        let response = self
            .authorized(
                self.http
                    .put(format!("{}/storage/{bucket}/{path}", self.server_url))
                    .header(CONTENT_TYPE, content_type)
                    .body(bytes),
            )
            .send()
            .await
            .map_err(network)?;
        let uploaded: UploadResponse = decode(response).await?;
        Ok(uploaded.url)
    }
}

#[cfg(test)]
#[path = "tests/http_tests.rs"]
mod tests;
