use std::{collections::HashMap, sync::Arc};

use backend::ChatBackend;
use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, MessageId, UserId},
    error::BackendError,
    protocol::Message,
};
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadMarker {
    pub message_id: MessageId,
    pub created_at: DateTime<Utc>,
}

impl ReadMarker {
    pub fn of(message: &Message) -> Self {
        Self {
            message_id: message.id,
            created_at: message.created_at,
        }
    }
}

type ReadKey = (ConversationId, UserId);

#[derive(Default)]
struct ReadLedger {
    reported: HashMap<ReadKey, Option<ReadMarker>>,
    /// Marker currently being sent; a second mark for it is skipped.
    pending: HashMap<ReadKey, Option<ReadMarker>>,
}

impl ReadLedger {
    fn already_covered(&self, key: &ReadKey, latest: &Option<ReadMarker>) -> bool {
        self.reported.get(key) == Some(latest) || self.pending.get(key) == Some(latest)
    }

    fn record(&mut self, key: ReadKey, latest: Option<ReadMarker>) {
        let newer = match (self.reported.get(&key), latest) {
            (Some(Some(previous)), Some(latest)) => latest.created_at >= previous.created_at,
            (Some(Some(_)), None) => false,
            _ => true,
        };
        if newer {
            self.reported.insert(key, latest);
        }
    }
}

/// Remembers the newest message reported read per conversation and user so
/// repeated marks without new traffic never reach the backend.
pub struct ReadTracker {
    backend: Arc<dyn ChatBackend>,
    ledger: Mutex<ReadLedger>,
}

impl ReadTracker {
    pub fn new(backend: Arc<dyn ChatBackend>) -> Self {
        Self {
            backend,
            ledger: Mutex::new(ReadLedger::default()),
        }
    }

    /// Returns whether the backend was called.
    pub async fn mark_read(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        latest: Option<ReadMarker>,
    ) -> Result<bool, BackendError> {
        let key = (conversation_id, user_id);
        {
            let mut ledger = self.ledger.lock().await;
            if ledger.already_covered(&key, &latest) {
                debug!(%conversation_id, %user_id, "read: nothing new to report");
                return Ok(false);
            }
            ledger.pending.insert(key, latest);
        }

        let result = self.backend.mark_read(conversation_id, user_id).await;

        let mut ledger = self.ledger.lock().await;
        if ledger.pending.get(&key) == Some(&latest) {
            ledger.pending.remove(&key);
        }
        result?;
        ledger.record(key, latest);
        debug!(%conversation_id, %user_id, "read: reported");
        Ok(true)
    }

    pub async fn last_reported(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Option<ReadMarker> {
        self.ledger
            .lock()
            .await
            .reported
            .get(&(conversation_id, user_id))
            .copied()
            .flatten()
    }

    /// Messages from other senders that arrived after the last reported one.
    pub async fn unread_count(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        messages: &[Message],
    ) -> usize {
        let marker = self.last_reported(conversation_id, user_id).await;
        messages
            .iter()
            .filter(|message| message.sender_id != user_id)
            .filter(|message| match marker {
                Some(marker) => {
                    message.created_at > marker.created_at && message.id != marker.message_id
                }
                None => true,
            })
            .count()
    }
}

#[cfg(test)]
#[path = "tests/read_tracking_tests.rs"]
mod tests;
