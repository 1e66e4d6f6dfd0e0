use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    ConversationId, ConversationKind, DeliveryStatus, MessageId, MessageKind, UserId,
};

const UNKNOWN_DISPLAY_NAME: &str = "Unknown";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: UserId,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub kind: ConversationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub participants: Vec<Participant>,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    /// Sorts participants by join time; stable for equal timestamps.
    pub fn normalize(mut self) -> Self {
        self.participants.sort_by_key(|participant| participant.joined_at);
        self
    }

    pub fn display_name(&self, viewer: UserId) -> String {
        match self.kind {
            ConversationKind::Direct => self
                .counterpart(viewer)
                .map(|participant| participant.display_name.clone())
                .unwrap_or_else(|| UNKNOWN_DISPLAY_NAME.to_string()),
            ConversationKind::Group => {
                if let Some(name) = self.name.as_ref().filter(|name| !name.trim().is_empty()) {
                    return name.clone();
                }
                let names = self
                    .participants
                    .iter()
                    .filter(|participant| participant.user_id != viewer)
                    .map(|participant| participant.display_name.as_str())
                    .collect::<Vec<_>>();
                if names.is_empty() {
                    UNKNOWN_DISPLAY_NAME.to_string()
                } else {
                    names.join(", ")
                }
            }
        }
    }

    pub fn display_avatar(&self, viewer: UserId) -> Option<String> {
        match self.kind {
            ConversationKind::Direct => self
                .counterpart(viewer)
                .and_then(|participant| participant.avatar_url.clone()),
            ConversationKind::Group => self.avatar_url.clone(),
        }
    }

    pub fn subtitle(&self) -> Option<String> {
        match self.kind {
            ConversationKind::Direct => None,
            ConversationKind::Group => Some(format!("{} members", self.participants.len())),
        }
    }

    fn counterpart(&self, viewer: UserId) -> Option<&Participant> {
        self.participants
            .iter()
            .find(|participant| participant.user_id != viewer)
            .or_else(|| self.participants.first())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub status: DeliveryStatus,
}

/// Record submitted to the backend; id and timestamp are assigned server side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePage {
    pub limit: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<MessageId>,
}

impl MessagePage {
    pub fn latest(limit: u32) -> Self {
        Self {
            limit,
            before: None,
        }
    }

    pub fn before(limit: u32, message_id: MessageId) -> Self {
        Self {
            limit,
            before: Some(message_id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", content = "id", rename_all = "snake_case")]
pub enum ChannelTopic {
    Conversation(ConversationId),
    ConversationList(UserId),
}

impl fmt::Display for ChannelTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelTopic::Conversation(id) => write!(f, "conversation:{id}"),
            ChannelTopic::ConversationList(user_id) => write!(f, "conversations:{user_id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum RealtimeEvent {
    MessageInserted { message: Message },
    MessageUpdated { message: Message },
    ConversationUpdated { conversation: Conversation },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResponse {
    pub url: String,
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn joined(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 9, minute, 0)
            .single()
            .expect("timestamp")
    }

    fn member(name: &str, minute: u32) -> Participant {
        Participant {
            user_id: UserId::new(),
            display_name: name.to_string(),
            avatar_url: Some(format!("https://avatars.test/{name}")),
            joined_at: joined(minute),
        }
    }

    fn conversation(kind: ConversationKind, participants: Vec<Participant>) -> Conversation {
        Conversation {
            id: ConversationId::new(),
            kind,
            name: None,
            avatar_url: None,
            participants,
            created_at: joined(0),
        }
        .normalize()
    }

    #[test]
    fn direct_conversation_shows_the_other_participant() {
        let viewer = member("alex", 0);
        let other = member("sam", 1);
        let direct = conversation(
            ConversationKind::Direct,
            vec![other.clone(), viewer.clone()],
        );

        assert_eq!(direct.participants[0].user_id, viewer.user_id);
        assert_eq!(direct.display_name(viewer.user_id), "sam");
        assert_eq!(direct.display_avatar(viewer.user_id), other.avatar_url);
        assert_eq!(direct.subtitle(), None);
    }

    #[test]
    fn unnamed_group_joins_member_names() {
        let viewer = member("alex", 0);
        let group = conversation(
            ConversationKind::Group,
            vec![viewer.clone(), member("sam", 1), member("jo", 2)],
        );

        assert_eq!(group.display_name(viewer.user_id), "sam, jo");
        assert_eq!(group.subtitle().as_deref(), Some("3 members"));
        assert_eq!(group.display_avatar(viewer.user_id), None);
    }

    #[test]
    fn empty_direct_conversation_falls_back_to_unknown() {
        let direct = conversation(ConversationKind::Direct, Vec::new());
        assert_eq!(direct.display_name(UserId::new()), "Unknown");
    }

    #[test]
    fn realtime_event_uses_type_and_payload_tags() {
        let group = conversation(ConversationKind::Group, vec![member("sam", 1)]);
        let event = RealtimeEvent::ConversationUpdated {
            conversation: group.clone(),
        };

        let value = serde_json::to_value(&event).expect("encode");
        assert_eq!(value["type"], "conversation_updated");
        assert_eq!(value["payload"]["conversation"]["kind"], "group");
        let decoded: RealtimeEvent = serde_json::from_value(value).expect("decode");
        assert_eq!(decoded, event);
    }

    #[test]
    fn message_status_defaults_to_sent() {
        let raw = serde_json::json!({
            "id": MessageId::new(),
            "conversation_id": ConversationId::new(),
            "sender_id": UserId::new(),
            "kind": "voice",
            "media_url": "https://media.test/clip.m4a",
            "created_at": "2024-05-01T10:00:00Z",
        });

        let message: Message = serde_json::from_value(raw).expect("decode");
        assert_eq!(message.status, DeliveryStatus::Sent);
        assert_eq!(message.kind, MessageKind::Voice);
        assert_eq!(message.content, None);
    }

    #[test]
    fn channel_topics_render_as_realtime_names() {
        let conversation_id = ConversationId::new();
        let user_id = UserId::new();

        assert_eq!(
            ChannelTopic::Conversation(conversation_id).to_string(),
            format!("conversation:{conversation_id}")
        );
        assert_eq!(
            ChannelTopic::ConversationList(user_id).to_string(),
            format!("conversations:{user_id}")
        );
    }
}
