use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{MessageId, ParticipantId, TrustLevel};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactionAction {
    Add,
    Remove,
}

impl ReactionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReactionAction::Add => "add",
            ReactionAction::Remove => "remove",
        }
    }

    pub fn opposite(&self) -> ReactionAction {
        match self {
            ReactionAction::Add => ReactionAction::Remove,
            ReactionAction::Remove => ReactionAction::Add,
        }
    }
}

/// Everything a stream can deliver. `Text`/`Image`/`VideoAnnounce` are
/// message kinds and end up in channel history; the rest are control kinds
/// and must never be stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WirePayload {
    Text {
        id: MessageId,
        sender: ParticipantId,
        timestamp: DateTime<Utc>,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<MessageId>,
    },
    Image {
        id: MessageId,
        sender: ParticipantId,
        timestamp: DateTime<Utc>,
        data_b64: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
    VideoAnnounce {
        id: MessageId,
        sender: ParticipantId,
        timestamp: DateTime<Utc>,
        title: String,
        stream_url: String,
    },
    Presence {
        sender: ParticipantId,
        timestamp: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        nickname: Option<String>,
    },
    Typing {
        sender: ParticipantId,
        timestamp: DateTime<Utc>,
    },
    Reaction {
        message_id: MessageId,
        emoji: String,
        sender: ParticipantId,
        action: ReactionAction,
        timestamp: DateTime<Utc>,
    },
    MemberUpdate {
        sender: ParticipantId,
        timestamp: DateTime<Utc>,
        members: Vec<ParticipantId>,
    },
}

impl WirePayload {
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            WirePayload::Presence { .. }
                | WirePayload::Typing { .. }
                | WirePayload::Reaction { .. }
                | WirePayload::MemberUpdate { .. }
        )
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            WirePayload::Text { .. } => "text",
            WirePayload::Image { .. } => "image",
            WirePayload::VideoAnnounce { .. } => "video_announce",
            WirePayload::Presence { .. } => "presence",
            WirePayload::Typing { .. } => "typing",
            WirePayload::Reaction { .. } => "reaction",
            WirePayload::MemberUpdate { .. } => "member_update",
        }
    }

    pub fn sender(&self) -> &ParticipantId {
        match self {
            WirePayload::Text { sender, .. }
            | WirePayload::Image { sender, .. }
            | WirePayload::VideoAnnounce { sender, .. }
            | WirePayload::Presence { sender, .. }
            | WirePayload::Typing { sender, .. }
            | WirePayload::Reaction { sender, .. }
            | WirePayload::MemberUpdate { sender, .. } => sender,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            WirePayload::Text { timestamp, .. }
            | WirePayload::Image { timestamp, .. }
            | WirePayload::VideoAnnounce { timestamp, .. }
            | WirePayload::Presence { timestamp, .. }
            | WirePayload::Typing { timestamp, .. }
            | WirePayload::Reaction { timestamp, .. }
            | WirePayload::MemberUpdate { timestamp, .. } => *timestamp,
        }
    }

    /// Message id for message kinds; `None` for control kinds.
    pub fn message_id(&self) -> Option<&MessageId> {
        match self {
            WirePayload::Text { id, .. }
            | WirePayload::Image { id, .. }
            | WirePayload::VideoAnnounce { id, .. } => Some(id),
            _ => None,
        }
    }
}

/// Outcome of signature verification attached to every ingested message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub valid: bool,
    pub trust_level: TrustLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl VerificationResult {
    pub fn ok(trust_level: TrustLevel) -> Self {
        Self {
            valid: true,
            trust_level,
            error: None,
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            trust_level: TrustLevel::UNKNOWN,
            error: Some(reason.into()),
        }
    }
}

/// One backward page of stored-stream history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryPage {
    pub messages: Vec<WirePayload>,
    pub has_more: bool,
}
