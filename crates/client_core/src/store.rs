use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};

use shared::{
    domain::{ChannelKind, MessageId, ParticipantId, StreamId},
    payload::{ReactionAction, VerificationResult, WirePayload},
};

use crate::error::ChannelError;

const EPHEMERAL_STREAM_SUFFIX: &str = "#ephemeral";

/// The ephemeral stream has no identity of its own: it is always derived
/// from the message stream id.
pub fn ephemeral_stream_id(message_stream_id: &StreamId) -> StreamId {
    StreamId(format!(
        "{}{EPHEMERAL_STREAM_SUFFIX}",
        message_stream_id.as_str()
    ))
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    Text {
        text: String,
        reply_to: Option<MessageId>,
    },
    Image {
        data_b64: String,
        caption: Option<String>,
    },
    VideoAnnounce {
        title: String,
        stream_url: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelMessage {
    pub id: MessageId,
    pub sender: ParticipantId,
    pub timestamp: DateTime<Utc>,
    pub body: MessageBody,
    pub verification: Option<VerificationResult>,
    pub pending: bool,
}

impl ChannelMessage {
    /// Converts a message-kind payload into a stored message. Control kinds
    /// and payloads missing an id or sender yield `None`.
    pub fn from_wire(payload: &WirePayload) -> Option<Self> {
        let (id, sender, timestamp, body) = match payload {
            WirePayload::Text {
                id,
                sender,
                timestamp,
                text,
                reply_to,
            } => (
                id,
                sender,
                *timestamp,
                MessageBody::Text {
                    text: text.clone(),
                    reply_to: reply_to.clone(),
                },
            ),
            WirePayload::Image {
                id,
                sender,
                timestamp,
                data_b64,
                caption,
            } => (
                id,
                sender,
                *timestamp,
                MessageBody::Image {
                    data_b64: data_b64.clone(),
                    caption: caption.clone(),
                },
            ),
            WirePayload::VideoAnnounce {
                id,
                sender,
                timestamp,
                title,
                stream_url,
            } => (
                id,
                sender,
                *timestamp,
                MessageBody::VideoAnnounce {
                    title: title.clone(),
                    stream_url: stream_url.clone(),
                },
            ),
            _ => return None,
        };

        if id.is_empty() || sender.is_empty() {
            return None;
        }

        Some(Self {
            id: id.clone(),
            sender: sender.clone(),
            timestamp,
            body,
            verification: None,
            pending: false,
        })
    }

    pub fn to_wire(&self) -> WirePayload {
        match &self.body {
            MessageBody::Text { text, reply_to } => WirePayload::Text {
                id: self.id.clone(),
                sender: self.sender.clone(),
                timestamp: self.timestamp,
                text: text.clone(),
                reply_to: reply_to.clone(),
            },
            MessageBody::Image { data_b64, caption } => WirePayload::Image {
                id: self.id.clone(),
                sender: self.sender.clone(),
                timestamp: self.timestamp,
                data_b64: data_b64.clone(),
                caption: caption.clone(),
            },
            MessageBody::VideoAnnounce { title, stream_url } => WirePayload::VideoAnnounce {
                id: self.id.clone(),
                sender: self.sender.clone(),
                timestamp: self.timestamp,
                title: title.clone(),
                stream_url: stream_url.clone(),
            },
        }
    }
}

/// One logical conversation bound to a message stream and its derived
/// ephemeral stream. All mutation happens through the owning `ChannelStore`.
#[derive(Debug)]
pub struct Channel {
    pub message_stream_id: StreamId,
    pub ephemeral_stream_id: StreamId,
    pub kind: ChannelKind,
    pub name: String,
    pub members: BTreeSet<ParticipantId>,
    pub created_by: ParticipantId,
    pub created_at: DateTime<Utc>,
    pub classification: Option<String>,
    pub read_only: bool,
    pub password: Option<String>,
    pub storage_partition: i64,
    /// Preview channels are live but have no metadata record yet.
    pub persisted: bool,
    pub history_loaded: bool,
    pub has_more_history: bool,
    pub loading_history: bool,
    pub oldest_timestamp: Option<DateTime<Utc>>,
    messages: Vec<ChannelMessage>,
    reactions: HashMap<MessageId, HashMap<String, BTreeSet<ParticipantId>>>,
}

impl Channel {
    pub fn new(
        message_stream_id: StreamId,
        kind: ChannelKind,
        name: String,
        created_by: ParticipantId,
        created_at: DateTime<Utc>,
    ) -> Self {
        let ephemeral_stream_id = ephemeral_stream_id(&message_stream_id);
        Self {
            message_stream_id,
            ephemeral_stream_id,
            kind,
            name,
            members: BTreeSet::new(),
            created_by,
            created_at,
            classification: None,
            read_only: false,
            password: None,
            storage_partition: 0,
            persisted: false,
            history_loaded: false,
            has_more_history: true,
            loading_history: false,
            oldest_timestamp: None,
            messages: Vec::new(),
            reactions: HashMap::new(),
        }
    }

    pub fn messages(&self) -> &[ChannelMessage] {
        &self.messages
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    pub fn contains_message(&self, id: &MessageId) -> bool {
        self.messages.iter().any(|m| &m.id == id)
    }

    pub fn message(&self, id: &MessageId) -> Option<&ChannelMessage> {
        self.messages.iter().find(|m| &m.id == id)
    }

    pub fn message_ids(&self) -> HashSet<MessageId> {
        self.messages.iter().map(|m| m.id.clone()).collect()
    }

    /// Appends unless the id is already present; a duplicate never
    /// overwrites the stored entry. Advances the pagination cursor when the
    /// new message is older than everything seen so far. Callers re-sort
    /// once per mutation batch.
    pub fn insert_message(&mut self, message: ChannelMessage) -> bool {
        if self.contains_message(&message.id) {
            return false;
        }
        match self.oldest_timestamp {
            Some(oldest) if message.timestamp >= oldest => {}
            _ => self.oldest_timestamp = Some(message.timestamp),
        }
        self.messages.push(message);
        true
    }

    /// Ascending by timestamp; ties broken deterministically by message id
    /// so immediate and batched arrivals converge on the same order.
    pub fn sort_messages(&mut self) {
        self.messages
            .sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
    }

    pub fn mark_confirmed(&mut self, id: &MessageId) -> bool {
        match self.messages.iter_mut().find(|m| &m.id == id) {
            Some(message) if message.pending => {
                message.pending = false;
                true
            }
            _ => false,
        }
    }

    pub fn set_verification(&mut self, id: &MessageId, verification: VerificationResult) {
        if let Some(message) = self.messages.iter_mut().find(|m| &m.id == id) {
            message.verification = Some(verification);
        }
    }

    /// Flips `participant`'s membership in the `(message, emoji)` set and
    /// returns whether the flip removed them. Empty sets are pruned eagerly.
    pub fn toggle_reaction(
        &mut self,
        participant: &ParticipantId,
        message_id: &MessageId,
        emoji: &str,
    ) -> bool {
        let present = self
            .reactions
            .get(message_id)
            .and_then(|per_emoji| per_emoji.get(emoji))
            .is_some_and(|users| users.contains(participant));
        let action = if present {
            ReactionAction::Remove
        } else {
            ReactionAction::Add
        };
        self.apply_reaction(participant, message_id, emoji, action);
        present
    }

    /// Idempotent add/remove; returns whether local state changed.
    pub fn apply_reaction(
        &mut self,
        participant: &ParticipantId,
        message_id: &MessageId,
        emoji: &str,
        action: ReactionAction,
    ) -> bool {
        match action {
            ReactionAction::Add => self
                .reactions
                .entry(message_id.clone())
                .or_default()
                .entry(emoji.to_string())
                .or_default()
                .insert(participant.clone()),
            ReactionAction::Remove => {
                let Some(per_emoji) = self.reactions.get_mut(message_id) else {
                    return false;
                };
                let Some(users) = per_emoji.get_mut(emoji) else {
                    return false;
                };
                let removed = users.remove(participant);
                if users.is_empty() {
                    per_emoji.remove(emoji);
                }
                if per_emoji.is_empty() {
                    self.reactions.remove(message_id);
                }
                removed
            }
        }
    }

    pub fn reactions_for(
        &self,
        message_id: &MessageId,
    ) -> Option<&HashMap<String, BTreeSet<ParticipantId>>> {
        self.reactions.get(message_id)
    }
}

/// Single source of truth for channel entities. Per-channel `Mutex` entries
/// give every channel one logical owner at a time; the outer map lock is
/// only held to look entries up.
pub struct ChannelStore {
    channels: RwLock<HashMap<StreamId, Arc<Mutex<Channel>>>>,
}

impl ChannelStore {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }

    pub async fn insert(&self, channel: Channel) -> Result<Arc<Mutex<Channel>>, ChannelError> {
        let mut channels = self.channels.write().await;
        let stream_id = channel.message_stream_id.clone();
        if channels.contains_key(&stream_id) {
            return Err(ChannelError::AlreadyJoined(stream_id));
        }
        let entry = Arc::new(Mutex::new(channel));
        channels.insert(stream_id, Arc::clone(&entry));
        Ok(entry)
    }

    pub async fn get(&self, stream_id: &StreamId) -> Option<Arc<Mutex<Channel>>> {
        self.channels.read().await.get(stream_id).cloned()
    }

    pub async fn remove(&self, stream_id: &StreamId) -> Option<Arc<Mutex<Channel>>> {
        self.channels.write().await.remove(stream_id)
    }

    pub async fn contains(&self, stream_id: &StreamId) -> bool {
        self.channels.read().await.contains_key(stream_id)
    }

    pub async fn stream_ids(&self) -> Vec<StreamId> {
        self.channels.read().await.keys().cloned().collect()
    }
}

impl Default for ChannelStore {
    fn default() -> Self {
        Self::new()
    }
}
