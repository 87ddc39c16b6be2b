use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use shared::{
    domain::{MessageId, ParticipantId, StreamId},
    payload::{ReactionAction, WirePayload},
};

use crate::{error::ChannelError, ChannelSession, SessionEvent, REACTION_DEBOUNCE_TTL};

fn debounce_key(
    stream_id: &StreamId,
    message_id: &MessageId,
    emoji: &str,
    action: ReactionAction,
) -> String {
    format!("{stream_id}:{message_id}:{emoji}:{}", action.as_str())
}

impl ChannelSession {
    /// Flips the local identity's membership in the `(message, emoji)` set
    /// and returns whether the flip removed it. The local flip always
    /// applies; only the network publish is debounced.
    pub async fn toggle_reaction(
        self: &Arc<Self>,
        stream_id: &StreamId,
        message_id: &MessageId,
        emoji: &str,
    ) -> Result<bool, ChannelError> {
        let channel = self
            .store
            .get(stream_id)
            .await
            .ok_or_else(|| ChannelError::NotFound(stream_id.clone()))?;

        let me = self.verifier.local_identity();
        let (is_removing, password) = {
            let mut guard = channel.lock().await;
            let removing = guard.toggle_reaction(&me, message_id, emoji);
            (removing, guard.password.clone())
        };
        self.emit(SessionEvent::Reaction {
            stream_id: stream_id.clone(),
            message_id: message_id.clone(),
            emoji: emoji.to_string(),
            participant: me.clone(),
            removed: is_removing,
        });

        let action = if is_removing {
            ReactionAction::Remove
        } else {
            ReactionAction::Add
        };

        // A toggle landing inside the window of its opposite cancels that
        // send instead of publishing the inverse right behind it.
        let opposite = debounce_key(stream_id, message_id, emoji, action.opposite());
        if self.reaction_debounce.remove(&opposite).await {
            debug!(stream_id = %stream_id, message_id = %message_id, "opposite reaction still debouncing; send skipped");
            return Ok(is_removing);
        }

        let key = debounce_key(stream_id, message_id, emoji, action);
        if !self
            .reaction_debounce
            .insert_if_absent(key, REACTION_DEBOUNCE_TTL)
            .await
        {
            debug!(stream_id = %stream_id, message_id = %message_id, "duplicate reaction send suppressed");
            return Ok(is_removing);
        }

        let payload = WirePayload::Reaction {
            message_id: message_id.clone(),
            emoji: emoji.to_string(),
            sender: me,
            action,
            timestamp: Utc::now(),
        };
        if let Err(err) = self
            .transport
            .publish(stream_id, payload, password.as_deref())
            .await
        {
            // Local state is kept; the toggle itself never fails on I/O.
            warn!(stream_id = %stream_id, message_id = %message_id, %err, "reaction publish failed");
        }
        Ok(is_removing)
    }

    /// Idempotent merge of a reaction observed on the wire. No-ops (already
    /// in the desired state) emit nothing.
    pub(crate) async fn apply_remote_reaction(
        &self,
        stream_id: &StreamId,
        message_id: &MessageId,
        emoji: &str,
        participant: &ParticipantId,
        action: ReactionAction,
    ) {
        // Our own reaction echoing back inside the debounce window was
        // already applied locally.
        if *participant == self.verifier.local_identity() {
            let key = debounce_key(stream_id, message_id, emoji, action);
            if self.reaction_debounce.contains(&key).await {
                return;
            }
        }

        let Some(channel) = self.store.get(stream_id).await else {
            return;
        };
        let changed = {
            let mut guard = channel.lock().await;
            guard.apply_reaction(participant, message_id, emoji, action)
        };
        if changed {
            self.emit(SessionEvent::Reaction {
                stream_id: stream_id.clone(),
                message_id: message_id.clone(),
                emoji: emoji.to_string(),
                participant: participant.clone(),
                removed: action == ReactionAction::Remove,
            });
        }
    }

    /// Reaction sets for one message, for presentation-layer reads.
    pub async fn message_reactions(
        &self,
        stream_id: &StreamId,
        message_id: &MessageId,
    ) -> Option<std::collections::HashMap<String, Vec<ParticipantId>>> {
        let channel = self.store.get(stream_id).await?;
        let guard = channel.lock().await;
        guard.reactions_for(message_id).map(|per_emoji| {
            per_emoji
                .iter()
                .map(|(emoji, users)| (emoji.clone(), users.iter().cloned().collect()))
                .collect()
        })
    }
}
