use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use tracing::{debug, warn};

use shared::{
    domain::{ChannelKind, StreamId},
    payload::{VerificationResult, WirePayload},
};

use crate::{
    store::ChannelMessage, ChannelSession, SessionEvent, VerifyOptions, RECEIVE_DEDUP_TTL,
    RECENT_MESSAGE_WINDOW_SECS,
};

impl ChannelSession {
    /// Entry point for every payload the transport delivers. Fire-and-forget:
    /// failures are logged, nothing propagates back into the transport
    /// callback.
    pub async fn ingest(self: &Arc<Self>, stream_id: StreamId, payload: WirePayload) {
        if !self.is_connected().await {
            debug!(stream_id = %stream_id, kind = payload.kind_name(), "dropping payload while disconnected");
            return;
        }

        if payload.is_control() {
            self.handle_control(&stream_id, payload).await;
            return;
        }

        let Some(message) = ChannelMessage::from_wire(&payload) else {
            debug!(stream_id = %stream_id, kind = payload.kind_name(), "dropping malformed payload");
            return;
        };

        // Closes the race between concurrent deliveries of the same id from
        // different paths (live subscription, history replay, own echo).
        let dedup_key = format!("{stream_id}:{}", message.id);
        if !self
            .receive_dedup
            .insert_if_absent(dedup_key, RECEIVE_DEDUP_TTL)
            .await
        {
            debug!(stream_id = %stream_id, message_id = %message.id, "duplicate delivery dropped");
            return;
        }

        let Some(channel) = self.store.get(&stream_id).await else {
            debug!(stream_id = %stream_id, "payload for unknown channel dropped");
            return;
        };
        if channel.lock().await.contains_message(&message.id) {
            return;
        }

        let age = Utc::now().signed_duration_since(message.timestamp);
        let recent = age < ChronoDuration::seconds(RECENT_MESSAGE_WINDOW_SECS);

        // A young self-authored message is the echo of an optimistic local
        // append; older ones arriving as history are processed normally.
        if recent && message.sender == self.verifier.local_identity() {
            debug!(stream_id = %stream_id, message_id = %message.id, "self echo suppressed");
            return;
        }

        if recent {
            let verification = self
                .verify_or_annotate(
                    &message,
                    &stream_id,
                    VerifyOptions {
                        skip_timestamp_check: false,
                    },
                )
                .await;
            let mut message = message;
            message.verification = Some(verification);

            let appended = {
                let mut guard = channel.lock().await;
                if guard.insert_message(message.clone()) {
                    guard.sort_messages();
                    true
                } else {
                    false
                }
            };
            if appended {
                self.emit(SessionEvent::Message { stream_id, message });
            }
        } else {
            self.queue_for_verification(stream_id, message).await;
        }
    }

    /// Verification failures never discard a message: they become an
    /// explicit invalid annotation the UI can warn about. The sender's
    /// directory trust level is still recorded on the failed result.
    pub(crate) async fn verify_or_annotate(
        &self,
        message: &ChannelMessage,
        stream_id: &StreamId,
        opts: VerifyOptions,
    ) -> VerificationResult {
        match self.verifier.verify_message(message, stream_id, opts).await {
            Ok(result) => result,
            Err(err) => {
                warn!(stream_id = %stream_id, message_id = %message.id, %err, "verification errored");
                VerificationResult {
                    valid: false,
                    trust_level: self.verifier.trust_level(&message.sender).await,
                    error: Some(err.to_string()),
                }
            }
        }
    }

    async fn handle_control(self: &Arc<Self>, stream_id: &StreamId, payload: WirePayload) {
        match payload {
            WirePayload::Presence {
                sender, nickname, ..
            } => {
                self.handle_presence(stream_id, sender, nickname).await;
            }
            WirePayload::Typing { sender, .. } => {
                if sender != self.verifier.local_identity() {
                    self.emit(SessionEvent::Typing {
                        stream_id: stream_id.clone(),
                        participant: sender,
                    });
                }
            }
            WirePayload::Reaction {
                message_id,
                emoji,
                sender,
                action,
                ..
            } => {
                self.apply_remote_reaction(stream_id, &message_id, &emoji, &sender, action)
                    .await;
            }
            WirePayload::MemberUpdate { members, .. } => {
                let Some(channel) = self.store.get(stream_id).await else {
                    return;
                };
                {
                    let mut guard = channel.lock().await;
                    if guard.kind != ChannelKind::Native {
                        return;
                    }
                    guard.members = members.into_iter().collect();
                    debug!(stream_id = %stream_id, members = guard.members.len(), "member set updated");
                }
                // Membership changed under the directory's feet.
                self.directory.clear_cache().await;
            }
            other => {
                debug!(stream_id = %stream_id, kind = other.kind_name(), "unhandled control payload");
            }
        }
    }
}
