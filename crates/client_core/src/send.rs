use std::sync::Arc;

use chrono::Utc;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use shared::{
    domain::{MessageId, ParticipantId, StreamId},
    error::TransportError,
    payload::WirePayload,
};

use crate::{
    error::SendError, store::ChannelMessage, ChannelSession, PermissionGrant, SessionEvent,
    MAX_PUBLISH_RETRIES, PERMISSION_CACHE_TTL, PUBLISH_RETRY_DELAY, SEND_GUARD_TTL,
};

fn wake_stream_id(participant: &ParticipantId) -> StreamId {
    StreamId(format!("wake/{participant}"))
}

impl ChannelSession {
    /// Optimistic send: the message appears locally (pending) before the
    /// first publish attempt. Exhausted retries surface to the caller while
    /// the message stays in the list for a manual retry.
    pub async fn send_message(
        self: &Arc<Self>,
        stream_id: &StreamId,
        text: &str,
        reply_to: Option<&MessageId>,
    ) -> Result<MessageId, SendError> {
        let channel = self
            .store
            .get(stream_id)
            .await
            .ok_or_else(|| SendError::NotFound(stream_id.clone()))?;

        let (read_only, password, members) = {
            let guard = channel.lock().await;
            (
                guard.read_only,
                guard.password.clone(),
                guard.members.iter().cloned().collect::<Vec<_>>(),
            )
        };
        if read_only {
            return Err(SendError::ReadOnly(stream_id.clone()));
        }

        if !self.resolve_publish_permission(stream_id).await? {
            return Err(SendError::PermissionDenied(stream_id.clone()));
        }

        let mut message = self
            .verifier
            .create_signed_message(text, stream_id, reply_to)
            .await
            .map_err(|err| SendError::Sign(err.to_string()))?;
        message.pending = true;
        let message_id = message.id.clone();

        // Guards against rapid duplicate sends of the same constructed
        // message; duplicates return silently.
        let guard_key = format!("{stream_id}:{message_id}");
        if !self
            .send_guard
            .insert_if_absent(guard_key.clone(), SEND_GUARD_TTL)
            .await
        {
            debug!(stream_id = %stream_id, message_id = %message_id, "duplicate concurrent send suppressed");
            return Ok(message_id);
        }

        {
            let mut guard = channel.lock().await;
            guard.insert_message(message.clone());
            guard.sort_messages();
        }
        self.emit(SessionEvent::Message {
            stream_id: stream_id.clone(),
            message: message.clone(),
        });

        let publish_result = self
            .publish_with_retry(stream_id, &message, password.as_deref())
            .await;
        // Released on every path.
        self.send_guard.remove(&guard_key).await;

        match publish_result {
            Ok(()) => {
                {
                    let mut guard = channel.lock().await;
                    guard.mark_confirmed(&message_id);
                }
                self.emit(SessionEvent::MessageConfirmed {
                    stream_id: stream_id.clone(),
                    message_id: message_id.clone(),
                });
                self.spawn_wake_signals(stream_id, members);
                Ok(message_id)
            }
            Err(source) => {
                self.emit(SessionEvent::MessageFailed {
                    stream_id: stream_id.clone(),
                    message_id: message_id.clone(),
                    reason: source.to_string(),
                });
                Err(SendError::RetriesExhausted {
                    attempts: MAX_PUBLISH_RETRIES,
                    source,
                })
            }
        }
    }

    /// Re-runs the publish leg for a message that stayed pending after its
    /// retries were exhausted.
    pub async fn retry_pending_message(
        self: &Arc<Self>,
        stream_id: &StreamId,
        message_id: &MessageId,
    ) -> Result<(), SendError> {
        let channel = self
            .store
            .get(stream_id)
            .await
            .ok_or_else(|| SendError::NotFound(stream_id.clone()))?;

        let (message, password, members) = {
            let guard = channel.lock().await;
            let message = guard
                .message(message_id)
                .filter(|m| m.pending)
                .cloned()
                .ok_or_else(|| SendError::NotPending(message_id.clone()))?;
            (
                message,
                guard.password.clone(),
                guard.members.iter().cloned().collect::<Vec<_>>(),
            )
        };

        let guard_key = format!("{stream_id}:{message_id}");
        if !self
            .send_guard
            .insert_if_absent(guard_key.clone(), SEND_GUARD_TTL)
            .await
        {
            debug!(stream_id = %stream_id, message_id = %message_id, "retry already in flight");
            return Ok(());
        }

        let publish_result = self
            .publish_with_retry(stream_id, &message, password.as_deref())
            .await;
        self.send_guard.remove(&guard_key).await;

        match publish_result {
            Ok(()) => {
                {
                    let mut guard = channel.lock().await;
                    guard.mark_confirmed(message_id);
                }
                self.emit(SessionEvent::MessageConfirmed {
                    stream_id: stream_id.clone(),
                    message_id: message_id.clone(),
                });
                self.spawn_wake_signals(stream_id, members);
                Ok(())
            }
            Err(source) => {
                self.emit(SessionEvent::MessageFailed {
                    stream_id: stream_id.clone(),
                    message_id: message_id.clone(),
                    reason: source.to_string(),
                });
                Err(SendError::RetriesExhausted {
                    attempts: MAX_PUBLISH_RETRIES,
                    source,
                })
            }
        }
    }

    async fn resolve_publish_permission(&self, stream_id: &StreamId) -> Result<bool, SendError> {
        let me = self.verifier.local_identity();
        {
            let inner = self.inner.lock().await;
            if let Some(grant) = inner.permission_cache.get(&me) {
                if grant.checked_at.elapsed() < PERMISSION_CACHE_TTL {
                    return Ok(grant.allowed);
                }
            }
        }

        let allowed = self.transport.can_publish(stream_id, &me).await?;
        self.inner.lock().await.permission_cache.insert(
            me,
            PermissionGrant {
                allowed,
                checked_at: Instant::now(),
            },
        );
        Ok(allowed)
    }

    async fn publish_with_retry(
        &self,
        stream_id: &StreamId,
        message: &ChannelMessage,
        password: Option<&str>,
    ) -> Result<(), TransportError> {
        let mut last_error = TransportError::Unknown("publish never attempted".to_string());
        for attempt in 1..=MAX_PUBLISH_RETRIES {
            match self
                .transport
                .publish(stream_id, message.to_wire(), password)
                .await
            {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(
                        stream_id = %stream_id,
                        message_id = %message.id,
                        attempt,
                        max_attempts = MAX_PUBLISH_RETRIES,
                        %err,
                        "publish attempt failed"
                    );
                    last_error = err;
                    if attempt < MAX_PUBLISH_RETRIES {
                        sleep(PUBLISH_RETRY_DELAY).await;
                    }
                }
            }
        }
        Err(last_error)
    }

    // Nudges other members' clients after a confirmed send. Never joined,
    // never reported beyond a debug line.
    fn spawn_wake_signals(self: &Arc<Self>, stream_id: &StreamId, members: Vec<ParticipantId>) {
        if members.is_empty() {
            return;
        }
        let session = Arc::clone(self);
        let stream_id = stream_id.clone();
        let me = self.verifier.local_identity();
        tokio::spawn(async move {
            for member in members.into_iter().filter(|m| *m != me) {
                let payload = WirePayload::Presence {
                    sender: me.clone(),
                    timestamp: Utc::now(),
                    nickname: None,
                };
                if let Err(err) = session
                    .transport
                    .publish(&wake_stream_id(&member), payload, None)
                    .await
                {
                    debug!(stream_id = %stream_id, member = %member, %err, "wake signal failed");
                }
            }
        });
    }
}
