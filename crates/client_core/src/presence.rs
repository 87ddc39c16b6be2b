use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use tokio::{
    sync::Mutex,
    task::JoinHandle,
    time::{sleep, Instant},
};
use tracing::debug;

use shared::{
    domain::{Member, ParticipantId, StreamId},
    payload::WirePayload,
};

use crate::{ChannelSession, SessionEvent, PRESENCE_HEARTBEAT_INTERVAL, PRESENCE_TIMEOUT};

struct PresenceEntry {
    last_active: Instant,
    nickname: Option<String>,
}

/// Per-channel liveness sets. Liveness is computed lazily on read; stale
/// entries are swept on heartbeat ticks rather than by a separate timer.
pub(crate) struct PresenceTracker {
    channels: Mutex<HashMap<StreamId, HashMap<ParticipantId, PresenceEntry>>>,
}

impl PresenceTracker {
    pub(crate) fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` when the participant was not online before this beat.
    async fn record(
        &self,
        stream_id: &StreamId,
        participant: ParticipantId,
        nickname: Option<String>,
    ) -> bool {
        let mut channels = self.channels.lock().await;
        let entries = channels.entry(stream_id.clone()).or_default();
        let was_online = entries
            .get(&participant)
            .is_some_and(|entry| entry.last_active.elapsed() < PRESENCE_TIMEOUT);
        entries.insert(
            participant,
            PresenceEntry {
                last_active: Instant::now(),
                nickname,
            },
        );
        !was_online
    }

    /// Liveness is decided here, lazily, at read time.
    pub(crate) async fn online_members(&self, stream_id: &StreamId) -> Vec<Member> {
        let channels = self.channels.lock().await;
        let mut members: Vec<Member> = channels
            .get(stream_id)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|(_, entry)| entry.last_active.elapsed() < PRESENCE_TIMEOUT)
                    .map(|(participant, entry)| Member {
                        id: participant.clone(),
                        nickname: entry.nickname.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        members.sort_by(|a, b| a.id.cmp(&b.id));
        members
    }

    pub(crate) async fn online(&self, stream_id: &StreamId) -> Vec<ParticipantId> {
        self.online_members(stream_id)
            .await
            .into_iter()
            .map(|member| member.id)
            .collect()
    }

    /// Returns how many stale entries were dropped.
    async fn sweep(&self, stream_id: &StreamId) -> usize {
        let mut channels = self.channels.lock().await;
        let Some(entries) = channels.get_mut(stream_id) else {
            return 0;
        };
        let before = entries.len();
        entries.retain(|_, entry| entry.last_active.elapsed() < PRESENCE_TIMEOUT);
        before - entries.len()
    }

    pub(crate) async fn forget_channel(&self, stream_id: &StreamId) {
        self.channels.lock().await.remove(stream_id);
    }
}

impl ChannelSession {
    pub async fn online_participants(&self, stream_id: &StreamId) -> Vec<ParticipantId> {
        self.presence.online(stream_id).await
    }

    /// Online set with the nicknames carried by the latest heartbeats.
    pub async fn online_members(&self, stream_id: &StreamId) -> Vec<Member> {
        self.presence.online_members(stream_id).await
    }

    pub(crate) async fn handle_presence(
        &self,
        stream_id: &StreamId,
        sender: ParticipantId,
        nickname: Option<String>,
    ) {
        if !self.store.contains(stream_id).await {
            return;
        }
        let newly_online = self.presence.record(stream_id, sender, nickname).await;
        if newly_online {
            let online = self.presence.online(stream_id).await;
            self.emit(SessionEvent::PresenceChanged {
                stream_id: stream_id.clone(),
                online,
            });
        }
    }

    /// Publishes a heartbeat immediately, then every interval while the
    /// channel remains the active one.
    pub(crate) fn spawn_presence_heartbeat(self: &Arc<Self>, stream_id: StreamId) -> JoinHandle<()> {
        let session = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let Some(session) = session.upgrade() else {
                    return;
                };
                if session.active_channel().await.as_ref() != Some(&stream_id) {
                    return;
                }

                session.publish_presence_heartbeat(&stream_id).await;

                let swept = session.presence.sweep(&stream_id).await;
                if swept > 0 {
                    let online = session.presence.online(&stream_id).await;
                    session.emit(SessionEvent::PresenceChanged {
                        stream_id: stream_id.clone(),
                        online,
                    });
                }

                drop(session);
                sleep(PRESENCE_HEARTBEAT_INTERVAL).await;
            }
        })
    }

    async fn publish_presence_heartbeat(&self, stream_id: &StreamId) {
        let Some(channel) = self.store.get(stream_id).await else {
            return;
        };
        let (ephemeral, password) = {
            let guard = channel.lock().await;
            (guard.ephemeral_stream_id.clone(), guard.password.clone())
        };
        let payload = WirePayload::Presence {
            sender: self.verifier.local_identity(),
            timestamp: Utc::now(),
            nickname: None,
        };
        if let Err(err) = self
            .transport
            .publish(&ephemeral, payload, password.as_deref())
            .await
        {
            debug!(stream_id = %stream_id, %err, "presence heartbeat failed");
        }
    }
}
