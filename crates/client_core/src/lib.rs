use std::{collections::HashMap, sync::Arc};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};

use shared::{
    domain::{ChannelKind, Member, MessageId, ParticipantId, StreamId, TrustLevel},
    error::TransportError,
    payload::{HistoryPage, VerificationResult, WirePayload},
};
use storage::{ChannelRecord, MetadataStore};

pub mod dedup;
pub mod error;
mod history;
mod ingest;
mod presence;
mod reactions;
mod send;
pub mod store;
mod verify_batch;

pub use error::{ChannelError, HistoryError, SendError};
pub use store::{ephemeral_stream_id, Channel, ChannelMessage, ChannelStore, MessageBody};

use dedup::ExpiringSet;
use presence::PresenceTracker;
use verify_batch::VerificationBatcher;

pub(crate) const RECEIVE_DEDUP_TTL: Duration = Duration::from_secs(5);
pub(crate) const SEND_GUARD_TTL: Duration = Duration::from_secs(30);
pub(crate) const REACTION_DEBOUNCE_TTL: Duration = Duration::from_millis(500);
pub(crate) const BATCH_FLUSH_WINDOW: Duration = Duration::from_millis(100);
pub(crate) const BATCH_MAX_SIZE: usize = 50;
/// Messages younger than this are treated as live traffic: they verify
/// immediately, and self-authored ones are assumed to be local echoes.
pub(crate) const RECENT_MESSAGE_WINDOW_SECS: i64 = 30;
pub(crate) const PERMISSION_CACHE_TTL: Duration = Duration::from_secs(60);
pub(crate) const PUBLISH_RETRY_DELAY: Duration = Duration::from_secs(2);
pub(crate) const MAX_PUBLISH_RETRIES: u32 = 3;
pub(crate) const PRESENCE_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
/// Five heartbeat periods: a participant survives a few missed beats
/// before reading as offline.
pub(crate) const PRESENCE_TIMEOUT: Duration = Duration::from_secs(25);
pub(crate) const HISTORY_PAGE_SIZE: u32 = 40;

pub type PayloadHandler = Arc<dyn Fn(StreamId, WirePayload) + Send + Sync>;

/// Callbacks handed to the transport at subscribe time. The transport
/// invokes them with the channel's *message* stream id as the routing key,
/// whichever of the two underlying streams the payload arrived on.
pub struct StreamHandlers {
    pub on_message: PayloadHandler,
    pub on_control: PayloadHandler,
    pub on_media: PayloadHandler,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VerifyOptions {
    /// Historical messages are expected to carry timestamps in the past.
    pub skip_timestamp_check: bool,
}

#[async_trait]
pub trait StreamTransport: Send + Sync {
    async fn subscribe(
        &self,
        message_stream_id: &StreamId,
        ephemeral_stream_id: &StreamId,
        handlers: StreamHandlers,
        password: Option<&str>,
        initial_count: u32,
    ) -> Result<(), TransportError>;

    async fn publish(
        &self,
        stream_id: &StreamId,
        payload: WirePayload,
        password: Option<&str>,
    ) -> Result<(), TransportError>;

    async fn fetch_older_history(
        &self,
        stream_id: &StreamId,
        partition: i64,
        before: DateTime<Utc>,
        limit: u32,
        password: Option<&str>,
    ) -> Result<HistoryPage, TransportError>;

    async fn unsubscribe(
        &self,
        message_stream_id: &StreamId,
        ephemeral_stream_id: &StreamId,
    ) -> Result<(), TransportError>;

    async fn can_publish(
        &self,
        stream_id: &StreamId,
        participant: &ParticipantId,
    ) -> Result<bool, TransportError>;
}

pub struct MissingStreamTransport;

#[async_trait]
impl StreamTransport for MissingStreamTransport {
    async fn subscribe(
        &self,
        message_stream_id: &StreamId,
        _ephemeral_stream_id: &StreamId,
        _handlers: StreamHandlers,
        _password: Option<&str>,
        _initial_count: u32,
    ) -> Result<(), TransportError> {
        Err(TransportError::Unknown(format!(
            "stream transport unavailable for {message_stream_id}"
        )))
    }

    async fn publish(
        &self,
        stream_id: &StreamId,
        _payload: WirePayload,
        _password: Option<&str>,
    ) -> Result<(), TransportError> {
        Err(TransportError::Unknown(format!(
            "stream transport unavailable for {stream_id}"
        )))
    }

    async fn fetch_older_history(
        &self,
        stream_id: &StreamId,
        _partition: i64,
        _before: DateTime<Utc>,
        _limit: u32,
        _password: Option<&str>,
    ) -> Result<HistoryPage, TransportError> {
        Err(TransportError::Unknown(format!(
            "stream transport unavailable for {stream_id}"
        )))
    }

    async fn unsubscribe(
        &self,
        message_stream_id: &StreamId,
        _ephemeral_stream_id: &StreamId,
    ) -> Result<(), TransportError> {
        Err(TransportError::Unknown(format!(
            "stream transport unavailable for {message_stream_id}"
        )))
    }

    async fn can_publish(
        &self,
        stream_id: &StreamId,
        _participant: &ParticipantId,
    ) -> Result<bool, TransportError> {
        Err(TransportError::Unknown(format!(
            "stream transport unavailable for {stream_id}"
        )))
    }
}

#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    fn local_identity(&self) -> ParticipantId;

    async fn create_signed_message(
        &self,
        text: &str,
        stream_id: &StreamId,
        reply_to: Option<&MessageId>,
    ) -> Result<ChannelMessage>;

    async fn verify_message(
        &self,
        message: &ChannelMessage,
        stream_id: &StreamId,
        opts: VerifyOptions,
    ) -> Result<VerificationResult>;

    async fn trust_level(&self, sender: &ParticipantId) -> TrustLevel;
}

pub struct MissingIdentityVerifier;

#[async_trait]
impl IdentityVerifier for MissingIdentityVerifier {
    fn local_identity(&self) -> ParticipantId {
        ParticipantId::from("")
    }

    async fn create_signed_message(
        &self,
        _text: &str,
        stream_id: &StreamId,
        _reply_to: Option<&MessageId>,
    ) -> Result<ChannelMessage> {
        Err(anyhow!("identity verifier unavailable for {stream_id}"))
    }

    async fn verify_message(
        &self,
        _message: &ChannelMessage,
        stream_id: &StreamId,
        _opts: VerifyOptions,
    ) -> Result<VerificationResult> {
        Err(anyhow!("identity verifier unavailable for {stream_id}"))
    }

    async fn trust_level(&self, _sender: &ParticipantId) -> TrustLevel {
        TrustLevel::UNKNOWN
    }
}

#[async_trait]
pub trait DirectoryService: Send + Sync {
    async fn detect_channel_kind(&self, stream_id: &StreamId) -> Result<ChannelKind>;
    async fn members(&self, stream_id: &StreamId) -> Result<Vec<Member>>;
    async fn clear_cache(&self);
}

pub struct MissingDirectoryService;

#[async_trait]
impl DirectoryService for MissingDirectoryService {
    async fn detect_channel_kind(&self, stream_id: &StreamId) -> Result<ChannelKind> {
        Err(anyhow!("directory service unavailable for {stream_id}"))
    }

    async fn members(&self, stream_id: &StreamId) -> Result<Vec<Member>> {
        Err(anyhow!("directory service unavailable for {stream_id}"))
    }

    async fn clear_cache(&self) {}
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    Message {
        stream_id: StreamId,
        message: ChannelMessage,
    },
    MessageConfirmed {
        stream_id: StreamId,
        message_id: MessageId,
    },
    MessageFailed {
        stream_id: StreamId,
        message_id: MessageId,
        reason: String,
    },
    HistoryLoading {
        stream_id: StreamId,
        loading: bool,
    },
    HistoryLoaded {
        stream_id: StreamId,
        loaded: usize,
        has_more: bool,
    },
    HistoryBatchLoaded {
        stream_id: StreamId,
        loaded: usize,
        total: usize,
    },
    Reaction {
        stream_id: StreamId,
        message_id: MessageId,
        emoji: String,
        participant: ParticipantId,
        removed: bool,
    },
    Typing {
        stream_id: StreamId,
        participant: ParticipantId,
    },
    PresenceChanged {
        stream_id: StreamId,
        online: Vec<ParticipantId>,
    },
    ChannelJoined {
        stream_id: StreamId,
    },
    ChannelLeft {
        stream_id: StreamId,
    },
}

struct PermissionGrant {
    allowed: bool,
    checked_at: Instant,
}

struct SessionState {
    connected: bool,
    active_channel: Option<StreamId>,
    presence_task: Option<JoinHandle<()>>,
    permission_cache: HashMap<ParticipantId, PermissionGrant>,
}

/// Root of the channel layer: owns the channel store, the dedup registries
/// and every pipeline. All external I/O goes through the injected
/// transport, verifier, directory and metadata collaborators.
pub struct ChannelSession {
    transport: Arc<dyn StreamTransport>,
    verifier: Arc<dyn IdentityVerifier>,
    directory: Arc<dyn DirectoryService>,
    metadata: MetadataStore,
    store: ChannelStore,
    receive_dedup: ExpiringSet,
    send_guard: ExpiringSet,
    reaction_debounce: ExpiringSet,
    batcher: VerificationBatcher,
    presence: PresenceTracker,
    inner: Mutex<SessionState>,
    events: broadcast::Sender<SessionEvent>,
}

impl ChannelSession {
    pub fn new(
        transport: Arc<dyn StreamTransport>,
        verifier: Arc<dyn IdentityVerifier>,
        directory: Arc<dyn DirectoryService>,
        metadata: MetadataStore,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            transport,
            verifier,
            directory,
            metadata,
            store: ChannelStore::new(),
            receive_dedup: ExpiringSet::new(),
            send_guard: ExpiringSet::new(),
            reaction_debounce: ExpiringSet::new(),
            batcher: VerificationBatcher::new(),
            presence: PresenceTracker::new(),
            inner: Mutex::new(SessionState {
                connected: false,
                active_channel: None,
                presence_task: None,
                permission_cache: HashMap::new(),
            }),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn local_identity(&self) -> ParticipantId {
        self.verifier.local_identity()
    }

    pub async fn set_connected(&self, connected: bool) {
        self.inner.lock().await.connected = connected;
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.lock().await.connected
    }

    /// Snapshot of a channel's message list, oldest first.
    pub async fn channel_messages(&self, stream_id: &StreamId) -> Option<Vec<ChannelMessage>> {
        let channel = self.store.get(stream_id).await?;
        let guard = channel.lock().await;
        Some(guard.messages().to_vec())
    }

    pub async fn channel_stream_ids(&self) -> Vec<StreamId> {
        self.store.stream_ids().await
    }

    pub async fn create_channel(
        self: &Arc<Self>,
        stream_id: StreamId,
        name: String,
        kind: ChannelKind,
        password: Option<String>,
        classification: Option<String>,
    ) -> Result<(), ChannelError> {
        let me = self.verifier.local_identity();
        let mut channel = Channel::new(stream_id.clone(), kind, name, me.clone(), Utc::now());
        channel.password = password;
        channel.classification = classification;
        channel.persisted = true;
        if kind == ChannelKind::Native {
            channel.members.insert(me);
        }
        self.activate_channel(channel, true).await?;
        info!(stream_id = %stream_id, kind = kind.as_str(), "channel created");
        Ok(())
    }

    pub async fn join_channel(
        self: &Arc<Self>,
        stream_id: StreamId,
        password: Option<String>,
    ) -> Result<(), ChannelError> {
        let channel = self.describe_remote_channel(&stream_id, password).await?;
        self.activate_channel(channel, true).await?;
        info!(stream_id = %stream_id, "channel joined");
        Ok(())
    }

    /// Joins without writing a metadata record; `persist_from_preview`
    /// upgrades the channel later.
    pub async fn join_preview(
        self: &Arc<Self>,
        stream_id: StreamId,
        password: Option<String>,
    ) -> Result<(), ChannelError> {
        let mut channel = self.describe_remote_channel(&stream_id, password).await?;
        channel.persisted = false;
        self.activate_channel(channel, false).await?;
        info!(stream_id = %stream_id, "channel previewed");
        Ok(())
    }

    pub async fn persist_from_preview(&self, stream_id: &StreamId) -> Result<(), ChannelError> {
        let channel = self
            .store
            .get(stream_id)
            .await
            .ok_or_else(|| ChannelError::NotFound(stream_id.clone()))?;
        let record = {
            let mut guard = channel.lock().await;
            guard.persisted = true;
            channel_record(&guard)
        };
        self.metadata
            .upsert_channel(&record)
            .await
            .map_err(|err| ChannelError::Persistence {
                stream_id: stream_id.clone(),
                reason: err.to_string(),
            })?;
        info!(stream_id = %stream_id, "preview channel persisted");
        Ok(())
    }

    pub async fn leave_channel(&self, stream_id: &StreamId) -> Result<(), ChannelError> {
        self.drop_channel(stream_id, false).await
    }

    pub async fn delete_channel(&self, stream_id: &StreamId) -> Result<(), ChannelError> {
        self.drop_channel(stream_id, true).await
    }

    /// Re-subscribes every channel with a metadata record. Messages and
    /// reactions are not persisted; they flow back in as transport history.
    pub async fn load_persisted_channels(self: &Arc<Self>) -> Result<usize, ChannelError> {
        let records = self
            .metadata
            .load_channels()
            .await
            .map_err(|err| ChannelError::Persistence {
                stream_id: StreamId::from(""),
                reason: err.to_string(),
            })?;

        let mut restored = 0;
        for record in records {
            if self.store.contains(&record.stream_id).await {
                continue;
            }
            let channel = channel_from_record(record);
            let stream_id = channel.message_stream_id.clone();
            match self.activate_channel(channel, false).await {
                Ok(()) => restored += 1,
                Err(err) => {
                    warn!(stream_id = %stream_id, %err, "failed to restore persisted channel");
                }
            }
        }
        Ok(restored)
    }

    pub async fn set_active_channel(self: &Arc<Self>, stream_id: Option<StreamId>) {
        let previous = {
            let mut inner = self.inner.lock().await;
            inner.active_channel = stream_id.clone();
            inner.presence_task.take()
        };
        if let Some(task) = previous {
            task.abort();
        }
        let Some(stream_id) = stream_id else {
            return;
        };
        if !self.store.contains(&stream_id).await {
            return;
        }
        let task = self.spawn_presence_heartbeat(stream_id);
        self.inner.lock().await.presence_task = Some(task);
    }

    pub async fn active_channel(&self) -> Option<StreamId> {
        self.inner.lock().await.active_channel.clone()
    }

    /// Best-effort typing notification on the ephemeral stream.
    pub fn send_typing(self: &Arc<Self>, stream_id: &StreamId) {
        let session = Arc::clone(self);
        let stream_id = stream_id.clone();
        tokio::spawn(async move {
            let Some(channel) = session.store.get(&stream_id).await else {
                return;
            };
            let (ephemeral, password) = {
                let guard = channel.lock().await;
                (guard.ephemeral_stream_id.clone(), guard.password.clone())
            };
            let payload = WirePayload::Typing {
                sender: session.verifier.local_identity(),
                timestamp: Utc::now(),
            };
            if let Err(err) = session
                .transport
                .publish(&ephemeral, payload, password.as_deref())
                .await
            {
                debug!(stream_id = %stream_id, %err, "typing publish failed");
            }
        });
    }

    async fn describe_remote_channel(
        &self,
        stream_id: &StreamId,
        password: Option<String>,
    ) -> Result<Channel, ChannelError> {
        let kind = self
            .directory
            .detect_channel_kind(stream_id)
            .await
            .map_err(|err| ChannelError::Directory {
                stream_id: stream_id.clone(),
                reason: err.to_string(),
            })?;

        // Creator is unknown for channels discovered through the directory.
        let mut channel = Channel::new(
            stream_id.clone(),
            kind,
            stream_id.as_str().to_string(),
            ParticipantId::from(""),
            Utc::now(),
        );
        channel.password = password;
        channel.persisted = true;

        if kind == ChannelKind::Native {
            let members =
                self.directory
                    .members(stream_id)
                    .await
                    .map_err(|err| ChannelError::Directory {
                        stream_id: stream_id.clone(),
                        reason: err.to_string(),
                    })?;
            channel.members = members.into_iter().map(|m| m.id).collect();
        }
        Ok(channel)
    }

    async fn activate_channel(
        self: &Arc<Self>,
        channel: Channel,
        persist: bool,
    ) -> Result<(), ChannelError> {
        let stream_id = channel.message_stream_id.clone();
        let ephemeral_id = channel.ephemeral_stream_id.clone();
        let password = channel.password.clone();
        let record = channel_record(&channel);
        let should_persist = persist && channel.persisted;

        self.store.insert(channel).await?;

        if let Err(err) = self
            .transport
            .subscribe(
                &stream_id,
                &ephemeral_id,
                self.stream_handlers(),
                password.as_deref(),
                HISTORY_PAGE_SIZE,
            )
            .await
        {
            self.store.remove(&stream_id).await;
            return Err(ChannelError::Transport(err));
        }

        if should_persist {
            self.metadata
                .upsert_channel(&record)
                .await
                .map_err(|err| ChannelError::Persistence {
                    stream_id: stream_id.clone(),
                    reason: err.to_string(),
                })?;
        }

        self.emit(SessionEvent::ChannelJoined { stream_id });
        Ok(())
    }

    async fn drop_channel(
        &self,
        stream_id: &StreamId,
        require_creator: bool,
    ) -> Result<(), ChannelError> {
        let channel = self
            .store
            .get(stream_id)
            .await
            .ok_or_else(|| ChannelError::NotFound(stream_id.clone()))?;

        let (ephemeral_id, was_persisted) = {
            let guard = channel.lock().await;
            if require_creator && !guard.created_by.is_empty() {
                let me = self.verifier.local_identity();
                if guard.created_by != me {
                    return Err(ChannelError::NotCreator(stream_id.clone()));
                }
            }
            (guard.ephemeral_stream_id.clone(), guard.persisted)
        };

        // Remove first so in-flight verification results find no channel.
        self.store.remove(stream_id).await;
        self.batcher.forget_channel(stream_id).await;
        self.presence.forget_channel(stream_id).await;

        {
            let mut inner = self.inner.lock().await;
            if inner.active_channel.as_ref() == Some(stream_id) {
                inner.active_channel = None;
                if let Some(task) = inner.presence_task.take() {
                    task.abort();
                }
            }
        }

        if let Err(err) = self.transport.unsubscribe(stream_id, &ephemeral_id).await {
            warn!(stream_id = %stream_id, %err, "unsubscribe failed");
        }

        if was_persisted {
            if let Err(err) = self.metadata.remove_channel(stream_id).await {
                warn!(stream_id = %stream_id, %err, "failed to remove channel metadata");
            }
        }

        self.emit(SessionEvent::ChannelLeft {
            stream_id: stream_id.clone(),
        });
        Ok(())
    }

    fn stream_handlers(self: &Arc<Self>) -> StreamHandlers {
        StreamHandlers {
            on_message: self.payload_handler(),
            on_control: self.payload_handler(),
            on_media: self.payload_handler(),
        }
    }

    // Handlers hold a weak reference: the transport outliving the session
    // must not keep it alive, and ingestion classifies payloads itself.
    fn payload_handler(self: &Arc<Self>) -> PayloadHandler {
        let session = Arc::downgrade(self);
        Arc::new(move |stream_id: StreamId, payload: WirePayload| {
            let Some(session) = session.upgrade() else {
                return;
            };
            tokio::spawn(async move {
                session.ingest(stream_id, payload).await;
            });
        })
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        // A dropped or lagging observer must never break the pipeline.
        let _ = self.events.send(event);
    }
}

fn channel_record(channel: &Channel) -> ChannelRecord {
    ChannelRecord {
        stream_id: channel.message_stream_id.clone(),
        name: channel.name.clone(),
        kind: channel.kind,
        members: channel.members.iter().cloned().collect(),
        classification: channel.classification.clone(),
        created_by: channel.created_by.clone(),
        created_at: channel.created_at,
        read_only: channel.read_only,
        storage_partition: channel.storage_partition,
    }
}

fn channel_from_record(record: ChannelRecord) -> Channel {
    let mut channel = Channel::new(
        record.stream_id,
        record.kind,
        record.name,
        record.created_by,
        record.created_at,
    );
    channel.members = record.members.into_iter().collect();
    channel.classification = record.classification;
    channel.read_only = record.read_only;
    channel.storage_partition = record.storage_partition;
    channel.persisted = true;
    channel
}

#[cfg(test)]
mod tests;
