use std::{collections::VecDeque, sync::Arc};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::{broadcast, Mutex};

use shared::{
    domain::{ChannelKind, Member, MessageId, ParticipantId, StreamId, TrustLevel},
    error::TransportError,
    payload::{HistoryPage, VerificationResult, WirePayload},
};
use storage::MetadataStore;

use crate::{
    store::{ChannelMessage, MessageBody},
    ChannelSession, DirectoryService, IdentityVerifier, SessionEvent, StreamHandlers,
    StreamTransport, VerifyOptions,
};

pub const STREAM: &str = "stream-1";
pub const LOCAL_IDENTITY: &str = "0xlocal";

pub fn stream() -> StreamId {
    StreamId::from(STREAM)
}

pub fn old_timestamp() -> DateTime<Utc> {
    Utc::now() - ChronoDuration::hours(1)
}

pub fn wire_text(id: &str, sender: &str, timestamp: DateTime<Utc>) -> WirePayload {
    WirePayload::Text {
        id: MessageId::from(id),
        sender: ParticipantId::from(sender),
        timestamp,
        text: format!("body of {id}"),
        reply_to: None,
    }
}

pub struct RecordingTransport {
    pub published: Mutex<Vec<(StreamId, WirePayload)>>,
    pub publish_attempts: Mutex<u32>,
    pub publish_failures_remaining: Mutex<u32>,
    pub subscribed: Mutex<Vec<StreamId>>,
    pub unsubscribed: Mutex<Vec<StreamId>>,
    pub fail_subscribe: Mutex<bool>,
    pub allow_publish: Mutex<bool>,
    pub can_publish_calls: Mutex<u32>,
    pub history_pages: Mutex<VecDeque<HistoryPage>>,
    pub history_calls: Mutex<u32>,
    pub history_delay: Mutex<Option<tokio::time::Duration>>,
    pub fail_history: Mutex<bool>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            published: Mutex::new(Vec::new()),
            publish_attempts: Mutex::new(0),
            publish_failures_remaining: Mutex::new(0),
            subscribed: Mutex::new(Vec::new()),
            unsubscribed: Mutex::new(Vec::new()),
            fail_subscribe: Mutex::new(false),
            allow_publish: Mutex::new(true),
            can_publish_calls: Mutex::new(0),
            history_pages: Mutex::new(VecDeque::new()),
            history_calls: Mutex::new(0),
            history_delay: Mutex::new(None),
            fail_history: Mutex::new(false),
        })
    }

    pub async fn published_to(&self, stream_id: &StreamId) -> Vec<WirePayload> {
        self.published
            .lock()
            .await
            .iter()
            .filter(|(target, _)| target == stream_id)
            .map(|(_, payload)| payload.clone())
            .collect()
    }
}

#[async_trait]
impl StreamTransport for RecordingTransport {
    async fn subscribe(
        &self,
        message_stream_id: &StreamId,
        _ephemeral_stream_id: &StreamId,
        _handlers: StreamHandlers,
        _password: Option<&str>,
        _initial_count: u32,
    ) -> Result<(), TransportError> {
        if *self.fail_subscribe.lock().await {
            return Err(TransportError::Network("injected subscribe failure".to_string()));
        }
        self.subscribed.lock().await.push(message_stream_id.clone());
        Ok(())
    }

    async fn publish(
        &self,
        stream_id: &StreamId,
        payload: WirePayload,
        _password: Option<&str>,
    ) -> Result<(), TransportError> {
        *self.publish_attempts.lock().await += 1;
        {
            let mut failures = self.publish_failures_remaining.lock().await;
            if *failures > 0 {
                *failures -= 1;
                return Err(TransportError::Network("injected publish failure".to_string()));
            }
        }
        self.published
            .lock()
            .await
            .push((stream_id.clone(), payload));
        Ok(())
    }

    async fn fetch_older_history(
        &self,
        _stream_id: &StreamId,
        _partition: i64,
        _before: DateTime<Utc>,
        _limit: u32,
        _password: Option<&str>,
    ) -> Result<HistoryPage, TransportError> {
        *self.history_calls.lock().await += 1;
        let delay = *self.history_delay.lock().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if *self.fail_history.lock().await {
            return Err(TransportError::Network("injected history failure".to_string()));
        }
        Ok(self
            .history_pages
            .lock()
            .await
            .pop_front()
            .unwrap_or(HistoryPage {
                messages: Vec::new(),
                has_more: false,
            }))
    }

    async fn unsubscribe(
        &self,
        message_stream_id: &StreamId,
        _ephemeral_stream_id: &StreamId,
    ) -> Result<(), TransportError> {
        self.unsubscribed
            .lock()
            .await
            .push(message_stream_id.clone());
        Ok(())
    }

    async fn can_publish(
        &self,
        _stream_id: &StreamId,
        _participant: &ParticipantId,
    ) -> Result<bool, TransportError> {
        *self.can_publish_calls.lock().await += 1;
        Ok(*self.allow_publish.lock().await)
    }
}

pub struct StaticVerifier {
    pub identity: ParticipantId,
    pub trust: TrustLevel,
    pub fail_verify: Mutex<bool>,
    pub fixed_next_id: Mutex<Option<MessageId>>,
    pub verify_calls: Mutex<Vec<(MessageId, bool)>>,
}

impl StaticVerifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            identity: ParticipantId::from(LOCAL_IDENTITY),
            trust: TrustLevel::SIGNED,
            fail_verify: Mutex::new(false),
            fixed_next_id: Mutex::new(None),
            verify_calls: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl IdentityVerifier for StaticVerifier {
    fn local_identity(&self) -> ParticipantId {
        self.identity.clone()
    }

    async fn create_signed_message(
        &self,
        text: &str,
        _stream_id: &StreamId,
        reply_to: Option<&MessageId>,
    ) -> Result<ChannelMessage> {
        let id = self
            .fixed_next_id
            .lock()
            .await
            .take()
            .unwrap_or_else(MessageId::random);
        Ok(ChannelMessage {
            id,
            sender: self.identity.clone(),
            timestamp: Utc::now(),
            body: MessageBody::Text {
                text: text.to_string(),
                reply_to: reply_to.cloned(),
            },
            verification: None,
            pending: false,
        })
    }

    async fn verify_message(
        &self,
        message: &ChannelMessage,
        _stream_id: &StreamId,
        opts: VerifyOptions,
    ) -> Result<VerificationResult> {
        self.verify_calls
            .lock()
            .await
            .push((message.id.clone(), opts.skip_timestamp_check));
        if *self.fail_verify.lock().await {
            return Err(anyhow!("signature verification backend unavailable"));
        }
        Ok(VerificationResult::ok(self.trust))
    }

    async fn trust_level(&self, _sender: &ParticipantId) -> TrustLevel {
        self.trust
    }
}

pub struct StaticDirectory {
    pub kind: ChannelKind,
    pub members: Vec<Member>,
}

impl StaticDirectory {
    pub fn public() -> Arc<Self> {
        Arc::new(Self {
            kind: ChannelKind::Public,
            members: Vec::new(),
        })
    }

    pub fn native(members: Vec<&str>) -> Arc<Self> {
        Arc::new(Self {
            kind: ChannelKind::Native,
            members: members
                .into_iter()
                .map(|id| Member {
                    id: ParticipantId::from(id),
                    nickname: None,
                })
                .collect(),
        })
    }
}

#[async_trait]
impl DirectoryService for StaticDirectory {
    async fn detect_channel_kind(&self, _stream_id: &StreamId) -> Result<ChannelKind> {
        Ok(self.kind)
    }

    async fn members(&self, _stream_id: &StreamId) -> Result<Vec<Member>> {
        Ok(self.members.clone())
    }

    async fn clear_cache(&self) {}
}

/// Build an in-memory metadata store.
///
/// The session tests run under `#[tokio::test(start_paused = true)]`. With the
/// clock paused, tokio auto-advances time whenever the runtime is otherwise
/// idle, which fires the sqlx connection-pool acquire timeout before the
/// (real-thread) SQLite connection can be established — surfacing as a spurious
/// "pool timed out while waiting for an open connection". Resume real time just
/// long enough to open the pool, then re-pause so the rest of the test keeps its
/// deterministic clock.
pub async fn metadata_store() -> MetadataStore {
    tokio::time::resume();
    let store = MetadataStore::in_memory().await.expect("metadata store");
    tokio::time::pause();
    store
}

pub async fn new_session(
    transport: Arc<RecordingTransport>,
    verifier: Arc<StaticVerifier>,
) -> Arc<ChannelSession> {
    let metadata = metadata_store().await;
    let session = ChannelSession::new(transport, verifier, StaticDirectory::public(), metadata);
    session.set_connected(true).await;
    session
}

/// Session with one public channel already created on `STREAM`.
pub async fn session_with_channel() -> (
    Arc<ChannelSession>,
    Arc<RecordingTransport>,
    Arc<StaticVerifier>,
) {
    let transport = RecordingTransport::new();
    let verifier = StaticVerifier::new();
    let session = new_session(Arc::clone(&transport), Arc::clone(&verifier)).await;
    session
        .create_channel(
            stream(),
            "general".to_string(),
            ChannelKind::Public,
            None,
            None,
        )
        .await
        .expect("create channel");
    (session, transport, verifier)
}

pub fn drain_events(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
