use std::{collections::HashMap, sync::Arc};

use futures::future::join_all;
use tokio::{sync::Mutex, task::JoinHandle, time::sleep};
use tracing::debug;

use shared::domain::StreamId;

use crate::{
    store::ChannelMessage, ChannelSession, SessionEvent, VerifyOptions, BATCH_FLUSH_WINDOW,
    BATCH_MAX_SIZE,
};

#[derive(Default)]
struct BatchQueue {
    messages: Vec<ChannelMessage>,
    flush_task: Option<JoinHandle<()>>,
}

/// Per-channel queues of historical messages awaiting verification.
/// Verification is an expensive external call; batching maximizes
/// fan-out while the debounce window and the size cap bound latency
/// and memory.
pub(crate) struct VerificationBatcher {
    queues: Mutex<HashMap<StreamId, BatchQueue>>,
}

impl VerificationBatcher {
    pub(crate) fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) async fn forget_channel(&self, stream_id: &StreamId) {
        if let Some(mut queue) = self.queues.lock().await.remove(stream_id) {
            if let Some(task) = queue.flush_task.take() {
                task.abort();
            }
        }
    }
}

impl ChannelSession {
    pub(crate) async fn queue_for_verification(
        self: &Arc<Self>,
        stream_id: StreamId,
        message: ChannelMessage,
    ) {
        let flush_now = {
            let mut queues = self.batcher.queues.lock().await;
            let queue = queues.entry(stream_id.clone()).or_default();
            queue.messages.push(message);
            if queue.messages.len() >= BATCH_MAX_SIZE {
                if let Some(task) = queue.flush_task.take() {
                    task.abort();
                }
                true
            } else {
                if queue.flush_task.is_none() {
                    let session = Arc::clone(self);
                    let stream_id = stream_id.clone();
                    queue.flush_task = Some(tokio::spawn(async move {
                        sleep(BATCH_FLUSH_WINDOW).await;
                        session.flush_verification_batch(&stream_id).await;
                    }));
                }
                false
            }
        };

        if flush_now {
            self.flush_verification_batch(&stream_id).await;
        }
    }

    pub(crate) async fn flush_verification_batch(self: &Arc<Self>, stream_id: &StreamId) {
        // Snapshot and clear under the lock: arrivals during verification
        // start a fresh batch, nothing is lost or processed twice.
        let batch = {
            let mut queues = self.batcher.queues.lock().await;
            match queues.get_mut(stream_id) {
                Some(queue) => {
                    queue.flush_task = None;
                    std::mem::take(&mut queue.messages)
                }
                None => return,
            }
        };
        if batch.is_empty() {
            return;
        }

        // One failure annotates its own message and blocks nothing else.
        let verifications = join_all(batch.iter().map(|message| {
            self.verify_or_annotate(
                message,
                stream_id,
                VerifyOptions {
                    skip_timestamp_check: true,
                },
            )
        }))
        .await;

        // The channel may have been left mid-flush.
        let Some(channel) = self.store.get(stream_id).await else {
            debug!(stream_id = %stream_id, discarded = batch.len(), "channel removed mid-flush; batch discarded");
            return;
        };

        let (loaded, total) = {
            let mut guard = channel.lock().await;
            let mut loaded = 0;
            for (mut message, verification) in batch.into_iter().zip(verifications) {
                message.verification = Some(verification);
                if guard.insert_message(message) {
                    loaded += 1;
                }
            }
            guard.sort_messages();
            guard.history_loaded = true;
            (loaded, guard.message_count())
        };

        self.emit(SessionEvent::HistoryBatchLoaded {
            stream_id: stream_id.clone(),
            loaded,
            total,
        });
    }
}
