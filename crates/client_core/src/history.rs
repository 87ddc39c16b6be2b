use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, warn};

use shared::domain::StreamId;

use crate::{
    error::HistoryError, store::ChannelMessage, ChannelSession, SessionEvent, VerifyOptions,
    HISTORY_PAGE_SIZE,
};

impl ChannelSession {
    /// Backward pagination below the channel's oldest known timestamp.
    /// A single load per channel may be in flight; a concurrent call
    /// returns immediately with zero loaded.
    pub async fn load_more_history(
        self: &Arc<Self>,
        stream_id: &StreamId,
    ) -> Result<(usize, bool), HistoryError> {
        let channel = self
            .store
            .get(stream_id)
            .await
            .ok_or_else(|| HistoryError::NotFound(stream_id.clone()))?;

        let (before, partition, password, prior_has_more) = {
            let mut guard = channel.lock().await;
            if guard.loading_history {
                debug!(stream_id = %stream_id, "history load already in flight");
                return Ok((0, guard.has_more_history));
            }
            if !guard.has_more_history {
                return Ok((0, false));
            }
            // Without a cursor there is no sound upper bound to page from.
            let Some(cursor) = guard.oldest_timestamp else {
                return Err(HistoryError::NoCursor(stream_id.clone()));
            };
            guard.loading_history = true;
            (
                cursor,
                guard.storage_partition,
                guard.password.clone(),
                guard.has_more_history,
            )
        };
        self.emit(SessionEvent::HistoryLoading {
            stream_id: stream_id.clone(),
            loading: true,
        });

        let page = match self
            .transport
            .fetch_older_history(
                stream_id,
                partition,
                before,
                HISTORY_PAGE_SIZE,
                password.as_deref(),
            )
            .await
        {
            Ok(page) => page,
            Err(err) => {
                // Conservative retry-later default: guard cleared, cursor
                // and has_more untouched.
                warn!(stream_id = %stream_id, %err, "history fetch failed");
                channel.lock().await.loading_history = false;
                self.emit(SessionEvent::HistoryLoading {
                    stream_id: stream_id.clone(),
                    loading: false,
                });
                return Ok((0, prior_has_more));
            }
        };

        // Overlap at the page boundary is expected; drop it before paying
        // for verification.
        let existing = channel.lock().await.message_ids();
        let candidates: Vec<ChannelMessage> = page
            .messages
            .iter()
            .filter_map(ChannelMessage::from_wire)
            .filter(|m| !existing.contains(&m.id))
            .collect();

        let verifications = join_all(candidates.iter().map(|message| {
            self.verify_or_annotate(
                message,
                stream_id,
                VerifyOptions {
                    skip_timestamp_check: true,
                },
            )
        }))
        .await;

        let (loaded, has_more) = {
            let mut guard = channel.lock().await;
            let mut loaded = 0;
            for (mut message, verification) in candidates.into_iter().zip(verifications) {
                message.verification = Some(verification);
                if guard.insert_message(message) {
                    loaded += 1;
                }
            }
            guard.sort_messages();
            guard.has_more_history = page.has_more;
            guard.history_loaded = true;
            guard.loading_history = false;
            (loaded, guard.has_more_history)
        };

        self.emit(SessionEvent::HistoryLoading {
            stream_id: stream_id.clone(),
            loading: false,
        });
        self.emit(SessionEvent::HistoryLoaded {
            stream_id: stream_id.clone(),
            loaded,
            has_more,
        });
        Ok((loaded, has_more))
    }
}
