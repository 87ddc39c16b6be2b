use std::{
    fs,
    path::PathBuf,
    str::FromStr,
    sync::atomic::{AtomicU64, Ordering},
};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};

use shared::domain::{ChannelKind, ParticipantId, StreamId};

/// Durable channel-metadata record. Messages and reactions are deliberately
/// absent: history is re-derived from the transport on every session.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelRecord {
    pub stream_id: StreamId,
    pub name: String,
    pub kind: ChannelKind,
    pub members: Vec<ParticipantId>,
    pub classification: Option<String>,
    pub created_by: ParticipantId,
    pub created_at: DateTime<Utc>,
    pub read_only: bool,
    pub storage_partition: i64,
}

#[derive(Clone)]
pub struct MetadataStore {
    pool: Pool<Sqlite>,
}

impl MetadataStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        let store = Self { pool };
        store.ensure_channel_table().await?;
        Ok(store)
    }

    pub async fn in_memory() -> Result<Self> {
        // A bare `sqlite::memory:` gives every pooled connection its own private
        // database, so a table created on one connection is missing on the next.
        // Use a uniquely-named shared-cache in-memory database instead: every
        // connection in this pool attaches to the same data, while each
        // `in_memory()` call stays isolated from the others. Pre-open the whole
        // pool (`min_connections`) so later acquires never have to cold-open a
        // connection — important for callers running under a paused clock.
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let id = COUNTER.fetch_add(1, Ordering::Relaxed);
        let url = format!("sqlite:file:metadata_mem_{id}?mode=memory&cache=shared");

        let connect_options = SqliteConnectOptions::from_str(&url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .min_connections(5)
            .max_connections(5)
            // Skip the per-acquire liveness ping: for an in-memory database the
            // connection can't have dropped, and the ping's round-trip to the
            // SQLite worker thread would let a paused test clock auto-advance
            // past the acquire timeout, spuriously reporting `PoolTimedOut`.
            .test_before_acquire(false)
            .connect_with(connect_options)
            .await?;
        let store = Self { pool };
        store.ensure_channel_table().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    async fn ensure_channel_table(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS channel_metadata (
                stream_id          TEXT PRIMARY KEY,
                name               TEXT NOT NULL,
                kind               TEXT NOT NULL,
                members_json       TEXT NOT NULL,
                classification     TEXT,
                created_by         TEXT NOT NULL,
                created_at         TEXT NOT NULL,
                read_only          INTEGER NOT NULL DEFAULT 0,
                storage_partition  INTEGER NOT NULL DEFAULT 0,
                updated_at         TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure channel_metadata table exists")?;
        Ok(())
    }

    pub async fn upsert_channel(&self, record: &ChannelRecord) -> Result<()> {
        let members_json = serde_json::to_string(&record.members)
            .context("failed to serialize channel members")?;
        sqlx::query(
            r#"
            INSERT INTO channel_metadata
                (stream_id, name, kind, members_json, classification,
                 created_by, created_at, read_only, storage_partition, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, CURRENT_TIMESTAMP)
            ON CONFLICT(stream_id) DO UPDATE SET
                name = excluded.name,
                kind = excluded.kind,
                members_json = excluded.members_json,
                classification = excluded.classification,
                read_only = excluded.read_only,
                storage_partition = excluded.storage_partition,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(record.stream_id.as_str())
        .bind(&record.name)
        .bind(record.kind.as_str())
        .bind(members_json)
        .bind(&record.classification)
        .bind(record.created_by.as_str())
        .bind(record.created_at)
        .bind(record.read_only)
        .bind(record.storage_partition)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to upsert channel metadata for {}", record.stream_id))?;
        Ok(())
    }

    pub async fn load_channel(&self, stream_id: &StreamId) -> Result<Option<ChannelRecord>> {
        let row = sqlx::query(
            "SELECT stream_id, name, kind, members_json, classification, created_by, \
             created_at, read_only, storage_partition \
             FROM channel_metadata WHERE stream_id = ?1",
        )
        .bind(stream_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to load channel metadata for {stream_id}"))?;

        row.map(record_from_row).transpose()
    }

    pub async fn load_channels(&self) -> Result<Vec<ChannelRecord>> {
        let rows = sqlx::query(
            "SELECT stream_id, name, kind, members_json, classification, created_by, \
             created_at, read_only, storage_partition \
             FROM channel_metadata ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to list channel metadata")?;

        rows.into_iter().map(record_from_row).collect()
    }

    pub async fn remove_channel(&self, stream_id: &StreamId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM channel_metadata WHERE stream_id = ?1")
            .bind(stream_id.as_str())
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to remove channel metadata for {stream_id}"))?;
        Ok(result.rows_affected() > 0)
    }
}

fn record_from_row(row: sqlx::sqlite::SqliteRow) -> Result<ChannelRecord> {
    let kind_text: String = row.try_get("kind")?;
    let kind = ChannelKind::parse(&kind_text)
        .ok_or_else(|| anyhow!("unknown channel kind in metadata store: {kind_text}"))?;
    let members_json: String = row.try_get("members_json")?;
    let members: Vec<ParticipantId> =
        serde_json::from_str(&members_json).context("corrupt channel members column")?;
    let stream_id: String = row.try_get("stream_id")?;
    let created_by: String = row.try_get("created_by")?;

    Ok(ChannelRecord {
        stream_id: StreamId(stream_id),
        name: row.try_get("name")?,
        kind,
        members,
        classification: row.try_get("classification")?,
        created_by: ParticipantId(created_by),
        created_at: row.try_get("created_at")?,
        read_only: row.try_get("read_only")?,
        storage_partition: row.try_get("storage_partition")?,
    })
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = database_url.strip_prefix("sqlite://") else {
        return Ok(());
    };
    if path.is_empty() || path.starts_with(':') {
        return Ok(());
    }
    let path = PathBuf::from(path);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests;
