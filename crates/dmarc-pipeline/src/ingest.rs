//! Ingestion coordinator
//!
//! Raw intake half of the pipeline: hash the exact received bytes, catch
//! bit-identical redelivery via the hash-unique entry row, persist the raw
//! artifact, and queue a pending entry for the processing coordinator.
//!
//! The blob write and the entry insert are not one transaction. A crash
//! between the two leaves an orphaned (but idempotently re-writable) blob;
//! the next identical-byte delivery finds no entry row and safely
//! re-creates it.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dmarc_common::checksum::sha256_hex;
use sqlx::SqlitePool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::{EntryStatus, IngestedEntry};
use crate::store::ContentStore;

/// Result of one intake attempt
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    /// False when the bytes were already known and nothing was written
    pub is_new: bool,
    pub entry: IngestedEntry,
}

/// Coordinates raw report intake
#[derive(Clone)]
pub struct IngestionCoordinator {
    pool: SqlitePool,
    store: ContentStore,
}

impl IngestionCoordinator {
    pub fn new(pool: SqlitePool, store: ContentStore) -> Self {
        Self { pool, store }
    }

    /// Ingest one attachment
    ///
    /// Idempotent by content hash: concurrent or repeated deliveries of
    /// the same bytes converge on a single entry, with the losing writer
    /// observing `is_new = false` rather than an error.
    pub async fn ingest(
        &self,
        filename: &str,
        bytes: &[u8],
        message_id: &str,
        received_at: DateTime<Utc>,
    ) -> Result<IngestOutcome> {
        let content_hash = sha256_hex(bytes);

        if let Some(entry) = self.find_by_hash(&content_hash).await? {
            info!(
                content_hash = %content_hash,
                entry_id = %entry.id,
                filename,
                "Duplicate raw artifact, skipping intake"
            );
            return Ok(IngestOutcome {
                is_new: false,
                entry,
            });
        }

        let (storage_path, status, parse_error) = match self.store.put(bytes).await {
            Ok(outcome) => (Some(outcome.path), EntryStatus::Pending, None),
            Err(e) => {
                // Recording a failed intake beats silently dropping it; the
                // entry carries the error for the operator retry path.
                warn!(
                    content_hash = %content_hash,
                    filename,
                    error = %e,
                    "Raw artifact store failed, recording failed intake"
                );
                (None, EntryStatus::Failed, Some(e.to_string()))
            }
        };

        let now = Utc::now();
        let entry = IngestedEntry {
            id: Uuid::new_v4(),
            message_id: message_id.to_string(),
            received_at,
            filename: filename.to_string(),
            content_hash: content_hash.clone(),
            file_size: bytes.len() as i64,
            storage_path,
            status,
            parse_error,
            created_at: now,
            updated_at: now,
        };

        let insert = sqlx::query(
            r#"
            INSERT INTO ingested_entries (
                id, message_id, received_at, filename, content_hash,
                file_size, storage_path, status, parse_error, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(entry.id)
        .bind(&entry.message_id)
        .bind(entry.received_at)
        .bind(&entry.filename)
        .bind(&entry.content_hash)
        .bind(entry.file_size)
        .bind(&entry.storage_path)
        .bind(entry.status)
        .bind(&entry.parse_error)
        .bind(entry.created_at)
        .bind(entry.updated_at)
        .execute(&self.pool)
        .await;

        match insert {
            Ok(_) => {
                info!(
                    entry_id = %entry.id,
                    content_hash = %content_hash,
                    filename,
                    size = entry.file_size,
                    status = entry.status.as_str(),
                    "Ingested raw artifact"
                );
                Ok(IngestOutcome {
                    is_new: true,
                    entry,
                })
            }
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                // A concurrent identical-byte ingest won the insert race.
                let existing = self
                    .find_by_hash(&content_hash)
                    .await?
                    .context("entry vanished after unique violation")?;
                info!(
                    content_hash = %content_hash,
                    entry_id = %existing.id,
                    "Lost intake race to concurrent writer"
                );
                Ok(IngestOutcome {
                    is_new: false,
                    entry: existing,
                })
            }
            Err(e) => Err(e).context("Failed to insert ingested entry"),
        }
    }

    /// Look up an entry by content hash
    pub async fn find_by_hash(&self, content_hash: &str) -> Result<Option<IngestedEntry>> {
        sqlx::query_as::<_, IngestedEntry>(
            r#"
            SELECT id, message_id, received_at, filename, content_hash,
                   file_size, storage_path, status, parse_error, created_at, updated_at
            FROM ingested_entries
            WHERE content_hash = ?1
            "#,
        )
        .bind(content_hash)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query entry by content hash")
    }
}
