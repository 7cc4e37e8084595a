//! Processing coordinator
//!
//! Drives claimed entries through decompress -> parse -> normalize, with
//! two guarantees:
//!
//! - A pending entry is claimed by exactly one worker, via a single
//!   conditional `UPDATE ... RETURNING` (never a read-then-write pair).
//! - Exactly one `parsed_reports` row ever exists per sender-declared
//!   `report_id`; a second entry carrying the same id completes as a
//!   skip, not a duplicate.
//!
//! Every per-entry failure is converted into entry state (`failed` with
//! `parse_error` set) and the batch continues; only environment failures
//! such as an unreachable database propagate to the caller, whose task
//! runner owns retry and backoff.

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use dmarc_common::checksum::verify_sha256;
use sqlx::SqlitePool;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::decompress::decompress;
use crate::models::{EntryStatus, IngestedEntry};
use crate::parser::{parse_report, ReportDraft};
use crate::store::ContentStore;

/// Counters for one processing batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    /// Entries that reached `completed` (created or skipped)
    pub processed: u64,
    /// Entries that reached `failed`
    pub failed: u64,
}

impl BatchStats {
    /// True when downstream aggregate caches should be invalidated.
    /// The invalidation itself belongs to an external collaborator.
    pub fn dirtied_aggregates(&self) -> bool {
        self.processed > 0
    }
}

enum EntryOutcome {
    /// New report written, with its record count
    Created(usize),
    /// report_id already normalized by an earlier entry
    Skipped,
}

/// Coordinates parsing and normalization of pending entries
#[derive(Clone)]
pub struct ProcessingCoordinator {
    pool: SqlitePool,
    store: ContentStore,
}

impl ProcessingCoordinator {
    pub fn new(pool: SqlitePool, store: ContentStore) -> Self {
        Self { pool, store }
    }

    /// Process up to `limit` pending entries
    ///
    /// Safe to invoke from multiple workers concurrently: the claim is a
    /// single atomic conditional update, so racing workers can never both
    /// take the same entry.
    pub async fn process_pending(&self, limit: usize) -> Result<BatchStats> {
        let mut stats = BatchStats::default();

        for _ in 0..limit {
            let Some(entry) = self.claim_next().await? else {
                break;
            };

            match self.process_entry(&entry).await {
                Ok(EntryOutcome::Created(record_count)) => {
                    stats.processed += 1;
                    info!(
                        entry_id = %entry.id,
                        filename = %entry.filename,
                        records = record_count,
                        "Entry completed (report created)"
                    );
                }
                Ok(EntryOutcome::Skipped) => {
                    stats.processed += 1;
                }
                Err(e) => {
                    stats.failed += 1;
                    error!(
                        entry_id = %entry.id,
                        filename = %entry.filename,
                        error = %e,
                        "Entry failed"
                    );
                    self.mark_failed(entry.id, &format!("{e:#}")).await?;
                }
            }
        }

        if stats.dirtied_aggregates() {
            info!(
                processed = stats.processed,
                failed = stats.failed,
                "Batch completed; downstream aggregates are stale"
            );
        }

        Ok(stats)
    }

    /// Reset failed entries to pending and run a processing batch
    ///
    /// The operator retry path: failed entries re-enter the queue without
    /// re-ingesting the raw bytes.
    pub async fn reprocess_failed(&self, limit: usize) -> Result<BatchStats> {
        let reset = sqlx::query(
            r#"
            UPDATE ingested_entries
            SET status = ?1, parse_error = NULL, updated_at = ?2
            WHERE id IN (
                SELECT id FROM ingested_entries
                WHERE status = ?3
                ORDER BY created_at, id
                LIMIT ?4
            )
            AND status = ?3
            "#,
        )
        .bind(EntryStatus::Pending)
        .bind(Utc::now())
        .bind(EntryStatus::Failed)
        .bind(limit as i64)
        .execute(&self.pool)
        .await
        .context("Failed to reset failed entries")?;

        info!(reset = reset.rows_affected(), "Reset failed entries to pending");

        self.process_pending(limit).await
    }

    /// Claim the oldest pending entry, if any
    ///
    /// One conditional UPDATE checking the returned row, so two workers
    /// racing on the queue can never double-claim an entry.
    async fn claim_next(&self) -> Result<Option<IngestedEntry>> {
        sqlx::query_as::<_, IngestedEntry>(
            r#"
            UPDATE ingested_entries
            SET status = ?1, updated_at = ?2
            WHERE id = (
                SELECT id FROM ingested_entries
                WHERE status = ?3
                ORDER BY created_at, id
                LIMIT 1
            )
            AND status = ?3
            RETURNING id, message_id, received_at, filename, content_hash,
                      file_size, storage_path, status, parse_error, created_at, updated_at
            "#,
        )
        .bind(EntryStatus::Processing)
        .bind(Utc::now())
        .bind(EntryStatus::Pending)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to claim pending entry")
    }

    async fn process_entry(&self, entry: &IngestedEntry) -> Result<EntryOutcome> {
        let storage_path = entry
            .storage_path
            .as_deref()
            .ok_or_else(|| anyhow!("entry has no stored raw artifact"))?;

        let raw = self
            .store
            .get(storage_path)
            .await
            .context("failed to load raw artifact")?;

        // The stored bytes must still hash to the intake-time content hash;
        // a mismatch means on-disk corruption, not a parse problem.
        verify_sha256(&raw, &entry.content_hash)
            .context("raw artifact failed integrity check")?;

        let xml = decompress(&raw, &entry.filename)?;
        let draft = parse_report(&xml)?;

        if draft.dropped_records > 0 {
            warn!(
                entry_id = %entry.id,
                report_id = %draft.report_id,
                dropped = draft.dropped_records,
                "Report parsed with partial record drop"
            );
        }

        if let Some(existing_pk) = self.find_report_pk(&draft.report_id).await? {
            // Provenance for the audit trail: which entry won, which was
            // discarded.
            info!(
                entry_id = %entry.id,
                report_id = %draft.report_id,
                existing_report_pk = %existing_pk,
                "Duplicate report_id, completing without new rows"
            );
            self.mark_completed(entry.id).await?;
            return Ok(EntryOutcome::Skipped);
        }

        match self.write_report(entry.id, &draft).await {
            Ok(record_count) => Ok(EntryOutcome::Created(record_count)),
            Err(WriteReportError::DuplicateReportId) => {
                // A concurrent worker normalized this report_id between the
                // existence check and the insert.
                info!(
                    entry_id = %entry.id,
                    report_id = %draft.report_id,
                    "Lost report_id race to concurrent worker, completing as skip"
                );
                self.mark_completed(entry.id).await?;
                Ok(EntryOutcome::Skipped)
            }
            Err(WriteReportError::Other(e)) => Err(e),
        }
    }

    /// Insert the report, all its records, and the entry completion in one
    /// transaction
    async fn write_report(
        &self,
        entry_id: Uuid,
        draft: &ReportDraft,
    ) -> std::result::Result<usize, WriteReportError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin transaction")?;

        let report_pk = Uuid::new_v4();
        let now = Utc::now();

        let insert = sqlx::query(
            r#"
            INSERT INTO parsed_reports (
                id, report_id, org_name, email, date_begin, date_end,
                domain, adkim, aspf, p, sp, pct, created_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
        )
        .bind(report_pk)
        .bind(&draft.report_id)
        .bind(&draft.org_name)
        .bind(&draft.email)
        .bind(draft.date_begin)
        .bind(draft.date_end)
        .bind(&draft.domain)
        .bind(&draft.adkim)
        .bind(&draft.aspf)
        .bind(&draft.p)
        .bind(&draft.sp)
        .bind(draft.pct)
        .bind(now)
        .execute(&mut *tx)
        .await;

        match insert {
            Ok(_) => {}
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                return Err(WriteReportError::DuplicateReportId);
            }
            Err(e) => {
                return Err(WriteReportError::Other(
                    anyhow::Error::new(e).context("failed to insert parsed report"),
                ))
            }
        }

        for record in &draft.records {
            let dkim_auth = serde_json::to_string(&record.dkim_auth)
                .context("failed to serialize dkim auth results")?;
            let spf_auth = serde_json::to_string(&record.spf_auth)
                .context("failed to serialize spf auth results")?;

            sqlx::query(
                r#"
                INSERT INTO parsed_records (
                    id, report_pk, source_ip, count, disposition,
                    dkim_result, spf_result, header_from, envelope_from,
                    envelope_to, dkim_auth, spf_auth, created_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(report_pk)
            .bind(&record.source_ip)
            .bind(record.count)
            .bind(&record.disposition)
            .bind(&record.dkim_result)
            .bind(&record.spf_result)
            .bind(&record.header_from)
            .bind(&record.envelope_from)
            .bind(&record.envelope_to)
            .bind(dkim_auth)
            .bind(spf_auth)
            .bind(now)
            .execute(&mut *tx)
            .await
            .context("failed to insert parsed record")?;
        }

        sqlx::query(
            r#"
            UPDATE ingested_entries
            SET status = ?1, parse_error = NULL, updated_at = ?2
            WHERE id = ?3
            "#,
        )
        .bind(EntryStatus::Completed)
        .bind(now)
        .bind(entry_id)
        .execute(&mut *tx)
        .await
        .context("failed to mark entry completed")?;

        tx.commit().await.context("failed to commit report")?;

        Ok(draft.records.len())
    }

    async fn find_report_pk(&self, report_id: &str) -> Result<Option<Uuid>> {
        sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM parsed_reports WHERE report_id = ?1",
        )
        .bind(report_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query report by report_id")
    }

    async fn mark_completed(&self, entry_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE ingested_entries
            SET status = ?1, parse_error = NULL, updated_at = ?2
            WHERE id = ?3
            "#,
        )
        .bind(EntryStatus::Completed)
        .bind(Utc::now())
        .bind(entry_id)
        .execute(&self.pool)
        .await
        .context("Failed to mark entry completed")?;
        Ok(())
    }

    async fn mark_failed(&self, entry_id: Uuid, error_message: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE ingested_entries
            SET status = ?1, parse_error = ?2, updated_at = ?3
            WHERE id = ?4
            "#,
        )
        .bind(EntryStatus::Failed)
        .bind(error_message)
        .bind(Utc::now())
        .bind(entry_id)
        .execute(&self.pool)
        .await
        .context("Failed to mark entry failed")?;
        Ok(())
    }
}

enum WriteReportError {
    DuplicateReportId,
    Other(anyhow::Error),
}

impl From<anyhow::Error> for WriteReportError {
    fn from(e: anyhow::Error) -> Self {
        WriteReportError::Other(e)
    }
}
