//! Mailbox collaborator interface
//!
//! The mailbox itself (IMAP, Graph, maildir, ...) is out of scope; the
//! pipeline consumes it through this trait. A source is passed explicitly
//! per invocation, never held as process-wide state, so acquisition and
//! release are scoped to the call even when a fetch or parse fails midway.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::ingest::IngestionCoordinator;

/// Attachment extensions worth fetching; everything else is skipped
/// before any bytes move.
const REPORT_EXTENSIONS: [&str; 3] = [".xml", ".gz", ".zip"];

/// Opaque handle to one candidate message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRef(pub String);

/// One fetched message with its report attachments
#[derive(Debug, Clone)]
pub struct FetchedMessage {
    pub message_id: String,
    pub received_at: DateTime<Utc>,
    /// (filename, raw bytes) pairs, pre-filtered by the source to report
    /// attachment types
    pub attachments: Vec<(String, Vec<u8>)>,
}

/// A mailbox that can list and fetch candidate report messages
#[async_trait]
pub trait MailboxSource: Send + Sync {
    async fn search_candidates(&self, limit: usize) -> Result<Vec<MessageRef>>;
    async fn fetch(&self, message: &MessageRef) -> Result<FetchedMessage>;
}

/// Counters from one drain pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    pub ingested: u64,
    pub duplicates: u64,
    pub failures: u64,
}

/// Pull up to `limit` candidate messages from `source` into the pipeline
///
/// One message's failure never aborts the pass; it is counted and the
/// drain continues.
pub async fn drain<S: MailboxSource>(
    source: &S,
    coordinator: &IngestionCoordinator,
    limit: usize,
) -> Result<DrainStats> {
    let candidates = source
        .search_candidates(limit)
        .await
        .context("Failed to search mailbox candidates")?;

    let mut stats = DrainStats::default();

    for candidate in &candidates {
        let message = match source.fetch(candidate).await {
            Ok(message) => message,
            Err(e) => {
                warn!(message_ref = %candidate.0, error = %e, "Failed to fetch message");
                stats.failures += 1;
                continue;
            }
        };

        for (filename, bytes) in &message.attachments {
            if !is_report_attachment(filename) {
                continue;
            }

            match coordinator
                .ingest(filename, bytes, &message.message_id, message.received_at)
                .await
            {
                Ok(outcome) if outcome.is_new => stats.ingested += 1,
                Ok(_) => stats.duplicates += 1,
                Err(e) => {
                    warn!(
                        message_id = %message.message_id,
                        filename = %filename,
                        error = %e,
                        "Failed to ingest attachment"
                    );
                    stats.failures += 1;
                }
            }
        }
    }

    info!(
        candidates = candidates.len(),
        ingested = stats.ingested,
        duplicates = stats.duplicates,
        failures = stats.failures,
        "Mailbox drain pass finished"
    );

    Ok(stats)
}

fn is_report_attachment(filename: &str) -> bool {
    let lower = filename.to_lowercase();
    REPORT_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}
