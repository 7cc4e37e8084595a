//! Core data model for the ingestion pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of an intake attempt.
///
/// Transitions are monotonic: `pending -> processing -> {completed, failed}`.
/// A `failed` entry may be reset to `pending` by an operator retry; it never
/// jumps straight to `completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "lowercase")]
pub enum EntryStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl EntryStatus {
    pub fn as_str(&self) -> &str {
        match self {
            EntryStatus::Pending => "pending",
            EntryStatus::Processing => "processing",
            EntryStatus::Completed => "completed",
            EntryStatus::Failed => "failed",
        }
    }
}

impl From<String> for EntryStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "processing" => EntryStatus::Processing,
            "completed" => EntryStatus::Completed,
            "failed" => EntryStatus::Failed,
            _ => EntryStatus::Pending,
        }
    }
}

/// One intake attempt (maps to the ingested_entries table)
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct IngestedEntry {
    pub id: Uuid,
    pub message_id: String,
    pub received_at: DateTime<Utc>,
    pub filename: String,
    /// SHA-256 hex of the exact received bytes; unique, the raw-intake
    /// idempotency key.
    pub content_hash: String,
    pub file_size: i64,
    /// Relative path in the content store. Absent when the store write
    /// itself failed and the entry was recorded as failed intake.
    pub storage_path: Option<String>,
    pub status: EntryStatus,
    pub parse_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Normalized aggregate report (maps to the parsed_reports table)
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ParsedReport {
    pub id: Uuid,
    /// Sender-declared identifier, unique system-wide; the logical
    /// processing idempotency key.
    pub report_id: String,
    pub org_name: String,
    pub email: Option<String>,
    pub date_begin: DateTime<Utc>,
    pub date_end: DateTime<Utc>,
    pub domain: String,
    pub adkim: Option<String>,
    pub aspf: Option<String>,
    pub p: String,
    pub sp: Option<String>,
    pub pct: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// One raw per-mechanism authentication result (DKIM or SPF)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthResultEntry {
    pub domain: Option<String>,
    /// DKIM selector or SPF scope, depending on mechanism
    pub selector: Option<String>,
    pub result: Option<String>,
}

/// One authentication-result row, owned by its report and written in the
/// same transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedRecord {
    pub id: Uuid,
    pub report_pk: Uuid,
    pub source_ip: String,
    pub count: i64,
    pub disposition: Option<String>,
    pub dkim_result: Option<String>,
    pub spf_result: Option<String>,
    pub header_from: Option<String>,
    pub envelope_from: Option<String>,
    pub envelope_to: Option<String>,
    pub dkim_auth: Vec<AuthResultEntry>,
    pub spf_auth: Vec<AuthResultEntry>,
    pub created_at: DateTime<Utc>,
}
