//! DMARC aggregate report XML parser
//!
//! Turns externally-supplied XML bytes into a [`ReportDraft`]: strict on
//! the fields the data model cannot live without (`report_id`, `org_name`,
//! policy `domain`, policy `p`, the date range), tolerant of everything
//! else. Real-world reporters omit optional fields, emit vendor extensions,
//! and occasionally produce rows without a source IP; none of that may
//! invalidate an otherwise-usable report.

use chrono::{DateTime, TimeZone, Utc};
use quick_xml::events::Event;
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use crate::models::AuthResultEntry;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("unparsable XML: {0}")]
    Xml(#[from] quick_xml::DeError),

    #[error("malformed XML: {0}")]
    Syntax(#[from] quick_xml::Error),

    #[error("missing feedback root element")]
    MissingRoot,

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid value for {field}: {value}")]
    InvalidField { field: &'static str, value: String },
}

/// Parsed report before persistence
#[derive(Debug, Clone, PartialEq)]
pub struct ReportDraft {
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
    pub records: Vec<RecordDraft>,
    /// Rows discarded for missing source_ip; kept for logging, never fatal
    pub dropped_records: usize,
}

/// Parsed authentication-result row before persistence
#[derive(Debug, Clone, PartialEq)]
pub struct RecordDraft {
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
}

// ============================================================================
// Wire format (everything optional; validation happens after deserialization)
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawFeedback {
    report_metadata: Option<RawReportMetadata>,
    policy_published: Option<RawPolicyPublished>,
    #[serde(default, rename = "record")]
    records: Vec<RawRecord>,
}

#[derive(Debug, Deserialize)]
struct RawReportMetadata {
    org_name: Option<String>,
    email: Option<String>,
    report_id: Option<String>,
    date_range: Option<RawDateRange>,
}

#[derive(Debug, Deserialize)]
struct RawDateRange {
    begin: Option<String>,
    end: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawPolicyPublished {
    domain: Option<String>,
    adkim: Option<String>,
    aspf: Option<String>,
    p: Option<String>,
    sp: Option<String>,
    pct: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawRecord {
    row: Option<RawRow>,
    identifiers: Option<RawIdentifiers>,
    auth_results: Option<RawAuthResults>,
}

#[derive(Debug, Deserialize)]
struct RawRow {
    source_ip: Option<String>,
    count: Option<String>,
    policy_evaluated: Option<RawPolicyEvaluated>,
}

#[derive(Debug, Deserialize)]
struct RawPolicyEvaluated {
    disposition: Option<String>,
    dkim: Option<String>,
    spf: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawIdentifiers {
    header_from: Option<String>,
    envelope_from: Option<String>,
    envelope_to: Option<String>,
}

// quick-xml collects repeated elements into the Vec, so a single object and
// an array both deserialize to the always-a-list shape.
#[derive(Debug, Deserialize)]
struct RawAuthResults {
    #[serde(default, rename = "dkim")]
    dkim: Vec<RawDkimResult>,
    #[serde(default, rename = "spf")]
    spf: Vec<RawSpfResult>,
}

#[derive(Debug, Deserialize)]
struct RawDkimResult {
    domain: Option<String>,
    selector: Option<String>,
    result: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawSpfResult {
    domain: Option<String>,
    scope: Option<String>,
    result: Option<String>,
}

// ============================================================================
// Parsing
// ============================================================================

/// Parse aggregate report XML into a [`ReportDraft`]
pub fn parse_report(xml: &[u8]) -> Result<ReportDraft, ParseError> {
    let text = String::from_utf8_lossy(xml);

    require_feedback_root(&text)?;

    let raw: RawFeedback = quick_xml::de::from_str(&text)?;

    let metadata = raw
        .report_metadata
        .ok_or(ParseError::MissingField("report_metadata"))?;
    let policy = raw
        .policy_published
        .ok_or(ParseError::MissingField("policy_published"))?;

    let report_id = required(metadata.report_id, "report_metadata.report_id")?;
    let org_name = required(metadata.org_name, "report_metadata.org_name")?;
    let date_range = metadata
        .date_range
        .ok_or(ParseError::MissingField("report_metadata.date_range"))?;
    let date_begin = epoch_to_utc(date_range.begin, "report_metadata.date_range.begin")?;
    let date_end = epoch_to_utc(date_range.end, "report_metadata.date_range.end")?;

    let domain = required(policy.domain, "policy_published.domain")?;
    let p = required(policy.p, "policy_published.p")?;

    let pct = policy.pct.as_deref().map(str::trim).and_then(|v| {
        v.parse::<i64>()
            .map_err(|_| warn!(report_id = %report_id, pct = %v, "Ignoring unparsable pct"))
            .ok()
    });

    let mut records = Vec::new();
    let mut dropped_records = 0usize;

    for raw_record in raw.records {
        match convert_record(raw_record) {
            Some(record) => records.push(record),
            None => {
                dropped_records += 1;
                warn!(report_id = %report_id, "Dropping record without source_ip");
            }
        }
    }

    Ok(ReportDraft {
        report_id,
        org_name,
        email: optional(metadata.email),
        date_begin,
        date_end,
        domain,
        adkim: optional(policy.adkim),
        aspf: optional(policy.aspf),
        p,
        sp: optional(policy.sp),
        pct,
        records,
        dropped_records,
    })
}

/// The single top-level element must be `feedback`; anything else is fatal
fn require_feedback_root(text: &str) -> Result<(), ParseError> {
    let mut reader = quick_xml::Reader::from_str(text);

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                if e.local_name().as_ref() == b"feedback" {
                    return Ok(());
                }
                return Err(ParseError::MissingRoot);
            }
            Event::Empty(e) => {
                // <feedback/> is a valid (empty) root; anything else is not
                if e.local_name().as_ref() == b"feedback" {
                    return Ok(());
                }
                return Err(ParseError::MissingRoot);
            }
            Event::Eof => return Err(ParseError::MissingRoot),
            _ => continue,
        }
    }
}

fn convert_record(raw: RawRecord) -> Option<RecordDraft> {
    let row = raw.row?;
    let source_ip = optional(row.source_ip)?;

    // Reporters occasionally omit count; the row is still evidence of one
    // message, so default to 1 rather than dropping it.
    let count = row
        .count
        .as_deref()
        .map(str::trim)
        .and_then(|v| v.parse::<i64>().ok())
        .filter(|c| *c > 0)
        .unwrap_or(1);

    let (disposition, dkim_result, spf_result) = match row.policy_evaluated {
        Some(pe) => (optional(pe.disposition), optional(pe.dkim), optional(pe.spf)),
        None => (None, None, None),
    };

    let (header_from, envelope_from, envelope_to) = match raw.identifiers {
        Some(ids) => (
            optional(ids.header_from),
            optional(ids.envelope_from),
            optional(ids.envelope_to),
        ),
        None => (None, None, None),
    };

    let (dkim_auth, spf_auth) = match raw.auth_results {
        Some(auth) => (
            auth.dkim
                .into_iter()
                .map(|d| AuthResultEntry {
                    domain: optional(d.domain),
                    selector: optional(d.selector),
                    result: optional(d.result),
                })
                .collect(),
            auth.spf
                .into_iter()
                .map(|s| AuthResultEntry {
                    domain: optional(s.domain),
                    selector: optional(s.scope),
                    result: optional(s.result),
                })
                .collect(),
        ),
        None => (Vec::new(), Vec::new()),
    };

    Some(RecordDraft {
        source_ip,
        count,
        disposition,
        dkim_result,
        spf_result,
        header_from,
        envelope_from,
        envelope_to,
        dkim_auth,
        spf_auth,
    })
}

fn required(value: Option<String>, field: &'static str) -> Result<String, ParseError> {
    optional(value).ok_or(ParseError::MissingField(field))
}

/// Trim whitespace and map empty values to absent
fn optional(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn epoch_to_utc(
    value: Option<String>,
    field: &'static str,
) -> Result<DateTime<Utc>, ParseError> {
    let raw = optional(value).ok_or(ParseError::MissingField(field))?;
    let secs = raw
        .parse::<i64>()
        .map_err(|_| ParseError::InvalidField {
            field,
            value: raw.clone(),
        })?;
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or(ParseError::InvalidField { field, value: raw })
}
