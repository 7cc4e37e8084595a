//! End-to-end pipeline tests
//!
//! Exercise the two coordinators against a scratch SQLite database and a
//! tempdir-backed content store, the same way production code drives them.

use anyhow::Result;
use chrono::Utc;
use dmarc_pipeline::db::{create_pool, run_migrations};
use dmarc_pipeline::decompress::decompress;
use dmarc_pipeline::mailbox::{self, FetchedMessage, MailboxSource, MessageRef};
use dmarc_pipeline::models::EntryStatus;
use dmarc_pipeline::parser::parse_report;
use dmarc_pipeline::{ContentStore, IngestionCoordinator, ProcessingCoordinator};
use flate2::write::GzEncoder;
use flate2::Compression;
use sqlx::SqlitePool;
use std::io::{Cursor, Write};
use zip::write::SimpleFileOptions;

struct TestPipeline {
    _dir: tempfile::TempDir,
    pool: SqlitePool,
    store: ContentStore,
    ingestion: IngestionCoordinator,
    processing: ProcessingCoordinator,
}

async fn test_pipeline() -> Result<TestPipeline> {
    let dir = tempfile::tempdir()?;
    let url = format!("sqlite://{}/pipeline.db", dir.path().display());
    let pool = create_pool(&url, 5).await?;
    run_migrations(&pool).await?;

    let store = ContentStore::new(dir.path().join("raw"));
    let ingestion = IngestionCoordinator::new(pool.clone(), store.clone());
    let processing = ProcessingCoordinator::new(pool.clone(), store.clone());

    Ok(TestPipeline {
        _dir: dir,
        pool,
        store,
        ingestion,
        processing,
    })
}

fn sample_xml(report_id: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<feedback>
  <report_metadata>
    <org_name>google.com</org_name>
    <email>noreply-dmarc-support@google.com</email>
    <report_id>{report_id}</report_id>
    <date_range>
      <begin>1706227200</begin>
      <end>1706313599</end>
    </date_range>
  </report_metadata>
  <policy_published>
    <domain>example.com</domain>
    <p>none</p>
  </policy_published>
  <record>
    <row>
      <source_ip>192.0.2.1</source_ip>
      <count>5</count>
      <policy_evaluated>
        <disposition>none</disposition>
        <dkim>pass</dkim>
        <spf>pass</spf>
      </policy_evaluated>
    </row>
  </record>
</feedback>"#
    )
}

fn gzip_bytes(content: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(content).unwrap();
    encoder.finish().unwrap()
}

fn zip_bytes(name: &str, content: &[u8]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    writer
        .start_file(name.to_string(), SimpleFileOptions::default())
        .unwrap();
    writer.write_all(content).unwrap();
    writer.finish().unwrap().into_inner()
}

async fn count(pool: &SqlitePool, sql: &str) -> i64 {
    sqlx::query_scalar(sql).fetch_one(pool).await.unwrap()
}

async fn entry_status(pool: &SqlitePool, hash: &str) -> EntryStatus {
    let status: String =
        sqlx::query_scalar("SELECT status FROM ingested_entries WHERE content_hash = ?1")
            .bind(hash)
            .fetch_one(pool)
            .await
            .unwrap();
    EntryStatus::from(status)
}

// ============================================================================
// Scenario A: ingest the same 512-byte gzip blob twice
// ============================================================================

#[tokio::test]
async fn scenario_a_identical_gzip_ingested_twice() -> Result<()> {
    let p = test_pipeline().await?;

    // Pad to a realistic blob size
    let xml = sample_xml(&"a".repeat(420));
    let blob = gzip_bytes(xml.as_bytes());

    let first = p
        .ingestion
        .ingest("google.com!example.com.xml.gz", &blob, "msg-1", Utc::now())
        .await?;
    let second = p
        .ingestion
        .ingest("google.com!example.com.xml.gz", &blob, "msg-2", Utc::now())
        .await?;

    assert!(first.is_new);
    assert!(!second.is_new);
    assert_eq!(first.entry.id, second.entry.id);
    assert_eq!(first.entry.content_hash, second.entry.content_hash);

    assert_eq!(count(&p.pool, "SELECT COUNT(*) FROM ingested_entries").await, 1);
    assert!(p.store.exists(&first.entry.content_hash).await);

    Ok(())
}

// ============================================================================
// Scenario B: two byte-distinct entries carrying the same report_id
// ============================================================================

#[tokio::test]
async fn scenario_b_duplicate_report_id_yields_one_report() -> Result<()> {
    let p = test_pipeline().await?;

    let xml = sample_xml("R1");
    // Byte-distinct delivery of the same logical report
    let xml_reformatted = format!("{xml}\n");

    let a = p
        .ingestion
        .ingest("first.xml", xml.as_bytes(), "msg-1", Utc::now())
        .await?;
    let b = p
        .ingestion
        .ingest("second.xml.gz", &gzip_bytes(xml_reformatted.as_bytes()), "msg-2", Utc::now())
        .await?;
    assert!(a.is_new);
    assert!(b.is_new);

    let stats = p.processing.process_pending(10).await?;
    assert_eq!(stats.processed, 2);
    assert_eq!(stats.failed, 0);

    assert_eq!(entry_status(&p.pool, &a.entry.content_hash).await, EntryStatus::Completed);
    assert_eq!(entry_status(&p.pool, &b.entry.content_hash).await, EntryStatus::Completed);

    assert_eq!(
        count(&p.pool, "SELECT COUNT(*) FROM parsed_reports WHERE report_id = 'R1'").await,
        1
    );
    // Records were written exactly once
    assert_eq!(count(&p.pool, "SELECT COUNT(*) FROM parsed_records").await, 1);

    Ok(())
}

// ============================================================================
// Scenario C: one record with source_ip, one without
// ============================================================================

#[tokio::test]
async fn scenario_c_record_without_source_ip_is_dropped() -> Result<()> {
    let p = test_pipeline().await?;

    let xml = sample_xml("R-partial").replace(
        "</feedback>",
        r#"<record>
             <row><count>3</count></row>
           </record>
           </feedback>"#,
    );

    p.ingestion
        .ingest("partial.xml", xml.as_bytes(), "msg-1", Utc::now())
        .await?;

    let stats = p.processing.process_pending(10).await?;
    assert_eq!(stats.processed, 1);
    assert_eq!(stats.failed, 0);

    assert_eq!(count(&p.pool, "SELECT COUNT(*) FROM parsed_reports").await, 1);
    assert_eq!(count(&p.pool, "SELECT COUNT(*) FROM parsed_records").await, 1);

    Ok(())
}

// ============================================================================
// Failure isolation
// ============================================================================

#[tokio::test]
async fn one_corrupt_entry_does_not_abort_the_batch() -> Result<()> {
    let p = test_pipeline().await?;

    p.ingestion
        .ingest("good-1.xml", sample_xml("G1").as_bytes(), "msg-1", Utc::now())
        .await?;

    let mut corrupt = gzip_bytes(sample_xml("BAD").as_bytes());
    corrupt.truncate(10);
    let bad = p
        .ingestion
        .ingest("corrupt.xml.gz", &corrupt, "msg-2", Utc::now())
        .await?;

    p.ingestion
        .ingest("good-2.xml", sample_xml("G2").as_bytes(), "msg-3", Utc::now())
        .await?;

    let stats = p.processing.process_pending(10).await?;
    assert_eq!(stats.processed, 2);
    assert_eq!(stats.failed, 1);

    // Successes were not rolled back
    assert_eq!(count(&p.pool, "SELECT COUNT(*) FROM parsed_reports").await, 2);

    // The corrupt entry carries its error
    let error: Option<String> =
        sqlx::query_scalar("SELECT parse_error FROM ingested_entries WHERE content_hash = ?1")
            .bind(&bad.entry.content_hash)
            .fetch_one(&p.pool)
            .await?;
    assert_eq!(entry_status(&p.pool, &bad.entry.content_hash).await, EntryStatus::Failed);
    assert!(error.unwrap().contains("gzip"));

    Ok(())
}

// ============================================================================
// Required-field enforcement persists nothing
// ============================================================================

#[tokio::test]
async fn missing_required_field_fails_entry_and_persists_no_rows() -> Result<()> {
    let p = test_pipeline().await?;

    let xml = sample_xml("R-strict").replace("<org_name>google.com</org_name>", "");
    p.ingestion
        .ingest("no-org.xml", xml.as_bytes(), "msg-1", Utc::now())
        .await?;

    let stats = p.processing.process_pending(10).await?;
    assert_eq!(stats.processed, 0);
    assert_eq!(stats.failed, 1);

    assert_eq!(count(&p.pool, "SELECT COUNT(*) FROM parsed_reports").await, 0);
    assert_eq!(count(&p.pool, "SELECT COUNT(*) FROM parsed_records").await, 0);

    let error: Option<String> =
        sqlx::query_scalar("SELECT parse_error FROM ingested_entries LIMIT 1")
            .fetch_one(&p.pool)
            .await?;
    assert!(error.unwrap().contains("org_name"));

    Ok(())
}

// ============================================================================
// Decompression transparency
// ============================================================================

#[tokio::test]
async fn gzip_zip_and_raw_parse_identically() -> Result<()> {
    let xml = sample_xml("R-transparent");

    let from_raw = parse_report(&decompress(xml.as_bytes(), "r.xml")?)?;
    let from_gzip = parse_report(&decompress(&gzip_bytes(xml.as_bytes()), "r.xml.gz")?)?;
    let from_zip = parse_report(&decompress(&zip_bytes("r.xml", xml.as_bytes()), "r.zip")?)?;

    assert_eq!(from_raw, from_gzip);
    assert_eq!(from_raw, from_zip);

    Ok(())
}

// ============================================================================
// Operator retry path
// ============================================================================

#[tokio::test]
async fn reprocess_failed_recovers_after_missing_blob_is_restored() -> Result<()> {
    let p = test_pipeline().await?;

    let xml = sample_xml("R-retry");
    let outcome = p
        .ingestion
        .ingest("retry.xml", xml.as_bytes(), "msg-1", Utc::now())
        .await?;

    // Simulate a crash that lost the blob after intake
    let blob_path = p.store.root().join(outcome.entry.storage_path.as_deref().unwrap());
    tokio::fs::remove_file(&blob_path).await?;

    let stats = p.processing.process_pending(10).await?;
    assert_eq!(stats.failed, 1);
    assert_eq!(entry_status(&p.pool, &outcome.entry.content_hash).await, EntryStatus::Failed);

    // Restore the artifact (idempotent put recreates the same path),
    // then retry without re-ingesting
    p.store.put(xml.as_bytes()).await?;
    let stats = p.processing.reprocess_failed(10).await?;
    assert_eq!(stats.processed, 1);
    assert_eq!(stats.failed, 0);

    assert_eq!(entry_status(&p.pool, &outcome.entry.content_hash).await, EntryStatus::Completed);
    assert_eq!(
        count(&p.pool, "SELECT COUNT(*) FROM parsed_reports WHERE report_id = 'R-retry'").await,
        1
    );

    Ok(())
}

#[tokio::test]
async fn corrupted_stored_blob_fails_integrity_check() -> Result<()> {
    let p = test_pipeline().await?;

    let xml = sample_xml("R-tampered");
    let outcome = p
        .ingestion
        .ingest("report.xml", xml.as_bytes(), "msg-1", Utc::now())
        .await?;

    // Flip the on-disk bytes after intake; the hash no longer matches
    let blob_path = p.store.root().join(outcome.entry.storage_path.as_deref().unwrap());
    tokio::fs::write(&blob_path, sample_xml("R-other").as_bytes()).await?;

    let stats = p.processing.process_pending(10).await?;
    assert_eq!(stats.processed, 0);
    assert_eq!(stats.failed, 1);

    assert_eq!(entry_status(&p.pool, &outcome.entry.content_hash).await, EntryStatus::Failed);
    let error: Option<String> =
        sqlx::query_scalar("SELECT parse_error FROM ingested_entries WHERE content_hash = ?1")
            .bind(&outcome.entry.content_hash)
            .fetch_one(&p.pool)
            .await?;
    assert!(error.unwrap().contains("Checksum mismatch"));

    // Nothing parsed from the tampered bytes
    assert_eq!(count(&p.pool, "SELECT COUNT(*) FROM parsed_reports").await, 0);

    Ok(())
}

#[tokio::test]
async fn reprocess_failed_records_error_again_when_unfixed() -> Result<()> {
    let p = test_pipeline().await?;

    let xml = sample_xml("R-still-bad").replace("<p>none</p>", "");
    let outcome = p
        .ingestion
        .ingest("bad.xml", xml.as_bytes(), "msg-1", Utc::now())
        .await?;

    let stats = p.processing.process_pending(10).await?;
    assert_eq!(stats.failed, 1);

    let stats = p.processing.reprocess_failed(10).await?;
    assert_eq!(stats.processed, 0);
    assert_eq!(stats.failed, 1);
    assert_eq!(entry_status(&p.pool, &outcome.entry.content_hash).await, EntryStatus::Failed);

    Ok(())
}

// ============================================================================
// Failed intake is recorded, not dropped
// ============================================================================

#[tokio::test]
async fn store_failure_records_failed_entry() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let url = format!("sqlite://{}/pipeline.db", dir.path().display());
    let pool = create_pool(&url, 5).await?;
    run_migrations(&pool).await?;

    // Root is a regular file, so every put fails
    let blocked_root = dir.path().join("blocked");
    tokio::fs::write(&blocked_root, b"in the way").await?;
    let store = ContentStore::new(&blocked_root);
    let ingestion = IngestionCoordinator::new(pool.clone(), store);

    let outcome = ingestion
        .ingest("r.xml", sample_xml("R-lost").as_bytes(), "msg-1", Utc::now())
        .await?;

    assert!(outcome.is_new);
    assert_eq!(outcome.entry.status, EntryStatus::Failed);
    assert!(outcome.entry.storage_path.is_none());
    assert!(outcome.entry.parse_error.is_some());
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM ingested_entries").await, 1);

    Ok(())
}

// ============================================================================
// Two workers on one queue
// ============================================================================

#[tokio::test]
async fn two_workers_never_double_claim_or_double_write() -> Result<()> {
    let p = test_pipeline().await?;

    for i in 0..4 {
        p.ingestion
            .ingest(
                &format!("r{i}.xml"),
                sample_xml(&format!("W{i}")).as_bytes(),
                &format!("msg-{i}"),
                Utc::now(),
            )
            .await?;
    }
    // Fifth entry repeats an earlier report_id
    p.ingestion
        .ingest(
            "dup.xml",
            format!("{}\n", sample_xml("W0")).as_bytes(),
            "msg-dup",
            Utc::now(),
        )
        .await?;

    let worker_a = ProcessingCoordinator::new(p.pool.clone(), p.store.clone());
    let worker_b = ProcessingCoordinator::new(p.pool.clone(), p.store.clone());

    let mut total = 0u64;
    loop {
        let a = worker_a.process_pending(1).await?;
        let b = worker_b.process_pending(1).await?;
        let batch = a.processed + a.failed + b.processed + b.failed;
        if batch == 0 {
            break;
        }
        total += batch;
    }

    assert_eq!(total, 5);
    assert_eq!(
        count(&p.pool, "SELECT COUNT(*) FROM ingested_entries WHERE status = 'completed'").await,
        5
    );
    assert_eq!(count(&p.pool, "SELECT COUNT(*) FROM parsed_reports").await, 4);
    assert_eq!(
        count(&p.pool, "SELECT COUNT(*) FROM parsed_reports WHERE report_id = 'W0'").await,
        1
    );

    Ok(())
}

// ============================================================================
// Mailbox drain
// ============================================================================

struct StubMailbox {
    messages: Vec<FetchedMessage>,
}

#[async_trait::async_trait]
impl MailboxSource for StubMailbox {
    async fn search_candidates(&self, limit: usize) -> Result<Vec<MessageRef>> {
        Ok(self
            .messages
            .iter()
            .take(limit)
            .map(|m| MessageRef(m.message_id.clone()))
            .collect())
    }

    async fn fetch(&self, message: &MessageRef) -> Result<FetchedMessage> {
        self.messages
            .iter()
            .find(|m| m.message_id == message.0)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no such message: {}", message.0))
    }
}

#[tokio::test]
async fn drain_ingests_report_attachments_and_skips_the_rest() -> Result<()> {
    let p = test_pipeline().await?;

    let xml = sample_xml("R-mail");
    let source = StubMailbox {
        messages: vec![
            FetchedMessage {
                message_id: "msg-1".to_string(),
                received_at: Utc::now(),
                attachments: vec![
                    ("report.xml".to_string(), xml.as_bytes().to_vec()),
                    ("smime.p7s".to_string(), vec![0x30, 0x82]),
                ],
            },
            FetchedMessage {
                message_id: "msg-2".to_string(),
                received_at: Utc::now(),
                // Bit-identical redelivery of msg-1's attachment
                attachments: vec![("copy.xml".to_string(), xml.as_bytes().to_vec())],
            },
        ],
    };

    let stats = mailbox::drain(&source, &p.ingestion, 10).await?;
    assert_eq!(stats.ingested, 1);
    assert_eq!(stats.duplicates, 1);
    assert_eq!(stats.failures, 0);

    let batch = p.processing.process_pending(10).await?;
    assert_eq!(batch.processed, 1);
    assert_eq!(count(&p.pool, "SELECT COUNT(*) FROM parsed_reports").await, 1);

    Ok(())
}
