//! DMARC aggregate report ingestion pipeline
//!
//! Ingests DMARC aggregate reports delivered as mail attachments,
//! deduplicates and durably stores the raw artifacts, parses the compressed
//! XML into normalized records, and guarantees each logical report is
//! processed exactly once despite redelivery, crashes, or concurrent
//! workers.
//!
//! # Pipeline
//!
//! ```text
//! mailbox -> IngestionCoordinator -> ContentStore + ingested_entries
//!         -> ProcessingCoordinator -> decompress -> parse
//!         -> parsed_reports / parsed_records
//! ```
//!
//! Two idempotency keys drive the exactly-once guarantee:
//!
//! - `content_hash` (SHA-256 of the exact received bytes) deduplicates raw
//!   intake, so bit-identical redelivery never stores or parses twice.
//! - `report_id` (sender-declared) deduplicates logical processing, so two
//!   deliveries of the same report yield exactly one normalized row set.

pub mod config;
pub mod db;
pub mod decompress;
pub mod ingest;
pub mod mailbox;
pub mod models;
pub mod parser;
pub mod process;
pub mod store;

pub use config::PipelineConfig;
pub use ingest::{IngestOutcome, IngestionCoordinator};
pub use process::{BatchStats, ProcessingCoordinator};
pub use store::ContentStore;
