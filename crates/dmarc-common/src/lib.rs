//! DMARC Pipeline Common Library
//!
//! Shared utilities and error handling for the DMARC pipeline workspace.
//!
//! # Overview
//!
//! This crate provides common functionality used across all workspace members:
//!
//! - **Error Handling**: Custom error types and result types
//! - **Checksums**: Content hashing for deduplication and integrity
//! - **Logging**: Centralized tracing initialization
//!
//! # Example
//!
//! ```no_run
//! use dmarc_common::checksum::sha256_hex;
//!
//! let hash = sha256_hex(b"raw report bytes");
//! println!("content hash: {}", hash);
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod checksum;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{CommonError, Result};
