//! Content-addressable raw artifact store
//!
//! Persists raw report bytes on the filesystem keyed by the SHA-256 of the
//! exact as-received bytes, computed before decompression so bit-identical
//! redelivery is caught before any parsing work. Writes are
//! temp-file-then-rename, so a path either holds the complete artifact or
//! does not exist.
//!
//! Layout: `<root>/<hh>/<hh>/<hash>` with two levels of hex sharding to
//! keep directories small.

use dmarc_common::checksum::sha256_hex;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage IO error at {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("raw artifact not found: {path}")]
    NotFound { path: String },
}

/// Result of a `put`
#[derive(Debug, Clone)]
pub struct PutOutcome {
    /// SHA-256 hex of the stored bytes
    pub hash: String,
    /// Path relative to the store root
    pub path: String,
    /// True when the artifact was already present and nothing was written
    pub already_existed: bool,
}

/// Filesystem blob store addressed by content hash
#[derive(Debug, Clone)]
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Store bytes once per distinct hash
    ///
    /// Idempotent: a repeat call with the same bytes returns the existing
    /// path without rewriting.
    pub async fn put(&self, data: &[u8]) -> Result<PutOutcome, StoreError> {
        let hash = sha256_hex(data);
        let relative = Self::relative_path(&hash);
        let absolute = self.root.join(&relative);

        if path_exists(&absolute).await {
            debug!(hash = %hash, "Raw artifact already stored");
            return Ok(PutOutcome {
                hash,
                path: relative,
                already_existed: true,
            });
        }

        let parent = absolute.parent().unwrap_or(&self.root);
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| StoreError::Io {
                path: parent.display().to_string(),
                source,
            })?;

        // Write to a unique temp name, then rename into place. A concurrent
        // writer of the same hash produces identical bytes, so whichever
        // rename lands last is a no-op in effect.
        let tmp = absolute.with_extension(format!("tmp-{}", Uuid::new_v4()));
        tokio::fs::write(&tmp, data)
            .await
            .map_err(|source| StoreError::Io {
                path: tmp.display().to_string(),
                source,
            })?;
        tokio::fs::rename(&tmp, &absolute)
            .await
            .map_err(|source| StoreError::Io {
                path: absolute.display().to_string(),
                source,
            })?;

        debug!(hash = %hash, path = %relative, size = data.len(), "Stored raw artifact");

        Ok(PutOutcome {
            hash,
            path: relative,
            already_existed: false,
        })
    }

    /// Read bytes back by store-relative path
    pub async fn get(&self, relative_path: &str) -> Result<Vec<u8>, StoreError> {
        let absolute = self.root.join(relative_path);
        match tokio::fs::read(&absolute).await {
            Ok(data) => Ok(data),
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound {
                    path: relative_path.to_string(),
                })
            }
            Err(source) => Err(StoreError::Io {
                path: absolute.display().to_string(),
                source,
            }),
        }
    }

    /// Check whether an artifact with this hash is stored
    pub async fn exists(&self, hash: &str) -> bool {
        path_exists(&self.root.join(Self::relative_path(hash))).await
    }

    fn relative_path(hash: &str) -> String {
        // Hashes are 64 hex chars; fall back to a flat path for anything
        // shorter (only reachable from tests feeding arbitrary keys).
        if hash.len() >= 4 {
            format!("{}/{}/{}", &hash[0..2], &hash[2..4], hash)
        } else {
            hash.to_string()
        }
    }
}

async fn path_exists(path: &Path) -> bool {
    tokio::fs::metadata(path).await.is_ok()
}
