//! Attachment decompression
//!
//! Reporters deliver aggregate reports as gzip, zip, or bare XML, and
//! routinely mislabel the file extension. Containers are therefore
//! classified by magic bytes, never by filename; the filename is carried
//! only for error context.

use flate2::read::GzDecoder;
use std::io::{Cursor, Read};
use thiserror::Error;
use tracing::debug;

/// Gzip magic bytes
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
/// Zip local-file-header magic bytes
const ZIP_MAGIC: [u8; 2] = [b'P', b'K'];

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("empty payload in {filename}")]
    Empty { filename: String },

    #[error("corrupt gzip container in {filename}: {source}")]
    Gzip {
        filename: String,
        source: std::io::Error,
    },

    #[error("corrupt zip container in {filename}: {source}")]
    Zip {
        filename: String,
        source: zip::result::ZipError,
    },

    #[error("zip archive {filename} contains no file members")]
    EmptyArchive { filename: String },

    #[error("decompressed payload of {filename} is empty")]
    EmptyPayload { filename: String },
}

/// Decompress an attachment into XML bytes
///
/// `1f 8b` is gzip, `PK` is zip (only the first file member is read;
/// multi-file archives are non-conformant), anything else is returned
/// unchanged as presumed raw XML. Empty input, corrupt containers, and
/// containers decompressing to nothing are all `DecodeError`.
pub fn decompress(data: &[u8], filename: &str) -> Result<Vec<u8>, DecodeError> {
    if data.is_empty() {
        return Err(DecodeError::Empty {
            filename: filename.to_string(),
        });
    }

    let xml = if data.starts_with(&GZIP_MAGIC) {
        decompress_gzip(data, filename)?
    } else if data.starts_with(&ZIP_MAGIC) {
        decompress_zip_first_member(data, filename)?
    } else {
        debug!(filename, size = data.len(), "No container magic, assuming raw XML");
        data.to_vec()
    };

    if xml.is_empty() {
        return Err(DecodeError::EmptyPayload {
            filename: filename.to_string(),
        });
    }

    Ok(xml)
}

fn decompress_gzip(data: &[u8], filename: &str) -> Result<Vec<u8>, DecodeError> {
    let mut decoder = GzDecoder::new(data);
    let mut decompressed = Vec::new();
    decoder
        .read_to_end(&mut decompressed)
        .map_err(|source| DecodeError::Gzip {
            filename: filename.to_string(),
            source,
        })?;
    debug!(filename, compressed = data.len(), decompressed = decompressed.len(), "Decompressed gzip");
    Ok(decompressed)
}

fn decompress_zip_first_member(data: &[u8], filename: &str) -> Result<Vec<u8>, DecodeError> {
    let cursor = Cursor::new(data);
    let mut archive = zip::ZipArchive::new(cursor).map_err(|source| DecodeError::Zip {
        filename: filename.to_string(),
        source,
    })?;

    for i in 0..archive.len() {
        let mut member = archive.by_index(i).map_err(|source| DecodeError::Zip {
            filename: filename.to_string(),
            source,
        })?;

        if member.is_dir() {
            continue;
        }

        let mut contents = Vec::new();
        member
            .read_to_end(&mut contents)
            .map_err(|source| DecodeError::Zip {
                filename: filename.to_string(),
                source: zip::result::ZipError::Io(source),
            })?;

        debug!(
            filename,
            member = %member.name(),
            decompressed = contents.len(),
            "Extracted first zip member"
        );
        return Ok(contents);
    }

    Err(DecodeError::EmptyArchive {
        filename: filename.to_string(),
    })
}
