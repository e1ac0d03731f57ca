//! Content digests for tracked files
//!
//! Files are hashed with SHA-1 in bounded chunks, so memory use does not grow
//! with file size. The synchronous and asynchronous variants feed identical
//! bytes into the same hasher and always agree.
//!
//! Directories have no content; their records carry [`DIR_SENTINEL`] instead,
//! a 40-character all-zero string that no real SHA-1 digest is treated as.

use crate::error::Result;
use sha1::{Digest, Sha1};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tokio::io::AsyncReadExt;

/// Digest placeholder for directory records
pub const DIR_SENTINEL: &str = "0000000000000000000000000000000000000000";

/// Bytes read per chunk
const CHUNK_SIZE: usize = 8192;

/// Whether a digest is the directory placeholder
pub fn is_dir_sentinel(digest: &str) -> bool {
    digest == DIR_SENTINEL
}

/// Compute the hex SHA-1 digest of a file
pub fn digest_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha1::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Compute the hex SHA-1 digest of a file without blocking the runtime
pub async fn digest_file_async(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha1::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];

    loop {
        let bytes_read = file.read(&mut buffer).await?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Hex SHA-1 digest of in-memory data
pub fn digest_bytes(data: &[u8]) -> String {
    hex::encode(Sha1::digest(data))
}
