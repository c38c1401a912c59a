//! Engine images and the framed blob that carries them.
//!
//! An *image* is the raw `SQLite` database file. A *blob* is the image as it
//! is persisted in the key-value store: a small header, then the image
//! compressed with zstd.
//!
//! ```text
//! offset  size  field
//! 0       4     magic "KBDB"
//! 4       1     frame format (1)
//! 5       4     schema version, little endian
//! 9       32    SHA-256 of the compressed payload
//! 41      ..    zstd(image)
//! ```
//!
//! The header lets a reader reject a blob from another schema version, or a
//! truncated one, before handing anything to `SQLite`.

use std::fs;

use rusqlite::{Connection, DatabaseName, backup::Progress};
use sha2::{Digest, Sha256};

use super::{EngineError, Result};

const MAGIC: &[u8; 4] = b"KBDB";
const FRAME_FORMAT: u8 = 1;
const HEADER_LEN: usize = 4 + 1 + 4 + 32;
const ZSTD_LEVEL: i32 = 3;

/// Copies the whole database into an in-memory image.
pub(super) fn capture_image(conn: &Connection) -> Result<Vec<u8>> {
    let scratch = tempfile::tempdir()?;
    let path = scratch.path().join("image.db");
    conn.backup(DatabaseName::Main, &path, None)?;
    Ok(fs::read(&path)?)
}

/// Replaces the database behind `conn` with `image`.
pub(super) fn restore_image(conn: &mut Connection, image: &[u8]) -> Result<()> {
    let scratch = tempfile::tempdir()?;
    let path = scratch.path().join("image.db");
    fs::write(&path, image)?;
    conn.restore(DatabaseName::Main, &path, None::<fn(Progress)>)?;

    let check: String = conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
    if check != "ok" {
        return Err(EngineError::Corrupt(format!("integrity check failed: {check}")));
    }
    Ok(())
}

/// Confirms `image` restores cleanly, without touching any live database.
pub(super) fn check_image(image: &[u8]) -> Result<()> {
    let mut scratch = Connection::open_in_memory()?;
    restore_image(&mut scratch, image)
}

/// Wraps an image in a versioned, checksummed frame.
pub(super) fn encode(image: &[u8], schema_version: u32) -> Result<Vec<u8>> {
    let payload = zstd::encode_all(image, ZSTD_LEVEL)?;
    let digest = Sha256::digest(&payload);

    let mut blob = Vec::with_capacity(HEADER_LEN + payload.len());
    blob.extend_from_slice(MAGIC);
    blob.push(FRAME_FORMAT);
    blob.extend_from_slice(&schema_version.to_le_bytes());
    blob.extend_from_slice(&digest);
    blob.extend_from_slice(&payload);
    Ok(blob)
}

/// Unwraps a frame produced by [`encode`], returning the image.
///
/// Fails with [`EngineError::SchemaMismatch`] when the blob was written by a
/// different schema version and with [`EngineError::Corrupt`] for anything
/// that is not an intact frame.
pub(super) fn decode(blob: &[u8], expected_version: u32) -> Result<Vec<u8>> {
    if blob.len() < HEADER_LEN {
        return Err(EngineError::Corrupt(format!(
            "blob too short: {} bytes",
            blob.len()
        )));
    }
    let (header, payload) = blob.split_at(HEADER_LEN);
    if &header[..4] != MAGIC {
        return Err(EngineError::Corrupt("missing blob magic".into()));
    }
    if header[4] != FRAME_FORMAT {
        return Err(EngineError::Corrupt(format!(
            "unknown frame format {}",
            header[4]
        )));
    }

    let mut version = [0u8; 4];
    version.copy_from_slice(&header[5..9]);
    let found = u32::from_le_bytes(version);
    if found != expected_version {
        return Err(EngineError::SchemaMismatch {
            found,
            expected: expected_version,
        });
    }

    let digest = Sha256::digest(payload);
    if digest.as_slice() != &header[9..HEADER_LEN] {
        return Err(EngineError::Corrupt(format!(
            "checksum mismatch: expected {}, got {}",
            hex::encode(&header[9..HEADER_LEN]),
            hex::encode(digest)
        )));
    }

    zstd::decode_all(payload).map_err(|e| EngineError::Corrupt(format!("decompression failed: {e}")))
}
