//! Database file format
//!
//! A database file holds one serialized [`Group`] snapshot. Every commit
//! rewrites the whole file through a temp file and an atomic rename.
//!
//! # Format
//!
//! ```text
//! +----------------------+
//! | Magic: "SHOL"        | 4 bytes
//! | Format Version       | 4 bytes (u32 LE)
//! | Commit Version       | 8 bytes (u64 LE)
//! | Key Fingerprint      | 8 bytes (u64 LE, 0 = no key)
//! | Payload Length       | 4 bytes (u32 LE)
//! | Payload              | MessagePack-encoded Group
//! | CRC32                | 4 bytes
//! +----------------------+
//! ```

use crate::error::{StorageError, StorageResult};
use crate::group::Group;
use std::io::Write;
use std::path::Path;
use xxhash_rust::xxh3::xxh3_64;

/// File magic bytes: "SHOL"
pub const FILE_MAGIC: [u8; 4] = *b"SHOL";

/// Current file format version
pub const FILE_FORMAT_VERSION: u32 = 1;

const HEADER_LEN: usize = 4 + 4 + 8 + 8 + 4;
const CRC_LEN: usize = 4;

/// Decoded file contents
#[derive(Debug, Clone, PartialEq)]
pub struct FileImage {
    /// Commit counter at the time the file was written
    pub commit_version: u64,
    /// Fingerprint of the key the file is bound to (0 = none)
    pub key_fingerprint: u64,
    /// Table data
    pub group: Group,
}

/// Fingerprint of an optional encryption key
///
/// Never zero for a present key, so zero can mean "no key".
pub fn key_fingerprint(key: Option<&[u8]>) -> u64 {
    match key {
        None => 0,
        Some(bytes) => xxh3_64(bytes).max(1),
    }
}

/// Serialize a file image
pub fn encode(path: &Path, image: &FileImage) -> StorageResult<Vec<u8>> {
    let payload = rmp_serde::to_vec(&image.group)
        .map_err(|e| StorageError::format(path, format!("encode failed: {}", e)))?;
    let payload_len = u32::try_from(payload.len())
        .map_err(|_| StorageError::format(path, "payload exceeds 4 GiB"))?;

    let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len() + CRC_LEN);
    bytes.extend_from_slice(&FILE_MAGIC);
    bytes.extend_from_slice(&FILE_FORMAT_VERSION.to_le_bytes());
    bytes.extend_from_slice(&image.commit_version.to_le_bytes());
    bytes.extend_from_slice(&image.key_fingerprint.to_le_bytes());
    bytes.extend_from_slice(&payload_len.to_le_bytes());
    bytes.extend_from_slice(&payload);

    // CRC32 of all preceding bytes
    let crc = crc32fast::hash(&bytes);
    bytes.extend_from_slice(&crc.to_le_bytes());
    Ok(bytes)
}

/// Deserialize a file image
pub fn decode(path: &Path, bytes: &[u8]) -> StorageResult<FileImage> {
    if bytes.len() < HEADER_LEN + CRC_LEN {
        return Err(StorageError::format(path, "file too short"));
    }
    if bytes[0..4] != FILE_MAGIC {
        return Err(StorageError::format(path, "invalid magic"));
    }

    let (data, crc_bytes) = bytes.split_at(bytes.len() - CRC_LEN);
    let stored_crc = u32::from_le_bytes(read_array(crc_bytes));
    let computed_crc = crc32fast::hash(data);
    if stored_crc != computed_crc {
        return Err(StorageError::format(
            path,
            format!(
                "checksum mismatch: stored {:#010x}, computed {:#010x}",
                stored_crc, computed_crc
            ),
        ));
    }

    let format_version = u32::from_le_bytes(read_array(&data[4..8]));
    if format_version != FILE_FORMAT_VERSION {
        return Err(StorageError::format(
            path,
            format!("unsupported format version {}", format_version),
        ));
    }
    let commit_version = u64::from_le_bytes(read_array(&data[8..16]));
    let key_fingerprint = u64::from_le_bytes(read_array(&data[16..24]));
    let payload_len = u32::from_le_bytes(read_array(&data[24..28])) as usize;

    let payload = &data[HEADER_LEN..];
    if payload.len() != payload_len {
        return Err(StorageError::format(
            path,
            format!(
                "payload length {} does not match header {}",
                payload.len(),
                payload_len
            ),
        ));
    }
    let group = rmp_serde::from_slice(payload)
        .map_err(|e| StorageError::format(path, format!("decode failed: {}", e)))?;

    Ok(FileImage {
        commit_version,
        key_fingerprint,
        group,
    })
}

/// Read and decode the file at `path`
pub fn read_file(path: &Path) -> StorageResult<FileImage> {
    let bytes = std::fs::read(path).map_err(|e| StorageError::from_io(path, e))?;
    decode(path, &bytes)
}

/// Atomically replace the file at `path` with `image`
pub fn write_file(path: &Path, image: &FileImage) -> StorageResult<()> {
    let bytes = encode(path, image)?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut tmp =
        tempfile::NamedTempFile::new_in(dir).map_err(|e| StorageError::from_io(path, e))?;
    tmp.write_all(&bytes)
        .map_err(|e| StorageError::from_io(path, e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| StorageError::from_io(path, e))?;
    tmp.persist(path)
        .map_err(|e| StorageError::from_io(path, e.error))?;
    Ok(())
}

fn read_array<const N: usize>(slice: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&slice[..N]);
    out
}
