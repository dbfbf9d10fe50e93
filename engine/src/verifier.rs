//! Content verification.
//!
//! The copy engine feeds every byte it writes through one incremental hasher,
//! so a completed file is verified from that streaming digest plus its size
//! without being read again. The only re-reads happen on resume, where the
//! already-written prefix of a temp file is hashed once to decide whether it
//! can be trusted.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use crate::checksums::{create_hasher, ChecksumAlgorithm, ChecksumHasher, ChecksumValue};
use crate::error::MigrateError;

/// Compare the observed size and digest against what the file must be.
///
/// `expected_size` is the size observed at scan time; `expected_digest`
/// comes from a checksum manifest when one was supplied.
pub fn verify(
    path: &Path,
    expected_size: u64,
    actual_size: u64,
    digest: &ChecksumValue,
    expected_digest: Option<&ChecksumValue>,
) -> Result<(), MigrateError> {
    if actual_size != expected_size {
        return Err(MigrateError::Corruption {
            path: path.to_path_buf(),
            reason: format!("size {} differs from expected {}", actual_size, expected_size),
        });
    }
    if let Some(expected) = expected_digest {
        if expected.algorithm() != digest.algorithm() {
            return Err(MigrateError::Corruption {
                path: path.to_path_buf(),
                reason: format!(
                    "expected digest uses {}, stream used {}",
                    expected.algorithm(),
                    digest.algorithm()
                ),
            });
        }
        if expected.hex() != digest.hex() {
            return Err(MigrateError::Corruption {
                path: path.to_path_buf(),
                reason: format!("digest {} differs from expected {}", digest, expected),
            });
        }
    }
    Ok(())
}

/// Compare two digests of the same content (streaming vs. recorded).
pub fn verify_digest(
    path: &Path,
    actual: &ChecksumValue,
    recorded: &ChecksumValue,
) -> Result<(), MigrateError> {
    if actual != recorded {
        return Err(MigrateError::Corruption {
            path: path.to_path_buf(),
            reason: format!("digest {} differs from recorded {}", actual, recorded),
        });
    }
    Ok(())
}

/// Hash the first `len` bytes of `file`.
///
/// Returns `None` if the file is shorter than `len`. On success the hasher
/// holds exactly the prefix state so streaming can continue from `len`.
pub fn rehash_prefix(
    file: &mut File,
    len: u64,
    algorithm: ChecksumAlgorithm,
    chunk_size: usize,
) -> io::Result<Option<Box<dyn ChecksumHasher>>> {
    if file.metadata()?.len() < len {
        return Ok(None);
    }
    file.seek(SeekFrom::Start(0))?;

    let mut hasher = create_hasher(algorithm);
    let mut buffer = vec![0u8; chunk_size.max(4096)];
    let mut remaining = len;
    while remaining > 0 {
        let want = remaining.min(buffer.len() as u64) as usize;
        let n = match file.read(&mut buffer[..want]) {
            Ok(0) => return Ok(None),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buffer[..n]);
        remaining -= n as u64;
    }
    Ok(Some(hasher))
}

/// Re-derive the prefix digest of a partial temp file and check it against
/// the recorded one.
///
/// Returns the resumed hasher only on an exact match.
pub fn trusted_prefix(
    file: &mut File,
    len: u64,
    recorded: &ChecksumValue,
    chunk_size: usize,
) -> io::Result<Option<Box<dyn ChecksumHasher>>> {
    match rehash_prefix(file, len, recorded.algorithm(), chunk_size)? {
        Some(hasher) if &hasher.digest() == recorded => Ok(Some(hasher)),
        _ => Ok(None),
    }
}
