//! Checksum algorithms and checksum manifests.
//!
//! This module provides:
//! - Multiple checksum algorithms (CRC32, MD5, SHA-256, BLAKE3)
//! - Incremental hashers that can report a prefix digest mid-stream
//! - Checksum manifest generation and parsing

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Supported checksum algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    /// CRC32 (fast, 32-bit, not collision resistant)
    Crc32,
    /// MD5 (included for compatibility with older manifests)
    Md5,
    /// SHA-256 (cryptographic, 256-bit)
    Sha256,
    /// BLAKE3 (modern, fast, 256-bit)
    #[default]
    Blake3,
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Crc32 => write!(f, "crc32"),
            Self::Md5 => write!(f, "md5"),
            Self::Sha256 => write!(f, "sha256"),
            Self::Blake3 => write!(f, "blake3"),
        }
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "crc32" => Ok(Self::Crc32),
            "md5" => Ok(Self::Md5),
            "sha256" => Ok(Self::Sha256),
            "blake3" => Ok(Self::Blake3),
            other => Err(format!("unknown checksum algorithm '{}'", other)),
        }
    }
}

/// A computed checksum value
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChecksumValue {
    algorithm: ChecksumAlgorithm,
    hex: String,
}

impl ChecksumValue {
    /// Create a new checksum value; hex digits are stored lowercase
    pub fn new(algorithm: ChecksumAlgorithm, hex: impl Into<String>) -> Self {
        ChecksumValue {
            algorithm,
            hex: hex.into().to_ascii_lowercase(),
        }
    }

    /// Get the algorithm
    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    /// Get the hex string representation
    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Format as "algo:hex", the form stored in the journal
    pub fn to_string_with_algo(&self) -> String {
        format!("{}:{}", self.algorithm, self.hex)
    }

    /// Parse the "algo:hex" form
    pub fn parse_with_algo(s: &str) -> Result<Self, String> {
        let (algo, hex) = s
            .split_once(':')
            .ok_or_else(|| format!("digest '{}' lacks an algorithm prefix", s))?;
        if hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(format!("digest '{}' is not hexadecimal", s));
        }
        Ok(ChecksumValue::new(algo.parse()?, hex))
    }
}

impl fmt::Display for ChecksumValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hex)
    }
}

/// Trait for computing checksums incrementally
pub trait ChecksumHasher: Send {
    /// Update the hasher with new data
    fn update(&mut self, data: &[u8]);

    /// Digest of everything fed so far, without ending the stream
    fn digest(&self) -> ChecksumValue;
}

/// CRC32 hasher (IEEE polynomial, reflected)
struct Crc32Hasher {
    crc: u32,
}

impl Crc32Hasher {
    fn new() -> Self {
        Crc32Hasher { crc: 0xffff_ffff }
    }
}

impl ChecksumHasher for Crc32Hasher {
    fn update(&mut self, data: &[u8]) {
        let mut crc = self.crc;
        for &byte in data {
            crc ^= byte as u32;
            for _ in 0..8 {
                crc = if crc & 1 == 1 {
                    (crc >> 1) ^ 0xedb8_8320
                } else {
                    crc >> 1
                };
            }
        }
        self.crc = crc;
    }

    fn digest(&self) -> ChecksumValue {
        ChecksumValue::new(
            ChecksumAlgorithm::Crc32,
            format!("{:08x}", self.crc ^ 0xffff_ffff),
        )
    }
}

/// MD5 hasher (backed by md5 crate)
struct Md5Hasher {
    context: md5::Context,
}

impl ChecksumHasher for Md5Hasher {
    fn update(&mut self, data: &[u8]) {
        self.context.consume(data);
    }

    fn digest(&self) -> ChecksumValue {
        let digest = self.context.clone().compute();
        ChecksumValue::new(ChecksumAlgorithm::Md5, format!("{:x}", digest))
    }
}

/// SHA-256 hasher (backed by sha2 crate)
struct Sha256Hasher {
    hasher: sha2::Sha256,
}

impl ChecksumHasher for Sha256Hasher {
    fn update(&mut self, data: &[u8]) {
        use sha2::Digest;
        self.hasher.update(data);
    }

    fn digest(&self) -> ChecksumValue {
        use sha2::Digest;
        let digest = self.hasher.clone().finalize();
        ChecksumValue::new(ChecksumAlgorithm::Sha256, format!("{:x}", digest))
    }
}

/// BLAKE3 hasher (backed by blake3 crate)
struct Blake3Hasher {
    hasher: blake3::Hasher,
}

impl ChecksumHasher for Blake3Hasher {
    fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    fn digest(&self) -> ChecksumValue {
        ChecksumValue::new(
            ChecksumAlgorithm::Blake3,
            self.hasher.finalize().to_hex().to_string(),
        )
    }
}

/// Create a new hasher for the given algorithm
pub fn create_hasher(algorithm: ChecksumAlgorithm) -> Box<dyn ChecksumHasher> {
    match algorithm {
        ChecksumAlgorithm::Crc32 => Box::new(Crc32Hasher::new()),
        ChecksumAlgorithm::Md5 => Box::new(Md5Hasher {
            context: md5::Context::new(),
        }),
        ChecksumAlgorithm::Sha256 => Box::new(Sha256Hasher {
            hasher: sha2::Sha256::default(),
        }),
        ChecksumAlgorithm::Blake3 => Box::new(Blake3Hasher {
            hasher: blake3::Hasher::new(),
        }),
    }
}

/// Compute the checksum of a whole file
pub fn compute_file_checksum(
    path: &Path,
    algorithm: ChecksumAlgorithm,
) -> std::io::Result<ChecksumValue> {
    let mut file = File::open(path)?;
    let mut hasher = create_hasher(algorithm);
    let mut buffer = vec![0u8; 1024 * 1024];

    loop {
        match file.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => hasher.update(&buffer[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(hasher.digest())
}

/// Generate checksum manifest content
///
/// Format: "<hex_checksum> <relative_path>" per line
pub fn generate_checksum_file(
    file_checksums: &[(String, ChecksumValue)], // (relative_path, checksum)
    algorithm: ChecksumAlgorithm,
) -> String {
    let mut result = String::new();

    result.push_str("; Checksum file generated by SafeMove\n");
    result.push_str(&format!("; Algorithm: {}\n", algorithm));
    result.push('\n');

    for (rel_path, checksum) in file_checksums {
        result.push_str(&format!("{} {}\n", checksum.hex(), rel_path));
    }

    result
}

/// Parse checksum manifest content into expected digests keyed by relative path.
///
/// An `; Algorithm:` header overrides `default_algorithm`. Malformed lines are
/// reported with their line number.
pub fn parse_checksum_file(
    content: &str,
    default_algorithm: ChecksumAlgorithm,
) -> Result<(ChecksumAlgorithm, HashMap<PathBuf, ChecksumValue>), String> {
    let mut algorithm = default_algorithm;
    let mut digests = HashMap::new();

    for (index, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(comment) = line.strip_prefix(';') {
            if let Some(name) = comment.trim().strip_prefix("Algorithm:") {
                algorithm = name.trim().parse()?;
            }
            continue;
        }

        let (hex, rel_path) = line
            .split_once(' ')
            .ok_or_else(|| format!("line {}: expected '<hex> <path>'", index + 1))?;
        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(format!("line {}: '{}' is not hexadecimal", index + 1, hex));
        }
        digests.insert(
            PathBuf::from(rel_path.trim_start()),
            ChecksumValue::new(algorithm, hex),
        );
    }

    Ok((algorithm, digests))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_algorithm_display() {
        assert_eq!(ChecksumAlgorithm::Crc32.to_string(), "crc32");
        assert_eq!(ChecksumAlgorithm::Md5.to_string(), "md5");
        assert_eq!(ChecksumAlgorithm::Sha256.to_string(), "sha256");
        assert_eq!(ChecksumAlgorithm::Blake3.to_string(), "blake3");
    }

    #[test]
    fn test_algorithm_from_str() {
        assert_eq!("crc32".parse(), Ok(ChecksumAlgorithm::Crc32));
        assert_eq!("MD5".parse(), Ok(ChecksumAlgorithm::Md5));
        assert_eq!("sha256".parse(), Ok(ChecksumAlgorithm::Sha256));
        assert_eq!("blake3".parse(), Ok(ChecksumAlgorithm::Blake3));
        assert!("invalid".parse::<ChecksumAlgorithm>().is_err());
    }

    #[test]
    fn test_crc32_known_value() {
        let mut hasher = create_hasher(ChecksumAlgorithm::Crc32);
        hasher.update(b"hello");
        assert_eq!(hasher.digest().hex(), "3610a686");
    }

    #[test]
    fn test_md5_known_value() {
        let mut hasher = create_hasher(ChecksumAlgorithm::Md5);
        hasher.update(b"hello");
        assert_eq!(hasher.digest().hex(), "5d41402abc4b2a76b9719d911017c592");
    }

    #[test]
    fn test_sha256_known_value() {
        let mut hasher = create_hasher(ChecksumAlgorithm::Sha256);
        hasher.update(b"hello");
        assert_eq!(
            hasher.digest().hex(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_digest_does_not_end_stream() {
        for algorithm in [
            ChecksumAlgorithm::Crc32,
            ChecksumAlgorithm::Md5,
            ChecksumAlgorithm::Sha256,
            ChecksumAlgorithm::Blake3,
        ] {
            let mut split = create_hasher(algorithm);
            split.update(b"hel");
            let _prefix = split.digest();
            split.update(b"lo");

            let mut whole = create_hasher(algorithm);
            whole.update(b"hello");
            assert_eq!(split.digest(), whole.digest(), "{}", algorithm);
        }
    }

    #[test]
    fn test_checksum_value_with_algo() {
        let cs = ChecksumValue::new(ChecksumAlgorithm::Sha256, "ABC123");
        assert_eq!(cs.to_string(), "abc123");
        assert_eq!(cs.to_string_with_algo(), "sha256:abc123");
        assert_eq!(ChecksumValue::parse_with_algo("sha256:abc123"), Ok(cs));
        assert!(ChecksumValue::parse_with_algo("abc123").is_err());
        assert!(ChecksumValue::parse_with_algo("sha256:xyz").is_err());
    }

    #[test]
    fn test_compute_file_checksum() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("file.txt");
        let mut file = File::create(&path).expect("Failed to create file");
        file.write_all(b"hello").expect("Failed to write file");
        drop(file);

        let checksum = compute_file_checksum(&path, ChecksumAlgorithm::Md5)
            .expect("Failed to hash file");
        assert_eq!(checksum.hex(), "5d41402abc4b2a76b9719d911017c592");
    }

    #[test]
    fn test_manifest_generate_then_parse() {
        let checksums = vec![
            (
                "file1.txt".to_string(),
                ChecksumValue::new(ChecksumAlgorithm::Sha256, "abc123"),
            ),
            (
                "dir/file 2.txt".to_string(),
                ChecksumValue::new(ChecksumAlgorithm::Sha256, "def456"),
            ),
        ];

        let content = generate_checksum_file(&checksums, ChecksumAlgorithm::Sha256);
        assert!(content.contains("abc123 file1.txt"));
        assert!(content.contains("Algorithm: sha256"));

        let (algorithm, parsed) = parse_checksum_file(&content, ChecksumAlgorithm::Blake3)
            .expect("Failed to parse manifest");
        assert_eq!(algorithm, ChecksumAlgorithm::Sha256);
        assert_eq!(
            parsed.get(Path::new("dir/file 2.txt")).map(|c| c.hex()),
            Some("def456")
        );
    }

    #[test]
    fn test_manifest_rejects_malformed_line() {
        let err = parse_checksum_file("; header\nnot-hex-at-all\n", ChecksumAlgorithm::Blake3)
            .expect_err("Malformed line should fail");
        assert!(err.contains("line 2"));
    }
}
