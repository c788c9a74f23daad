//! Checksum and verification functionality.
//!
//! This module provides:
//! - Multiple checksum algorithms (SHA-256, BLAKE3, MD5, xxHash64, CRC32)
//! - Streaming hashers usable while a file is being copied
//! - File and byte-range checksum computation
//! - The cheap partial fingerprint used for duplicate detection
//! - Checksum manifest generation and verification

use std::fmt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Supported checksum algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    /// SHA-256 (cryptographic, 256-bit)
    #[default]
    Sha256,
    /// BLAKE3 (modern, fast, 256-bit)
    Blake3,
    /// MD5 (legacy, kept for compatibility with existing manifests)
    Md5,
    /// xxHash64 (fast, non-cryptographic)
    Xxh64,
    /// CRC32 (fast, 32-bit)
    Crc32,
}

impl ChecksumAlgorithm {
    pub const ALL: [ChecksumAlgorithm; 5] = [
        ChecksumAlgorithm::Sha256,
        ChecksumAlgorithm::Blake3,
        ChecksumAlgorithm::Md5,
        ChecksumAlgorithm::Xxh64,
        ChecksumAlgorithm::Crc32,
    ];

    pub fn is_cryptographic(self) -> bool {
        matches!(self, ChecksumAlgorithm::Sha256 | ChecksumAlgorithm::Blake3)
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sha256 => write!(f, "sha256"),
            Self::Blake3 => write!(f, "blake3"),
            Self::Md5 => write!(f, "md5"),
            Self::Xxh64 => write!(f, "xxh64"),
            Self::Crc32 => write!(f, "crc32"),
        }
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "sha256" => Ok(Self::Sha256),
            "blake3" => Ok(Self::Blake3),
            "md5" => Ok(Self::Md5),
            "xxh64" | "xxhash64" => Ok(Self::Xxh64),
            "crc32" => Ok(Self::Crc32),
            other => Err(EngineError::InvalidConfig {
                reason: format!("unknown checksum algorithm '{other}'"),
            }),
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
    pub fn new(algorithm: ChecksumAlgorithm, hex: String) -> Self {
        ChecksumValue { algorithm, hex }
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Format as "algo:hex"
    pub fn to_string_with_algo(&self) -> String {
        format!("{}:{}", self.algorithm, self.hex)
    }
}

impl fmt::Display for ChecksumValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hex)
    }
}

/// Digest of one file, produced for verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumRecord {
    pub path: PathBuf,
    pub algorithm: ChecksumAlgorithm,
    pub digest: ChecksumValue,
    /// Number of bytes hashed
    pub length: u64,
}

impl ChecksumRecord {
    pub fn compute(path: &Path, algorithm: ChecksumAlgorithm) -> Result<Self> {
        let mut file = open_for_hashing(path)?;
        let mut hasher = create_hasher(algorithm);
        let length = feed_hasher(&mut file, path, hasher.as_mut(), None)?;
        Ok(ChecksumRecord {
            path: path.to_path_buf(),
            algorithm,
            digest: hasher.finalize(),
            length,
        })
    }
}

/// Trait for computing checksums incrementally
pub trait ChecksumHasher: Send {
    /// Update the hasher with new data
    fn update(&mut self, data: &[u8]);

    /// Finalize and return the checksum value
    fn finalize(self: Box<Self>) -> ChecksumValue;
}

struct Sha256Hasher {
    hasher: sha2::Sha256,
}

impl ChecksumHasher for Sha256Hasher {
    fn update(&mut self, data: &[u8]) {
        use sha2::Digest;
        self.hasher.update(data);
    }

    fn finalize(self: Box<Self>) -> ChecksumValue {
        use sha2::Digest;
        let digest = self.hasher.finalize();
        ChecksumValue::new(ChecksumAlgorithm::Sha256, format!("{:x}", digest))
    }
}

struct Blake3Hasher {
    hasher: blake3::Hasher,
}

impl ChecksumHasher for Blake3Hasher {
    fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    fn finalize(self: Box<Self>) -> ChecksumValue {
        let digest = self.hasher.finalize();
        ChecksumValue::new(ChecksumAlgorithm::Blake3, digest.to_hex().to_string())
    }
}

struct Md5Hasher {
    context: md5::Context,
}

impl ChecksumHasher for Md5Hasher {
    fn update(&mut self, data: &[u8]) {
        self.context.consume(data);
    }

    fn finalize(self: Box<Self>) -> ChecksumValue {
        let digest = self.context.compute();
        ChecksumValue::new(ChecksumAlgorithm::Md5, format!("{:x}", digest))
    }
}

struct Xxh64Hasher {
    state: xxhash_rust::xxh64::Xxh64,
}

impl ChecksumHasher for Xxh64Hasher {
    fn update(&mut self, data: &[u8]) {
        self.state.update(data);
    }

    fn finalize(self: Box<Self>) -> ChecksumValue {
        ChecksumValue::new(
            ChecksumAlgorithm::Xxh64,
            format!("{:016x}", self.state.digest()),
        )
    }
}

struct Crc32Hasher {
    hasher: crc32fast::Hasher,
}

impl ChecksumHasher for Crc32Hasher {
    fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    fn finalize(self: Box<Self>) -> ChecksumValue {
        ChecksumValue::new(
            ChecksumAlgorithm::Crc32,
            format!("{:08x}", self.hasher.finalize()),
        )
    }
}

/// Create a new hasher for the given algorithm
pub fn create_hasher(algorithm: ChecksumAlgorithm) -> Box<dyn ChecksumHasher> {
    match algorithm {
        ChecksumAlgorithm::Sha256 => Box::new(Sha256Hasher {
            hasher: sha2::Sha256::default(),
        }),
        ChecksumAlgorithm::Blake3 => Box::new(Blake3Hasher {
            hasher: blake3::Hasher::new(),
        }),
        ChecksumAlgorithm::Md5 => Box::new(Md5Hasher {
            context: md5::Context::new(),
        }),
        ChecksumAlgorithm::Xxh64 => Box::new(Xxh64Hasher {
            state: xxhash_rust::xxh64::Xxh64::new(0),
        }),
        ChecksumAlgorithm::Crc32 => Box::new(Crc32Hasher {
            hasher: crc32fast::Hasher::new(),
        }),
    }
}

fn open_for_hashing(path: &Path) -> Result<File> {
    File::open(path).map_err(|e| EngineError::ReadError {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Stream `reader` into `hasher`, stopping after `limit` bytes when given.
///
/// Returns the number of bytes consumed.
pub(crate) fn feed_hasher(
    reader: &mut impl Read,
    path: &Path,
    hasher: &mut dyn ChecksumHasher,
    limit: Option<u64>,
) -> Result<u64> {
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    let mut consumed = 0u64;
    loop {
        let want = match limit {
            Some(limit) if consumed >= limit => break,
            Some(limit) => (limit - consumed).min(buffer.len() as u64) as usize,
            None => buffer.len(),
        };
        let n = reader
            .read(&mut buffer[..want])
            .map_err(|e| EngineError::ReadError {
                path: path.to_path_buf(),
                source: e,
            })?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        consumed += n as u64;
    }
    Ok(consumed)
}

/// Compute checksum for a file
pub fn compute_file_checksum(path: &Path, algorithm: ChecksumAlgorithm) -> Result<ChecksumValue> {
    Ok(ChecksumRecord::compute(path, algorithm)?.digest)
}

/// Compute the checksum of `len` bytes starting at `offset`.
///
/// A range running past end of file hashes whatever bytes exist.
pub fn compute_range_checksum(
    path: &Path,
    offset: u64,
    len: u64,
    algorithm: ChecksumAlgorithm,
) -> Result<ChecksumValue> {
    let mut file = open_for_hashing(path)?;
    file.seek(SeekFrom::Start(offset))
        .map_err(|e| EngineError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;
    let mut hasher = create_hasher(algorithm);
    feed_hasher(&mut file, path, hasher.as_mut(), Some(len))?;
    Ok(hasher.finalize())
}

/// Cheap fingerprint: xxHash64 over the first `prefix_len` bytes plus the
/// file size.
pub fn partial_fingerprint(path: &Path, prefix_len: u64) -> Result<ChecksumValue> {
    let mut file = open_for_hashing(path)?;
    let size = file
        .metadata()
        .map_err(|e| EngineError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?
        .len();
    let mut hasher = create_hasher(ChecksumAlgorithm::Xxh64);
    feed_hasher(&mut file, path, hasher.as_mut(), Some(prefix_len))?;
    hasher.update(&size.to_le_bytes());
    Ok(hasher.finalize())
}

/// Generate a checksum manifest for multiple files
///
/// Format: "<hex_checksum> <relative_path>" per line
pub fn generate_checksum_file(
    file_checksums: &[(String, ChecksumValue)],
    algorithm: ChecksumAlgorithm,
) -> String {
    let mut result = String::new();

    result.push_str("; Checksum file generated by ingest\n");
    result.push_str(&format!("; Algorithm: {}\n", algorithm));
    result.push('\n');

    for (rel_path, checksum) in file_checksums {
        result.push_str(&format!("{} {}\n", checksum.hex(), rel_path));
    }

    result
}

/// Algorithm named in a manifest's header, if present.
pub fn manifest_algorithm(content: &str) -> Option<ChecksumAlgorithm> {
    content
        .lines()
        .filter_map(|line| line.trim().strip_prefix("; Algorithm:"))
        .find_map(|name| name.trim().parse().ok())
}

/// One line of a verified manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub path: String,
    pub expected: ChecksumValue,
    pub actual: ChecksumValue,
}

impl ManifestEntry {
    pub fn matches(&self) -> bool {
        self.expected.hex().eq_ignore_ascii_case(self.actual.hex())
    }
}

/// Parse and verify a checksum manifest.
///
/// `file_get_checksum` is called with each relative path in the manifest.
pub fn verify_checksum_file(
    checksum_content: &str,
    file_get_checksum: impl Fn(&str) -> Result<ChecksumValue>,
) -> Result<Vec<ManifestEntry>> {
    let mut results = Vec::new();

    for line in checksum_content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with(';') {
            continue;
        }

        let Some((expected_hex, rel_path)) = line.split_once(' ') else {
            continue;
        };

        let actual = file_get_checksum(rel_path)?;
        let expected = ChecksumValue::new(actual.algorithm(), expected_hex.to_string());
        results.push(ManifestEntry {
            path: rel_path.to_string(),
            expected,
            actual,
        });
    }

    Ok(results)
}

/// Returns true if two files have the same size and digest.
pub fn files_match(a: &Path, b: &Path, algorithm: ChecksumAlgorithm) -> Result<bool> {
    let left = ChecksumRecord::compute(a, algorithm)?;
    let right = ChecksumRecord::compute(b, algorithm)?;
    Ok(left.length == right.length && left.digest == right.digest)
}
