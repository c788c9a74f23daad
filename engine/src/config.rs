//! Engine configuration.
//!
//! `EngineConfig` is a plain value: the host builds it (usually from a TOML
//! file), passes it at construction and swaps it at runtime through
//! [`TransferScheduler::reconfigure`](crate::scheduler::TransferScheduler::reconfigure).

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::checksums::ChecksumAlgorithm;
use crate::error::{EngineError, Result};
use crate::mapping::MappingRule;

/// Bytes in one configured megabyte.
pub const MEGABYTE: f64 = 1_048_576.0;

const MIN_CHUNK_SIZE: usize = 4 * 1024;

/// What to do when the destination exists with different content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Write next to the existing file as `name_1.ext`, `name_2.ext`, ...
    #[default]
    Rename,
    /// Replace the existing file
    Overwrite,
}

/// A mapping rule as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingRuleConfig {
    /// Extension pattern: `*.jpg`, `.jpg` or `jpg`
    pub pattern: String,
    /// Destination directory for matching files
    pub target: PathBuf,
    /// Higher wins; ties go to the rule declared first
    #[serde(default)]
    pub priority: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of concurrently occupied workers
    pub parallel_transfers: usize,

    /// Aggregate limit in MB/s; 0 means unlimited
    pub bandwidth_limit: f64,

    /// Delete the source after a verified copy
    pub delete_source: bool,

    /// Drive poll interval in seconds
    pub check_interval: u64,

    /// Ingest newly connected removable and network drives automatically
    pub auto_start: bool,

    pub max_retries: u32,

    pub retry_base_delay_ms: u64,

    /// Copy chunk size in bytes
    pub chunk_size: usize,

    pub verify_algorithm: ChecksumAlgorithm,

    /// Prefix length in KiB for the duplicate fingerprint
    pub partial_hash_kib: u64,

    pub on_conflict: ConflictPolicy,

    /// Mount points that are never registered
    pub excluded_drives: Vec<PathBuf>,

    pub mappings: Vec<MappingRuleConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            parallel_transfers: 2,
            bandwidth_limit: 0.0,
            delete_source: false,
            check_interval: 2,
            auto_start: false,
            max_retries: 3,
            retry_base_delay_ms: 500,
            chunk_size: 1024 * 1024,
            verify_algorithm: ChecksumAlgorithm::Sha256,
            partial_hash_kib: 64,
            on_conflict: ConflictPolicy::Rename,
            excluded_drives: Vec::new(),
            mappings: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.parallel_transfers == 0 {
            return Err(invalid("parallel_transfers must be at least 1"));
        }
        if !self.bandwidth_limit.is_finite() || self.bandwidth_limit < 0.0 {
            return Err(invalid("bandwidth_limit must be a non-negative number"));
        }
        if self.check_interval == 0 {
            return Err(invalid("check_interval must be at least 1 second"));
        }
        if self.chunk_size < MIN_CHUNK_SIZE {
            return Err(invalid(format!(
                "chunk_size must be at least {MIN_CHUNK_SIZE} bytes"
            )));
        }
        self.mapping_rules()?;
        Ok(())
    }

    /// Bandwidth limit in bytes per second, 0 when unlimited.
    pub fn bandwidth_bytes_per_sec(&self) -> u64 {
        if self.bandwidth_limit <= 0.0 {
            0
        } else {
            (self.bandwidth_limit * MEGABYTE).round().max(1.0) as u64
        }
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval)
    }

    pub fn partial_hash_bytes(&self) -> u64 {
        self.partial_hash_kib * 1024
    }

    /// Backoff before retry number `attempt` (1-based), capped at one minute.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        const MAX_DELAY_MS: u64 = 60_000;
        let exponent = attempt.saturating_sub(1).min(20);
        let delay = self
            .retry_base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(MAX_DELAY_MS);
        Duration::from_millis(delay)
    }

    /// Compile the configured mappings.
    pub fn mapping_rules(&self) -> Result<Vec<MappingRule>> {
        self.mappings
            .iter()
            .map(|m| MappingRule::new(&m.pattern, m.target.clone(), m.priority))
            .collect()
    }
}

fn invalid(reason: impl Into<String>) -> EngineError {
    EngineError::InvalidConfig {
        reason: reason.into(),
    }
}
