//! Error types for the ingest engine.
//!
//! `EngineError` is the error returned by fallible engine operations. Every
//! variant maps onto an [`ErrorKind`], the stable reason code that ends up on
//! a job when it fails and drives the scheduler's retry policy.

use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{JobId, JobStatus};

/// Errors raised by the engine.
///
/// Path-carrying variants keep the underlying `io::Error` as their source so
/// callers can inspect the OS error code via [`EngineError::raw_os_error`].
#[derive(Debug, Error)]
pub enum EngineError {
    /// Source file does not exist
    #[error("Source not found: {}", path.display())]
    SourceNotFound { path: PathBuf },

    /// Source exists but cannot be accessed
    #[error("Source access denied: {}", path.display())]
    SourceAccessDenied { path: PathBuf, source: io::Error },

    /// Failed to read from a file
    #[error("Failed to read file: {}", path.display())]
    ReadError { path: PathBuf, source: io::Error },

    /// Failed to write to a file
    #[error("Failed to write file: {}", path.display())]
    WriteError { path: PathBuf, source: io::Error },

    /// Failed to enumerate a directory
    #[error("Failed to enumerate directory: {}", path.display())]
    EnumerationFailed { path: PathBuf, source: io::Error },

    /// Failed to create a directory
    #[error("Failed to create directory: {}", path.display())]
    DirectoryCreationFailed { path: PathBuf, source: io::Error },

    /// Path is unusable for a transfer
    #[error("Invalid path: {} ({reason})", path.display())]
    InvalidPath { path: PathBuf, reason: String },

    /// Destination digest differs from the digest of the source
    #[error("Verification failed for {}: expected {expected}, got {actual}", path.display())]
    VerificationFailed {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    /// Destination volume cannot hold the remaining bytes
    #[error(
        "Insufficient space for {}: {required} bytes required, {available} available",
        path.display()
    )]
    InsufficientSpace {
        path: PathBuf,
        required: u64,
        available: u64,
    },

    /// The drive backing a transfer is gone
    #[error("Drive vanished: {}", drive.display())]
    DriveVanished { drive: PathBuf },

    /// Mapping rule pattern could not be compiled
    #[error("Invalid mapping pattern '{pattern}': {reason}")]
    InvalidRule { pattern: String, reason: String },

    /// Configuration value out of range
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// Job status change that the lifecycle does not allow
    #[error("Job {job}: illegal transition {from} -> {to}")]
    InvalidTransition {
        job: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Unknown job: {id}")]
    UnknownJob { id: JobId },

    #[error("Unknown batch: {id}")]
    UnknownBatch { id: uuid::Uuid },

    /// A job id was submitted twice
    #[error("Job {id} is already scheduled")]
    DuplicateJob { id: JobId },

    /// The scheduler no longer accepts work
    #[error("Scheduler is shut down")]
    SchedulerStopped,

    /// A background thread could not be started
    #[error("Failed to spawn thread {name}")]
    SpawnFailed { name: String, source: io::Error },
}

impl EngineError {
    /// Extract the OS error code from this error, if available.
    pub fn raw_os_error(&self) -> Option<u32> {
        match self {
            Self::SourceAccessDenied { source, .. }
            | Self::ReadError { source, .. }
            | Self::WriteError { source, .. }
            | Self::EnumerationFailed { source, .. }
            | Self::DirectoryCreationFailed { source, .. }
            | Self::SpawnFailed { source, .. } => {
                source.raw_os_error().map(|e| e as u32)
            }
            _ => None,
        }
    }

    /// Classify this error into the failure taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SourceNotFound { .. }
            | Self::SourceAccessDenied { .. }
            | Self::ReadError { .. }
            | Self::WriteError { .. }
            | Self::EnumerationFailed { .. }
            | Self::DirectoryCreationFailed { .. }
            | Self::SpawnFailed { .. } => ErrorKind::IoError,
            Self::VerificationFailed { .. } => ErrorKind::VerificationFailed,
            Self::InsufficientSpace { .. } => ErrorKind::InsufficientSpace,
            Self::DriveVanished { .. } => ErrorKind::DriveVanished,
            Self::SchedulerStopped => ErrorKind::Shutdown,
            Self::InvalidPath { .. }
            | Self::InvalidRule { .. }
            | Self::InvalidConfig { .. }
            | Self::InvalidTransition { .. }
            | Self::UnknownJob { .. }
            | Self::UnknownBatch { .. }
            | Self::DuplicateJob { .. } => ErrorKind::Invalid,
        }
    }
}

/// Reason codes attached to failed or cancelled jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Read, write, or permission failure
    IoError,
    /// Digest mismatch after copy
    VerificationFailed,
    /// Destination already occupied; resolved locally, never surfaced
    DestinationConflict,
    /// Destination volume is full
    InsufficientSpace,
    /// Source or destination drive disappeared
    DriveVanished,
    /// File matched no mapping rule
    Unmapped,
    /// Another job in the batch failed fatally before this one started
    BatchAborted,
    /// Cancelled on request
    Cancelled,
    /// Interrupted by scheduler shutdown; the temp file is kept
    Shutdown,
    /// Caller error (bad path, rule, config, or state)
    Invalid,
}

impl ErrorKind {
    /// Whether the scheduler should retry a job that failed with this kind.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::IoError | ErrorKind::VerificationFailed)
    }

    /// Stable machine-readable code.
    pub fn reason_code(self) -> &'static str {
        match self {
            ErrorKind::IoError => "io_error",
            ErrorKind::VerificationFailed => "verification_failed",
            ErrorKind::DestinationConflict => "destination_conflict",
            ErrorKind::InsufficientSpace => "insufficient_space",
            ErrorKind::DriveVanished => "drive_vanished",
            ErrorKind::Unmapped => "unmapped",
            ErrorKind::BatchAborted => "batch_aborted",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Shutdown => "shutdown",
            ErrorKind::Invalid => "invalid",
        }
    }

    /// Human-readable explanation for UIs.
    pub fn describe(self) -> &'static str {
        match self {
            ErrorKind::IoError => "The file could not be read or written",
            ErrorKind::VerificationFailed => "The copy did not match the original",
            ErrorKind::DestinationConflict => "A file with this name already exists",
            ErrorKind::InsufficientSpace => "Not enough free space on the destination",
            ErrorKind::DriveVanished => "The drive was disconnected",
            ErrorKind::Unmapped => "No mapping rule matches this file type",
            ErrorKind::BatchAborted => "Stopped because another file in the batch failed",
            ErrorKind::Cancelled => "The transfer was cancelled",
            ErrorKind::Shutdown => "The transfer was interrupted by shutdown",
            ErrorKind::Invalid => "The request was invalid",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.reason_code())
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
