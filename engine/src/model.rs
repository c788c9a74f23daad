//! Core data model for the ingest engine.
//!
//! This module defines the data structures shared by every component:
//! - Drive, DriveId, DriveType, DriveStatus: attached storage as seen by the monitor
//! - TransferJob: one source-to-destination file transfer
//! - TransferBatch: the jobs created by one drive connection or manual submission
//! - Priority, JobStatus, BatchStatus, BatchOrigin: enums controlling scheduling

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::checksums::ChecksumValue;
use crate::error::{EngineError, ErrorKind, Result};

/// Identifier of a transfer job.
pub type JobId = Uuid;

/// Identifier of a transfer batch.
pub type BatchId = Uuid;

/// Identity of a drive: its mount point.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DriveId(PathBuf);

impl DriveId {
    pub fn new(mount_point: impl Into<PathBuf>) -> Self {
        DriveId(mount_point.into())
    }

    pub fn mount_point(&self) -> &Path {
        &self.0
    }

    /// Returns true if `path` lies under this drive's mount point.
    ///
    /// A filesystem root (`/`, `C:\`) contains every path on its volume but
    /// is never used for prefix matching; callers must match root drives by id.
    pub fn contains(&self, path: &Path) -> bool {
        if self.0.parent().is_none() {
            return false;
        }
        path.starts_with(&self.0)
    }
}

impl fmt::Display for DriveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// Kind of storage behind a mount point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriveType {
    Local,
    Removable,
    Network,
    Cloud,
}

impl fmt::Display for DriveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriveType::Local => write!(f, "local"),
            DriveType::Removable => write!(f, "removable"),
            DriveType::Network => write!(f, "network"),
            DriveType::Cloud => write!(f, "cloud"),
        }
    }
}

/// Lifecycle status of a drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriveStatus {
    Unknown,
    /// Detected, readiness probe not yet done
    Connecting,
    Ready,
    /// At least one transfer touches this drive
    Busy,
    /// Mounted but its root cannot be listed
    Error,
    Disconnected,
}

impl DriveStatus {
    /// Whether the drive monitor may move a drive from `self` to `next`.
    pub fn can_transition_to(self, next: DriveStatus) -> bool {
        use DriveStatus::*;
        match (self, next) {
            (a, b) if a == b => true,
            (Unknown, Connecting) => true,
            (Connecting, Ready | Busy | Error | Disconnected) => true,
            (Ready, Busy) | (Busy, Ready) => true,
            (Ready | Busy, Error) | (Error, Ready | Busy) => true,
            (Ready | Busy | Error, Disconnected) => true,
            _ => false,
        }
    }
}

impl fmt::Display for DriveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DriveStatus::Unknown => "unknown",
            DriveStatus::Connecting => "connecting",
            DriveStatus::Ready => "ready",
            DriveStatus::Busy => "busy",
            DriveStatus::Error => "error",
            DriveStatus::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// A drive tracked by the monitor.
#[derive(Debug, Clone, PartialEq)]
pub struct Drive {
    /// Mount point, unique within the registry
    pub id: DriveId,

    /// Display label (volume name, or the mount point when unnamed)
    pub label: String,

    pub drive_type: DriveType,

    pub status: DriveStatus,

    /// Filesystem name as reported by the OS (e.g. "exfat", "nfs")
    pub file_system: String,

    /// Total capacity in bytes
    pub total_bytes: u64,

    /// Free space in bytes at the last poll
    pub free_bytes: u64,

    /// When the drive was first seen
    pub detected_at: DateTime<Utc>,
}

/// Scheduling priority of a job.
///
/// Ordering is `Low < Normal < High`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            other => Err(EngineError::InvalidConfig {
                reason: format!("unknown priority '{other}'"),
            }),
        }
    }
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Queued or waiting for a retry
    Pending,
    /// Owned by a worker and copying
    Active,
    /// Parked by a pause request
    Paused,
    Completed,
    /// Failed; terminal once the scheduler decides not to retry
    Error,
    Cancelled,
}

impl JobStatus {
    /// Returns true for states that can never change again.
    pub fn is_final(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Cancelled)
    }

    /// Whether a job may move from `self` to `next`.
    ///
    /// Forward-only, except `Error -> Pending` (retry), `Active <-> Paused`
    /// and `Paused -> Pending` when a queued job is resumed.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Active | Paused | Cancelled)
                | (Active, Paused | Completed | Error | Cancelled)
                | (Paused, Active | Pending | Cancelled)
                | (Error, Pending)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Active => "active",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Error => "error",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Why a job failed or was cancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl JobFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        JobFailure {
            kind,
            message: message.into(),
        }
    }

    pub fn from_error(err: &EngineError) -> Self {
        JobFailure::new(err.kind(), err.to_string())
    }
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.reason_code(), self.message)
    }
}

/// One source-to-destination file transfer.
#[derive(Debug, Clone)]
pub struct TransferJob {
    /// Unique identifier for this job
    pub id: JobId,

    /// Batch that owns this job
    pub batch_id: BatchId,

    /// File to ingest
    pub source_path: PathBuf,

    /// Final destination path (may be rewritten by a rename decision)
    pub destination_path: PathBuf,

    /// Source size at planning time
    pub expected_size: u64,

    pub priority: Priority,

    pub status: JobStatus,

    /// Bytes copied so far in the current attempt
    pub bytes_transferred: u64,

    /// Bytes of the temp file known to match the source
    pub confirmed_offset: u64,

    /// Digest of the source computed during the copy pass
    pub expected_checksum: Option<ChecksumValue>,

    /// Digest of the destination after the copy
    pub observed_checksum: Option<ChecksumValue>,

    /// Number of retries already consumed
    pub retry_count: u32,

    /// Drive the source was read from, when known
    pub source_drive: Option<DriveId>,

    /// Last error or cancellation reason
    pub failure: Option<JobFailure>,

    /// Completed because an identical file already existed at the destination
    pub skipped: bool,

    /// Position in the scheduler's dispatch order (set when first started)
    pub dispatch_order: Option<u64>,

    pub created_at: DateTime<Utc>,

    pub started_at: Option<DateTime<Utc>>,

    pub finished_at: Option<DateTime<Utc>>,
}

impl TransferJob {
    pub fn new(
        batch_id: BatchId,
        source_path: impl Into<PathBuf>,
        destination_path: impl Into<PathBuf>,
        expected_size: u64,
        priority: Priority,
    ) -> Self {
        TransferJob {
            id: Uuid::new_v4(),
            batch_id,
            source_path: source_path.into(),
            destination_path: destination_path.into(),
            expected_size,
            priority,
            status: JobStatus::Pending,
            bytes_transferred: 0,
            confirmed_offset: 0,
            expected_checksum: None,
            observed_checksum: None,
            retry_count: 0,
            source_drive: None,
            failure: None,
            skipped: false,
            dispatch_order: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Move the job to `next`, rejecting transitions the lifecycle forbids.
    pub fn transition(&mut self, next: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                job: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        match next {
            JobStatus::Active if self.started_at.is_none() => self.started_at = Some(Utc::now()),
            JobStatus::Completed | JobStatus::Cancelled | JobStatus::Error => {
                self.finished_at = Some(Utc::now())
            }
            _ => {}
        }
        Ok(())
    }

    /// Returns true if the job lies on `drive`, either by its recorded
    /// source drive or by source/destination path prefix.
    pub fn touches_drive(&self, drive: &DriveId) -> bool {
        self.source_drive.as_ref() == Some(drive)
            || drive.contains(&self.source_path)
            || drive.contains(&self.destination_path)
    }
}

/// Where a batch came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOrigin {
    /// Created from a drive connection
    Drive(DriveId),
    /// Submitted by the host directly
    Manual,
}

/// Aggregate status of a batch, derived from its jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Active,
    Completed,
    Error,
    Cancelled,
}

impl BatchStatus {
    /// Derive a batch status from its jobs' statuses.
    ///
    /// `Error` counts as terminal here; callers only observe `Error` on jobs
    /// the scheduler has given up on.
    pub fn derive<I>(statuses: I) -> BatchStatus
    where
        I: IntoIterator<Item = JobStatus>,
    {
        let mut any_error = false;
        let mut any_cancelled = false;
        for status in statuses {
            match status {
                JobStatus::Pending | JobStatus::Active | JobStatus::Paused => {
                    return BatchStatus::Active
                }
                JobStatus::Error => any_error = true,
                JobStatus::Cancelled => any_cancelled = true,
                JobStatus::Completed => {}
            }
        }
        if any_error {
            BatchStatus::Error
        } else if any_cancelled {
            BatchStatus::Cancelled
        } else {
            BatchStatus::Completed
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BatchStatus::Active => "active",
            BatchStatus::Completed => "completed",
            BatchStatus::Error => "error",
            BatchStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A set of jobs created by one drive connection or manual submission.
#[derive(Debug, Clone)]
pub struct TransferBatch {
    pub id: BatchId,
    pub origin: BatchOrigin,
    pub jobs: Vec<TransferJob>,
    pub created_at: DateTime<Utc>,
}

impl TransferBatch {
    pub fn new(origin: BatchOrigin) -> Self {
        TransferBatch {
            id: Uuid::new_v4(),
            origin,
            jobs: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Create a job owned by this batch and append it.
    pub fn add_job(
        &mut self,
        source_path: impl Into<PathBuf>,
        destination_path: impl Into<PathBuf>,
        expected_size: u64,
        priority: Priority,
    ) -> JobId {
        let mut job = TransferJob::new(self.id, source_path, destination_path, expected_size, priority);
        if let BatchOrigin::Drive(drive) = &self.origin {
            job.source_drive = Some(drive.clone());
        }
        let id = job.id;
        self.jobs.push(job);
        id
    }

    pub fn status(&self) -> BatchStatus {
        BatchStatus::derive(self.jobs.iter().map(|j| j.status))
    }

    pub fn total_bytes(&self) -> u64 {
        self.jobs.iter().map(|j| j.expected_size).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn test_job_transitions() {
        let mut job = TransferJob::new(Uuid::new_v4(), "/a", "/b", 10, Priority::Normal);
        job.transition(JobStatus::Active).unwrap();
        assert!(job.started_at.is_some());
        job.transition(JobStatus::Paused).unwrap();
        job.transition(JobStatus::Active).unwrap();
        job.transition(JobStatus::Error).unwrap();
        job.transition(JobStatus::Pending).unwrap();
        job.transition(JobStatus::Active).unwrap();
        job.transition(JobStatus::Completed).unwrap();

        let err = job.transition(JobStatus::Active).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
    }

    #[test]
    fn test_pending_cannot_complete_directly() {
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Cancelled.can_transition_to(JobStatus::Pending));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Error));
    }

    #[test]
    fn test_batch_status_derivation() {
        use JobStatus::*;
        assert_eq!(BatchStatus::derive([Completed, Active]), BatchStatus::Active);
        assert_eq!(BatchStatus::derive([Completed, Completed]), BatchStatus::Completed);
        assert_eq!(BatchStatus::derive([Completed, Error, Cancelled]), BatchStatus::Error);
        assert_eq!(BatchStatus::derive([Completed, Cancelled]), BatchStatus::Cancelled);
        assert_eq!(BatchStatus::derive([Paused, Error]), BatchStatus::Active);
    }

    #[test]
    fn test_drive_id_contains() {
        let card = DriveId::new("/media/card");
        assert!(card.contains(Path::new("/media/card/DCIM/IMG_0001.JPG")));
        assert!(!card.contains(Path::new("/media/cardreader/x")));
        assert!(!DriveId::new("/").contains(Path::new("/home/user")));
    }

    #[test]
    fn test_drive_jobs_inherit_source_drive() {
        let drive = DriveId::new("/media/card");
        let mut batch = TransferBatch::new(BatchOrigin::Drive(drive.clone()));
        batch.add_job("/media/card/a.jpg", "/photos/a.jpg", 5, Priority::Normal);
        assert_eq!(batch.jobs[0].source_drive.as_ref(), Some(&drive));
        assert_eq!(batch.jobs[0].batch_id, batch.id);
        assert!(batch.jobs[0].touches_drive(&drive));
    }

    #[test]
    fn test_drive_status_transitions() {
        assert!(DriveStatus::Unknown.can_transition_to(DriveStatus::Connecting));
        assert!(DriveStatus::Ready.can_transition_to(DriveStatus::Busy));
        assert!(DriveStatus::Error.can_transition_to(DriveStatus::Disconnected));
        assert!(!DriveStatus::Disconnected.can_transition_to(DriveStatus::Ready));
    }
}
