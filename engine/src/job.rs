//! Batch planning.
//!
//! This module turns files into jobs:
//! - Creating a single job from a source file and a destination directory
//! - Planning a batch from the candidates found on a drive
//! - Planning a batch from paths given by the user
//!
//! Files that no mapping rule claims are left out of the batch and reported
//! back as unmapped.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{EngineError, Result};
use crate::fs_ops::{enumerate_candidates, Candidate};
use crate::mapping::{MappingRule, RuleSet};
use crate::model::{BatchId, BatchOrigin, DriveId, Priority, TransferBatch, TransferJob};

/// A batch ready for submission plus the files left out of it.
#[derive(Debug, Clone)]
pub struct PlannedBatch {
    pub batch: TransferBatch,
    /// Files no rule matched
    pub unmapped: Vec<PathBuf>,
}

impl PlannedBatch {
    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }
}

/// Create a job copying `source` into `dest_dir`.
///
/// # Arguments
/// * `batch_id` - Batch the job will belong to
/// * `source` - Regular file to copy
/// * `dest_dir` - Directory the file is copied into, under its own name
/// * `priority` - Scheduling tier
///
/// # Returns
/// A new TransferJob in Pending state
///
/// # Errors
/// Returns EngineError if the source doesn't exist, is not a file, or the
/// destination directory is empty
pub fn create_job(
    batch_id: BatchId,
    source: &Path,
    dest_dir: &Path,
    priority: Priority,
) -> Result<TransferJob> {
    let metadata = match fs::metadata(source) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(EngineError::SourceNotFound {
                path: source.to_path_buf(),
            });
        }
        Err(e) => {
            return Err(EngineError::SourceAccessDenied {
                path: source.to_path_buf(),
                source: e,
            });
        }
    };
    if !metadata.is_file() {
        return Err(EngineError::InvalidPath {
            path: source.to_path_buf(),
            reason: "Source must be a file".to_string(),
        });
    }

    let Some(name) = source.file_name() else {
        return Err(EngineError::InvalidPath {
            path: source.to_path_buf(),
            reason: "Source has no file name".to_string(),
        });
    };
    if dest_dir.as_os_str().is_empty() {
        return Err(EngineError::InvalidPath {
            path: dest_dir.to_path_buf(),
            reason: "Destination path is empty".to_string(),
        });
    }

    Ok(TransferJob::new(
        batch_id,
        source,
        dest_dir.join(name),
        metadata.len(),
        priority,
    ))
}

/// Build a batch from already enumerated candidates.
pub fn plan_batch(
    origin: BatchOrigin,
    files: &[Candidate],
    rules: &RuleSet,
    priority: Priority,
) -> PlannedBatch {
    let mut batch = TransferBatch::new(origin);
    let mut unmapped = Vec::new();

    for file in files {
        match (rules.resolve(&file.path), file.path.file_name()) {
            (Some(dir), Some(name)) => {
                batch.add_job(&file.path, dir.join(name), file.size, priority);
            }
            _ => unmapped.push(file.path.clone()),
        }
    }

    debug!(
        batch = %batch.id,
        jobs = batch.jobs.len(),
        unmapped = unmapped.len(),
        "batch planned"
    );
    PlannedBatch { batch, unmapped }
}

/// Enumerate a drive and plan a batch for everything the rules claim.
///
/// Rule targets lying on the drive itself are excluded from enumeration,
/// as are `exclusions`.
pub fn plan_drive_batch(
    drive: &DriveId,
    rules: &[MappingRule],
    priority: Priority,
    exclusions: &[PathBuf],
) -> Result<PlannedBatch> {
    let rule_set = RuleSet::new(rules)?;
    let mut skip: Vec<PathBuf> = exclusions.to_vec();
    skip.extend(
        rules
            .iter()
            .map(|r| r.target_dir().to_path_buf())
            .filter(|t| drive.contains(t)),
    );

    let files = enumerate_candidates(drive.mount_point(), &skip)?;
    let planned = plan_batch(BatchOrigin::Drive(drive.clone()), &files, &rule_set, priority);
    info!(
        drive = %drive,
        files = files.len(),
        jobs = planned.batch.jobs.len(),
        unmapped = planned.unmapped.len(),
        "drive enumerated"
    );
    Ok(planned)
}

/// Plan a manual batch from files and directories.
///
/// Directories are enumerated recursively; a path that does not exist is
/// an error.
pub fn plan_paths(paths: &[PathBuf], rules: &[MappingRule], priority: Priority) -> Result<PlannedBatch> {
    let rule_set = RuleSet::new(rules)?;
    let mut files = Vec::new();
    for path in paths {
        let metadata = fs::metadata(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => EngineError::SourceNotFound { path: path.clone() },
            _ => EngineError::SourceAccessDenied {
                path: path.clone(),
                source: e,
            },
        })?;
        if metadata.is_dir() {
            files.extend(enumerate_candidates(path, &[])?);
        } else {
            files.push(Candidate {
                path: path.clone(),
                size: metadata.len(),
            });
        }
    }
    Ok(plan_batch(BatchOrigin::Manual, &files, &rule_set, priority))
}
