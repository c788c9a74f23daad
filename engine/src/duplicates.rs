//! Duplicate resolution for destinations that already exist.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::checksums::{compute_file_checksum, partial_fingerprint, ChecksumAlgorithm};
use crate::config::{ConflictPolicy, EngineConfig};
use crate::error::{EngineError, Result};
use crate::fs_ops::temp_path_for;
use crate::model::JobId;

/// Outcome of comparing a source with an existing destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateDecision {
    /// Destination already holds identical content
    Skip,
    /// Write to a fresh `name_N.ext` path instead
    Rename,
    /// Replace the destination
    Overwrite,
}

/// Size and location of a file being compared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    pub path: PathBuf,
    pub size: u64,
}

impl FileMeta {
    pub fn read(path: &Path) -> Result<Self> {
        let meta = fs::metadata(path).map_err(|e| EngineError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(FileMeta {
            path: path.to_path_buf(),
            size: meta.len(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct DuplicateResolver {
    algorithm: ChecksumAlgorithm,
    partial_bytes: u64,
    policy: ConflictPolicy,
}

impl DuplicateResolver {
    pub fn new(algorithm: ChecksumAlgorithm, partial_bytes: u64, policy: ConflictPolicy) -> Self {
        DuplicateResolver {
            algorithm,
            partial_bytes,
            policy,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        DuplicateResolver::new(
            config.verify_algorithm,
            config.partial_hash_bytes(),
            config.on_conflict,
        )
    }

    /// Decide what to do with `source` given an existing `dest`.
    ///
    /// Sizes are compared first, then the partial fingerprint; the full
    /// digest is only computed when both agree.
    pub fn decide(&self, source: &FileMeta, dest: &FileMeta) -> Result<DuplicateDecision> {
        if source.size != dest.size {
            debug!(path = %dest.path.display(), "size differs from existing destination");
            return Ok(self.conflict());
        }

        let src_partial = partial_fingerprint(&source.path, self.partial_bytes)?;
        let dst_partial = partial_fingerprint(&dest.path, self.partial_bytes)?;
        if src_partial != dst_partial {
            debug!(path = %dest.path.display(), "partial fingerprint differs");
            return Ok(self.conflict());
        }

        let src_full = compute_file_checksum(&source.path, self.algorithm)?;
        let dst_full = compute_file_checksum(&dest.path, self.algorithm)?;
        if src_full == dst_full {
            Ok(DuplicateDecision::Skip)
        } else {
            debug!(path = %dest.path.display(), "full digest differs");
            Ok(self.conflict())
        }
    }

    fn conflict(&self) -> DuplicateDecision {
        match self.policy {
            ConflictPolicy::Rename => DuplicateDecision::Rename,
            ConflictPolicy::Overwrite => DuplicateDecision::Overwrite,
        }
    }
}

/// First `name_N.ext` sibling of `dest` that neither exists nor has a
/// transfer in progress.
pub fn rename_target(dest: &Path) -> PathBuf {
    free_sibling(dest, |_| false)
}

fn free_sibling(dest: &Path, taken: impl Fn(&Path) -> bool) -> PathBuf {
    let parent = dest.parent().unwrap_or_else(|| Path::new(""));
    let stem = dest
        .file_stem()
        .map(|s| s.to_os_string())
        .unwrap_or_default();
    let ext = dest.extension();

    let mut counter = 1u32;
    loop {
        let mut name = OsString::from(&stem);
        name.push(format!("_{counter}"));
        if let Some(ext) = ext {
            name.push(".");
            name.push(ext);
        }
        let candidate = parent.join(name);
        if !taken(&candidate) && !candidate.exists() && !temp_path_for(&candidate).exists() {
            return candidate;
        }
        counter += 1;
    }
}

/// Destination paths owned by unfinished jobs.
///
/// A job keeps its claim across retries until it reaches a final state, so
/// its kept temp file is never picked up by another job. The second job to
/// want a path is moved to a free `name_N.ext` sibling.
#[derive(Debug, Default)]
pub struct DestinationClaims {
    owners: Mutex<HashMap<PathBuf, JobId>>,
}

impl DestinationClaims {
    pub fn new() -> Self {
        DestinationClaims::default()
    }

    /// `false` if another job holds `path`.
    pub fn claim(&self, path: &Path, job: JobId) -> bool {
        *self.lock().entry(path.to_path_buf()).or_insert(job) == job
    }

    /// Drop `job`'s claim on `path`, if it holds one.
    pub fn release(&self, path: &Path, job: JobId) {
        let mut owners = self.lock();
        if owners.get(path) == Some(&job) {
            owners.remove(path);
        }
    }

    /// Drop every claim held by `job`.
    pub fn release_job(&self, job: JobId) {
        self.lock().retain(|_, owner| *owner != job);
    }

    pub fn owner(&self, path: &Path) -> Option<JobId> {
        self.lock().get(path).copied()
    }

    /// Claim the first sibling of `dest` that is neither claimed nor on disk.
    pub fn claim_renamed(&self, dest: &Path, job: JobId) -> PathBuf {
        loop {
            let candidate = free_sibling(dest, |p| self.owner(p).is_some());
            if self.claim(&candidate, job) {
                return candidate;
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PathBuf, JobId>> {
        self.owners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
