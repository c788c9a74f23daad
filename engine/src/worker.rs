//! Single-file transfer.
//!
//! A [`TransferWorker`] runs one [`WorkOrder`]: it consults the duplicate
//! resolver, copies the source into a `.ingest-part` temp file in chunks
//! (throttled, pausable, cancellable), verifies the temp file against the
//! digest computed during the copy, and renames it into place.
//!
//! Interrupted copies leave the temp file behind. The next attempt checks
//! the kept prefix byte-for-byte against the source before trusting it.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::checksums::{compute_file_checksum, create_hasher, ChecksumAlgorithm, ChecksumHasher, ChecksumValue};
use crate::config::EngineConfig;
use crate::drives::SpaceProbe;
use crate::duplicates::{rename_target, DestinationClaims, DuplicateDecision, DuplicateResolver, FileMeta};
use crate::error::{EngineError, ErrorKind};
use crate::fs_ops::{ensure_parent_dir_exists, promote_temp, remove_file_quiet, temp_path_for};
use crate::model::{DriveId, JobId};
use crate::progress::ProgressCallback;
use crate::throttle::Throttle;

const VERIFY_BUFFER_SIZE: usize = 64 * 1024;

/// Why a running job was told to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// Explicit cancel request
    User,
    /// The job's drive disappeared
    DriveVanished,
    /// Another job in the batch failed fatally
    BatchAborted,
    /// Scheduler shutdown; the temp file is kept for a later resume
    Shutdown,
}

impl CancelReason {
    pub fn kind(self) -> ErrorKind {
        match self {
            CancelReason::User => ErrorKind::Cancelled,
            CancelReason::DriveVanished => ErrorKind::DriveVanished,
            CancelReason::BatchAborted => ErrorKind::BatchAborted,
            CancelReason::Shutdown => ErrorKind::Shutdown,
        }
    }
}

#[derive(Debug, Default)]
struct ControlState {
    paused: bool,
    cancelled: Option<CancelReason>,
}

/// Pause and cancel signals for one running job.
///
/// Signals are observed by the worker between chunks.
#[derive(Debug, Default)]
pub struct JobControl {
    state: Mutex<ControlState>,
    wake: Condvar,
}

impl JobControl {
    pub fn new() -> Self {
        JobControl::default()
    }

    pub fn pause(&self) {
        self.lock().paused = true;
    }

    pub fn resume(&self) {
        self.lock().paused = false;
        self.wake.notify_all();
    }

    /// Request cancellation. The first reason given wins.
    pub fn cancel(&self, reason: CancelReason) {
        let mut state = self.lock();
        if state.cancelled.is_none() {
            state.cancelled = Some(reason);
        }
        drop(state);
        self.wake.notify_all();
    }

    pub fn cancel_reason(&self) -> Option<CancelReason> {
        self.lock().cancelled
    }

    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    /// Block while paused. `on_park` and `on_unpark` run without the
    /// control lock held, around the parked period.
    pub fn checkpoint(
        &self,
        on_park: impl FnOnce(),
        on_unpark: impl FnOnce(),
    ) -> Result<(), CancelReason> {
        let state = self.lock();
        if let Some(reason) = state.cancelled {
            return Err(reason);
        }
        if !state.paused {
            return Ok(());
        }
        drop(state);

        on_park();
        let mut state = self.lock();
        while state.paused && state.cancelled.is_none() {
            state = self.wake.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
        let cancelled = state.cancelled;
        drop(state);

        match cancelled {
            Some(reason) => Err(reason),
            None => {
                on_unpark();
                Ok(())
            }
        }
    }

    /// Sleep for `duration`, waking early on cancellation.
    pub fn sleep(&self, duration: Duration) -> Result<(), CancelReason> {
        if duration.is_zero() {
            return match self.cancel_reason() {
                Some(reason) => Err(reason),
                None => Ok(()),
            };
        }
        let deadline = Instant::now() + duration;
        let mut state = self.lock();
        loop {
            if let Some(reason) = state.cancelled {
                return Err(reason);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            state = self
                .wake
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn lock(&self) -> MutexGuard<'_, ControlState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Everything a worker needs to know about the job it runs.
#[derive(Debug, Clone)]
pub struct WorkOrder {
    pub job: JobId,
    pub source: PathBuf,
    pub destination: PathBuf,
    pub expected_size: u64,
    /// Bytes of the temp file believed to match the source
    pub confirmed_offset: u64,
    /// Ignore any existing temp file
    pub restart: bool,
    pub source_drive: Option<DriveId>,
}

/// Per-dispatch settings taken from the engine configuration.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub chunk_size: usize,
    pub algorithm: ChecksumAlgorithm,
    pub delete_source: bool,
    pub resolver: DuplicateResolver,
}

impl WorkerSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        WorkerSettings {
            chunk_size: config.chunk_size,
            algorithm: config.verify_algorithm,
            delete_source: config.delete_source,
            resolver: DuplicateResolver::from_config(config),
        }
    }
}

/// Result of a successful job.
#[derive(Debug, Clone, PartialEq)]
pub struct CopyReport {
    /// Final path, which a rename decision may have changed
    pub destination: PathBuf,
    /// Total bytes in the destination
    pub bytes: u64,
    /// Offset the copy resumed from after prefix verification
    pub resumed_from: u64,
    pub source_checksum: Option<ChecksumValue>,
    pub dest_checksum: Option<ChecksumValue>,
    /// An identical file was already in place
    pub skipped: bool,
}

#[derive(Debug)]
pub enum WorkOutcome {
    Completed(CopyReport),
    Failed {
        error: EngineError,
        /// Offset to resume from on retry
        confirmed_offset: u64,
        destination: PathBuf,
    },
    Cancelled {
        reason: CancelReason,
        destination: PathBuf,
    },
}

enum Stop {
    Failed(EngineError, u64),
    Cancelled(CancelReason),
}

pub struct TransferWorker<'a> {
    settings: &'a WorkerSettings,
    throttle: &'a Throttle,
    control: &'a JobControl,
    progress: &'a dyn ProgressCallback,
    space: Option<&'a dyn SpaceProbe>,
    claims: Option<&'a DestinationClaims>,
}

impl<'a> TransferWorker<'a> {
    pub fn new(
        settings: &'a WorkerSettings,
        throttle: &'a Throttle,
        control: &'a JobControl,
        progress: &'a dyn ProgressCallback,
    ) -> Self {
        TransferWorker {
            settings,
            throttle,
            control,
            progress,
            space: None,
            claims: None,
        }
    }

    pub fn with_space_probe(mut self, space: Option<&'a dyn SpaceProbe>) -> Self {
        self.space = space;
        self
    }

    /// Share destination claims with the other workers of a pool. Claims
    /// taken by a run are left for the owner to release once the job is
    /// final.
    pub fn with_claims(mut self, claims: Option<&'a DestinationClaims>) -> Self {
        self.claims = claims;
        self
    }

    pub fn run(&self, order: &WorkOrder) -> WorkOutcome {
        let destination = match self.resolve_destination(order) {
            Ok(Some(destination)) => destination,
            Ok(None) => return self.finish_skipped(order),
            Err(error) => {
                return WorkOutcome::Failed {
                    error,
                    confirmed_offset: order.confirmed_offset,
                    destination: order.destination.clone(),
                }
            }
        };

        match self.copy(order, &destination) {
            Ok(report) => WorkOutcome::Completed(report),
            Err(Stop::Failed(error, confirmed_offset)) => WorkOutcome::Failed {
                error,
                confirmed_offset,
                destination,
            },
            Err(Stop::Cancelled(reason)) => {
                if reason != CancelReason::Shutdown {
                    remove_file_quiet(&temp_path_for(&destination));
                }
                debug!(job = %order.job, ?reason, "transfer cancelled");
                WorkOutcome::Cancelled {
                    reason,
                    destination,
                }
            }
        }
    }

    /// Pick and claim the path to write. `Ok(None)` means the destination
    /// already holds this file.
    fn resolve_destination(&self, order: &WorkOrder) -> Result<Option<PathBuf>, EngineError> {
        let dest = &order.destination;
        if let Some(claims) = self.claims {
            if !claims.claim(dest, order.job) {
                debug!(job = %order.job, path = %dest.display(), "destination held by another job");
                return Ok(Some(claims.claim_renamed(dest, order.job)));
            }
        }

        Ok(match self.existing_decision(order)? {
            None | Some(DuplicateDecision::Overwrite) => Some(dest.clone()),
            Some(DuplicateDecision::Skip) => None,
            Some(DuplicateDecision::Rename) => Some(match self.claims {
                Some(claims) => {
                    claims.release(dest, order.job);
                    claims.claim_renamed(dest, order.job)
                }
                None => rename_target(dest),
            }),
        })
    }

    /// `None` when nothing is at the destination yet.
    fn existing_decision(&self, order: &WorkOrder) -> Result<Option<DuplicateDecision>, EngineError> {
        let dest = &order.destination;
        if !dest.exists() {
            return Ok(None);
        }
        if dest.is_dir() {
            return Ok(Some(DuplicateDecision::Rename));
        }

        let meta = fs::metadata(&order.source).map_err(|e| self.source_error(order, e))?;
        let source = FileMeta {
            path: order.source.clone(),
            size: meta.len(),
        };
        let existing = FileMeta::read(dest)?;
        let decision = self.settings.resolver.decide(&source, &existing)?;
        debug!(job = %order.job, path = %dest.display(), ?decision, "destination exists");
        Ok(Some(decision))
    }

    fn finish_skipped(&self, order: &WorkOrder) -> WorkOutcome {
        info!(job = %order.job, path = %order.destination.display(), "identical file already present, skipping");
        if self.settings.delete_source {
            self.delete_source(order);
        }
        WorkOutcome::Completed(CopyReport {
            destination: order.destination.clone(),
            bytes: order.expected_size,
            resumed_from: 0,
            source_checksum: None,
            dest_checksum: None,
            skipped: true,
        })
    }

    fn copy(&self, order: &WorkOrder, destination: &Path) -> Result<CopyReport, Stop> {
        let algorithm = self.settings.algorithm;
        let temp = temp_path_for(destination);
        ensure_parent_dir_exists(destination).map_err(|e| Stop::Failed(e, order.confirmed_offset))?;

        let mut src = File::open(&order.source)
            .map_err(|e| Stop::Failed(self.source_error(order, e), order.confirmed_offset))?;
        let src_meta = src
            .metadata()
            .map_err(|e| Stop::Failed(self.source_error(order, e), order.confirmed_offset))?;
        let src_len = src_meta.len();
        let mtime = src_meta.modified().ok();

        let mut out = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&temp)
            .map_err(|e| Stop::Failed(write_error(&temp, e, src_len), order.confirmed_offset))?;
        let existing = out.metadata().map(|m| m.len()).unwrap_or(0);

        let candidate = if order.restart {
            0
        } else if order.confirmed_offset > 0 {
            order.confirmed_offset
        } else {
            existing
        }
        .min(existing)
        .min(src_len);

        let mut hasher = create_hasher(algorithm);
        let mut offset = 0;
        if candidate > 0 {
            match verify_prefix(&mut src, &mut out, &order.source, &temp, candidate, hasher.as_mut()) {
                Ok(true) => {
                    debug!(job = %order.job, offset = candidate, "resuming from verified prefix");
                    offset = candidate;
                }
                Ok(false) => {
                    warn!(job = %order.job, path = %temp.display(), "kept prefix does not match source, restarting");
                    hasher = create_hasher(algorithm);
                }
                Err(e) => return Err(Stop::Failed(e, candidate)),
            }
        }

        let seek = |file: &mut File, path: &Path| {
            file.seek(SeekFrom::Start(offset)).map(|_| ()).map_err(|e| EngineError::ReadError {
                path: path.to_path_buf(),
                source: e,
            })
        };
        out.set_len(offset)
            .map_err(|e| Stop::Failed(write_error(&temp, e, src_len), offset))?;
        seek(&mut out, &temp).map_err(|e| Stop::Failed(e, offset))?;
        seek(&mut src, &order.source).map_err(|e| Stop::Failed(e, offset))?;

        if let Some(available) = self.space.and_then(|s| s.available_space(destination)) {
            let required = src_len.saturating_sub(offset);
            if available < required {
                drop(out);
                remove_file_quiet(&temp);
                return Err(Stop::Failed(
                    EngineError::InsufficientSpace {
                        path: destination.to_path_buf(),
                        required,
                        available,
                    },
                    0,
                ));
            }
        }

        let resumed_from = offset;
        self.progress.on_job_progress(order.job, offset);

        let chunk = self.settings.chunk_size.max(1);
        let mut buffer = vec![0u8; chunk];
        loop {
            self.control
                .checkpoint(
                    || self.progress.on_job_paused(order.job),
                    || self.progress.on_job_resumed(order.job),
                )
                .map_err(Stop::Cancelled)?;

            let want = src_len.saturating_sub(offset).clamp(1, chunk as u64);
            self.control
                .sleep(self.throttle.reserve(want))
                .map_err(Stop::Cancelled)?;

            let n = match src.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Stop::Failed(self.source_error(order, e), offset)),
            };
            out.write_all(&buffer[..n])
                .map_err(|e| Stop::Failed(write_error(&temp, e, src_len.saturating_sub(offset)), offset))?;
            hasher.update(&buffer[..n]);
            offset += n as u64;
            self.progress.on_job_progress(order.job, offset);
        }

        out.sync_all()
            .map_err(|e| Stop::Failed(write_error(&temp, e, 0), offset))?;
        drop(out);
        drop(src);

        let source_checksum = hasher.finalize();
        let dest_checksum =
            compute_file_checksum(&temp, algorithm).map_err(|e| Stop::Failed(e, offset))?;
        if source_checksum != dest_checksum {
            remove_file_quiet(&temp);
            return Err(Stop::Failed(
                EngineError::VerificationFailed {
                    path: destination.to_path_buf(),
                    expected: source_checksum.to_string(),
                    actual: dest_checksum.to_string(),
                },
                0,
            ));
        }

        promote_temp(&temp, destination, mtime).map_err(|e| Stop::Failed(e, offset))?;
        info!(
            job = %order.job,
            path = %destination.display(),
            bytes = offset,
            checksum = %source_checksum.to_string_with_algo(),
            "transfer completed"
        );

        if self.settings.delete_source {
            self.delete_source(order);
        }

        Ok(CopyReport {
            destination: destination.to_path_buf(),
            bytes: offset,
            resumed_from,
            source_checksum: Some(source_checksum),
            dest_checksum: Some(dest_checksum),
            skipped: false,
        })
    }

    fn delete_source(&self, order: &WorkOrder) {
        match fs::remove_file(&order.source) {
            Ok(()) => debug!(job = %order.job, path = %order.source.display(), "source deleted"),
            Err(e) => warn!(job = %order.job, path = %order.source.display(), error = %e, "could not delete source"),
        }
    }

    fn source_error(&self, order: &WorkOrder, err: io::Error) -> EngineError {
        if let Some(drive) = &order.source_drive {
            if !drive.mount_point().exists() {
                return EngineError::DriveVanished {
                    drive: drive.mount_point().to_path_buf(),
                };
            }
        }
        match err.kind() {
            io::ErrorKind::NotFound => EngineError::SourceNotFound {
                path: order.source.clone(),
            },
            io::ErrorKind::PermissionDenied => EngineError::SourceAccessDenied {
                path: order.source.clone(),
                source: err,
            },
            _ => EngineError::ReadError {
                path: order.source.clone(),
                source: err,
            },
        }
    }
}

fn is_disk_full(err: &io::Error) -> bool {
    // ENOSPC / ERROR_DISK_FULL
    match err.raw_os_error() {
        Some(28) => cfg!(unix),
        Some(112) => cfg!(windows),
        _ => false,
    }
}

fn write_error(path: &Path, err: io::Error, required: u64) -> EngineError {
    if is_disk_full(&err) {
        EngineError::InsufficientSpace {
            path: path.to_path_buf(),
            required,
            available: 0,
        }
    } else {
        EngineError::WriteError {
            path: path.to_path_buf(),
            source: err,
        }
    }
}

/// Compare the first `len` bytes of `src` and `temp`, feeding the source
/// bytes into `hasher`. Both files are read from the start.
fn verify_prefix(
    src: &mut File,
    temp: &mut File,
    src_path: &Path,
    temp_path: &Path,
    len: u64,
    hasher: &mut dyn ChecksumHasher,
) -> Result<bool, EngineError> {
    let read_err = |path: &Path| {
        let path = path.to_path_buf();
        move |e: io::Error| EngineError::ReadError { path, source: e }
    };
    src.seek(SeekFrom::Start(0)).map_err(read_err(src_path))?;
    temp.seek(SeekFrom::Start(0)).map_err(read_err(temp_path))?;

    let mut a = vec![0u8; VERIFY_BUFFER_SIZE];
    let mut b = vec![0u8; VERIFY_BUFFER_SIZE];
    let mut remaining = len;
    while remaining > 0 {
        let n = remaining.min(VERIFY_BUFFER_SIZE as u64) as usize;
        src.read_exact(&mut a[..n]).map_err(read_err(src_path))?;
        match temp.read_exact(&mut b[..n]) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(false),
            Err(e) => return Err(read_err(temp_path)(e)),
        }
        if a[..n] != b[..n] {
            return Ok(false);
        }
        hasher.update(&a[..n]);
        remaining -= n as u64;
    }
    Ok(true)
}
