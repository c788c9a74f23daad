//! Progress reporting.
//!
//! This module defines:
//! - `ProgressCallback`: how a worker reports on the job it is running
//! - `ProgressAggregator`: folds job progress into batch and global
//!   statistics (speed over a sliding window, ETA) and announces finished
//!   batches exactly once

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::info;

use crate::events::{EngineEvent, EventBus};
use crate::model::{BatchId, BatchStatus, JobFailure, JobId, JobStatus, TransferBatch, TransferJob};

/// Default width of the speed window.
pub const DEFAULT_SPEED_WINDOW: Duration = Duration::from_secs(3);

/// Minimum spacing between `Progress` events.
pub const PUBLISH_INTERVAL: Duration = Duration::from_millis(250);

/// Trait for receiving progress from a running transfer.
///
/// Called synchronously from the worker thread between chunks.
pub trait ProgressCallback: Send + Sync {
    /// `bytes_transferred` is the total written to the temp file so far.
    fn on_job_progress(&self, job: JobId, bytes_transferred: u64);

    /// The worker has parked on a pause request.
    fn on_job_paused(&self, job: JobId);

    /// The worker has left the parked state and continues copying.
    fn on_job_resumed(&self, job: JobId);
}

/// Aggregate view across all unfinished batches.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalProgress {
    pub bytes_done: u64,
    pub bytes_total: u64,
    /// Bytes per second over the speed window
    pub speed: f64,
    /// `None` while nothing is moving
    pub eta: Option<Duration>,
    pub active_batches: usize,
    pub jobs_finished: usize,
    pub jobs_total: usize,
}

/// Outcome of a finished batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchSummary {
    pub batch: BatchId,
    pub status: BatchStatus,
    pub total_jobs: usize,
    /// Includes skipped jobs
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub bytes_transferred: u64,
    pub failures: Vec<(PathBuf, JobFailure)>,
}

#[derive(Debug)]
struct JobTally {
    batch: BatchId,
    total: u64,
    done: u64,
    finished: bool,
}

#[derive(Debug)]
struct BatchTally {
    jobs: Vec<JobId>,
    statuses: Vec<JobStatus>,
    remaining: usize,
    skipped: usize,
    bytes_transferred: u64,
    failures: Vec<(PathBuf, JobFailure)>,
    finished: bool,
}

impl BatchTally {
    fn summary(&self, batch: BatchId) -> BatchSummary {
        let count = |s: JobStatus| self.statuses.iter().filter(|&&x| x == s).count();
        BatchSummary {
            batch,
            status: BatchStatus::derive(self.statuses.iter().copied()),
            total_jobs: self.jobs.len(),
            completed: count(JobStatus::Completed),
            skipped: self.skipped,
            failed: count(JobStatus::Error),
            cancelled: count(JobStatus::Cancelled),
            bytes_transferred: self.bytes_transferred,
            failures: self.failures.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct AggregatorState {
    jobs: HashMap<JobId, JobTally>,
    batches: HashMap<BatchId, BatchTally>,
    /// (time, cumulative bytes moved)
    samples: VecDeque<(Instant, u64)>,
    moved: u64,
    last_publish: Option<Instant>,
}

pub struct ProgressAggregator {
    state: Mutex<AggregatorState>,
    bus: EventBus,
    window: Duration,
}

impl ProgressAggregator {
    pub fn new(bus: EventBus) -> Self {
        ProgressAggregator::with_window(bus, DEFAULT_SPEED_WINDOW)
    }

    pub fn with_window(bus: EventBus, window: Duration) -> Self {
        ProgressAggregator {
            state: Mutex::new(AggregatorState::default()),
            bus,
            window,
        }
    }

    /// Start tracking a batch. Jobs already final at registration count
    /// towards its summary immediately; an empty batch finishes at once.
    pub fn register_batch(&self, batch: &TransferBatch) -> Option<BatchSummary> {
        let summary = {
            let mut state = self.lock();
            let mut tally = BatchTally {
                jobs: batch.jobs.iter().map(|j| j.id).collect(),
                statuses: batch.jobs.iter().map(|j| j.status).collect(),
                remaining: 0,
                skipped: 0,
                bytes_transferred: 0,
                failures: Vec::new(),
                finished: false,
            };
            for job in &batch.jobs {
                let finished = job.status.is_final();
                if finished {
                    tally.bytes_transferred += job.bytes_transferred;
                    tally.skipped += usize::from(job.skipped);
                } else {
                    tally.remaining += 1;
                }
                state.jobs.insert(
                    job.id,
                    JobTally {
                        batch: batch.id,
                        total: job.expected_size,
                        done: if finished { job.expected_size } else { 0 },
                        finished,
                    },
                );
            }
            let summary = if tally.remaining == 0 {
                tally.finished = true;
                Some(tally.summary(batch.id))
            } else {
                None
            };
            state.batches.insert(batch.id, tally);
            summary
        };
        if let Some(summary) = &summary {
            self.publish_finished(summary.clone());
        }
        summary
    }

    pub fn on_job_progress(&self, job: JobId, bytes: u64) {
        self.on_job_progress_at(job, bytes, Instant::now());
    }

    pub(crate) fn on_job_progress_at(&self, job: JobId, bytes: u64, now: Instant) {
        let snapshot = {
            let mut state = self.lock();
            let Some(tally) = state.jobs.get_mut(&job) else {
                return;
            };
            // A restart from zero lowers `done` without moving bytes
            let delta = bytes.saturating_sub(tally.done);
            tally.done = bytes;
            state.moved += delta;
            let moved = state.moved;
            state.samples.push_back((now, moved));
            self.prune(&mut state, now);

            let due = state
                .last_publish
                .map_or(true, |t| now.saturating_duration_since(t) >= PUBLISH_INTERVAL);
            if due {
                state.last_publish = Some(now);
                Some(self.snapshot_locked(&state, now))
            } else {
                None
            }
        };
        if let Some(snapshot) = snapshot {
            self.bus.publish(EngineEvent::Progress(snapshot));
        }
    }

    /// Record a job reaching a state it will not leave. Returns the batch
    /// summary when this was the batch's last outstanding job.
    pub fn on_job_terminal(&self, job: &TransferJob) -> Option<BatchSummary> {
        let summary = {
            let mut state = self.lock();
            let batch_id = match state.jobs.get_mut(&job.id) {
                Some(tally) if !tally.finished => {
                    tally.finished = true;
                    if job.status == JobStatus::Completed {
                        tally.done = tally.total;
                    }
                    tally.batch
                }
                _ => return None,
            };
            let batch = state.batches.get_mut(&batch_id)?;
            if let Some(pos) = batch.jobs.iter().position(|id| *id == job.id) {
                batch.statuses[pos] = job.status;
            }
            batch.remaining = batch.remaining.saturating_sub(1);
            if job.status == JobStatus::Completed {
                batch.bytes_transferred += job.bytes_transferred;
            }
            if job.skipped {
                batch.skipped += 1;
            }
            if let Some(failure) = &job.failure {
                if job.status != JobStatus::Completed {
                    batch.failures.push((job.source_path.clone(), failure.clone()));
                }
            }
            if batch.remaining == 0 && !batch.finished {
                batch.finished = true;
                Some(batch.summary(batch_id))
            } else {
                None
            }
        };
        if let Some(summary) = &summary {
            self.publish_finished(summary.clone());
        }
        summary
    }

    /// Bytes per second over the sliding window.
    pub fn speed(&self) -> f64 {
        self.speed_at(Instant::now())
    }

    pub(crate) fn speed_at(&self, now: Instant) -> f64 {
        let mut state = self.lock();
        self.prune(&mut state, now);
        speed_of(&state.samples, now)
    }

    /// Estimated time to drain all unfinished batches.
    pub fn eta(&self) -> Option<Duration> {
        let now = Instant::now();
        let mut state = self.lock();
        self.prune(&mut state, now);
        self.snapshot_locked(&state, now).eta
    }

    pub fn snapshot(&self) -> GlobalProgress {
        let now = Instant::now();
        let mut state = self.lock();
        self.prune(&mut state, now);
        self.snapshot_locked(&state, now)
    }

    /// Summary of a batch, finished or not.
    pub fn batch_summary(&self, batch: BatchId) -> Option<BatchSummary> {
        let state = self.lock();
        state.batches.get(&batch).map(|b| b.summary(batch))
    }

    /// Drop bookkeeping for a finished batch.
    pub fn forget_batch(&self, batch: BatchId) {
        let mut state = self.lock();
        if let Some(tally) = state.batches.remove(&batch) {
            for id in tally.jobs {
                state.jobs.remove(&id);
            }
        }
    }

    fn snapshot_locked(&self, state: &AggregatorState, now: Instant) -> GlobalProgress {
        let mut bytes_done = 0;
        let mut bytes_total = 0;
        let mut jobs_finished = 0;
        let mut jobs_total = 0;
        let mut active_batches = 0;
        for batch in state.batches.values().filter(|b| !b.finished) {
            active_batches += 1;
            for id in &batch.jobs {
                if let Some(job) = state.jobs.get(id) {
                    bytes_done += job.done.min(job.total);
                    bytes_total += job.total;
                    jobs_total += 1;
                    jobs_finished += usize::from(job.finished);
                }
            }
        }
        let speed = speed_of(&state.samples, now);
        let remaining = bytes_total.saturating_sub(bytes_done);
        let eta = if speed > 0.0 {
            Some(Duration::from_secs_f64(remaining as f64 / speed))
        } else {
            None
        };
        GlobalProgress {
            bytes_done,
            bytes_total,
            speed,
            eta,
            active_batches,
            jobs_finished,
            jobs_total,
        }
    }

    /// Keep at most one sample older than the window as the baseline.
    fn prune(&self, state: &mut AggregatorState, now: Instant) {
        while state.samples.len() >= 2
            && now.saturating_duration_since(state.samples[1].0) >= self.window
        {
            state.samples.pop_front();
        }
        if state.samples.len() == 1
            && now.saturating_duration_since(state.samples[0].0) >= self.window
        {
            state.samples.clear();
        }
    }

    fn publish_finished(&self, summary: BatchSummary) {
        info!(
            batch = %summary.batch,
            status = %summary.status,
            completed = summary.completed,
            failed = summary.failed,
            cancelled = summary.cancelled,
            bytes = summary.bytes_transferred,
            "batch finished"
        );
        self.bus.publish(EngineEvent::BatchFinished {
            batch: summary.batch,
            summary,
        });
    }

    fn lock(&self) -> MutexGuard<'_, AggregatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn speed_of(samples: &VecDeque<(Instant, u64)>, now: Instant) -> f64 {
    match (samples.front(), samples.back()) {
        (Some(&(t0, first)), Some(&(_, last))) if samples.len() >= 2 => {
            let elapsed = now.saturating_duration_since(t0).as_secs_f64();
            if elapsed > 0.0 {
                (last - first) as f64 / elapsed
            } else {
                0.0
            }
        }
        _ => 0.0,
    }
}
