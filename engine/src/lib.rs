//! # Ingest Engine - Card-to-Disk Transfer Library
//!
//! A headless ingest engine in Rust: it watches for memory cards and network
//! shares, sorts their files into a destination tree by extension, and copies
//! them with verification. Designed as the foundation for multiple hosts
//! (CLI, GUI, automation).
//!
//! ## Overview
//!
//! The engine provides:
//! - Drive monitoring by polling mount points
//! - Extension-based mapping rules with priorities
//! - A bounded worker pool fed from a priority queue
//! - Chunked, throttled, resumable copies verified by digest
//! - Duplicate detection (skip identical files, rename conflicts)
//! - Progress aggregation with speed and ETA
//! - Typed events delivered over channels or callbacks
//!
//! ## Basic Usage
//!
//! ```no_run
//! use ingest_engine::{
//!     EngineConfig, EngineEvent, IngestSession, MappingRuleConfig, Priority, SystemMounts,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EngineConfig {
//!     auto_start: true,
//!     mappings: vec![MappingRuleConfig {
//!         pattern: "*.jpg".into(),
//!         target: "/srv/library/photos".into(),
//!         priority: 0,
//!     }],
//!     ..EngineConfig::default()
//! };
//!
//! let mut session = IngestSession::new(config, SystemMounts)?;
//! let events = session.bus().subscribe();
//! session.start()?;
//!
//! // Manual submission works alongside auto-start
//! session.ingest_paths(&["/home/me/Downloads".into()], Priority::High)?;
//!
//! for event in events.iter() {
//!     if let EngineEvent::BatchFinished { summary, .. } = event {
//!         println!("{} files copied", summary.completed);
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - **model**: Core data structures (Drive, TransferJob, TransferBatch)
//! - **error**: Error types and failure reason codes
//! - **config**: Engine configuration and validation
//! - **checksums**: Digest computation, verification and manifests
//! - **mapping**: Extension pattern rules and resolution
//! - **duplicates**: Skip/rename/overwrite decisions for existing files
//! - **fs_ops**: Low-level filesystem operations
//! - **throttle**: Shared bandwidth limit
//! - **events**: Engine events and their delivery
//! - **progress**: Progress callbacks and aggregation
//! - **drives**: Drive monitoring
//! - **worker**: Single-file transfer
//! - **scheduler**: Job queue and worker pool
//! - **job**: Batch planning
//! - **session**: Drive monitor and scheduler wiring

pub mod checksums;
pub mod config;
pub mod drives;
pub mod duplicates;
pub mod error;
pub mod events;
pub mod fs_ops;
pub mod job;
pub mod mapping;
pub mod model;
pub mod progress;
pub mod scheduler;
pub mod session;
pub mod throttle;
pub mod worker;

// Re-export main types and functions
pub use checksums::{
    compute_file_checksum, compute_range_checksum, ChecksumAlgorithm, ChecksumRecord, ChecksumValue,
};
pub use config::{ConflictPolicy, EngineConfig, MappingRuleConfig};
pub use drives::{
    classify_mount, DriveActivity, DriveMonitor, ManualMounts, MonitorHandle, MountInfo, MountSource,
    SpaceProbe, SystemMounts,
};
pub use duplicates::{DestinationClaims, DuplicateDecision, DuplicateResolver};
pub use error::{EngineError, ErrorKind};
pub use events::{EngineEvent, EventBus, EventHandler};
pub use job::{create_job, plan_batch, plan_drive_batch, plan_paths, PlannedBatch};
pub use mapping::{resolve, MappingRule, RuleSet};
pub use model::{
    BatchId, BatchOrigin, BatchStatus, Drive, DriveId, DriveStatus, DriveType, JobFailure, JobId,
    JobStatus, Priority, TransferBatch, TransferJob,
};
pub use progress::{BatchSummary, GlobalProgress, ProgressAggregator, ProgressCallback};
pub use scheduler::{SchedulerHooks, TransferScheduler};
pub use session::IngestSession;
pub use throttle::Throttle;
pub use worker::{CancelReason, JobControl};
