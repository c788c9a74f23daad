//! ingest - Command-line host for the ingest engine.
//!
//! Loads configuration, installs logging and drives the engine: watching
//! for drives, copying paths by hand, listing drives and hashing files.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand};
use crossbeam_channel::RecvTimeoutError;
use ingest_engine::checksums::{generate_checksum_file, manifest_algorithm, verify_checksum_file};
use ingest_engine::{
    compute_file_checksum, BatchSummary, ChecksumAlgorithm, ConflictPolicy, DriveMonitor,
    EngineConfig, EngineEvent, EventBus, GlobalProgress, IngestSession, JobStatus, ManualMounts,
    MappingRuleConfig, MountInfo, MountSource, Priority, SystemMounts,
};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// ingest - card-to-disk ingest with verification
#[derive(Parser, Debug)]
#[command(name = "ingest")]
#[command(version = "0.1.0")]
#[command(about = "Sort and copy files from cards and shares with verification")]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Watch for drives and ingest them as they appear
    Watch {
        /// Stop after this many seconds instead of running until killed
        #[arg(long, value_name = "SECS")]
        duration: Option<u64>,

        /// Treat a directory as a removable drive instead of polling the
        /// system mounts (repeatable)
        #[arg(long = "mount", value_name = "DIR")]
        mounts: Vec<PathBuf>,

        #[command(flatten)]
        overrides: Overrides,
    },

    /// Copy files and directories through the mapping rules
    Copy {
        /// Files or directories to ingest
        #[arg(required = true, value_name = "PATH")]
        paths: Vec<PathBuf>,

        /// Directory for files no mapping rule claims
        #[arg(long, value_name = "DIR")]
        to: Option<PathBuf>,

        /// Scheduling priority: high, normal or low
        #[arg(long, value_name = "PRIORITY", default_value = "normal")]
        priority: String,

        /// Print every finished file
        #[arg(long)]
        verbose: bool,

        #[command(flatten)]
        overrides: Overrides,
    },

    /// List the drives currently attached
    Drives,

    /// Print file digests, write a manifest, or check one
    Hash {
        /// Files to hash
        #[arg(value_name = "FILE")]
        files: Vec<PathBuf>,

        /// Checksum algorithm: sha256, blake3, md5, xxh64, crc32
        #[arg(long, value_name = "ALGORITHM", default_value = "sha256")]
        algo: String,

        /// Write a manifest of the digests to this file
        #[arg(long, value_name = "FILE")]
        manifest: Option<PathBuf>,

        /// Verify the files listed in this manifest
        #[arg(long, value_name = "FILE", conflicts_with = "manifest")]
        check: Option<PathBuf>,
    },
}

/// Command-line values that take precedence over the configuration file.
#[derive(Args, Debug, Default, Clone)]
struct Overrides {
    /// Number of simultaneous transfers
    #[arg(long, value_name = "N")]
    parallel: Option<usize>,

    /// Bandwidth limit in MB/s (0 = unlimited)
    #[arg(long, value_name = "MB/S")]
    bandwidth: Option<f64>,

    /// Delete each source file after a verified copy
    #[arg(long)]
    delete_source: bool,

    /// Start ingesting new drives without asking
    #[arg(long)]
    auto_start: bool,

    /// Verification algorithm: sha256, blake3, md5, xxh64, crc32
    #[arg(long, value_name = "ALGORITHM")]
    verify: Option<String>,

    /// What to do when a different file already has the name: rename or overwrite
    #[arg(long, value_name = "POLICY")]
    on_conflict: Option<String>,
}

/// Renders global progress to stderr.
struct ProgressPrinter {
    verbose: bool,
    start_time: Instant,
    last_update: Option<Instant>,
}

impl ProgressPrinter {
    fn new(verbose: bool) -> Self {
        ProgressPrinter {
            verbose,
            start_time: Instant::now(),
            last_update: None,
        }
    }

    fn format_bytes(bytes: u64) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
        let mut size = bytes as f64;
        let mut unit_idx = 0;

        while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
            size /= 1024.0;
            unit_idx += 1;
        }

        format!("{:.2} {}", size, UNITS[unit_idx])
    }

    fn format_duration(elapsed: Duration) -> String {
        let secs = elapsed.as_secs();
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        let secs = secs % 60;

        if hours > 0 {
            format!("{}h {}m {}s", hours, mins, secs)
        } else if mins > 0 {
            format!("{}m {}s", mins, secs)
        } else {
            format!("{}s", secs)
        }
    }

    fn print_progress_bar(percent: u32) -> String {
        let filled = (percent.min(100) / 5) as usize;
        let empty = 20 - filled;
        format!("[{}{}] {}%", "=".repeat(filled), " ".repeat(empty), percent)
    }

    fn on_progress(&mut self, progress: &GlobalProgress) {
        // At most five redraws per second
        if self
            .last_update
            .is_some_and(|t| t.elapsed() < Duration::from_millis(200))
        {
            return;
        }
        self.last_update = Some(Instant::now());

        let total = progress.bytes_total.max(1);
        let percent = (progress.bytes_done as f64 / total as f64 * 100.0) as u32;
        let eta = progress
            .eta
            .map(Self::format_duration)
            .unwrap_or_else(|| "--".to_string());
        eprint!(
            "\rProgress: {} | {}/{} | {}/s | ETA {}   ",
            Self::print_progress_bar(percent),
            Self::format_bytes(progress.bytes_done),
            Self::format_bytes(progress.bytes_total),
            Self::format_bytes(progress.speed as u64),
            eta
        );
        let _ = std::io::Write::flush(&mut std::io::stderr());
    }

    fn on_job_finished(&self, source: Option<&Path>, status: JobStatus) {
        if !self.verbose {
            return;
        }
        let name = source
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .unwrap_or("(unknown)");
        eprintln!("\r{}: {}", status, name);
    }

    fn on_batch_finished(&self, summary: &BatchSummary) {
        eprintln!();
        eprintln!("Transfer complete!");
        eprintln!(
            "Summary: {} done, {} skipped, {} failed, {} cancelled",
            summary.completed - summary.skipped,
            summary.skipped,
            summary.failed,
            summary.cancelled
        );
        eprintln!("Bytes copied: {}", Self::format_bytes(summary.bytes_transferred));
        eprintln!("Elapsed: {}", Self::format_duration(self.start_time.elapsed()));

        if !summary.failures.is_empty() {
            eprintln!();
            eprintln!("Failed files:");
            for (path, failure) in &summary.failures {
                let name = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or("(unknown)");
                eprintln!("  {}: {}", name, failure);
            }
        }
    }
}

/// Parse arguments, install logging, then run the command
fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let exit_code = match run_cli(&cli) {
        Ok(true) => 0,
        Ok(false) => 1,
        Err(msg) => {
            eprintln!("Error: {}", msg);
            2
        }
    };

    std::process::exit(exit_code);
}

/// Main CLI logic - separated for testability.
///
/// Returns `Ok(false)` when the command ran but something failed, and
/// `Err` for usage and configuration errors.
fn run_cli(cli: &Cli) -> Result<bool, String> {
    match &cli.command {
        Command::Watch {
            duration,
            mounts,
            overrides,
        } => {
            let config = load_config(cli.config.as_deref(), overrides)?;
            run_watch(config, duration.map(Duration::from_secs), mounts)
        }
        Command::Copy {
            paths,
            to,
            priority,
            verbose,
            overrides,
        } => {
            let mut config = load_config(cli.config.as_deref(), overrides)?;
            if let Some(to) = to {
                config.mappings.push(MappingRuleConfig {
                    pattern: "*".to_string(),
                    target: to.clone(),
                    priority: i32::MIN,
                });
            }
            if config.mappings.is_empty() {
                return Err("No mapping rules: pass --to or a config with mappings".to_string());
            }
            let priority: Priority = priority.parse().map_err(|e| format!("{}", e))?;
            run_copy(config, paths, priority, *verbose)
        }
        Command::Drives => run_drives(),
        Command::Hash {
            files,
            algo,
            manifest,
            check,
        } => {
            let algorithm: ChecksumAlgorithm = algo.parse().map_err(|e| format!("{}", e))?;
            match check {
                Some(check) => run_hash_check(check, algorithm),
                None if files.is_empty() => Err("No files to hash".to_string()),
                None => run_hash(files, algorithm, manifest.as_deref()),
            }
        }
    }
}

/// Read the configuration file, if any, and apply command-line overrides.
fn load_config(path: Option<&Path>, overrides: &Overrides) -> Result<EngineConfig, String> {
    let mut config = match path {
        Some(path) => {
            let text = fs::read_to_string(path)
                .map_err(|e| format!("Cannot read config {}: {}", path.display(), e))?;
            toml::from_str::<EngineConfig>(&text)
                .map_err(|e| format!("Invalid config {}: {}", path.display(), e))?
        }
        None => EngineConfig::default(),
    };

    if let Some(parallel) = overrides.parallel {
        config.parallel_transfers = parallel;
    }
    if let Some(bandwidth) = overrides.bandwidth {
        config.bandwidth_limit = bandwidth;
    }
    if overrides.delete_source {
        config.delete_source = true;
    }
    if overrides.auto_start {
        config.auto_start = true;
    }
    if let Some(verify) = &overrides.verify {
        config.verify_algorithm = verify.parse().map_err(|e| format!("{}", e))?;
    }
    if let Some(policy) = &overrides.on_conflict {
        config.on_conflict = match policy.to_lowercase().as_str() {
            "rename" => ConflictPolicy::Rename,
            "overwrite" => ConflictPolicy::Overwrite,
            _ => {
                return Err(format!(
                    "Invalid conflict policy '{}'. Must be 'rename' or 'overwrite'",
                    policy
                ))
            }
        };
    }

    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}

fn run_watch(config: EngineConfig, duration: Option<Duration>, mounts: &[PathBuf]) -> Result<bool, String> {
    let session = if mounts.is_empty() {
        IngestSession::new(config, SystemMounts)
    } else {
        let manual = Arc::new(ManualMounts::new());
        for dir in mounts {
            if !dir.is_dir() {
                return Err(format!("Mount is not a directory: {}", dir.display()));
            }
            let (total, free) = host_capacity(dir);
            manual.insert(MountInfo::removable(dir, total, free));
        }
        IngestSession::new(config, manual)
    };
    let mut session = session.map_err(|e| e.to_string())?;

    let events = session.bus().subscribe();
    session.start().map_err(|e| e.to_string())?;
    info!("watching for drives");

    let deadline = duration.map(|d| Instant::now() + d);
    let mut failures = 0usize;
    loop {
        let timeout = match deadline {
            Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                Some(left) => left,
                None => break,
            },
            None => Duration::from_secs(3600),
        };
        match events.recv_timeout(timeout) {
            Ok(event) => {
                if let EngineEvent::BatchFinished { summary, .. } = &event {
                    failures += summary.failed;
                }
                log_event(&event);
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    session.stop();
    info!("watch finished");
    Ok(failures == 0)
}

/// Capacity of the system mount holding `dir`, so a directory standing in
/// for a card reports real free space.
fn host_capacity(dir: &Path) -> (u64, u64) {
    let dir = fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf());
    SystemMounts
        .mounts()
        .unwrap_or_default()
        .into_iter()
        .filter(|m| dir.starts_with(&m.mount_point))
        .max_by_key(|m| m.mount_point.components().count())
        .map(|m| (m.total_bytes, m.free_bytes))
        .unwrap_or((u64::MAX, u64::MAX))
}

fn log_event(event: &EngineEvent) {
    match event {
        EngineEvent::JobStatusChanged {
            job,
            status,
            reason: Some(reason),
            ..
        } => debug!(job = %job, status = %status, reason = %reason, "job status changed"),
        EngineEvent::JobStatusChanged { job, status, .. } => {
            debug!(job = %job, status = %status, "job status changed")
        }
        EngineEvent::Progress(progress) => debug!(
            done = progress.bytes_done,
            total = progress.bytes_total,
            speed = progress.speed,
            "progress"
        ),
        _ => {}
    }
}

fn run_copy(config: EngineConfig, paths: &[PathBuf], priority: Priority, verbose: bool) -> Result<bool, String> {
    let session = IngestSession::new(config, ManualMounts::new()).map_err(|e| e.to_string())?;
    let events = session.bus().subscribe();

    let Some(batch_id) = session
        .ingest_paths(paths, priority)
        .map_err(|e| e.to_string())?
    else {
        eprintln!("Nothing to copy: no file matched a mapping rule");
        return Ok(true);
    };

    let mut printer = ProgressPrinter::new(verbose);
    let jobs = session
        .scheduler()
        .batch(batch_id)
        .map(|b| b.jobs)
        .unwrap_or_default();
    eprintln!("Copying {} files...", jobs.len());

    for event in events.iter() {
        match event {
            EngineEvent::Progress(progress) => printer.on_progress(&progress),
            EngineEvent::JobStatusChanged {
                job, batch, status, ..
            } if batch == batch_id
                && matches!(status, JobStatus::Completed | JobStatus::Error | JobStatus::Cancelled) =>
            {
                let source = jobs.iter().find(|j| j.id == job).map(|j| j.source_path.as_path());
                printer.on_job_finished(source, status);
            }
            EngineEvent::BatchFinished { batch, summary } if batch == batch_id => {
                printer.on_batch_finished(&summary);
                return Ok(summary.failed == 0 && summary.cancelled == 0);
            }
            _ => {}
        }
    }
    Err("Event stream closed before the batch finished".to_string())
}

fn run_drives() -> Result<bool, String> {
    let monitor = DriveMonitor::new(SystemMounts, EventBus::new());
    monitor.poll();
    let drives = monitor.snapshot();
    if drives.is_empty() {
        println!("No drives found");
        return Ok(true);
    }
    for drive in drives {
        println!(
            "{:<30} {:<20} {:<10} {:<12} {:<8} {} free of {}",
            drive.id.to_string(),
            drive.label,
            drive.drive_type.to_string(),
            drive.status.to_string(),
            drive.file_system,
            ProgressPrinter::format_bytes(drive.free_bytes),
            ProgressPrinter::format_bytes(drive.total_bytes),
        );
    }
    Ok(true)
}

fn run_hash(files: &[PathBuf], algorithm: ChecksumAlgorithm, manifest: Option<&Path>) -> Result<bool, String> {
    let base = manifest
        .and_then(Path::parent)
        .map(Path::to_path_buf)
        .unwrap_or_default();
    let mut entries = Vec::new();
    let mut ok = true;
    for file in files {
        match compute_file_checksum(file, algorithm) {
            Ok(checksum) => {
                println!("{}  {}", checksum.hex(), file.display());
                let rel = file.strip_prefix(&base).unwrap_or(file);
                entries.push((rel.to_string_lossy().replace('\\', "/"), checksum));
            }
            Err(e) => {
                eprintln!("{}: {}", file.display(), e);
                ok = false;
            }
        }
    }
    if let Some(manifest) = manifest {
        fs::write(manifest, generate_checksum_file(&entries, algorithm))
            .map_err(|e| format!("Cannot write manifest {}: {}", manifest.display(), e))?;
    }
    Ok(ok)
}

fn run_hash_check(manifest: &Path, fallback: ChecksumAlgorithm) -> Result<bool, String> {
    let content = fs::read_to_string(manifest)
        .map_err(|e| format!("Cannot read manifest {}: {}", manifest.display(), e))?;
    let algorithm = manifest_algorithm(&content).unwrap_or(fallback);
    let base = manifest.parent().unwrap_or(Path::new(""));

    let results = match verify_checksum_file(&content, |rel| {
        compute_file_checksum(&base.join(rel), algorithm)
    }) {
        Ok(results) => results,
        Err(e) => {
            eprintln!("{}", e);
            return Ok(false);
        }
    };

    let mut ok = true;
    for entry in &results {
        if entry.matches() {
            println!("{}: OK", entry.path);
        } else {
            println!("{}: FAILED", entry.path);
            ok = false;
        }
    }
    Ok(ok)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn copy_cli(paths: Vec<PathBuf>, to: Option<PathBuf>, config: Option<PathBuf>) -> Cli {
        Cli {
            config,
            command: Command::Copy {
                paths,
                to,
                priority: "normal".to_string(),
                verbose: false,
                overrides: Overrides::default(),
            },
        }
    }

    #[test]
    fn test_cli_parses_copy_arguments() {
        let cli = Cli::try_parse_from([
            "ingest", "copy", "a.jpg", "b", "--to", "/out", "--priority", "high", "--parallel", "4",
        ])
        .expect("arguments should parse");
        match cli.command {
            Command::Copy {
                paths,
                to,
                priority,
                overrides,
                ..
            } => {
                assert_eq!(paths, vec![PathBuf::from("a.jpg"), PathBuf::from("b")]);
                assert_eq!(to, Some(PathBuf::from("/out")));
                assert_eq!(priority, "high");
                assert_eq!(overrides.parallel, Some(4));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_cli_copy_with_catch_all_target() {
        let src_dir = TempDir::new().expect("Failed to create temp dir");
        let dst_dir = TempDir::new().expect("Failed to create temp dir");
        fs::write(src_dir.path().join("test.txt"), "hello").expect("Failed to write file");

        let cli = copy_cli(
            vec![src_dir.path().to_path_buf()],
            Some(dst_dir.path().to_path_buf()),
            None,
        );
        assert_eq!(run_cli(&cli), Ok(true));
        assert_eq!(fs::read_to_string(dst_dir.path().join("test.txt")).unwrap(), "hello");
    }

    #[test]
    fn test_cli_copy_uses_config_mappings() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let src = dir.path().join("card");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("IMG_1.JPG"), "jpeg").unwrap();
        fs::write(src.join("notes.txt"), "skip me").unwrap();
        let photos = dir.path().join("photos");

        let config_path = dir.path().join("ingest.toml");
        fs::write(
            &config_path,
            format!(
                "parallel_transfers = 1\n\n[[mappings]]\npattern = \"jpg\"\ntarget = {:?}\n",
                photos.to_string_lossy()
            ),
        )
        .unwrap();

        let cli = copy_cli(vec![src], None, Some(config_path));
        assert_eq!(run_cli(&cli), Ok(true));
        assert!(photos.join("IMG_1.JPG").exists());
        assert!(!photos.join("notes.txt").exists());
    }

    #[test]
    fn test_cli_copy_without_rules_is_usage_error() {
        let src_dir = TempDir::new().expect("Failed to create temp dir");
        let cli = copy_cli(vec![src_dir.path().to_path_buf()], None, None);
        assert!(run_cli(&cli).is_err());
    }

    #[test]
    fn test_cli_copy_rejects_missing_source() {
        let dst_dir = TempDir::new().expect("Failed to create temp dir");
        let cli = copy_cli(
            vec![PathBuf::from("/nonexistent/path")],
            Some(dst_dir.path().to_path_buf()),
            None,
        );
        assert!(run_cli(&cli).is_err(), "CLI should reject missing source");
    }

    #[test]
    fn test_cli_rejects_invalid_priority() {
        let dst_dir = TempDir::new().expect("Failed to create temp dir");
        let mut cli = copy_cli(vec![dst_dir.path().to_path_buf()], Some(dst_dir.path().to_path_buf()), None);
        if let Command::Copy { priority, .. } = &mut cli.command {
            *priority = "urgent".to_string();
        }
        assert!(run_cli(&cli).is_err());
    }

    #[test]
    fn test_load_config_applies_overrides() {
        let overrides = Overrides {
            parallel: Some(4),
            bandwidth: Some(2.5),
            delete_source: true,
            auto_start: true,
            verify: Some("blake3".to_string()),
            on_conflict: Some("overwrite".to_string()),
        };
        let config = load_config(None, &overrides).unwrap();
        assert_eq!(config.parallel_transfers, 4);
        assert_eq!(config.bandwidth_limit, 2.5);
        assert!(config.delete_source);
        assert!(config.auto_start);
        assert_eq!(config.verify_algorithm, ChecksumAlgorithm::Blake3);
        assert_eq!(config.on_conflict, ConflictPolicy::Overwrite);

        let bad = Overrides {
            on_conflict: Some("ask".to_string()),
            ..Overrides::default()
        };
        assert!(load_config(None, &bad).is_err());
        let zero = Overrides {
            parallel: Some(0),
            ..Overrides::default()
        };
        assert!(load_config(None, &zero).is_err());
    }

    #[test]
    fn test_cli_hash_manifest_and_check() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let a = dir.path().join("a.bin");
        let b = dir.path().join("b.bin");
        fs::write(&a, "alpha").unwrap();
        fs::write(&b, "beta").unwrap();
        let manifest = dir.path().join("SHA256SUMS");

        let write = Cli {
            config: None,
            command: Command::Hash {
                files: vec![a.clone(), b.clone()],
                algo: "sha256".to_string(),
                manifest: Some(manifest.clone()),
                check: None,
            },
        };
        assert_eq!(run_cli(&write), Ok(true));
        let content = fs::read_to_string(&manifest).unwrap();
        assert!(content.contains(" a.bin"));

        let check = Cli {
            config: None,
            command: Command::Hash {
                files: Vec::new(),
                algo: "md5".to_string(),
                manifest: None,
                check: Some(manifest.clone()),
            },
        };
        assert_eq!(run_cli(&check), Ok(true), "algorithm comes from the manifest header");

        fs::write(&b, "tampered").unwrap();
        assert_eq!(run_cli(&check), Ok(false));
    }

    #[test]
    fn test_cli_rejects_invalid_hash_algorithm() {
        let cli = Cli {
            config: None,
            command: Command::Hash {
                files: vec![PathBuf::from("x")],
                algo: "invalid_algo".to_string(),
                manifest: None,
                check: None,
            },
        };
        assert!(run_cli(&cli).is_err(), "CLI should reject invalid hash algorithm");
    }

    #[test]
    fn test_format_helpers() {
        assert_eq!(ProgressPrinter::format_bytes(1536), "1.50 KB");
        assert_eq!(ProgressPrinter::format_duration(Duration::from_secs(3725)), "1h 2m 5s");
        assert_eq!(ProgressPrinter::print_progress_bar(50), "[==========          ] 50%");
    }
}
