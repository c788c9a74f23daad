//! End-to-end ingest scenarios driven through the public API.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use ingest_engine::fs_ops::temp_path_for;
use ingest_engine::{
    plan_paths, BatchOrigin, EngineConfig, EngineEvent, ErrorKind, EventBus, IngestSession,
    JobStatus, ManualMounts, MappingRuleConfig, MountInfo, Priority, SchedulerHooks,
    TransferBatch, TransferScheduler,
};

fn config(parallel: usize) -> EngineConfig {
    EngineConfig {
        parallel_transfers: parallel,
        chunk_size: 16 * 1024,
        retry_base_delay_ms: 1,
        ..EngineConfig::default()
    }
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

fn write_file(path: &Path, data: &[u8]) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, data).unwrap();
}

fn batch_of(sources: &[PathBuf], dst: &Path, priority: Priority) -> TransferBatch {
    let mut batch = TransferBatch::new(BatchOrigin::Manual);
    for src in sources {
        let size = fs::metadata(src).unwrap().len();
        batch.add_job(src, dst.join(src.file_name().unwrap()), size, priority);
    }
    batch
}

fn wait_until(mut f: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(15);
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn test_concurrent_transfers_never_exceed_limit() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let sources: Vec<PathBuf> = (0..6)
        .map(|i| {
            let path = dir.path().join(format!("src/clip{i}.mov"));
            write_file(&path, &pattern(64 * 1024, i as u8));
            path
        })
        .collect();

    let mut cfg = config(2);
    cfg.bandwidth_limit = 0.5;
    let scheduler = TransferScheduler::new(cfg, EventBus::new(), SchedulerHooks::default()).unwrap();
    scheduler.submit(batch_of(&sources, &dir.path().join("dst"), Priority::Normal)).unwrap();

    let mut max_active = 0;
    loop {
        max_active = max_active.max(scheduler.active_count());
        if scheduler.wait_idle(Duration::from_millis(2)) {
            break;
        }
    }

    assert!(max_active >= 1);
    assert!(max_active <= 2, "saw {max_active} active transfers");
    assert!(scheduler.jobs().iter().all(|j| j.status == JobStatus::Completed));
}

#[test]
fn test_bandwidth_limit_bounds_aggregate_rate() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let sources: Vec<PathBuf> = (0..3)
        .map(|i| {
            let path = dir.path().join(format!("src/part{i}.bin"));
            write_file(&path, &pattern(512 * 1024, i as u8));
            path
        })
        .collect();

    // 1.5 MiB through a 1 MiB/s bucket holding at most 0.1 s of burst
    let mut cfg = config(3);
    cfg.bandwidth_limit = 1.0;
    let rate = cfg.bandwidth_bytes_per_sec() as f64;
    let chunk = cfg.chunk_size as f64;
    let scheduler = TransferScheduler::new(cfg, EventBus::new(), SchedulerHooks::default()).unwrap();

    let moved = || scheduler.jobs().iter().map(|j| j.bytes_transferred).sum::<u64>();
    let started = Instant::now();
    scheduler.submit(batch_of(&sources, &dir.path().join("dst"), Priority::Normal)).unwrap();
    let mut samples = vec![(Instant::now(), moved())];
    while !scheduler.wait_idle(Duration::from_millis(10)) {
        samples.push((Instant::now(), moved()));
        assert!(started.elapsed() < Duration::from_secs(15), "transfers never finished");
    }
    samples.push((Instant::now(), moved()));
    let elapsed = started.elapsed();

    // Chunks admitted just before a window opens may land inside it
    let slack = rate * 0.1 + 3.0 * chunk;
    for (i, &(t0, b0)) in samples.iter().enumerate() {
        for &(t1, b1) in &samples[i + 1..] {
            let window = t1.duration_since(t0);
            if window > Duration::from_secs(1) {
                break;
            }
            let allowed = rate * window.as_secs_f64() * 1.05 + slack;
            let seen = b1.saturating_sub(b0) as f64;
            assert!(seen <= allowed, "{seen} bytes moved in {window:?}, allowed {allowed}");
        }
    }

    assert!(elapsed >= Duration::from_millis(1200), "finished too fast: {elapsed:?}");
    assert!(scheduler.jobs().iter().all(|j| j.status == JobStatus::Completed));
}

#[test]
fn test_completed_copy_matches_source() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let data = pattern(300_000, 7);
    let src = dir.path().join("card/DCIM/IMG_0042.CR3");
    write_file(&src, &data);
    let dst = dir.path().join("library");

    let scheduler =
        TransferScheduler::new(config(1), EventBus::new(), SchedulerHooks::default()).unwrap();
    let events = scheduler.bus().subscribe();
    scheduler.submit(batch_of(&[src.clone()], &dst, Priority::Normal)).unwrap();
    assert!(scheduler.wait_idle(Duration::from_secs(15)));

    let job = &scheduler.jobs()[0];
    assert_eq!(job.status, JobStatus::Completed);
    assert!(!job.skipped);
    assert_eq!(job.bytes_transferred, data.len() as u64);
    assert!(job.expected_checksum.is_some());
    assert_eq!(job.expected_checksum, job.observed_checksum);
    assert_eq!(fs::read(&job.destination_path).unwrap(), data);
    assert!(!temp_path_for(&job.destination_path).exists());

    let statuses: Vec<JobStatus> = events
        .try_iter()
        .filter_map(|e| match e {
            EngineEvent::JobStatusChanged { status, .. } => Some(status),
            _ => None,
        })
        .collect();
    assert_eq!(statuses, vec![JobStatus::Active, JobStatus::Completed]);
}

#[test]
fn test_existing_destinations_are_skipped_or_renamed() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let same = dir.path().join("src/same.jpg");
    let differs = dir.path().join("src/differs.jpg");
    write_file(&same, b"identical bytes");
    write_file(&differs, b"new shot");
    let dst = dir.path().join("dst");
    write_file(&dst.join("same.jpg"), b"identical bytes");
    write_file(&dst.join("differs.jpg"), b"an older, unrelated shot");

    let scheduler =
        TransferScheduler::new(config(2), EventBus::new(), SchedulerHooks::default()).unwrap();
    scheduler
        .submit(batch_of(&[same.clone(), differs.clone()], &dst, Priority::Normal))
        .unwrap();
    assert!(scheduler.wait_idle(Duration::from_secs(15)));

    let jobs = scheduler.jobs();
    let skipped = jobs.iter().find(|j| j.source_path == same).unwrap();
    assert_eq!(skipped.status, JobStatus::Completed);
    assert!(skipped.skipped);
    assert_eq!(skipped.destination_path, dst.join("same.jpg"));

    let renamed = jobs.iter().find(|j| j.source_path == differs).unwrap();
    assert_eq!(renamed.status, JobStatus::Completed);
    assert_eq!(renamed.destination_path, dst.join("differs_1.jpg"));
    assert_eq!(fs::read(dst.join("differs_1.jpg")).unwrap(), b"new shot");
    assert_eq!(fs::read(dst.join("differs.jpg")).unwrap(), b"an older, unrelated shot");
}

#[test]
fn test_interrupted_transfer_resumes_from_kept_temp() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let data = pattern(512 * 1024, 3);
    let src = dir.path().join("src/long.mov");
    write_file(&src, &data);
    let dst = dir.path().join("dst");
    let dest_file = dst.join("long.mov");
    let temp = temp_path_for(&dest_file);

    let mut slow = config(1);
    slow.bandwidth_limit = 0.25;
    {
        let scheduler =
            TransferScheduler::new(slow, EventBus::new(), SchedulerHooks::default()).unwrap();
        scheduler.submit(batch_of(&[src.clone()], &dst, Priority::Normal)).unwrap();
        assert!(wait_until(|| scheduler
            .jobs()
            .first()
            .is_some_and(|j| j.bytes_transferred >= 64 * 1024)));
        scheduler.shutdown();
        let job = &scheduler.jobs()[0];
        assert_eq!(job.status, JobStatus::Cancelled);
    }

    let kept = fs::metadata(&temp).map(|m| m.len()).unwrap_or(0);
    assert!(kept > 0, "shutdown keeps the partial copy");
    assert!(!dest_file.exists());

    let scheduler =
        TransferScheduler::new(config(1), EventBus::new(), SchedulerHooks::default()).unwrap();
    scheduler.submit(batch_of(&[src.clone()], &dst, Priority::Normal)).unwrap();
    assert!(scheduler.wait_idle(Duration::from_secs(15)));

    assert_eq!(scheduler.jobs()[0].status, JobStatus::Completed);
    assert_eq!(fs::read(&dest_file).unwrap(), data);
    assert!(!temp.exists());
}

#[test]
fn test_drive_removed_mid_transfer_cancels_without_partial_file() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let card = dir.path().join("card");
    let src = card.join("DCIM/MVI_0001.MP4");
    write_file(&src, &pattern(1024 * 1024, 9));
    let library = dir.path().join("library");

    let cfg = EngineConfig {
        auto_start: true,
        bandwidth_limit: 0.25,
        mappings: vec![MappingRuleConfig {
            pattern: "mp4".into(),
            target: library.join("video"),
            priority: 0,
        }],
        ..config(1)
    };

    let mounts = Arc::new(ManualMounts::new());
    let mut session = IngestSession::new(cfg, Arc::clone(&mounts)).unwrap();
    session.start().unwrap();

    mounts.insert(MountInfo::removable(&card, 1 << 30, 1 << 29));
    session.monitor().poll();
    assert!(wait_until(|| session
        .scheduler()
        .jobs()
        .first()
        .is_some_and(|j| j.status == JobStatus::Active && j.bytes_transferred > 0)));

    mounts.remove(&card);
    session.monitor().poll();
    assert!(wait_until(|| session
        .scheduler()
        .jobs()
        .first()
        .is_some_and(|j| j.status == JobStatus::Cancelled)));
    assert!(session.scheduler().wait_idle(Duration::from_secs(15)));

    let job = &session.scheduler().jobs()[0];
    assert_eq!(job.failure.as_ref().map(|f| f.kind), Some(ErrorKind::DriveVanished));
    let dest = library.join("video/MVI_0001.MP4");
    assert!(!dest.exists());
    assert!(!temp_path_for(&dest).exists());
}

#[test]
fn test_high_priority_job_starts_before_queued_normal_jobs() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let sources: Vec<PathBuf> = (0..5)
        .map(|i| {
            let path = dir.path().join(format!("src/shot{i}.jpg"));
            write_file(&path, &pattern(32 * 1024, i as u8));
            path
        })
        .collect();

    let mut batch = batch_of(&sources, &dir.path().join("dst"), Priority::Normal);
    batch.jobs[2].priority = Priority::High;
    let urgent = batch.jobs[2].id;

    let scheduler =
        TransferScheduler::new(config(2), EventBus::new(), SchedulerHooks::default()).unwrap();
    scheduler.submit(batch).unwrap();
    assert!(scheduler.wait_idle(Duration::from_secs(15)));

    let jobs = scheduler.jobs();
    assert!(jobs.iter().all(|j| j.status == JobStatus::Completed));
    let urgent_order = jobs.iter().find(|j| j.id == urgent).unwrap().dispatch_order.unwrap();
    assert_eq!(urgent_order, 0);
    let mut normal: Vec<u64> = jobs
        .iter()
        .filter(|j| j.id != urgent)
        .map(|j| j.dispatch_order.unwrap())
        .collect();
    normal.sort_unstable();
    assert_eq!(normal, vec![1, 2, 3, 4]);
}

#[test]
fn test_same_named_files_from_different_folders_both_arrive() {
    for round in 0..3u8 {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let first = dir.path().join("card/DCIM/100CANON/IMG_0001.JPG");
        let second = dir.path().join("card/DCIM/101CANON/IMG_0001.JPG");
        write_file(&first, &pattern(200_000, round));
        write_file(&second, &pattern(210_000, round.wrapping_add(100)));
        let photos = dir.path().join("library/photos");

        let cfg = EngineConfig {
            chunk_size: 4096,
            bandwidth_limit: 2.0,
            mappings: vec![MappingRuleConfig {
                pattern: "jpg".into(),
                target: photos.clone(),
                priority: 0,
            }],
            ..config(2)
        };
        let rules = cfg.mapping_rules().unwrap();
        let planned = plan_paths(&[first.clone(), second.clone()], &rules, Priority::Normal).unwrap();
        assert_eq!(planned.batch.jobs.len(), 2);

        let scheduler = TransferScheduler::new(cfg, EventBus::new(), SchedulerHooks::default()).unwrap();
        scheduler.submit(planned.batch).unwrap();
        assert!(scheduler.wait_idle(Duration::from_secs(15)));

        let jobs = scheduler.jobs();
        for job in &jobs {
            assert_eq!(job.status, JobStatus::Completed, "round {round}: {:?}", job.failure);
            assert!(!job.skipped);
            assert_eq!(fs::read(&job.destination_path).unwrap(), fs::read(&job.source_path).unwrap());
        }
        let names: HashSet<PathBuf> = jobs.iter().map(|j| j.destination_path.clone()).collect();
        let expected: HashSet<PathBuf> =
            [photos.join("IMG_0001.JPG"), photos.join("IMG_0001_1.JPG")].into_iter().collect();
        assert_eq!(names, expected);
        assert_eq!(fs::read_dir(&photos).unwrap().count(), 2, "no temp files left behind");
    }
}

#[test]
fn test_verification_failure_is_retried_from_scratch() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let data = pattern(200_000, 7);
    let src = dir.path().join("card/DCIM/IMG_0042.CR3");
    write_file(&src, &data);
    let dst = dir.path().join("library");
    let temp = temp_path_for(&dst.join("IMG_0042.CR3"));

    let scheduler =
        TransferScheduler::new(config(1), EventBus::new(), SchedulerHooks::default()).unwrap();
    let events = scheduler.bus().subscribe();
    // Damage the temp file once, after the last chunk lands and before it is verified
    let damaged = AtomicBool::new(false);
    scheduler.bus().register(Arc::new(move |event: &EngineEvent| {
        if let EngineEvent::JobProgress {
            bytes_transferred,
            total_bytes,
            ..
        } = event
        {
            if bytes_transferred == total_bytes && !damaged.swap(true, Ordering::SeqCst) {
                let mut file = OpenOptions::new().write(true).open(&temp).unwrap();
                file.write_all(b"\xff\xff\xff\xff").unwrap();
            }
        }
    }));
    scheduler.submit(batch_of(&[src.clone()], &dst, Priority::Normal)).unwrap();
    assert!(scheduler.wait_idle(Duration::from_secs(15)));

    let job = &scheduler.jobs()[0];
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.retry_count, 1);
    assert_eq!(job.expected_checksum, job.observed_checksum);
    assert_eq!(fs::read(&job.destination_path).unwrap(), data);

    let retried_for_verification = events.try_iter().any(|e| {
        matches!(
            e,
            EngineEvent::JobStatusChanged {
                status: JobStatus::Pending,
                reason: Some(ref failure),
                ..
            } if failure.kind == ErrorKind::VerificationFailed
        )
    });
    assert!(retried_for_verification);
}
