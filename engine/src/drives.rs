//! Drive monitoring.
//!
//! The [`DriveMonitor`] polls a [`MountSource`] and keeps a registry of the
//! drives it finds. Each poll is diffed against the registry and the
//! differences are published as drive events. Polling is idempotent, so it
//! can run on a fixed interval.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::model::{Drive, DriveId, DriveStatus, DriveType};

const VIRTUAL_FILESYSTEMS: &[&str] = &[
    "devfs", "sysfs", "proc", "tmpfs", "ramfs", "devtmpfs", "overlay", "squashfs", "autofs",
];

const NETWORK_FILESYSTEMS: &[&str] = &[
    "nfs", "nfs4", "cifs", "smbfs", "smb3", "afpfs", "sshfs", "fuse.sshfs", "9p", "webdav",
    "davfs", "fuse.davfs2", "ncpfs",
];

const CLOUD_FILESYSTEMS: &[&str] = &["fuse.rclone", "fuse.s3fs", "fuse.gcsfuse", "fuse.onedriver"];

const CLOUD_MARKERS: &[&str] = &[
    "dropbox",
    "onedrive",
    "google drive",
    "icloud drive",
    "cloudstorage",
    "pcloud",
];

/// A mount point as reported by a [`MountSource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfo {
    pub mount_point: PathBuf,
    pub label: String,
    pub file_system: String,
    pub is_removable: bool,
    pub total_bytes: u64,
    pub free_bytes: u64,
}

impl MountInfo {
    /// A removable mount with the given capacity, labelled after its
    /// directory name.
    pub fn removable(mount_point: impl Into<PathBuf>, total_bytes: u64, free_bytes: u64) -> Self {
        let mount_point = mount_point.into();
        let label = mount_point
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| mount_point.display().to_string());
        MountInfo {
            mount_point,
            label,
            file_system: String::new(),
            is_removable: true,
            total_bytes,
            free_bytes,
        }
    }
}

/// Source of the currently attached mounts.
pub trait MountSource: Send + Sync {
    fn mounts(&self) -> io::Result<Vec<MountInfo>>;

    /// Readiness probe: succeeds when the mount root can be listed.
    fn probe(&self, mount_point: &Path) -> io::Result<()> {
        fs::read_dir(mount_point).map(|_| ())
    }
}

/// Mounts reported by the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMounts;

impl MountSource for SystemMounts {
    fn mounts(&self) -> io::Result<Vec<MountInfo>> {
        let disks = sysinfo::Disks::new_with_refreshed_list();
        let mounts = disks
            .list()
            .iter()
            .filter_map(|disk| {
                let file_system = disk.file_system().to_string_lossy().to_lowercase();
                if VIRTUAL_FILESYSTEMS.contains(&file_system.as_str()) {
                    return None;
                }
                let mount_point = disk.mount_point().to_path_buf();
                let name = disk.name().to_string_lossy().into_owned();
                let label = if name.is_empty() {
                    mount_point.display().to_string()
                } else {
                    name
                };
                Some(MountInfo {
                    mount_point,
                    label,
                    file_system,
                    is_removable: disk.is_removable(),
                    total_bytes: disk.total_space(),
                    free_bytes: disk.available_space(),
                })
            })
            .collect();
        Ok(mounts)
    }
}

/// A host-maintained list of mounts.
///
/// Lets a host treat plain directories as drives (for example a watched
/// import folder) and serves as the in-memory source in tests.
#[derive(Debug, Default)]
pub struct ManualMounts {
    mounts: Mutex<Vec<MountInfo>>,
}

impl ManualMounts {
    pub fn new() -> Self {
        ManualMounts::default()
    }

    pub fn insert(&self, mount: MountInfo) {
        let mut mounts = self.mounts.lock().unwrap_or_else(PoisonError::into_inner);
        mounts.retain(|m| m.mount_point != mount.mount_point);
        mounts.push(mount);
    }

    pub fn remove(&self, mount_point: &Path) {
        self.mounts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|m| m.mount_point != mount_point);
    }

    pub fn set_free_bytes(&self, mount_point: &Path, free_bytes: u64) {
        let mut mounts = self.mounts.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(m) = mounts.iter_mut().find(|m| m.mount_point == mount_point) {
            m.free_bytes = free_bytes;
        }
    }
}

impl MountSource for ManualMounts {
    fn mounts(&self) -> io::Result<Vec<MountInfo>> {
        Ok(self.mounts.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }
}

impl<T: MountSource + ?Sized> MountSource for Arc<T> {
    fn mounts(&self) -> io::Result<Vec<MountInfo>> {
        (**self).mounts()
    }

    fn probe(&self, mount_point: &Path) -> io::Result<()> {
        (**self).probe(mount_point)
    }
}

/// Classify a mount by its metadata. Unclassifiable mounts are `Local`.
pub fn classify_mount(info: &MountInfo) -> DriveType {
    let fs = info.file_system.to_lowercase();
    let path = info.mount_point.to_string_lossy().to_lowercase();
    let label = info.label.to_lowercase();

    if CLOUD_FILESYSTEMS.contains(&fs.as_str())
        || CLOUD_MARKERS
            .iter()
            .any(|marker| path.contains(marker) || label.contains(marker))
    {
        return DriveType::Cloud;
    }
    if NETWORK_FILESYSTEMS.contains(&fs.as_str())
        || path.starts_with("//")
        || path.starts_with("\\\\")
        || label.starts_with("//")
        || label.starts_with("\\\\")
    {
        return DriveType::Network;
    }
    if info.is_removable {
        return DriveType::Removable;
    }
    DriveType::Local
}

/// Receives drive activity from the scheduler.
pub trait DriveActivity: Send + Sync {
    fn mark_busy(&self, id: &DriveId);
    fn mark_ready(&self, id: &DriveId);

    /// Registered drive whose mount point holds `path`, if any.
    fn drive_for(&self, path: &Path) -> Option<DriveId>;
}

/// Answers how much space is free at a destination.
pub trait SpaceProbe: Send + Sync {
    /// `None` when unknown; the worker then skips the space check.
    fn available_space(&self, path: &Path) -> Option<u64>;
}

#[derive(Debug)]
struct Entry {
    drive: Drive,
    busy: u32,
}

pub struct DriveMonitor {
    source: Box<dyn MountSource>,
    bus: EventBus,
    registry: RwLock<HashMap<DriveId, Entry>>,
    /// Every mount seen by the last successful poll, excluded ones included
    last_mounts: RwLock<Vec<MountInfo>>,
    excluded: RwLock<Vec<PathBuf>>,
    /// Serializes polls so a stale enumeration never overwrites a newer one
    polling: Mutex<()>,
}

impl DriveMonitor {
    pub fn new(source: impl MountSource + 'static, bus: EventBus) -> Self {
        DriveMonitor {
            source: Box::new(source),
            bus,
            registry: RwLock::new(HashMap::new()),
            last_mounts: RwLock::new(Vec::new()),
            excluded: RwLock::new(Vec::new()),
            polling: Mutex::new(()),
        }
    }

    pub fn with_exclusions(self, excluded: Vec<PathBuf>) -> Self {
        self.set_exclusions(excluded);
        self
    }

    /// Replace the excluded mount points. Already registered drives that
    /// become excluded are dropped on the next poll.
    pub fn set_exclusions(&self, excluded: Vec<PathBuf>) {
        *self.excluded.write().unwrap_or_else(PoisonError::into_inner) = excluded;
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Re-enumerate mounts, update the registry and publish the changes.
    ///
    /// Returns the events that were published. A failed enumeration keeps
    /// the registry as it was.
    pub fn poll(&self) -> Vec<EngineEvent> {
        let _polling = self.polling.lock().unwrap_or_else(PoisonError::into_inner);
        let mounts = match self.source.mounts() {
            Ok(mounts) => mounts,
            Err(e) => {
                warn!(error = %e, "mount enumeration failed, keeping last drive state");
                return Vec::new();
            }
        };

        let excluded = self
            .excluded
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let probed: Vec<(MountInfo, bool)> = mounts
            .iter()
            .filter(|m| !excluded.iter().any(|ex| m.mount_point == *ex))
            .map(|m| (m.clone(), self.source.probe(&m.mount_point).is_ok()))
            .collect();
        *self.last_mounts.write().unwrap_or_else(PoisonError::into_inner) = mounts;

        let mut events = Vec::new();
        {
            let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
            let mut present = HashSet::new();

            for (info, healthy) in probed {
                let id = DriveId::new(&info.mount_point);
                present.insert(id.clone());

                match registry.get_mut(&id) {
                    None => {
                        let drive = Drive {
                            id: id.clone(),
                            label: info.label.clone(),
                            drive_type: classify_mount(&info),
                            // Unreadable on first sight means still mounting. Failing
                            // again on the next poll turns it into Error below.
                            status: if healthy {
                                DriveStatus::Ready
                            } else {
                                DriveStatus::Connecting
                            },
                            file_system: info.file_system.clone(),
                            total_bytes: info.total_bytes,
                            free_bytes: info.free_bytes,
                            detected_at: Utc::now(),
                        };
                        info!(
                            drive = %id,
                            label = %drive.label,
                            kind = %drive.drive_type,
                            status = %drive.status,
                            "drive connected"
                        );
                        registry.insert(
                            id,
                            Entry {
                                drive: drive.clone(),
                                busy: 0,
                            },
                        );
                        events.push(EngineEvent::DriveConnected(drive));
                    }
                    Some(entry) => {
                        let next = if !healthy {
                            DriveStatus::Error
                        } else if entry.busy > 0 {
                            DriveStatus::Busy
                        } else {
                            DriveStatus::Ready
                        };
                        let changed = next != entry.drive.status
                            || info.free_bytes != entry.drive.free_bytes;
                        entry.drive.total_bytes = info.total_bytes;
                        entry.drive.free_bytes = info.free_bytes;
                        if next != entry.drive.status {
                            debug!(drive = %id, from = %entry.drive.status, to = %next, "drive status changed");
                        }
                        entry.drive.status = next;
                        if changed {
                            events.push(EngineEvent::DriveStatusChanged {
                                id,
                                status: next,
                                free_bytes: info.free_bytes,
                            });
                        }
                    }
                }
            }

            let gone: Vec<DriveId> = registry
                .keys()
                .filter(|id| !present.contains(*id))
                .cloned()
                .collect();
            for id in gone {
                registry.remove(&id);
                info!(drive = %id, "drive disconnected");
                events.push(EngineEvent::DriveDisconnected(id));
            }
        }

        for event in &events {
            self.bus.publish(event.clone());
        }
        events
    }

    /// Classify the mount holding `path`, using the last poll's mounts.
    pub fn classify(&self, path: &Path) -> DriveType {
        let mounts = self.last_mounts.read().unwrap_or_else(PoisonError::into_inner);
        mounts
            .iter()
            .filter(|m| path.starts_with(&m.mount_point))
            .max_by_key(|m| m.mount_point.components().count())
            .map(classify_mount)
            .unwrap_or(DriveType::Local)
    }

    pub fn snapshot(&self) -> Vec<Drive> {
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        let mut drives: Vec<Drive> = registry.values().map(|e| e.drive.clone()).collect();
        drives.sort_by(|a, b| a.id.cmp(&b.id));
        drives
    }

    pub fn drive(&self, id: &DriveId) -> Option<Drive> {
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        registry.get(id).map(|e| e.drive.clone())
    }

    /// Poll every `interval` on a background thread.
    pub fn spawn(self: &Arc<Self>, interval: Duration) -> Result<MonitorHandle> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let monitor = Arc::clone(self);
        let thread = thread::Builder::new()
            .name("drive-monitor".into())
            .spawn(move || loop {
                monitor.poll();
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    _ => break,
                }
            });
        let thread = thread.map_err(|e| EngineError::SpawnFailed {
            name: "drive-monitor".to_string(),
            source: e,
        })?;
        Ok(MonitorHandle {
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }

    fn set_activity(&self, id: &DriveId, busy: bool) {
        let event = {
            let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
            let Some(entry) = registry.get_mut(id) else {
                return;
            };
            if busy {
                entry.busy += 1;
            } else {
                entry.busy = entry.busy.saturating_sub(1);
            }
            let next = match entry.drive.status {
                DriveStatus::Ready if entry.busy > 0 => DriveStatus::Busy,
                DriveStatus::Busy if entry.busy == 0 => DriveStatus::Ready,
                _ => return,
            };
            entry.drive.status = next;
            EngineEvent::DriveStatusChanged {
                id: id.clone(),
                status: next,
                free_bytes: entry.drive.free_bytes,
            }
        };
        self.bus.publish(event);
    }
}

impl DriveActivity for DriveMonitor {
    fn mark_busy(&self, id: &DriveId) {
        self.set_activity(id, true);
    }

    fn mark_ready(&self, id: &DriveId) {
        self.set_activity(id, false);
    }

    fn drive_for(&self, path: &Path) -> Option<DriveId> {
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        registry
            .keys()
            .filter(|id| id.contains(path))
            .max_by_key(|id| id.mount_point().components().count())
            .cloned()
    }
}

impl SpaceProbe for DriveMonitor {
    fn available_space(&self, path: &Path) -> Option<u64> {
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        registry
            .values()
            .filter(|e| path.starts_with(e.drive.id.mount_point()))
            .max_by_key(|e| e.drive.id.mount_point().components().count())
            .map(|e| e.drive.free_bytes)
    }
}

/// Stops the monitor thread when dropped.
pub struct MonitorHandle {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
