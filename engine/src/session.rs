//! Ingest session.
//!
//! Wires the drive monitor to the scheduler: a newly connected removable or
//! network drive is enumerated, mapped and submitted when `auto_start` is
//! set, and every transfer touching a drive that disappears is cancelled.
//! Drives that connect before they are readable are ingested once they
//! first report ready.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, select, Receiver, Sender};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::drives::{DriveMonitor, MonitorHandle, MountSource};
use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::job::{plan_drive_batch, plan_paths, PlannedBatch};
use crate::mapping::MappingRule;
use crate::model::{BatchId, Drive, DriveId, DriveStatus, DriveType, Priority};
use crate::scheduler::{SchedulerHooks, TransferScheduler};

struct SessionSettings {
    config: EngineConfig,
    rules: Vec<MappingRule>,
}

struct SessionCore {
    scheduler: Arc<TransferScheduler>,
    settings: RwLock<SessionSettings>,
    /// Connected drives not yet reported ready
    not_ready: Mutex<HashMap<DriveId, Drive>>,
}

impl SessionCore {
    fn with_settings<T>(&self, f: impl FnOnce(&SessionSettings) -> T) -> T {
        f(&self.settings.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn not_ready_drives(&self) -> MutexGuard<'_, HashMap<DriveId, Drive>> {
        self.not_ready.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ingest_drive(&self, drive: &DriveId, priority: Priority) -> Result<Option<BatchId>> {
        let planned = self.with_settings(|s| {
            plan_drive_batch(drive, &s.rules, priority, &s.config.excluded_drives)
        })?;
        self.submit(planned)
    }

    fn submit(&self, planned: PlannedBatch) -> Result<Option<BatchId>> {
        if !planned.unmapped.is_empty() {
            debug!(files = planned.unmapped.len(), "files matched no mapping rule");
        }
        if planned.is_empty() {
            return Ok(None);
        }
        self.scheduler.submit(planned.batch).map(Some)
    }

    fn on_drive_connected(&self, drive: &Drive) {
        if !self.with_settings(|s| s.config.auto_start) {
            return;
        }
        if !matches!(drive.drive_type, DriveType::Removable | DriveType::Network) {
            debug!(drive = %drive.id, kind = ?drive.drive_type, "not auto-ingesting fixed drive");
            return;
        }
        match self.ingest_drive(&drive.id, Priority::Normal) {
            Ok(Some(batch)) => info!(drive = %drive.id, batch = %batch, "auto-ingest started"),
            Ok(None) => info!(drive = %drive.id, "nothing to ingest"),
            Err(e) => warn!(drive = %drive.id, error = %e, "auto-ingest failed"),
        }
    }

    fn handle(&self, event: &EngineEvent) {
        match event {
            EngineEvent::DriveConnected(drive) if drive.status == DriveStatus::Ready => {
                self.on_drive_connected(drive)
            }
            EngineEvent::DriveConnected(drive) => {
                debug!(drive = %drive.id, status = %drive.status, "drive not ready yet");
                self.not_ready_drives().insert(drive.id.clone(), drive.clone());
            }
            EngineEvent::DriveStatusChanged {
                id,
                status: DriveStatus::Ready,
                ..
            } => {
                let became_ready = self.not_ready_drives().remove(id);
                if let Some(drive) = became_ready {
                    self.on_drive_connected(&drive);
                }
            }
            EngineEvent::DriveDisconnected(id) => {
                self.not_ready_drives().remove(id);
                self.scheduler.cancel_for_drive(id);
            }
            _ => {}
        }
    }
}

/// A running ingest pipeline: drive monitor, scheduler and the glue between
/// them.
pub struct IngestSession {
    core: Arc<SessionCore>,
    monitor: Arc<DriveMonitor>,
    bus: EventBus,
    listener: Option<(Sender<()>, JoinHandle<()>)>,
    poller: Option<MonitorHandle>,
}

impl IngestSession {
    pub fn new(config: EngineConfig, mounts: impl MountSource + 'static) -> Result<Self> {
        config.validate()?;
        let rules = config.mapping_rules()?;
        let bus = EventBus::new();
        let monitor = Arc::new(
            DriveMonitor::new(mounts, bus.clone()).with_exclusions(config.excluded_drives.clone()),
        );
        let hooks = SchedulerHooks {
            drives: Some(monitor.clone()),
            space: Some(monitor.clone()),
        };
        let scheduler = Arc::new(TransferScheduler::new(config.clone(), bus.clone(), hooks)?);
        Ok(IngestSession {
            core: Arc::new(SessionCore {
                scheduler,
                settings: RwLock::new(SessionSettings { config, rules }),
                not_ready: Mutex::new(HashMap::new()),
            }),
            monitor,
            bus,
            listener: None,
            poller: None,
        })
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn scheduler(&self) -> &Arc<TransferScheduler> {
        &self.core.scheduler
    }

    pub fn monitor(&self) -> &Arc<DriveMonitor> {
        &self.monitor
    }

    /// Start reacting to drive events and polling on `check_interval`.
    /// Calling it again has no effect.
    pub fn start(&mut self) -> Result<()> {
        if self.listener.is_none() {
            let events = self.bus.subscribe();
            self.listener = Some(spawn_listener(Arc::clone(&self.core), events)?);
        }
        if self.poller.is_none() {
            let interval = self.core.with_settings(|s| s.config.check_interval());
            self.poller = Some(self.monitor.spawn(interval)?);
            info!(interval_secs = interval.as_secs(), "ingest session started");
        }
        Ok(())
    }

    /// Plan and submit everything on `drive`. `None` when no file matched.
    pub fn ingest_drive(&self, drive: &DriveId, priority: Priority) -> Result<Option<BatchId>> {
        self.core.ingest_drive(drive, priority)
    }

    /// Plan and submit a manual batch.
    pub fn ingest_paths(&self, paths: &[PathBuf], priority: Priority) -> Result<Option<BatchId>> {
        let planned = self.core.with_settings(|s| plan_paths(paths, &s.rules, priority))?;
        self.core.submit(planned)
    }

    /// Apply a new configuration to the scheduler, the monitor and future
    /// planning.
    pub fn reconfigure(&self, config: EngineConfig) -> Result<()> {
        let rules = config.mapping_rules()?;
        self.core.scheduler.reconfigure(config.clone())?;
        self.monitor.set_exclusions(config.excluded_drives.clone());
        let mut settings = self
            .core
            .settings
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *settings = SessionSettings { config, rules };
        Ok(())
    }

    /// Stop polling and reacting to drive events. Queued and running
    /// transfers are left to the scheduler.
    pub fn stop(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.stop();
        }
        if let Some((stop, thread)) = self.listener.take() {
            let _ = stop.send(());
            if thread.join().is_err() {
                warn!("session listener panicked");
            }
        }
    }
}

impl Drop for IngestSession {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_listener(
    core: Arc<SessionCore>,
    events: Receiver<EngineEvent>,
) -> Result<(Sender<()>, JoinHandle<()>)> {
    let (stop_tx, stop_rx) = bounded::<()>(1);
    let thread = thread::Builder::new()
        .name("ingest-session".into())
        .spawn(move || loop {
            select! {
                recv(events) -> event => match event {
                    Ok(event) => core.handle(&event),
                    Err(_) => break,
                },
                recv(stop_rx) -> _ => break,
            }
        })
        .map_err(|e| EngineError::SpawnFailed {
            name: "ingest-session".to_string(),
            source: e,
        })?;
    Ok((stop_tx, thread))
}
