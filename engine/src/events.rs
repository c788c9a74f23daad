//! Engine events and their delivery.
//!
//! Every observable change (drive arrival, job progress, batch completion)
//! is published as an [`EngineEvent`] on an [`EventBus`]. Hosts either
//! subscribe to a channel or register an [`EventHandler`]; the engine never
//! depends on how the events are consumed.

use std::sync::{Arc, Mutex, PoisonError};

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::model::{BatchId, Drive, DriveId, DriveStatus, JobFailure, JobId, JobStatus};
use crate::progress::{BatchSummary, GlobalProgress};

#[derive(Debug, Clone)]
pub enum EngineEvent {
    DriveConnected(Drive),
    DriveDisconnected(DriveId),
    /// Status or free space of a registered drive changed
    DriveStatusChanged {
        id: DriveId,
        status: DriveStatus,
        free_bytes: u64,
    },
    JobProgress {
        job: JobId,
        batch: BatchId,
        bytes_transferred: u64,
        total_bytes: u64,
    },
    /// `reason` is set for errors, cancellations and retries
    JobStatusChanged {
        job: JobId,
        batch: BatchId,
        status: JobStatus,
        reason: Option<JobFailure>,
    },
    BatchFinished {
        batch: BatchId,
        summary: BatchSummary,
    },
    /// Periodic global snapshot
    Progress(GlobalProgress),
}

/// Callback receiving every published event.
///
/// Handlers run on the publishing thread (a worker, the drive monitor or a
/// host thread) and must not block for long.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &EngineEvent);
}

impl<F> EventHandler for F
where
    F: Fn(&EngineEvent) + Send + Sync,
{
    fn handle(&self, event: &EngineEvent) {
        self(event)
    }
}

#[derive(Default)]
struct Subscribers {
    senders: Vec<Sender<EngineEvent>>,
    handlers: Vec<Arc<dyn EventHandler>>,
}

/// Fan-out of engine events. Cloning shares the same subscriber list.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Subscribers>>,
}

impl EventBus {
    pub fn new() -> Self {
        EventBus::default()
    }

    /// Receive all events published from now on.
    pub fn subscribe(&self) -> Receiver<EngineEvent> {
        let (tx, rx) = unbounded();
        self.lock().senders.push(tx);
        rx
    }

    pub fn register(&self, handler: Arc<dyn EventHandler>) {
        self.lock().handlers.push(handler);
    }

    /// Deliver `event` to every subscriber. Dropped receivers are pruned.
    pub fn publish(&self, event: EngineEvent) {
        let handlers = {
            let mut subs = self.lock();
            subs.senders.retain(|tx| tx.send(event.clone()).is_ok());
            subs.handlers.clone()
        };
        for handler in handlers {
            handler.handle(&event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        let subs = self.lock();
        subs.senders.len() + subs.handlers.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Subscribers> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_channel_subscribers_receive_events() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        bus.publish(EngineEvent::DriveDisconnected(DriveId::new("/media/card")));
        match rx.try_recv().unwrap() {
            EngineEvent::DriveDisconnected(id) => assert_eq!(id, DriveId::new("/media/card")),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_handlers_are_called() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        bus.register(Arc::new(move |_: &EngineEvent| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));
        bus.publish(EngineEvent::DriveDisconnected(DriveId::new("/a")));
        bus.publish(EngineEvent::DriveDisconnected(DriveId::new("/b")));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_dropped_receivers_are_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        let clone = bus.clone();
        assert_eq!(clone.subscriber_count(), 1);
        drop(rx);
        bus.publish(EngineEvent::DriveDisconnected(DriveId::new("/a")));
        assert_eq!(clone.subscriber_count(), 0);
    }

    #[test]
    fn test_handler_may_publish_reentrantly() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        let inner = bus.clone();
        bus.register(Arc::new(move |event: &EngineEvent| {
            if let EngineEvent::DriveConnected(drive) = event {
                inner.publish(EngineEvent::DriveDisconnected(drive.id.clone()));
            }
        }));
        let drive = Drive {
            id: DriveId::new("/media/card"),
            label: "CARD".into(),
            drive_type: crate::model::DriveType::Removable,
            status: DriveStatus::Ready,
            file_system: "exfat".into(),
            total_bytes: 10,
            free_bytes: 5,
            detected_at: chrono::Utc::now(),
        };
        bus.publish(EngineEvent::DriveConnected(drive));
        assert!(matches!(rx.try_recv().unwrap(), EngineEvent::DriveConnected(_)));
        assert!(matches!(rx.try_recv().unwrap(), EngineEvent::DriveDisconnected(_)));
    }
}
