//! Scheduler event channel.
//!
//! The scheduler holds a cloneable sender; a front-end holds the receiver.
//! Events are notifications only — state is observed through `observe()`
//! snapshots, never through event payloads.

use simbatch_types::{FolderId, JobId, JobStatus};
use tokio::sync::mpsc;

/// A state-change notification published by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    /// A job transitioned to Running.
    JobStarted { folder: FolderId, job: JobId },
    /// A job left Running: terminal, or re-queued by retry/restart.
    JobFinished {
        folder: FolderId,
        job: JobId,
        status: JobStatus,
    },
    /// An admission pass found nothing running and nothing queued while the
    /// queue was running; the queue is now paused. Fires at most once per
    /// start/pause cycle.
    QueueFinished,
}

/// Cloneable sending half, owned by the scheduler.
#[derive(Clone, Debug)]
pub struct EventSender {
    sender: mpsc::UnboundedSender<SchedulerEvent>,
}

/// Receiving half, owned by the subscribing front-end.
pub struct EventReceiver {
    receiver: mpsc::UnboundedReceiver<SchedulerEvent>,
}

/// Create a connected sender/receiver pair.
pub fn event_channel() -> (EventSender, EventReceiver) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (EventSender { sender }, EventReceiver { receiver })
}

impl EventSender {
    /// Non-blocking. A dropped receiver means nobody is listening; the
    /// event is discarded.
    pub fn emit(&self, event: SchedulerEvent) {
        let _ = self.sender.send(event);
    }
}

impl EventReceiver {
    /// Wait for the next event. `None` once the scheduler is gone.
    pub async fn recv(&mut self) -> Option<SchedulerEvent> {
        self.receiver.recv().await
    }

    /// Non-blocking poll.
    pub fn try_recv(&mut self) -> Option<SchedulerEvent> {
        self.receiver.try_recv().ok()
    }

    /// Collect everything currently pending.
    pub fn drain(&mut self) -> Vec<SchedulerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.receiver.try_recv() {
            events.push(event);
        }
        events
    }
}
