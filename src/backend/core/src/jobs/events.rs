//! Job lifecycle notifications.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::job::{JobError, JobId};

/// Events emitted as jobs move through their lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    /// Job accepted by the queue
    Added { job_id: JobId, name: String },
    /// An attempt began on a worker
    Started {
        job_id: JobId,
        name: String,
        attempt: u32,
    },
    /// Handler returned a result
    Completed {
        job_id: JobId,
        name: String,
        result: serde_json::Value,
        duration_ms: u64,
    },
    /// Job failed for good
    Failed {
        job_id: JobId,
        name: String,
        error: JobError,
        attempts: u32,
    },
    /// Attempt failed, another one will follow after `delay_ms`
    Retrying {
        job_id: JobId,
        name: String,
        error: JobError,
        attempt: u32,
        delay_ms: u64,
    },
    /// Scheduled job became pending
    Promoted { job_id: JobId, name: String },
    /// Queue finished draining
    Stopped,
}

impl JobEvent {
    /// The job this event concerns, if any.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            Self::Added { job_id, .. }
            | Self::Started { job_id, .. }
            | Self::Completed { job_id, .. }
            | Self::Failed { job_id, .. }
            | Self::Retrying { job_id, .. }
            | Self::Promoted { job_id, .. } => Some(*job_id),
            Self::Stopped => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Added { .. } => "added",
            Self::Started { .. } => "started",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
            Self::Retrying { .. } => "retrying",
            Self::Promoted { .. } => "promoted",
            Self::Stopped => "stopped",
        }
    }
}

/// Fan-out channel for [`JobEvent`]s.
///
/// Sending never blocks. A subscriber that falls more than `capacity` events
/// behind observes `RecvError::Lagged` and skips ahead.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<JobEvent>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero. Queue construction validates this first.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }

    /// Emit an event.
    pub fn emit(&self, event: JobEvent) {
        // Ignore send errors (no subscribers)
        let _ = self.sender.send(event);
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
