//! Typed engine events, fanned out over a tokio broadcast channel.
//!
//! Delivery (mail, chat, dashboards) belongs to subscribers. Drift is a
//! separate event from job success, so a routine backup never looks like a
//! change notification.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::device::DeviceId;
use crate::job::{JobError, JobId};
use crate::metadata::SnapshotId;

const DEFAULT_CAPACITY: usize = 256;

/// Which side of a push the device is known to be on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LastConfirmedState {
    /// The push never completed; the device holds the configuration read before it
    PrePush,
    /// The push completed, or a read after a failed push matched the target
    PostPush,
    /// A failed push left something that matches neither side, or the device could not be read back
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    JobSucceeded {
        job_id: JobId,
        device_id: DeviceId,
        snapshot_id: SnapshotId,
        attempts: u32,
        at: DateTime<Utc>,
    },
    JobFailed {
        job_id: JobId,
        device_id: DeviceId,
        error: JobError,
        attempts: u32,
        at: DateTime<Utc>,
    },
    DriftDetected {
        device_id: DeviceId,
        previous: SnapshotId,
        current: SnapshotId,
        lines_added: usize,
        lines_removed: usize,
        at: DateTime<Utc>,
    },
    RestoreCompleted {
        device_id: DeviceId,
        snapshot_id: SnapshotId,
        post_restore_job: Option<JobId>,
        at: DateTime<Utc>,
    },
    RestoreFailed {
        device_id: DeviceId,
        snapshot_id: SnapshotId,
        reason: String,
        last_confirmed: LastConfirmedState,
        at: DateTime<Utc>,
    },
}

impl EngineEvent {
    pub fn device_id(&self) -> &DeviceId {
        match self {
            Self::JobSucceeded { device_id, .. }
            | Self::JobFailed { device_id, .. }
            | Self::DriftDetected { device_id, .. }
            | Self::RestoreCompleted { device_id, .. }
            | Self::RestoreFailed { device_id, .. } => device_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::JobSucceeded { .. } => "job_succeeded",
            Self::JobFailed { .. } => "job_failed",
            Self::DriftDetected { .. } => "drift_detected",
            Self::RestoreCompleted { .. } => "restore_completed",
            Self::RestoreFailed { .. } => "restore_failed",
        }
    }
}

/// Broadcast fan-out; slow subscribers lag rather than block the engine
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: EngineEvent) {
        let kind = event.kind();
        // No subscribers is normal for one-shot CLI runs
        if self.sender.send(event).is_err() {
            trace!(kind, "Event dropped, no subscribers");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
