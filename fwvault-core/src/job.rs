/*!
Backup jobs and the ledger that owns them.

A job moves `Queued → Running → {Succeeded, Failed, Aborted}` and never
backwards. Retries stay inside `Running`; only the attempt counter moves.
The ledger guarantees at most one `Queued` or `Running` job per device and
keeps a bounded window of terminal jobs for history queries.
*/

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Mutex;
use uuid::Uuid;

use crate::device::DeviceId;
use crate::diff::DiffRecord;
use crate::error::TransportError;
use crate::metadata::{CaptureInfo, SnapshotId};
use crate::{Result, VaultError};

/// Default number of terminal jobs kept for history
pub const DEFAULT_HISTORY_WINDOW: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Uuid::parse_str(raw)
            .map(Self)
            .map_err(|e| VaultError::validation(format!("invalid job id '{raw}': {e}")))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Aborted,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Aborted)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Forward-only transition table
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Queued, Running) | (Queued, Aborted) | (Running, Succeeded | Failed | Aborted)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What asked for the job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobOrigin {
    Scheduled { schedule: String },
    Manual,
    Batch,
    /// Capture of the state a restore just produced
    PostRestore { restored: SnapshotId },
}

/// Failure classification kept on the job record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorKind {
    Timeout,
    AuthFailure,
    Unreachable,
    Protocol,
    Validation,
    Storage,
    CredentialMissing,
    DeviceNotFound,
    DeviceBusy,
    Cancelled,
    Internal,
}

impl JobErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::AuthFailure => "auth_failure",
            Self::Unreachable => "unreachable",
            Self::Protocol => "protocol",
            Self::Validation => "validation",
            Self::Storage => "storage",
            Self::CredentialMissing => "credential_missing",
            Self::DeviceNotFound => "device_not_found",
            Self::DeviceBusy => "device_busy",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: JobErrorKind,
    pub message: String,
}

impl JobError {
    pub fn new<S: Into<String>>(kind: JobErrorKind, message: S) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(JobErrorKind::Cancelled, "job was cancelled")
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl From<&TransportError> for JobError {
    fn from(error: &TransportError) -> Self {
        let kind = match error {
            TransportError::Timeout(_) => JobErrorKind::Timeout,
            TransportError::AuthFailure(_) => JobErrorKind::AuthFailure,
            TransportError::Unreachable(_) => JobErrorKind::Unreachable,
            TransportError::Protocol(_) => JobErrorKind::Protocol,
        };
        Self::new(kind, error.to_string())
    }
}

impl From<&VaultError> for JobError {
    fn from(error: &VaultError) -> Self {
        let kind = match error {
            VaultError::Transport(t) => return t.into(),
            VaultError::Validation(_) => JobErrorKind::Validation,
            VaultError::CredentialMissing(_) => JobErrorKind::CredentialMissing,
            VaultError::DeviceNotFound(_) => JobErrorKind::DeviceNotFound,
            VaultError::DeviceBusy(_) => JobErrorKind::DeviceBusy,
            e if e.is_storage() => JobErrorKind::Storage,
            _ => JobErrorKind::Internal,
        };
        Self::new(kind, error.to_string())
    }
}

/// A validated capture that could not be published
#[derive(Debug, Clone)]
pub struct OrphanedCapture {
    pub content: Vec<u8>,
    pub info: CaptureInfo,
    /// When the transport returned it
    pub captured_at: DateTime<Utc>,
}

/// One backup attempt for one device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub device_id: DeviceId,
    pub origin: JobOrigin,
    pub requested_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub state: JobState,
    #[serde(default)]
    pub snapshot_id: Option<SnapshotId>,
    #[serde(default)]
    pub diff: Option<DiffRecord>,
    #[serde(default)]
    pub error: Option<JobError>,
    /// Held in memory only, never serialized
    #[serde(skip)]
    pub orphaned_capture: Option<OrphanedCapture>,
}

impl Job {
    pub fn new(device_id: DeviceId, origin: JobOrigin) -> Self {
        Self {
            id: JobId::new(),
            device_id,
            origin,
            requested_at: Utc::now(),
            started_at: None,
            finished_at: None,
            attempts: 0,
            state: JobState::Queued,
            snapshot_id: None,
            diff: None,
            error: None,
            orphaned_capture: None,
        }
    }

    pub fn transition(&mut self, next: JobState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(VaultError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        let now = Utc::now();
        if next == JobState::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        self.state = next;
        Ok(())
    }

    /// Wall time between start and finish, if both happened
    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.finished_at? - self.started_at?)
    }
}

#[derive(Default)]
struct LedgerInner {
    jobs: HashMap<JobId, Job>,
    active_by_device: HashMap<DeviceId, JobId>,
    terminal_order: VecDeque<JobId>,
}

impl LedgerInner {
    fn record_terminal(&mut self, id: JobId, window: usize) {
        if let Some(job) = self.jobs.get(&id) {
            if self.active_by_device.get(&job.device_id) == Some(&id) {
                self.active_by_device.remove(&job.device_id);
            }
        }
        self.terminal_order.push_back(id);
        while self.terminal_order.len() > window {
            if let Some(old) = self.terminal_order.pop_front() {
                self.jobs.remove(&old);
            }
        }
    }
}

/// Process-wide job table
pub struct JobLedger {
    inner: Mutex<LedgerInner>,
    history_window: usize,
}

impl Default for JobLedger {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_WINDOW)
    }
}

impl JobLedger {
    pub fn new(history_window: usize) -> Self {
        Self {
            inner: Mutex::new(LedgerInner::default()),
            history_window: history_window.max(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LedgerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a job unless the device already has an active one
    pub fn enqueue(&self, device_id: &DeviceId, origin: JobOrigin) -> Option<JobId> {
        let mut inner = self.lock();
        if inner.active_by_device.contains_key(device_id) {
            return None;
        }
        let job = Job::new(device_id.clone(), origin);
        let id = job.id;
        inner.active_by_device.insert(device_id.clone(), id);
        inner.jobs.insert(id, job);
        Some(id)
    }

    /// Re-admit queued jobs persisted by a previous process
    pub fn restore_queued(&self, jobs: Vec<Job>) -> usize {
        let mut inner = self.lock();
        let mut restored = 0;
        for mut job in jobs {
            if job.state != JobState::Queued || inner.active_by_device.contains_key(&job.device_id)
            {
                continue;
            }
            job.orphaned_capture = None;
            inner.active_by_device.insert(job.device_id.clone(), job.id);
            inner.jobs.insert(job.id, job);
            restored += 1;
        }
        restored
    }

    /// Atomically move a queued job to `Running`; only one caller wins
    pub fn claim(&self, id: JobId) -> Result<Job> {
        let mut inner = self.lock();
        let job = inner
            .jobs
            .get_mut(&id)
            .ok_or_else(|| VaultError::validation(format!("unknown job {id}")))?;
        job.transition(JobState::Running)?;
        Ok(job.clone())
    }

    /// Mutate a job in place; terminal transitions are recorded for pruning
    pub fn update<T>(&self, id: JobId, f: impl FnOnce(&mut Job) -> Result<T>) -> Result<T> {
        let mut inner = self.lock();
        let job = inner
            .jobs
            .get_mut(&id)
            .ok_or_else(|| VaultError::validation(format!("unknown job {id}")))?;
        let was_terminal = job.state.is_terminal();
        let value = f(job)?;
        if !was_terminal && job.state.is_terminal() {
            inner.record_terminal(id, self.history_window);
        }
        Ok(value)
    }

    /// Move a job to a terminal state with an optional error record
    pub fn finish(&self, id: JobId, state: JobState, error: Option<JobError>) -> Result<Job> {
        self.update(id, |job| {
            job.transition(state)?;
            job.error = error;
            Ok(job.clone())
        })
    }

    pub fn get(&self, id: JobId) -> Option<Job> {
        self.lock().jobs.get(&id).cloned()
    }

    pub fn active_for(&self, device_id: &DeviceId) -> Option<JobId> {
        self.lock().active_by_device.get(device_id).copied()
    }

    pub fn has_active(&self, device_id: &DeviceId) -> bool {
        self.active_for(device_id).is_some()
    }

    /// Jobs in a given state, oldest request first
    pub fn in_state(&self, state: JobState) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .lock()
            .jobs
            .values()
            .filter(|j| j.state == state)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.requested_at);
        jobs
    }

    pub fn active_count(&self) -> usize {
        self.lock().active_by_device.len()
    }

    /// Known jobs, optionally for one device, newest first
    pub fn history(&self, device_id: Option<&DeviceId>) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .lock()
            .jobs
            .values()
            .filter(|j| device_id.map_or(true, |d| &j.device_id == d))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.requested_at.cmp(&a.requested_at));
        jobs
    }

    /// Jobs holding a capture that storage refused
    pub fn orphaned(&self) -> Vec<JobId> {
        self.lock()
            .jobs
            .values()
            .filter(|j| j.orphaned_capture.is_some())
            .map(|j| j.id)
            .collect()
    }
}
