/*!
Cron-driven job scheduling.

The scheduler keeps a min-heap of `(next fire time, schedule)` entries. Each
tick pops every entry due at or before now, expands it to the devices it
targets, coalesces duplicate fires per device into one job and reinserts the
entry at its next fire time after now, so fires missed while the process was
busy or down collapse into one.

A device whose job is still queued or running, or which is being restored,
is skipped for that tick. Concurrency across devices is bounded by the
engine's worker permits.
*/

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BinaryHeap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::SchedulerSettings;
use crate::cron::CronExpr;
use crate::device::{Device, DeviceId};
use crate::engine::ExecutionEngine;
use crate::job::{Job, JobId, JobOrigin, JobState};
use crate::outcome::BatchReport;
use crate::registry::RejectedEntry;
use crate::{Result, VaultError};

/// Schedule entry as written in the configuration file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScheduleSpec {
    pub id: String,
    pub cron: String,
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Devices a schedule fires for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleTarget {
    All,
    Device(DeviceId),
    Group(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Schedule {
    pub id: String,
    pub cron: CronExpr,
    pub target: ScheduleTarget,
    pub enabled: bool,
}

impl Schedule {
    /// Devices also opt in by naming the schedule in their own record
    pub fn applies_to(&self, device: &Device) -> bool {
        if device.schedule.as_deref() == Some(self.id.as_str()) {
            return true;
        }
        match &self.target {
            ScheduleTarget::All => true,
            ScheduleTarget::Device(id) => &device.id == id,
            ScheduleTarget::Group(group) => &device.group == group,
        }
    }
}

impl TryFrom<ScheduleSpec> for Schedule {
    type Error = VaultError;

    fn try_from(spec: ScheduleSpec) -> Result<Self> {
        if spec.id.trim().is_empty() {
            return Err(VaultError::validation("schedule id must not be empty"));
        }
        let target = match (spec.device, spec.group) {
            (Some(_), Some(_)) => {
                return Err(VaultError::validation(
                    "a schedule targets a device or a group, not both",
                ))
            }
            (Some(device), None) => ScheduleTarget::Device(DeviceId::new(device)?),
            (None, Some(group)) => ScheduleTarget::Group(group),
            (None, None) => ScheduleTarget::All,
        };
        Ok(Self {
            cron: CronExpr::parse(&spec.cron)?,
            id: spec.id,
            target,
            enabled: spec.enabled,
        })
    }
}

/// Parse schedule entries one by one; bad entries are reported, not fatal
pub fn parse_schedules(entries: &[serde_yaml::Value]) -> (Vec<Schedule>, Vec<RejectedEntry>) {
    let mut schedules: Vec<Schedule> = Vec::new();
    let mut rejected = Vec::new();
    let mut seen = HashSet::new();

    for (index, entry) in entries.iter().enumerate() {
        let id = entry.get("id").and_then(|v| v.as_str()).map(str::to_string);
        let parsed = serde_yaml::from_value::<ScheduleSpec>(entry.clone())
            .map_err(VaultError::from)
            .and_then(Schedule::try_from)
            .and_then(|schedule| {
                if seen.insert(schedule.id.clone()) {
                    Ok(schedule)
                } else {
                    Err(VaultError::validation(format!(
                        "duplicate schedule id '{}'",
                        schedule.id
                    )))
                }
            });

        match parsed {
            Ok(schedule) => schedules.push(schedule),
            Err(e) => {
                warn!(index, id = ?id, "Rejected schedule entry: {e}");
                rejected.push(RejectedEntry {
                    index,
                    id,
                    reason: e.to_string(),
                });
            }
        }
    }
    (schedules, rejected)
}

/// Anything that can start a backup for one device
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BackupTrigger: Send + Sync {
    /// Queue a backup; `None` when the device already has work in flight
    async fn trigger(&self, device_id: &DeviceId, origin: JobOrigin) -> Result<Option<JobId>>;
}

/// What one tick did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub enqueued: Vec<JobId>,
    /// Extra fires folded into a job already enqueued this tick
    pub coalesced: usize,
    /// Devices passed over because they were busy
    pub skipped: Vec<DeviceId>,
}

impl TickReport {
    pub fn is_empty(&self) -> bool {
        self.enqueued.is_empty() && self.coalesced == 0 && self.skipped.is_empty()
    }
}

/// Scheduler state persisted across restarts
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerState {
    pub saved_at: Option<DateTime<Utc>>,
    /// Last fire time per schedule id
    #[serde(default)]
    pub last_fired: BTreeMap<String, DateTime<Utc>>,
    /// Jobs that were queued but never started
    #[serde(default)]
    pub queued: Vec<Job>,
}

impl SchedulerState {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Option<Self>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&raw)?))
    }

    /// Write-then-rename so a crash never leaves a torn state file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)?;

        let mut temp = NamedTempFile::new_in(parent)?;
        temp.write_all(&serde_json::to_vec_pretty(self)?)?;
        temp.as_file().sync_all()?;
        temp.persist(path)
            .map_err(|e| VaultError::storage(format!("Failed to persist {}: {e}", path.display())))?;
        Ok(())
    }
}

#[derive(Default)]
struct ScheduleBook {
    schedules: Vec<Schedule>,
    queue: BinaryHeap<Reverse<(DateTime<Utc>, usize)>>,
    last_fired: BTreeMap<String, DateTime<Utc>>,
}

impl ScheduleBook {
    /// A schedule that missed a fire since it last ran is due right away
    fn rebuild(&mut self, now: DateTime<Utc>) {
        self.queue.clear();
        for (idx, schedule) in self.schedules.iter().enumerate() {
            if !schedule.enabled {
                continue;
            }
            let missed = self
                .last_fired
                .get(&schedule.id)
                .and_then(|last| schedule.cron.next_after(*last))
                .filter(|at| *at <= now);
            let next = missed.map(|_| now).or_else(|| schedule.cron.next_after(now));
            match next {
                Some(at) => self.queue.push(Reverse((at, idx))),
                None => warn!(schedule = %schedule.id, "Schedule never fires"),
            }
        }
    }
}

pub struct Scheduler {
    engine: Arc<ExecutionEngine>,
    book: Mutex<ScheduleBook>,
    tracker: TaskTracker,
    stop: CancellationToken,
    tick_interval: Duration,
    state_path: Option<PathBuf>,
}

impl Scheduler {
    pub fn new(
        engine: Arc<ExecutionEngine>,
        schedules: Vec<Schedule>,
        settings: &SchedulerSettings,
    ) -> Self {
        let scheduler = Self {
            engine,
            book: Mutex::new(ScheduleBook::default()),
            tracker: TaskTracker::new(),
            stop: CancellationToken::new(),
            tick_interval: settings.tick_interval(),
            state_path: settings.state_path.clone(),
        };
        scheduler.set_schedules(schedules, Utc::now());
        scheduler
    }

    fn book(&self) -> std::sync::MutexGuard<'_, ScheduleBook> {
        self.book.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn engine(&self) -> &Arc<ExecutionEngine> {
        &self.engine
    }

    /// Replace the schedule set, keeping fire history by schedule id
    pub fn set_schedules(&self, schedules: Vec<Schedule>, now: DateTime<Utc>) {
        let mut book = self.book();
        book.schedules = schedules;
        book.rebuild(now);
    }

    pub fn schedules(&self) -> Vec<Schedule> {
        self.book().schedules.clone()
    }

    /// Upcoming fire time per schedule, soonest first
    pub fn upcoming(&self) -> Vec<(String, DateTime<Utc>)> {
        let book = self.book();
        let mut entries: Vec<_> = book
            .queue
            .iter()
            .filter_map(|Reverse((at, idx))| book.schedules.get(*idx).map(|s| (s.id.clone(), *at)))
            .collect();
        entries.sort_by_key(|(_, at)| *at);
        entries
    }

    /// Apply persisted state without running anything
    ///
    /// Jobs that never started go back into the ledger as Queued, so
    /// [`Scheduler::shutdown`] persists them again. Returns their ids.
    pub fn adopt(&self, state: SchedulerState, now: DateTime<Utc>) -> Vec<JobId> {
        {
            let mut book = self.book();
            book.last_fired = state.last_fired;
            book.rebuild(now);
        }
        let known: HashSet<DeviceId> = self.engine.registry().ids().into_iter().collect();
        let jobs: Vec<Job> = state
            .queued
            .into_iter()
            .filter(|j| known.contains(&j.device_id))
            .collect();
        let ids: Vec<JobId> = jobs.iter().map(|j| j.id).collect();
        self.engine.ledger().restore_queued(jobs);

        ids.into_iter()
            .filter(|id| {
                self.engine
                    .ledger()
                    .get(*id)
                    .map_or(false, |j| j.state == JobState::Queued)
            })
            .collect()
    }

    /// Adopt `state` and dispatch its queued jobs
    ///
    /// Must run inside a Tokio runtime.
    pub fn resume(&self, state: SchedulerState, now: DateTime<Utc>) -> usize {
        let ids = self.adopt(state, now);
        for id in &ids {
            self.dispatch(*id);
        }
        if !ids.is_empty() {
            info!(restored = ids.len(), "Resumed queued jobs from previous run");
        }
        ids.len()
    }

    /// Fire every schedule due at `now`
    pub fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let devices = self.engine.registry().list(None);
        let mut report = TickReport::default();
        let mut due: BTreeMap<DeviceId, String> = BTreeMap::new();

        {
            let mut book = self.book();
            let mut fired = Vec::new();
            while let Some(Reverse((at, idx))) = book.queue.peek().copied() {
                if at > now {
                    break;
                }
                book.queue.pop();
                fired.push(idx);
            }

            for idx in fired {
                let Some(schedule) = book.schedules.get(idx).cloned() else {
                    continue;
                };
                for device in devices.iter().filter(|d| schedule.applies_to(d)) {
                    match due.entry(device.id.clone()) {
                        Entry::Vacant(slot) => {
                            slot.insert(schedule.id.clone());
                        }
                        Entry::Occupied(_) => report.coalesced += 1,
                    }
                }
                book.last_fired.insert(schedule.id.clone(), now);
                match schedule.cron.next_after(now) {
                    Some(next) => book.queue.push(Reverse((next, idx))),
                    None => warn!(schedule = %schedule.id, "Schedule has no further fire time"),
                }
            }
        }

        for (device_id, schedule) in due {
            if self.is_busy(&device_id) {
                debug!(%device_id, %schedule, "Device busy, skipping scheduled fire");
                report.skipped.push(device_id);
                continue;
            }
            match self
                .engine
                .ledger()
                .enqueue(&device_id, JobOrigin::Scheduled { schedule })
            {
                Some(job_id) => {
                    self.dispatch(job_id);
                    report.enqueued.push(job_id);
                }
                None => report.skipped.push(device_id),
            }
        }
        report
    }

    fn is_busy(&self, device_id: &DeviceId) -> bool {
        self.engine.ledger().has_active(device_id) || self.engine.claims().is_held(device_id)
    }

    /// Run a queued job on the worker pool
    fn dispatch(&self, job_id: JobId) -> tokio::task::JoinHandle<Option<Job>> {
        let engine = Arc::clone(&self.engine);
        let stop = self.stop.clone();
        self.tracker.spawn(async move {
            // Left queued so teardown persists it
            if stop.is_cancelled() {
                return None;
            }
            match engine.run(job_id).await {
                Ok(job) => Some(job),
                Err(e) => {
                    warn!(%job_id, "Job could not run: {e}");
                    None
                }
            }
        })
    }

    /// Back up one device now and wait for the job to finish
    ///
    /// Returns `None` when the device already has a job in flight.
    pub async fn backup_now(&self, device_id: &DeviceId) -> Result<Option<Job>> {
        self.engine.registry().get(device_id)?;
        if self.engine.claims().is_held(device_id) {
            return Ok(None);
        }
        let Some(job_id) = self.engine.ledger().enqueue(device_id, JobOrigin::Manual) else {
            return Ok(None);
        };
        self.tracker
            .track_future(self.engine.run(job_id))
            .await
            .map(Some)
    }

    /// Back up every device, optionally one group, and wait for all jobs
    pub async fn trigger_all(&self, group: Option<&str>) -> BatchReport {
        let mut report = BatchReport::default();
        let mut handles = Vec::new();

        for device in self.engine.registry().list(group) {
            if self.engine.claims().is_held(&device.id) {
                report.skipped.push(device.id);
                continue;
            }
            match self.engine.ledger().enqueue(&device.id, JobOrigin::Batch) {
                Some(job_id) => handles.push(self.dispatch(job_id)),
                None => report.skipped.push(device.id),
            }
        }

        for joined in futures::future::join_all(handles).await {
            match joined {
                Ok(Some(job)) => report.jobs.push(job),
                Ok(None) => {}
                Err(e) => warn!("Backup task panicked: {e}"),
            }
        }
        info!(
            jobs = report.jobs.len(),
            skipped = report.skipped.len(),
            status = %report.status(),
            "Batch finished"
        );
        report
    }

    /// Wait for every dispatched job to finish
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Tick on the configured interval until teardown
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval = ?self.tick_interval, "Scheduler started");

        loop {
            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = interval.tick() => {
                    let report = self.tick(Utc::now());
                    if !report.is_empty() {
                        info!(
                            enqueued = report.enqueued.len(),
                            coalesced = report.coalesced,
                            skipped = report.skipped.len(),
                            "Scheduler tick"
                        );
                    }
                }
            }
        }
        debug!("Scheduler loop stopped");
    }

    pub fn state(&self) -> SchedulerState {
        SchedulerState {
            saved_at: Some(Utc::now()),
            last_fired: self.book().last_fired.clone(),
            queued: self.engine.ledger().in_state(JobState::Queued),
        }
    }

    /// Stop ticking, drain in-flight jobs and persist what is left
    pub async fn shutdown(&self) -> Result<SchedulerState> {
        self.stop.cancel();
        self.tracker.close();
        self.tracker.wait().await;

        let state = self.state();
        if let Some(path) = &self.state_path {
            state.save(path)?;
            info!(path = %path.display(), queued = state.queued.len(), "Scheduler state saved");
        }
        Ok(state)
    }
}

#[async_trait]
impl BackupTrigger for Scheduler {
    async fn trigger(&self, device_id: &DeviceId, origin: JobOrigin) -> Result<Option<JobId>> {
        self.engine.registry().get(device_id)?;
        if self.engine.claims().is_held(device_id) {
            return Ok(None);
        }
        let job_id = self.engine.ledger().enqueue(device_id, origin);
        if let Some(id) = job_id {
            self.dispatch(id);
        }
        Ok(job_id)
    }
}
