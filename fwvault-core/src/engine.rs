/*!
Execution engine: runs one backup job end to end.

`fetch → validate → store → diff → events → retention`

A job takes a worker permit before it is claimed and holds it until it
reaches a terminal state, so at most `max_concurrent_jobs` jobs are ever
`Running`; the rest wait `Queued`. Every transport call gets a freshly
resolved credential and runs under a caller-enforced timeout. Transient
transport failures (timeout, unreachable) are retried with exponential
backoff while the job stays `Running`. Cancellation drops the in-flight
transport future, which closes its connection, and nothing is published
after a cancellation is seen.
*/

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use fwvault_retry::{with_backoff, with_backoff_notify, RetryPolicy};

use crate::claim::{ClaimKind, DeviceClaims};
use crate::config::Settings;
use crate::device::{Device, DeviceId};
use crate::diff::{DiffRecord, DiffTracker};
use crate::error::TransportError;
use crate::events::{EngineEvent, EventBus};
use crate::job::{Job, JobError, JobId, JobLedger, JobState, OrphanedCapture};
use crate::metadata::{CaptureInfo, DeviceInfo, SnapshotMetadata};
use crate::observability;
use crate::registry::DeviceRegistry;
use crate::retention::RetentionConfig;
use crate::snapshot::ArtifactStore;
use crate::transport::{BackupTransport, RawConfig, TransportProvider};
use crate::validation::validate_capture;
use crate::{Result, VaultError};

/// Knobs the engine reads on every job
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub job_timeout: Duration,
    pub transport_policy: RetryPolicy,
    pub storage_policy: RetryPolicy,
    pub min_config_bytes: usize,
    pub max_concurrent_jobs: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for EngineSettings {
    fn from(settings: &Settings) -> Self {
        Self {
            job_timeout: settings.execution.job_timeout(),
            transport_policy: settings.execution.transport_policy(),
            storage_policy: settings.execution.storage_policy(),
            min_config_bytes: settings.execution.min_config_bytes,
            max_concurrent_jobs: settings.scheduler.max_concurrent_jobs,
        }
    }
}

/// Result of a connection test
#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub device_id: DeviceId,
    pub bytes: usize,
    pub device_info: Option<DeviceInfo>,
    pub elapsed: Duration,
}

/// Shared collaborators, cloned into each job
pub struct ExecutionEngine {
    registry: Arc<DeviceRegistry>,
    transports: Arc<dyn TransportProvider>,
    store: Arc<dyn ArtifactStore>,
    diff: DiffTracker,
    ledger: Arc<JobLedger>,
    claims: Arc<DeviceClaims>,
    events: EventBus,
    retention: RwLock<RetentionConfig>,
    permits: Arc<Semaphore>,
    settings: EngineSettings,
    cancellations: Mutex<HashMap<JobId, CancellationToken>>,
    shutdown: CancellationToken,
}

/// Why a job stopped before succeeding
enum Stop {
    Failed(JobError),
    Aborted(JobError),
}

impl ExecutionEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<DeviceRegistry>,
        transports: Arc<dyn TransportProvider>,
        store: Arc<dyn ArtifactStore>,
        ledger: Arc<JobLedger>,
        claims: Arc<DeviceClaims>,
        events: EventBus,
        retention: RetentionConfig,
        settings: EngineSettings,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(settings.max_concurrent_jobs.max(1)));
        Self {
            diff: DiffTracker::new(Arc::clone(&store)),
            registry,
            transports,
            store,
            ledger,
            claims,
            events,
            retention: RwLock::new(retention),
            permits,
            settings,
            cancellations: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn ledger(&self) -> &Arc<JobLedger> {
        &self.ledger
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn transports(&self) -> &Arc<dyn TransportProvider> {
        &self.transports
    }

    pub fn claims(&self) -> &Arc<DeviceClaims> {
        &self.claims
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn set_retention(&self, retention: RetentionConfig) {
        *self.retention.write().unwrap_or_else(|e| e.into_inner()) = retention;
    }

    pub fn retention(&self) -> RetentionConfig {
        self.retention
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Jobs holding a worker permit right now
    pub fn busy_workers(&self) -> usize {
        self.settings.max_concurrent_jobs.max(1) - self.permits.available_permits()
    }

    /// Cancel every running job; later jobs abort on claim
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Cancel one job; a queued job is aborted on the spot
    pub fn cancel(&self, job_id: JobId) -> bool {
        if let Some(token) = self.tokens().get(&job_id) {
            token.cancel();
            return true;
        }
        match self.ledger.get(job_id) {
            Some(job) if job.state == JobState::Queued => self
                .ledger
                .finish(job_id, JobState::Aborted, Some(JobError::cancelled()))
                .is_ok(),
            _ => false,
        }
    }

    /// Cancel whatever job is active for a device
    pub fn cancel_device(&self, device_id: &DeviceId) -> bool {
        self.ledger
            .active_for(device_id)
            .map_or(false, |id| self.cancel(id))
    }

    fn tokens(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, CancellationToken>> {
        self.cancellations.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run a queued job to a terminal state and return its final record
    #[instrument(skip(self), fields(device_id = tracing::field::Empty))]
    pub async fn run(&self, job_id: JobId) -> Result<Job> {
        let token = self.shutdown.child_token();
        self.tokens().insert(job_id, token.clone());

        let permit = tokio::select! {
            biased;
            _ = token.cancelled() => {
                self.tokens().remove(&job_id);
                return self.abort_waiting(job_id);
            }
            permit = Arc::clone(&self.permits).acquire_owned() => permit,
        };
        let _permit = match permit {
            Ok(permit) => permit,
            Err(_) => {
                self.tokens().remove(&job_id);
                return Err(VaultError::Unsupported("engine is shutting down".into()));
            }
        };

        let job = match self.ledger.claim(job_id) {
            Ok(job) => job,
            Err(e) => {
                self.tokens().remove(&job_id);
                return Err(e);
            }
        };
        tracing::Span::current().record("device_id", job.device_id.as_str());
        observability::record_job_started();
        let started = Instant::now();

        let outcome = self.execute(&job, &token).await;
        self.tokens().remove(&job_id);

        let finished = match outcome {
            Ok((metadata, diff)) => self.succeed(job_id, metadata, diff)?,
            Err(Stop::Failed(error)) => self.fail(job_id, JobState::Failed, error)?,
            Err(Stop::Aborted(error)) => self.fail(job_id, JobState::Aborted, error)?,
        };
        observability::record_job_finished(finished.state, started.elapsed());
        Ok(finished)
    }

    /// Settle a job cancelled before it got a worker
    ///
    /// Engine shutdown leaves it `Queued` so it is persisted and resumed.
    fn abort_waiting(&self, job_id: JobId) -> Result<Job> {
        let job = self
            .ledger
            .get(job_id)
            .ok_or_else(|| VaultError::validation(format!("unknown job {job_id}")))?;
        if job.state != JobState::Queued || self.shutdown.is_cancelled() {
            return Ok(job);
        }
        self.fail(job_id, JobState::Aborted, JobError::cancelled())
    }

    async fn execute(
        &self,
        job: &Job,
        token: &CancellationToken,
    ) -> std::result::Result<(SnapshotMetadata, Option<DiffRecord>), Stop> {
        if token.is_cancelled() {
            return Err(Stop::Aborted(JobError::cancelled()));
        }
        let device = self
            .registry
            .get(&job.device_id)
            .map_err(|e| Stop::Aborted(JobError::from(&e)))?;
        let _claim = self
            .claims
            .try_claim(&device.id, ClaimKind::Backup)
            .map_err(|e| Stop::Aborted(JobError::from(&e)))?;
        let transport = self
            .transports
            .transport_for(device.transport)
            .map_err(|e| Stop::Failed(JobError::from(&e)))?;

        let raw = tokio::select! {
            biased;
            _ = token.cancelled() => {
                info!(job_id = %job.id, "Job cancelled during fetch");
                return Err(Stop::Aborted(JobError::cancelled()));
            }
            fetched = self.fetch_with_retries(job.id, &device, transport.as_ref()) => {
                fetched.map_err(|e| Stop::Failed(JobError::from(&e)))?
            }
        };
        let fetched_at = Utc::now();

        validate_capture(device.kind, raw.content.as_bytes(), self.settings.min_config_bytes)
            .map_err(|e| {
                warn!(job_id = %job.id, device_id = %device.id, "Capture rejected: {e}");
                Stop::Failed(JobError::from(&e))
            })?;

        // Nothing becomes visible once the job is cancelled
        if token.is_cancelled() {
            return Err(Stop::Aborted(JobError::cancelled()));
        }

        let info = CaptureInfo::new(device.transport)
            .with_device_info(raw.device_info.clone())
            .with_job(job.id.to_string());
        let content = raw.content.into_bytes();
        let metadata = match self.publish(&device.id, &content, &info).await {
            Ok(metadata) => metadata,
            Err(e) => {
                let _ = self.ledger.update(job.id, |j| {
                    j.orphaned_capture = Some(OrphanedCapture {
                        content,
                        info,
                        captured_at: fetched_at,
                    });
                    Ok(())
                });
                return Err(Stop::Failed(JobError::from(&e)));
            }
        };
        observability::record_snapshot_size(metadata.size);

        let diff = match self.diff.compute_diff(device.kind, &metadata) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(device_id = %device.id, snapshot_id = %metadata.snapshot_id, "Diff failed: {e}");
                None
            }
        };

        self.sweep_device(&device);
        Ok((metadata, diff))
    }

    /// Fetch under retry; each attempt resolves a fresh credential
    async fn fetch_with_retries(
        &self,
        job_id: JobId,
        device: &Device,
        transport: &dyn BackupTransport,
    ) -> Result<RawConfig> {
        let timeout = self.settings.job_timeout;
        let result = with_backoff_notify(
            "fetch_config",
            &self.settings.transport_policy,
            |attempt| async move {
                let _ = self.ledger.update(job_id, |j| {
                    j.attempts = attempt as u32;
                    Ok(())
                });
                debug!(%job_id, device_id = %device.id, attempt, "Fetching configuration");

                let credential = self.registry.resolve_credential(&device.id)?;
                let fetched =
                    tokio::time::timeout(timeout, transport.fetch_config(device, &credential, timeout))
                        .await;
                drop(credential);
                match fetched {
                    Ok(result) => result.map_err(VaultError::from),
                    Err(_) => Err(VaultError::from(TransportError::Timeout(timeout))),
                }
            },
            |attempt, err, delay| {
                observability::record_retry();
                info!(%job_id, device_id = %device.id, attempt, ?delay, "Retrying after {err}");
            },
        )
        .await;

        match result {
            Ok(retried) => Ok(retried.value),
            Err(e) => {
                let attempts = e.attempts() as u32;
                let _ = self.ledger.update(job_id, |j| {
                    j.attempts = attempts;
                    Ok(())
                });
                Err(e.into_last_error())
            }
        }
    }

    /// Store with the storage retry policy
    async fn publish(
        &self,
        device_id: &DeviceId,
        content: &[u8],
        info: &CaptureInfo,
    ) -> Result<SnapshotMetadata> {
        with_backoff("store_snapshot", &self.settings.storage_policy, |_| async move {
            self.store.put(device_id, content, info.clone())
        })
        .await
        .map(|r| r.value)
        .map_err(|e| e.into_last_error())
    }

    fn sweep_device(&self, device: &Device) {
        let policy = self.retention().policy_for(&device.id, Some(&device.group));
        match self.store.sweep(&device.id, &policy, Utc::now()) {
            Ok(report) if !report.removed.is_empty() => {
                info!(device_id = %device.id, removed = report.removed.len(), kept = report.kept, "Retention sweep");
            }
            Ok(_) => {}
            Err(e) => warn!(device_id = %device.id, "Retention sweep failed: {e}"),
        }
    }

    fn succeed(
        &self,
        job_id: JobId,
        metadata: SnapshotMetadata,
        diff: Option<DiffRecord>,
    ) -> Result<Job> {
        let job = self.ledger.update(job_id, |j| {
            j.transition(JobState::Succeeded)?;
            j.snapshot_id = Some(metadata.snapshot_id.clone());
            j.diff = diff.clone();
            j.orphaned_capture = None;
            Ok(j.clone())
        })?;
        info!(
            %job_id,
            device_id = %job.device_id,
            snapshot_id = %metadata.snapshot_id,
            attempts = job.attempts,
            change_detected = diff.as_ref().map(|d| d.change_detected),
            "Backup succeeded"
        );

        self.events.emit(EngineEvent::JobSucceeded {
            job_id,
            device_id: job.device_id.clone(),
            snapshot_id: metadata.snapshot_id.clone(),
            attempts: job.attempts,
            at: Utc::now(),
        });
        if let Some(record) = diff.as_ref().filter(|d| d.is_drift()) {
            self.emit_drift(record);
        }
        Ok(job)
    }

    fn emit_drift(&self, record: &DiffRecord) {
        let Some(previous) = record.previous.clone() else {
            return;
        };
        observability::record_drift();
        info!(device_id = %record.device_id, snapshot_id = %record.current, change = %record.summary.stat(), "Configuration drift detected");
        self.events.emit(EngineEvent::DriftDetected {
            device_id: record.device_id.clone(),
            previous,
            current: record.current.clone(),
            lines_added: record.summary.added.len(),
            lines_removed: record.summary.removed.len(),
            at: Utc::now(),
        });
    }

    fn fail(&self, job_id: JobId, state: JobState, error: JobError) -> Result<Job> {
        let job = self.ledger.finish(job_id, state, Some(error.clone()))?;
        warn!(
            %job_id,
            device_id = %job.device_id,
            attempts = job.attempts,
            state = %state,
            "Backup did not complete: {error}"
        );
        self.events.emit(EngineEvent::JobFailed {
            job_id,
            device_id: job.device_id.clone(),
            error,
            attempts: job.attempts,
            at: Utc::now(),
        });
        Ok(job)
    }

    /// Publish the capture a failed job kept after storage refused it
    ///
    /// The job stays `Failed`; it gains the snapshot id and loses the capture.
    /// A capture older than the device's newest snapshot is discarded instead,
    /// since snapshots are appended in capture order.
    pub async fn retry_store(&self, job_id: JobId) -> Result<SnapshotMetadata> {
        let job = self
            .ledger
            .get(job_id)
            .ok_or_else(|| VaultError::validation(format!("unknown job {job_id}")))?;
        let orphan = job.orphaned_capture.ok_or_else(|| {
            VaultError::validation(format!("job {job_id} holds no unsaved capture"))
        })?;
        if let Some(latest) = self.store.latest(&job.device_id)? {
            if latest.captured_at > orphan.captured_at {
                self.ledger.update(job_id, |j| {
                    j.orphaned_capture = None;
                    Ok(())
                })?;
                warn!(%job_id, snapshot_id = %latest.snapshot_id, "Discarded unsaved capture superseded by a newer snapshot");
                return Err(VaultError::validation(format!(
                    "capture of job {job_id} from {} is older than snapshot {}",
                    orphan.captured_at, latest.snapshot_id
                )));
            }
        }
        let kind = self
            .registry
            .get(&job.device_id)
            .map(|d| d.kind)
            .unwrap_or_default();

        let metadata = self
            .publish(&job.device_id, &orphan.content, &orphan.info)
            .await?;
        let diff = self.diff.compute_diff(kind, &metadata).ok();
        self.ledger.update(job_id, |j| {
            j.orphaned_capture = None;
            j.snapshot_id = Some(metadata.snapshot_id.clone());
            j.diff = diff.clone();
            Ok(())
        })?;
        info!(%job_id, snapshot_id = %metadata.snapshot_id, "Recovered unsaved capture");
        if let Some(record) = diff.as_ref().filter(|d| d.is_drift()) {
            self.emit_drift(record);
        }
        Ok(metadata)
    }

    /// One fetch and validation without storing anything
    pub async fn probe(&self, device_id: &DeviceId) -> Result<ProbeReport> {
        let device = self.registry.get(device_id)?;
        let transport = self.transports.transport_for(device.transport)?;
        let credential = self.registry.resolve_credential(device_id)?;
        let timeout = self.settings.job_timeout;
        let started = Instant::now();

        let raw = tokio::time::timeout(timeout, transport.fetch_config(&device, &credential, timeout))
            .await
            .map_err(|_| TransportError::Timeout(timeout))??;
        drop(credential);
        validate_capture(device.kind, raw.content.as_bytes(), self.settings.min_config_bytes)?;

        Ok(ProbeReport {
            device_id: device.id,
            bytes: raw.len(),
            device_info: raw.device_info,
            elapsed: started.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::NoCompression;
    use crate::credential::{Credential, StaticCredentialResolver};
    use crate::device::{CredentialRef, TransportMethod};
    use crate::job::{JobErrorKind, JobOrigin};
    use crate::snapshot::SnapshotStore;
    use crate::storage::MemoryStorage;
    use crate::transport::{ScriptedTransport, Step, TransportRegistry};

    const CONFIG: &str = "#config-version=FGT60F-7.2.5-FW-build1517-230606:opmode=0\nconfig system global\n    set hostname \"fw-01\"\n    set timezone 04\nend\n";

    struct Harness {
        engine: ExecutionEngine,
        transport: Arc<ScriptedTransport>,
        fw: DeviceId,
    }

    fn harness() -> Harness {
        let reference = CredentialRef::env("FW01");
        let resolver = StaticCredentialResolver::new()
            .insert(&reference, Credential::password("admin", "secret"));
        let registry = Arc::new(DeviceRegistry::new(Arc::new(resolver)));
        let entry: serde_yaml::Value = serde_yaml::from_str(
            "id: fw-01\ntransport: ssh_cli\nconnection:\n  host: 10.0.0.1\n  credential: env:FW01\n",
        )
        .unwrap();
        assert!(registry.import(&[entry]).is_clean());

        let transport = Arc::new(ScriptedTransport::new(TransportMethod::SshCli));
        let store: Arc<dyn ArtifactStore> =
            Arc::new(SnapshotStore::new(MemoryStorage::new(), NoCompression::new()));
        let settings = EngineSettings {
            job_timeout: Duration::from_secs(5),
            transport_policy: RetryPolicy::new(3)
                .with_intervals(Duration::from_millis(100), Duration::from_secs(1))
                .without_jitter(),
            storage_policy: RetryPolicy::new(2).without_jitter(),
            min_config_bytes: 10,
            max_concurrent_jobs: 2,
        };
        let engine = ExecutionEngine::new(
            registry,
            Arc::new(TransportRegistry::uniform(transport.clone())),
            store,
            Arc::new(JobLedger::default()),
            DeviceClaims::new(),
            EventBus::default(),
            RetentionConfig::default(),
            settings,
        );
        Harness {
            engine,
            transport,
            fw: DeviceId::new("fw-01").unwrap(),
        }
    }

    fn enqueue(h: &Harness) -> JobId {
        h.engine
            .ledger()
            .enqueue(&h.fw, JobOrigin::Manual)
            .unwrap()
    }

    #[tokio::test]
    async fn test_successful_job_stores_snapshot() {
        let h = harness();
        h.transport.set_live(&h.fw, CONFIG);
        let mut events = h.engine.events().subscribe();

        let job = h.engine.run(enqueue(&h)).await.unwrap();
        assert_eq!(job.state, JobState::Succeeded);
        assert_eq!(job.attempts, 1);
        let snapshot = job.snapshot_id.unwrap();
        assert_eq!(h.engine.store().get(&snapshot).unwrap(), CONFIG.as_bytes());
        assert!(job.diff.unwrap().previous.is_none());

        let event = events.recv().await.unwrap();
        assert_eq!(event.kind(), "job_succeeded");
        // First capture is new, not drift
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_retried_until_success() {
        let h = harness();
        h.transport.push_step(&h.fw, Step::Hang);
        h.transport.push_step(&h.fw, Step::Hang);
        h.transport.set_live(&h.fw, CONFIG);

        let job = h.engine.run(enqueue(&h)).await.unwrap();
        assert_eq!(job.state, JobState::Succeeded);
        assert_eq!(job.attempts, 3);
        assert_eq!(h.transport.fetch_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failure_is_not_retried() {
        let h = harness();
        h.transport
            .push_step(&h.fw, Step::Fail(TransportError::auth("bad password")));
        h.transport.set_live(&h.fw, CONFIG);

        let job = h.engine.run(enqueue(&h)).await.unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.error.unwrap().kind, JobErrorKind::AuthFailure);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted() {
        let h = harness();
        for _ in 0..3 {
            h.transport
                .push_step(&h.fw, Step::Fail(TransportError::unreachable("no route")));
        }
        let job = h.engine.run(enqueue(&h)).await.unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempts, 3);
        assert_eq!(job.error.unwrap().kind, JobErrorKind::Unreachable);
    }

    #[tokio::test]
    async fn test_invalid_capture_fails_without_snapshot() {
        let h = harness();
        h.transport
            .push_step(&h.fw, Step::Config("config system global\n".to_string()));

        let job = h.engine.run(enqueue(&h)).await.unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.error.unwrap().kind, JobErrorKind::Validation);
        assert!(h.engine.store().list(&h.fw).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_claim_is_single_use() {
        let h = harness();
        h.transport.set_live(&h.fw, CONFIG);
        let id = enqueue(&h);
        h.engine.run(id).await.unwrap();
        assert!(matches!(
            h.engine.run(id).await,
            Err(VaultError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_during_fetch_aborts() {
        let h = Arc::new(harness());
        h.transport.push_step(&h.fw, Step::Hang);
        let id = enqueue(&h);

        let runner = {
            let h = Arc::clone(&h);
            tokio::spawn(async move { h.engine.run(id).await })
        };
        while h.engine.ledger().get(id).unwrap().state != JobState::Running {
            tokio::task::yield_now().await;
        }
        assert!(h.engine.cancel_device(&h.fw));

        let job = runner.await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Aborted);
        assert_eq!(job.error.unwrap().kind, JobErrorKind::Cancelled);
        assert!(h.engine.store().list(&h.fw).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_removed_device_aborts() {
        let h = harness();
        let id = enqueue(&h);
        h.engine.registry().remove(&h.fw).unwrap();
        let job = h.engine.run(id).await.unwrap();
        assert_eq!(job.state, JobState::Aborted);
        assert_eq!(job.error.unwrap().kind, JobErrorKind::DeviceNotFound);
    }

    #[tokio::test]
    async fn test_probe_does_not_store() {
        let h = harness();
        h.transport.set_live(&h.fw, CONFIG);
        let report = h.engine.probe(&h.fw).await.unwrap();
        assert_eq!(report.bytes, CONFIG.len());
        assert_eq!(report.device_info.unwrap().model.as_deref(), Some("FGT60F"));
        assert!(h.engine.store().list(&h.fw).unwrap().is_empty());
    }
}
