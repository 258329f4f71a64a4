/*!
Top-level facade wiring the registry, store, engine, scheduler and restore
engine together.

[`BackupService::init`] loads inventory, schedules, retention and any
persisted scheduler state; [`BackupService::teardown`] stops ticking, drains
in-flight jobs and persists what is still queued. Whether persisted jobs run
is up to the caller: see [`QueuedJobs`].
*/

use chrono::Utc;
use rayon::prelude::*;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::claim::DeviceClaims;
use crate::config::LoadedConfig;
use crate::credential::CredentialResolver;
use crate::device::{Device, DeviceId};
use crate::diff::{DiffRecord, DiffTracker};
use crate::engine::{EngineSettings, ExecutionEngine, ProbeReport};
use crate::events::{EngineEvent, EventBus};
use crate::job::{Job, JobId, JobLedger};
use crate::metadata::{SnapshotId, SnapshotMetadata};
use crate::outcome::BatchReport;
use crate::registry::{DeviceRegistry, LoadReport, RejectedEntry};
use crate::restore::{RestoreEngine, RestorePlan, RestoreResult};
use crate::retention::SweepReport;
use crate::scheduler::{parse_schedules, BackupTrigger, Scheduler, SchedulerState};
use crate::snapshot::{create_store_from_config, ArtifactStore};
use crate::transport::{TransportProvider, TransportRegistry};
use crate::{Result, VaultError};

/// What to do with jobs a previous run left queued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuedJobs {
    /// Dispatch them now
    Resume,
    /// Keep them queued and persist them again at teardown
    Hold,
}

/// What initialization loaded and what it had to reject
#[derive(Debug, Clone, Default)]
pub struct InitReport {
    pub inventory: LoadReport,
    pub rejected_schedules: Vec<RejectedEntry>,
    /// Queued jobs carried over from the previous run
    pub resumed_jobs: usize,
    /// Carried-over jobs left queued under [`QueuedJobs::Hold`]
    pub held_jobs: usize,
}

impl InitReport {
    pub fn is_clean(&self) -> bool {
        self.inventory.is_clean() && self.rejected_schedules.is_empty()
    }
}

/// Integrity check over every snapshot of one device
#[derive(Debug, Clone, Default)]
pub struct VerifyReport {
    pub verified: Vec<SnapshotId>,
    pub failed: Vec<(SnapshotId, String)>,
}

pub struct BackupService {
    engine: Arc<ExecutionEngine>,
    scheduler: Arc<Scheduler>,
    restore: RestoreEngine,
    diff: DiffTracker,
    report: InitReport,
}

impl BackupService {
    /// Initialize with the network transports and configured credential sources
    pub async fn init(config: LoadedConfig, queued: QueuedJobs) -> Result<Self> {
        let resolver = Arc::new(config.settings.credentials.resolver()?);
        Self::init_with(config, Arc::new(TransportRegistry::network()), resolver, queued).await
    }

    /// Initialize with explicit transports and credential resolver
    pub async fn init_with(
        config: LoadedConfig,
        transports: Arc<dyn TransportProvider>,
        resolver: Arc<dyn CredentialResolver>,
        queued: QueuedJobs,
    ) -> Result<Self> {
        let settings = config.settings;
        settings.validate()?;

        let registry = Arc::new(DeviceRegistry::new(resolver));
        let inventory = registry.import(&config.devices);
        let store = create_store_from_config(&settings.storage)?;

        let engine = Arc::new(ExecutionEngine::new(
            registry,
            transports,
            Arc::clone(&store),
            Arc::new(JobLedger::new(settings.scheduler.job_history_window)),
            DeviceClaims::new(),
            EventBus::default(),
            config.retention,
            EngineSettings::from(&settings),
        ));

        let (schedules, rejected_schedules) = parse_schedules(&config.schedules);
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&engine),
            schedules,
            &settings.scheduler,
        ));

        let (mut resumed_jobs, mut held_jobs) = (0, 0);
        if let Some(path) = &settings.scheduler.state_path {
            match SchedulerState::load(path) {
                Ok(Some(state)) => match queued {
                    QueuedJobs::Resume => resumed_jobs = scheduler.resume(state, Utc::now()),
                    QueuedJobs::Hold => held_jobs = scheduler.adopt(state, Utc::now()).len(),
                },
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), "Ignoring unreadable scheduler state: {e}"),
            }
        }

        let trigger: Arc<dyn BackupTrigger> = Arc::clone(&scheduler) as Arc<dyn BackupTrigger>;
        let restore = RestoreEngine::new(&engine, trigger);
        let report = InitReport {
            inventory,
            rejected_schedules,
            resumed_jobs,
            held_jobs,
        };
        info!(
            devices = engine.registry().len(),
            rejected_devices = report.inventory.rejected.len(),
            schedules = scheduler.schedules().len(),
            rejected_schedules = report.rejected_schedules.len(),
            "Backup service initialized"
        );

        Ok(Self {
            diff: DiffTracker::new(store),
            engine,
            scheduler,
            restore,
            report,
        })
    }

    pub fn init_report(&self) -> &InitReport {
        &self.report
    }

    pub fn engine(&self) -> &Arc<ExecutionEngine> {
        &self.engine
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        self.engine.store()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.engine.events().subscribe()
    }

    pub fn devices(&self, group: Option<&str>) -> Vec<Device> {
        self.engine.registry().list(group)
    }

    /// Back up one device and wait for the result
    pub async fn backup_device(&self, device_id: &DeviceId) -> Result<Option<Job>> {
        self.scheduler.backup_now(device_id).await
    }

    pub async fn backup_all(&self, group: Option<&str>) -> BatchReport {
        self.scheduler.trigger_all(group).await
    }

    /// Snapshots of a device in capture order; works for removed devices too
    pub fn history(&self, device_id: &DeviceId) -> Result<Vec<SnapshotMetadata>> {
        self.store().list(device_id)
    }

    pub fn job_history(&self, device_id: Option<&DeviceId>) -> Vec<Job> {
        self.engine.ledger().history(device_id)
    }

    fn kind_of(&self, device_id: &DeviceId) -> crate::device::DeviceKind {
        self.engine
            .registry()
            .get(device_id)
            .map(|d| d.kind)
            .unwrap_or_default()
    }

    /// Diff two snapshots of one device
    pub fn diff(&self, device_id: &DeviceId, from: &SnapshotId, to: &SnapshotId) -> Result<DiffRecord> {
        for id in [from, to] {
            if id.device_id() != device_id {
                return Err(VaultError::validation(format!(
                    "snapshot {id} does not belong to {device_id}"
                )));
            }
        }
        self.diff.diff_snapshots(self.kind_of(device_id), from, to)
    }

    /// Diff the newest snapshot against the one before it
    pub fn diff_latest(&self, device_id: &DeviceId) -> Result<Option<DiffRecord>> {
        let Some(latest) = self.store().latest(device_id)? else {
            return Ok(None);
        };
        let Some(previous) = self.store().predecessor(&latest.snapshot_id)? else {
            return Ok(None);
        };
        self.diff
            .diff_snapshots(self.kind_of(device_id), &previous.snapshot_id, &latest.snapshot_id)
            .map(Some)
    }

    pub async fn plan_restore(&self, device_id: &DeviceId, snapshot_id: &SnapshotId) -> Result<RestorePlan> {
        self.restore.plan(device_id, snapshot_id).await
    }

    pub async fn restore(
        &self,
        device_id: &DeviceId,
        snapshot_id: &SnapshotId,
        token: &str,
    ) -> Result<RestoreResult> {
        self.restore.restore(device_id, snapshot_id, token).await
    }

    pub fn verify(&self, snapshot_id: &SnapshotId) -> Result<SnapshotMetadata> {
        self.store().verify(snapshot_id)
    }

    pub fn verify_device(&self, device_id: &DeviceId) -> Result<VerifyReport> {
        let mut report = VerifyReport::default();
        for metadata in self.store().list(device_id)? {
            match self.store().verify(&metadata.snapshot_id) {
                Ok(_) => report.verified.push(metadata.snapshot_id),
                Err(e) => report.failed.push((metadata.snapshot_id, e.to_string())),
            }
        }
        Ok(report)
    }

    /// Apply retention to every device with stored snapshots
    pub fn sweep_all(&self) -> Result<Vec<SweepReport>> {
        let retention = self.engine.retention();
        let registry = self.engine.registry();
        let store = self.store();
        let now = Utc::now();

        store
            .devices()?
            .par_iter()
            .map(|device_id| {
                let group = registry.get(device_id).ok().map(|d| d.group);
                let policy = retention.policy_for(device_id, group.as_deref());
                store.sweep(device_id, &policy, now)
            })
            .collect()
    }

    /// Remove a device from the inventory, cancelling its job; snapshots stay
    pub fn remove_device(&self, device_id: &DeviceId) -> Result<Device> {
        if self.engine.cancel_device(device_id) {
            info!(%device_id, "Cancelled in-flight job of removed device");
        }
        self.engine.registry().remove(device_id)
    }

    /// Replace the inventory; jobs of devices that disappeared are cancelled
    pub fn reload_inventory(&self, entries: &[serde_yaml::Value]) -> LoadReport {
        let report = self.engine.registry().reload(entries);
        for device_id in &report.removed {
            self.engine.cancel_device(device_id);
        }
        report
    }

    pub fn reload_schedules(&self, entries: &[serde_yaml::Value]) -> Vec<RejectedEntry> {
        let (schedules, rejected) = parse_schedules(entries);
        self.scheduler.set_schedules(schedules, Utc::now());
        rejected
    }

    pub async fn retry_store(&self, job_id: JobId) -> Result<SnapshotMetadata> {
        self.engine.retry_store(job_id).await
    }

    pub async fn test_connection(&self, device_id: &DeviceId) -> Result<ProbeReport> {
        self.engine.probe(device_id).await
    }

    /// Run the scheduler loop until [`BackupService::teardown`]
    pub async fn run(&self) {
        self.scheduler.run().await
    }

    /// Wait for every dispatched job, including post-restore backups
    pub async fn wait_idle(&self) {
        self.scheduler.wait_idle().await
    }

    pub async fn teardown(&self) -> Result<SchedulerState> {
        let state = self.scheduler.shutdown().await?;
        info!(queued = state.queued.len(), "Backup service stopped");
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use crate::credential::{Credential, StaticCredentialResolver};
    use crate::device::{CredentialRef, TransportMethod};
    use crate::transport::ScriptedTransport;

    const CONFIG: &str = r#"
settings:
  storage: { backend: memory }
  execution: { min_config_bytes: 10, max_retries: 1 }
devices:
  - id: fw-01
    group: core
    transport: ssh_cli
    connection: { host: 10.0.0.1, credential: "env:FW" }
  - id: fw-02
    group: branches
    transport: rest_api
    connection: { host: 10.0.0.2, credential: "env:FW" }
  - id: "bad id"
    transport: ssh_cli
    connection: { host: 10.0.0.3, credential: "env:FW" }
schedules:
  - { id: nightly, cron: "0 2 * * *" }
  - { id: broken, cron: "nope" }
retention:
  default: { max_count: 2 }
"#;

    const V1: &str = "config system global\n    set hostname \"fw\"\nend\n";
    const V2: &str = "config system global\n    set hostname \"fw-new\"\nend\n";

    async fn service() -> (BackupService, Arc<ScriptedTransport>) {
        let transport = Arc::new(ScriptedTransport::new(TransportMethod::SshCli));
        let resolver = StaticCredentialResolver::new()
            .insert(&CredentialRef::env("FW"), Credential::password("admin", "pw"));
        let service = BackupService::init_with(
            parse_config(CONFIG).unwrap(),
            Arc::new(TransportRegistry::uniform(transport.clone())),
            Arc::new(resolver),
            QueuedJobs::Resume,
        )
        .await
        .unwrap();
        (service, transport)
    }

    fn id(raw: &str) -> DeviceId {
        DeviceId::new(raw).unwrap()
    }

    #[tokio::test]
    async fn test_init_reports_rejected_entries() {
        let (service, _) = service().await;
        let report = service.init_report();
        assert!(!report.is_clean());
        assert_eq!(report.inventory.loaded.len(), 2);
        assert_eq!(report.inventory.rejected[0].index, 2);
        assert_eq!(report.rejected_schedules[0].id.as_deref(), Some("broken"));
        assert_eq!(service.devices(Some("branches")).len(), 1);
    }

    #[tokio::test]
    async fn test_backup_history_and_diff() {
        let (service, transport) = service().await;
        transport.set_live(&id("fw-01"), V1);
        service.backup_device(&id("fw-01")).await.unwrap().unwrap();
        transport.set_live(&id("fw-01"), V2);
        let job = service.backup_device(&id("fw-01")).await.unwrap().unwrap();
        assert!(job.diff.as_ref().unwrap().change_detected);

        let history = service.history(&id("fw-01")).unwrap();
        assert_eq!(history.len(), 2);
        let record = service
            .diff(&id("fw-01"), &history[0].snapshot_id, &history[1].snapshot_id)
            .unwrap();
        assert_eq!(record.summary.stat(), "+1 -1");
        assert_eq!(
            service.diff_latest(&id("fw-01")).unwrap().unwrap().summary,
            record.summary
        );
        assert!(service
            .diff(&id("fw-02"), &history[0].snapshot_id, &history[1].snapshot_id)
            .is_err());

        let verified = service.verify_device(&id("fw-01")).unwrap();
        assert_eq!(verified.verified.len(), 2);
        assert!(verified.failed.is_empty());
    }

    #[tokio::test]
    async fn test_removed_device_keeps_history() {
        let (service, transport) = service().await;
        transport.set_live(&id("fw-01"), V1);
        service.backup_device(&id("fw-01")).await.unwrap();

        service.remove_device(&id("fw-01")).unwrap();
        assert!(matches!(
            service.backup_device(&id("fw-01")).await,
            Err(VaultError::DeviceNotFound(_))
        ));
        assert_eq!(service.history(&id("fw-01")).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_all_applies_default_policy() {
        let (service, transport) = service().await;
        for n in 0..4 {
            transport.push_step(
                &id("fw-02"),
                crate::transport::Step::Config(format!(
                    "config system global\n    set alias \"v{n}\"\nend\n"
                )),
            );
        }
        let store = service.store();
        for _ in 0..4 {
            let job = service.backup_device(&id("fw-02")).await.unwrap().unwrap();
            assert!(job.snapshot_id.is_some());
        }
        // The engine sweeps after every job already
        assert_eq!(store.list(&id("fw-02")).unwrap().len(), 2);

        let reports = service.sweep_all().unwrap();
        assert!(reports.iter().all(|r| r.removed.is_empty()));
    }

    #[tokio::test]
    async fn test_reload_cancels_removed_devices() {
        let (service, _) = service().await;
        let entries: Vec<serde_yaml::Value> = serde_yaml::from_str(
            "- { id: fw-01, transport: ssh_cli, connection: { host: 10.0.0.1, credential: \"env:FW\" } }",
        )
        .unwrap();
        let report = service.reload_inventory(&entries);
        assert_eq!(report.removed, vec![id("fw-02")]);
        assert_eq!(service.devices(None).len(), 1);

        let rejected = service.reload_schedules(&[]);
        assert!(rejected.is_empty());
        assert!(service.scheduler().schedules().is_empty());
    }

    async fn service_with_state(dir: &std::path::Path, queued: QueuedJobs) -> (BackupService, Arc<ScriptedTransport>) {
        let transport = Arc::new(ScriptedTransport::new(TransportMethod::SshCli));
        transport.set_live(&id("fw-01"), V1);
        let resolver = StaticCredentialResolver::new()
            .insert(&CredentialRef::env("FW"), Credential::password("admin", "pw"));
        let mut config = parse_config(CONFIG).unwrap();
        config.settings.scheduler.state_path = Some(dir.join("scheduler.json"));
        let service = BackupService::init_with(
            config,
            Arc::new(TransportRegistry::uniform(transport.clone())),
            Arc::new(resolver),
            queued,
        )
        .await
        .unwrap();
        (service, transport)
    }

    #[tokio::test]
    async fn test_held_jobs_are_not_run_and_survive_teardown() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut state = SchedulerState::default();
        state
            .queued
            .push(Job::new(id("fw-01"), crate::job::JobOrigin::Manual));
        state.save(dir.path().join("scheduler.json")).unwrap();

        let (service, transport) = service_with_state(dir.path(), QueuedJobs::Hold).await;
        assert_eq!(service.init_report().held_jobs, 1);
        assert_eq!(service.init_report().resumed_jobs, 0);
        assert!(service.history(&id("fw-01")).unwrap().is_empty());
        let saved = service.teardown().await.unwrap();
        assert_eq!(saved.queued.len(), 1);
        assert_eq!(transport.fetch_count(), 0);

        let (service, transport) = service_with_state(dir.path(), QueuedJobs::Resume).await;
        assert_eq!(service.init_report().resumed_jobs, 1);
        service.wait_idle().await;
        assert_eq!(transport.fetch_count(), 1);
        assert_eq!(service.history(&id("fw-01")).unwrap().len(), 1);
        assert!(service.teardown().await.unwrap().queued.is_empty());
    }

    #[tokio::test]
    async fn test_teardown_without_state_path() {
        let (service, _) = service().await;
        let state = service.teardown().await.unwrap();
        assert!(state.queued.is_empty());
    }
}
