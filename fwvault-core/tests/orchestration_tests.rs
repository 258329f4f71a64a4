/*!
End-to-end tests for the backup orchestration engine.
These drive the public service API with scripted transports and in-memory
or on-disk storage.
*/

use fwvault_core::claim::DeviceClaims;
use fwvault_core::compression::NoCompression;
use fwvault_core::config::parse_config;
use fwvault_core::credential::{Credential, StaticCredentialResolver};
use fwvault_core::device::CredentialRef;
use fwvault_core::engine::{EngineSettings, ExecutionEngine};
use fwvault_core::events::EventBus;
use fwvault_core::job::{JobErrorKind, JobLedger, JobOrigin};
use fwvault_core::registry::DeviceRegistry;
use fwvault_core::retention::{RetentionConfig, RetentionPolicy};
use fwvault_core::service::QueuedJobs;
use fwvault_core::snapshot::SnapshotStore;
use fwvault_core::storage::{MemoryStorage, StorageAdapter};
use fwvault_core::transport::{ScriptedTransport, Step, TransportRegistry};
use fwvault_core::{
    ArtifactStore, BackupService, DeviceId, EngineEvent, JobState, Result, RunStatus,
    TransportError, TransportMethod, VaultError,
};
use fwvault_retry::RetryPolicy;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const BASE: &str = "#config-version=FGT60F-7.2.5-FW-build1517-230606:opmode=0:vdom=0:user=admin
#conf_file_ver=3141592653
#buildno=1517
config system global
    set admintimeout 480
    set hostname \"fw-01\"
    set timezone 04
end
config firewall address
    edit \"lan\"
        set subnet 192.168.1.0 255.255.255.0
    next
end
";

fn inventory(storage: &str) -> String {
    format!(
        r#"
settings:
  storage: {storage}
  execution:
    job_timeout_secs: 30
    max_retries: 3
    backoff_initial_ms: 500
    min_config_bytes: 50
devices:
  - id: fw-01
    group: core
    transport: ssh_cli
    connection: {{ host: 10.0.0.1, credential: "env:FW" }}
  - id: fw-02
    group: branches
    transport: scp
    connection:
      host: 10.0.0.2
      credential: "env:FW"
      options: {{ remote_path: sys_config }}
  - id: fw-03
    group: branches
    transport: rest_api
    connection: {{ host: 10.0.0.3, credential: "env:FW" }}
retention:
  default: {{ max_count: 10 }}
"#
    )
}

fn id(raw: &str) -> DeviceId {
    DeviceId::new(raw).unwrap()
}

fn resolver() -> Arc<StaticCredentialResolver> {
    Arc::new(
        StaticCredentialResolver::new()
            .insert(&CredentialRef::env("FW"), Credential::password("admin", "secret")),
    )
}

async fn memory_service() -> (BackupService, Arc<ScriptedTransport>) {
    let transport = Arc::new(ScriptedTransport::new(TransportMethod::SshCli));
    for device in ["fw-01", "fw-02", "fw-03"] {
        transport.set_live(&id(device), BASE.replace("fw-01", device));
    }
    let config = parse_config(&inventory("{ backend: memory }")).unwrap();
    let service = BackupService::init_with(
        config,
        Arc::new(TransportRegistry::uniform(transport.clone())),
        resolver(),
        QueuedJobs::Resume,
    )
    .await
    .unwrap();
    (service, transport)
}

#[tokio::test]
async fn test_identical_and_changed_captures() {
    let (service, transport) = memory_service().await;
    let fw = id("fw-01");
    let mut events = service.subscribe();

    let s1 = service.backup_device(&fw).await.unwrap().unwrap();
    let s2 = service.backup_device(&fw).await.unwrap().unwrap();
    transport.set_live(&fw, BASE.replace("admintimeout 480", "admintimeout 5"));
    let s3 = service.backup_device(&fw).await.unwrap().unwrap();

    // The first capture has no predecessor and counts as new
    let d1 = s1.diff.unwrap();
    assert!(d1.previous.is_none() && d1.change_detected);

    // Identical output is still stored but is not a change
    let d2 = s2.diff.unwrap();
    assert_eq!(d2.previous, s1.snapshot_id);
    assert!(!d2.change_detected);
    assert_ne!(s1.snapshot_id, s2.snapshot_id);

    let d3 = s3.diff.unwrap();
    assert!(d3.change_detected);
    assert_eq!(d3.summary.added.len(), 1);
    assert_eq!(d3.summary.removed.len(), 1);
    assert_eq!(d3.summary.added[0].text.trim(), "set admintimeout 5");

    let history = service.history(&fw).unwrap();
    assert_eq!(history.len(), 3);
    assert!(history.windows(2).all(|w| w[0].captured_at <= w[1].captured_at
        && w[0].sequence < w[1].sequence));

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.push(event.kind());
    }
    assert_eq!(
        kinds,
        vec!["job_succeeded", "job_succeeded", "job_succeeded", "drift_detected"]
    );
}

#[tokio::test]
async fn test_volatile_header_changes_are_not_drift() {
    let (service, transport) = memory_service().await;
    let fw = id("fw-01");
    service.backup_device(&fw).await.unwrap();
    transport.set_live(
        &fw,
        BASE.replace("#conf_file_ver=3141592653", "#conf_file_ver=2718281828"),
    );
    let job = service.backup_device(&fw).await.unwrap().unwrap();
    assert!(!job.diff.unwrap().change_detected);
}

#[tokio::test(start_paused = true)]
async fn test_two_timeouts_then_success() {
    let (service, transport) = memory_service().await;
    let fw = id("fw-01");
    transport.push_step(&fw, Step::Hang);
    transport.push_step(&fw, Step::Hang);

    let job = service.backup_device(&fw).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Succeeded);
    assert_eq!(job.attempts, 3);
    assert!(job.snapshot_id.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_batch_with_auth_failure_is_partial() {
    let (service, transport) = memory_service().await;
    transport.push_step(&id("fw-02"), Step::Fail(TransportError::auth("bad password")));

    let report = service.backup_all(None).await;
    assert_eq!(report.status(), RunStatus::PartialFailure);
    assert_eq!(report.status().exit_code(), 2);

    let failed: Vec<_> = report.failed().collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].device_id, id("fw-02"));
    assert_eq!(failed[0].attempts, 1);
    assert_eq!(failed[0].error.as_ref().unwrap().kind, JobErrorKind::AuthFailure);

    for device in ["fw-01", "fw-03"] {
        assert_eq!(service.history(&id(device)).unwrap().len(), 1);
    }
    assert!(service.history(&id("fw-02")).unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_job_keeps_last_good_snapshot() {
    let (service, transport) = memory_service().await;
    let fw = id("fw-01");
    service.backup_device(&fw).await.unwrap();
    transport.push_step(&fw, Step::Config("config system global\n".repeat(5)));

    let job = service.backup_device(&fw).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.error.unwrap().kind, JobErrorKind::Validation);
    assert_eq!(service.history(&fw).unwrap().len(), 1);
}

#[tokio::test]
async fn test_retention_sweep_spares_pinned_snapshot() {
    let (service, transport) = memory_service().await;
    let fw = id("fw-01");
    for n in 0..5 {
        transport.set_live(&fw, BASE.replace("timezone 04", &format!("timezone {n:02}")));
        service.backup_device(&fw).await.unwrap();
    }
    let store = service.store();
    let ids = store.snapshot_ids(&fw).unwrap();
    store.pin(&ids[0]).unwrap();

    let report = store
        .sweep(&fw, &RetentionPolicy::max_count(2), chrono::Utc::now())
        .unwrap();
    // The pinned snapshot counts toward the maximum but is never removed
    assert_eq!(report.removed, ids[1..4].to_vec());
    assert_eq!(report.pinned, 1);
    let remaining = store.snapshot_ids(&fw).unwrap();
    assert_eq!(remaining, vec![ids[0].clone(), ids[4].clone()]);
}

#[tokio::test]
async fn test_restore_requires_matching_token() {
    let (service, transport) = memory_service().await;
    let fw = id("fw-01");
    let first = service.backup_device(&fw).await.unwrap().unwrap();
    let target = first.snapshot_id.unwrap();
    transport.set_live(&fw, BASE.replace("hostname \"fw-01\"", "hostname \"fw-01-lab\""));

    let err = service.restore(&fw, &target, "0000").await.unwrap_err();
    assert_eq!(RunStatus::from(&err), RunStatus::InvalidConfirmation);
    assert!(transport.pushes().is_empty());

    let plan = service.plan_restore(&fw, &target).await.unwrap();
    assert_eq!(plan.summary.stat(), "+1 -1");
    let result = service.restore(&fw, &target, &plan.token).await.unwrap();
    assert_eq!(transport.pushes().len(), 1);

    // The post-restore backup captures the restored state
    assert!(result.post_restore_job.is_some());
    service.wait_idle().await;
    let history = service.history(&fw).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].content_hash, history[0].content_hash);
    let job = service
        .job_history(Some(&fw))
        .into_iter()
        .find(|j| Some(j.id) == result.post_restore_job)
        .unwrap();
    assert!(matches!(job.origin, JobOrigin::PostRestore { .. }));
}

#[tokio::test]
async fn test_no_duplicate_jobs_for_busy_device() {
    let (service, transport) = memory_service().await;
    let fw = id("fw-01");
    transport.push_step(&fw, Step::Delay(Duration::from_millis(200)));

    let (first, second) = tokio::join!(service.backup_device(&fw), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        service.backup_device(&fw).await
    });
    assert!(first.unwrap().is_some());
    assert!(second.unwrap().is_none());
    assert_eq!(transport.fetch_count(), 1);
}

#[tokio::test]
async fn test_local_store_survives_restart() {
    let dir = TempDir::new().unwrap();
    let storage = format!(
        "{{ backend: local, base_path: {} }}",
        dir.path().join("backups").display()
    );
    let transport = Arc::new(ScriptedTransport::new(TransportMethod::SshCli));
    transport.set_live(&id("fw-01"), BASE);

    for expected in 1..=2 {
        let service = BackupService::init_with(
            parse_config(&inventory(&storage)).unwrap(),
            Arc::new(TransportRegistry::uniform(transport.clone())),
            resolver(),
            QueuedJobs::Resume,
        )
        .await
        .unwrap();
        service.backup_device(&id("fw-01")).await.unwrap();
        let history = service.history(&id("fw-01")).unwrap();
        assert_eq!(history.len(), expected);
        assert!(service.verify(&history[0].snapshot_id).is_ok());
        service.teardown().await.unwrap();
    }
}

/// Memory storage whose writes fail while `failing` is set
#[derive(Default)]
struct FlakyStorage {
    inner: MemoryStorage,
    failing: AtomicBool,
}

impl StorageAdapter for FlakyStorage {
    fn save(&self, data: &[u8], key: &str) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(VaultError::storage("disk full"));
        }
        self.inner.save(data, key)
    }

    fn load(&self, key: &str) -> Result<Vec<u8>> {
        self.inner.load(key)
    }

    fn exists(&self, key: &str) -> bool {
        self.inner.exists(key)
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.list(prefix)
    }
}

struct FlakyHarness {
    engine: ExecutionEngine,
    storage: Arc<FlakyStorage>,
    store: Arc<dyn ArtifactStore>,
    transport: Arc<ScriptedTransport>,
}

fn flaky_harness() -> FlakyHarness {
    let registry = Arc::new(DeviceRegistry::new(resolver()));
    let entries: Vec<serde_yaml::Value> = serde_yaml::from_str(
        "- { id: fw-01, transport: ssh_cli, connection: { host: 10.0.0.1, credential: \"env:FW\" } }",
    )
    .unwrap();
    assert!(registry.import(&entries).is_clean());

    let storage = Arc::new(FlakyStorage::default());
    let store: Arc<dyn ArtifactStore> =
        Arc::new(SnapshotStore::new(Arc::clone(&storage), NoCompression::new()));
    let transport = Arc::new(ScriptedTransport::new(TransportMethod::SshCli));
    transport.set_live(&id("fw-01"), BASE);

    let engine = ExecutionEngine::new(
        registry,
        Arc::new(TransportRegistry::uniform(transport.clone())),
        Arc::clone(&store),
        Arc::new(JobLedger::default()),
        DeviceClaims::new(),
        EventBus::default(),
        RetentionConfig::default(),
        EngineSettings {
            storage_policy: RetryPolicy::new(2)
                .with_intervals(Duration::from_millis(1), Duration::from_millis(5)),
            min_config_bytes: 50,
            ..EngineSettings::default()
        },
    );
    FlakyHarness {
        engine,
        storage,
        store,
        transport,
    }
}

#[tokio::test]
async fn test_storage_failure_keeps_capture_for_retry() {
    let fw = id("fw-01");
    let FlakyHarness {
        engine,
        storage,
        store,
        ..
    } = flaky_harness();
    storage.failing.store(true, Ordering::SeqCst);
    let mut rx = engine.events().subscribe();

    let job_id = engine.ledger().enqueue(&fw, JobOrigin::Manual).unwrap();
    let job = engine.run(job_id).await.unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.error.unwrap().kind, JobErrorKind::Storage);
    assert_eq!(engine.ledger().orphaned(), vec![job_id]);
    assert!(store.list(&fw).unwrap().is_empty());
    match rx.recv().await.unwrap() {
        EngineEvent::JobFailed { error, .. } => assert_eq!(error.kind, JobErrorKind::Storage),
        other => panic!("unexpected event {other:?}"),
    }

    storage.failing.store(false, Ordering::SeqCst);
    let metadata = engine.retry_store(job_id).await.unwrap();
    assert_eq!(store.get(&metadata.snapshot_id).unwrap(), BASE.as_bytes());

    let job = engine.ledger().get(job_id).unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.snapshot_id, Some(metadata.snapshot_id));
    assert!(engine.ledger().orphaned().is_empty());
}

#[tokio::test]
async fn test_stale_capture_is_not_published_over_newer_snapshot() {
    let fw = id("fw-01");
    let h = flaky_harness();

    h.storage.failing.store(true, Ordering::SeqCst);
    let stale = h.engine.ledger().enqueue(&fw, JobOrigin::Manual).unwrap();
    h.engine.run(stale).await.unwrap();

    h.storage.failing.store(false, Ordering::SeqCst);
    let changed = BASE.replace("admintimeout 480", "admintimeout 5");
    h.transport.set_live(&fw, changed.clone());
    let fresh = h.engine.ledger().enqueue(&fw, JobOrigin::Manual).unwrap();
    let fresh = h.engine.run(fresh).await.unwrap();
    assert_eq!(fresh.state, JobState::Succeeded);

    let mut rx = h.engine.events().subscribe();
    let err = h.engine.retry_store(stale).await.unwrap_err();
    assert!(matches!(err, VaultError::Validation(_)));

    // The newest snapshot still holds the newest capture
    let latest = h.store.latest(&fw).unwrap().unwrap();
    assert_eq!(h.store.get(&latest.snapshot_id).unwrap(), changed.as_bytes());
    assert_eq!(h.store.list(&fw).unwrap().len(), 1);
    assert!(h.engine.ledger().orphaned().is_empty());
    assert!(rx.try_recv().is_err());
}
