/*!
Restore engine: push a stored snapshot back to its device.

A restore is a two-step exchange. [`RestoreEngine::plan`] fetches the live
configuration, diffs it against the target snapshot and returns a
confirmation token bound to that diff. [`RestoreEngine::restore`] recomputes
the plan under the device claim and refuses to push unless the token still
matches, so an operator never confirms one diff and gets another.

After a successful push a backup job captures the post-restore state. After
a failed one the device is read back, and the event reports whether it still
holds the pre-push configuration, the target, or neither.
*/

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::claim::{ClaimKind, DeviceClaims};
use crate::device::{Device, DeviceId};
use crate::diff::{ChangeSummary, DiffTracker};
use crate::engine::ExecutionEngine;
use crate::error::TransportError;
use crate::events::{EngineEvent, EventBus, LastConfirmedState};
use crate::job::{JobId, JobOrigin};
use crate::metadata::{SnapshotId, SnapshotMetadata};
use crate::normalize::Normalizer;
use crate::observability;
use crate::registry::DeviceRegistry;
use crate::scheduler::BackupTrigger;
use crate::snapshot::{ArtifactStore, PinGuard};
use crate::transport::{BackupTransport, TransportProvider};
use crate::{Result, VaultError};

const TOKEN_LEN: usize = 20;

/// What a restore would change, and the token that confirms it
#[derive(Debug, Clone, Serialize)]
pub struct RestorePlan {
    pub device_id: DeviceId,
    pub snapshot_id: SnapshotId,
    /// Live configuration on the left, target snapshot on the right
    pub summary: ChangeSummary,
    pub live_hash: String,
    pub target_hash: String,
    pub token: String,
    /// Whether the device's transport can push at all
    pub push_capable: bool,
    pub planned_at: DateTime<Utc>,
}

impl RestorePlan {
    pub fn is_noop(&self) -> bool {
        self.summary.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreResult {
    pub device_id: DeviceId,
    pub snapshot_id: SnapshotId,
    pub last_confirmed: LastConfirmedState,
    /// Backup job capturing the restored state, if one could be queued
    pub post_restore_job: Option<JobId>,
}

fn confirmation_token(
    device_id: &DeviceId,
    snapshot_id: &SnapshotId,
    live_hash: &str,
    target_hash: &str,
    summary: &ChangeSummary,
) -> String {
    let snapshot = snapshot_id.to_string();
    let mut hasher = Sha256::new();
    for part in [device_id.as_str(), snapshot.as_str(), live_hash, target_hash] {
        hasher.update(part.as_bytes());
        hasher.update(b"|");
    }
    hasher.update(summary.render().as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..TOKEN_LEN].to_string()
}

fn normalized_hash(device: &Device, content: &str) -> String {
    let normalized = Normalizer::for_kind(device.kind).normalize(content);
    SnapshotMetadata::compute_hash(normalized.as_bytes())
}

/// A restore error and where it left the device
struct RestoreFailure {
    error: VaultError,
    last_confirmed: LastConfirmedState,
}

impl From<VaultError> for RestoreFailure {
    fn from(error: VaultError) -> Self {
        Self {
            error,
            last_confirmed: LastConfirmedState::PrePush,
        }
    }
}

impl From<TransportError> for RestoreFailure {
    fn from(error: TransportError) -> Self {
        VaultError::from(error).into()
    }
}

pub struct RestoreEngine {
    registry: Arc<DeviceRegistry>,
    transports: Arc<dyn TransportProvider>,
    store: Arc<dyn ArtifactStore>,
    diff: DiffTracker,
    claims: Arc<DeviceClaims>,
    events: EventBus,
    trigger: Arc<dyn BackupTrigger>,
    timeout: Duration,
}

impl RestoreEngine {
    /// Share the engine's collaborators; `trigger` queues the post-restore backup
    pub fn new(engine: &ExecutionEngine, trigger: Arc<dyn BackupTrigger>) -> Self {
        Self {
            registry: Arc::clone(engine.registry()),
            transports: Arc::clone(engine.transports()),
            store: Arc::clone(engine.store()),
            diff: DiffTracker::new(Arc::clone(engine.store())),
            claims: Arc::clone(engine.claims()),
            events: engine.events().clone(),
            trigger,
            timeout: engine.settings().job_timeout,
        }
    }

    fn target(&self, device_id: &DeviceId, snapshot_id: &SnapshotId) -> Result<(Device, SnapshotMetadata)> {
        if snapshot_id.device_id() != device_id {
            return Err(VaultError::validation(format!(
                "snapshot {snapshot_id} does not belong to {device_id}"
            )));
        }
        let device = self.registry.get(device_id)?;
        let metadata = self.store.metadata(snapshot_id)?;
        Ok((device, metadata))
    }

    async fn fetch_live(&self, device: &Device, transport: &dyn BackupTransport) -> Result<String> {
        let credential = self.registry.resolve_credential(&device.id)?;
        let fetched = tokio::time::timeout(
            self.timeout,
            transport.fetch_config(device, &credential, self.timeout),
        )
        .await
        .map_err(|_| TransportError::Timeout(self.timeout))??;
        Ok(fetched.content)
    }

    async fn build_plan(
        &self,
        device: &Device,
        metadata: &SnapshotMetadata,
        transport: &dyn BackupTransport,
    ) -> Result<RestorePlan> {
        let live = self.fetch_live(device, transport).await?;
        let summary = self
            .diff
            .diff_against(device.kind, &live, &metadata.snapshot_id)?;
        let live_hash = normalized_hash(device, &live);
        let token = confirmation_token(
            &device.id,
            &metadata.snapshot_id,
            &live_hash,
            &metadata.content_hash,
            &summary,
        );

        Ok(RestorePlan {
            device_id: device.id.clone(),
            snapshot_id: metadata.snapshot_id.clone(),
            summary,
            live_hash,
            target_hash: metadata.content_hash.clone(),
            token,
            push_capable: transport.pusher().is_some(),
            planned_at: Utc::now(),
        })
    }

    /// Diff the live configuration against `snapshot_id` without touching the device
    #[instrument(skip_all, fields(%device_id, %snapshot_id))]
    pub async fn plan(&self, device_id: &DeviceId, snapshot_id: &SnapshotId) -> Result<RestorePlan> {
        let (device, metadata) = self.target(device_id, snapshot_id)?;
        let transport = self.transports.transport_for(device.transport)?;
        let plan = self.build_plan(&device, &metadata, transport.as_ref()).await?;
        info!(change = %plan.summary.stat(), token = %plan.token, "Restore planned");
        Ok(plan)
    }

    /// Push `snapshot_id` to its device if `token` matches the current plan
    #[instrument(skip_all, fields(%device_id, %snapshot_id))]
    pub async fn restore(
        &self,
        device_id: &DeviceId,
        snapshot_id: &SnapshotId,
        token: &str,
    ) -> Result<RestoreResult> {
        let result = self.restore_inner(device_id, snapshot_id, token).await;
        observability::record_restore(result.is_ok());
        result.map_err(|failure| {
            let RestoreFailure {
                error,
                last_confirmed,
            } = failure;
            self.events.emit(EngineEvent::RestoreFailed {
                device_id: device_id.clone(),
                snapshot_id: snapshot_id.clone(),
                reason: error.to_string(),
                last_confirmed,
                at: Utc::now(),
            });
            warn!(?last_confirmed, "Restore failed: {error}");
            error
        })
    }

    /// Read the device back after a failed push and place it against the plan
    async fn state_after_failed_push(
        &self,
        device: &Device,
        transport: &dyn BackupTransport,
        plan: &RestorePlan,
        target: &str,
    ) -> LastConfirmedState {
        match self.fetch_live(device, transport).await {
            Ok(live) => {
                let hash = normalized_hash(device, &live);
                if hash == plan.live_hash {
                    LastConfirmedState::PrePush
                } else if hash == normalized_hash(device, target) {
                    LastConfirmedState::PostPush
                } else {
                    LastConfirmedState::Unknown
                }
            }
            Err(e) => {
                warn!("Could not read configuration back after failed push: {e}");
                LastConfirmedState::Unknown
            }
        }
    }

    async fn restore_inner(
        &self,
        device_id: &DeviceId,
        snapshot_id: &SnapshotId,
        token: &str,
    ) -> std::result::Result<RestoreResult, RestoreFailure> {
        let (device, metadata) = self.target(device_id, snapshot_id)?;
        let _pin = PinGuard::new(Arc::clone(&self.store), snapshot_id.clone())?;
        let claim = self.claims.try_claim(device_id, ClaimKind::Restore)?;

        let transport = self.transports.transport_for(device.transport)?;
        let pusher = transport.pusher().ok_or_else(|| {
            VaultError::Unsupported(format!(
                "{} transport cannot push configuration",
                device.transport
            ))
        })?;

        let plan = self.build_plan(&device, &metadata, transport.as_ref()).await?;
        if plan.token != token.trim() {
            return Err(VaultError::confirmation(
                "token does not match the current diff; run the plan again",
            )
            .into());
        }

        self.store.verify(snapshot_id)?;
        let content = String::from_utf8(self.store.get(snapshot_id)?).map_err(|e| {
            VaultError::invalid_format(format!("Snapshot {snapshot_id} is not UTF-8: {e}"))
        })?;

        let credential = self.registry.resolve_credential(device_id)?;
        let pushed = tokio::time::timeout(
            self.timeout,
            pusher.push_config(&device, &credential, &content, self.timeout),
        )
        .await
        .unwrap_or(Err(TransportError::Timeout(self.timeout)));
        drop(credential);
        if let Err(e) = pushed {
            let last_confirmed = self
                .state_after_failed_push(&device, transport.as_ref(), &plan, &content)
                .await;
            return Err(RestoreFailure {
                error: e.into(),
                last_confirmed,
            });
        }
        info!(change = %plan.summary.stat(), "Configuration pushed");

        // The post-restore backup needs the device free
        drop(claim);
        let post_restore_job = match self
            .trigger
            .trigger(
                device_id,
                JobOrigin::PostRestore {
                    restored: snapshot_id.clone(),
                },
            )
            .await
        {
            Ok(job) => job,
            Err(e) => {
                warn!("Post-restore backup could not be queued: {e}");
                None
            }
        };

        self.events.emit(EngineEvent::RestoreCompleted {
            device_id: device_id.clone(),
            snapshot_id: snapshot_id.clone(),
            post_restore_job,
            at: Utc::now(),
        });
        Ok(RestoreResult {
            device_id: device_id.clone(),
            snapshot_id: snapshot_id.clone(),
            last_confirmed: LastConfirmedState::PostPush,
            post_restore_job,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::NoCompression;
    use crate::credential::{Credential, StaticCredentialResolver};
    use crate::device::{CredentialRef, TransportMethod};
    use crate::engine::EngineSettings;
    use crate::job::JobLedger;
    use crate::metadata::CaptureInfo;
    use crate::retention::RetentionConfig;
    use crate::scheduler::MockBackupTrigger;
    use crate::snapshot::SnapshotStore;
    use crate::storage::MemoryStorage;
    use crate::transport::{ScriptedTransport, Step, TransportRegistry};

    const OLD: &str = "config system global\n    set hostname \"fw-01\"\n    set admintimeout 5\nend\n";
    const NEW: &str = "config system global\n    set hostname \"fw-01\"\n    set admintimeout 480\nend\n";

    struct Fixture {
        engine: ExecutionEngine,
        transport: Arc<ScriptedTransport>,
        fw: DeviceId,
        target: SnapshotId,
    }

    fn fixture(transport: ScriptedTransport) -> Fixture {
        let resolver = StaticCredentialResolver::new()
            .insert(&CredentialRef::env("FW"), Credential::password("admin", "pw"));
        let registry = Arc::new(DeviceRegistry::new(Arc::new(resolver)));
        let entry: serde_yaml::Value = serde_yaml::from_str(
            "id: fw-01\ntransport: ssh_cli\nconnection: { host: 10.0.0.1, credential: \"env:FW\" }\n",
        )
        .unwrap();
        registry.import(&[entry]);

        let fw = DeviceId::new("fw-01").unwrap();
        let transport = Arc::new(transport);
        transport.set_live(&fw, NEW);
        let store: Arc<dyn ArtifactStore> =
            Arc::new(SnapshotStore::new(MemoryStorage::new(), NoCompression::new()));
        let target = store
            .put(&fw, OLD.as_bytes(), CaptureInfo::new(TransportMethod::SshCli))
            .unwrap()
            .snapshot_id;

        let engine = ExecutionEngine::new(
            registry,
            Arc::new(TransportRegistry::uniform(transport.clone())),
            store,
            Arc::new(JobLedger::default()),
            DeviceClaims::new(),
            EventBus::default(),
            RetentionConfig::default(),
            EngineSettings::default(),
        );
        Fixture {
            engine,
            transport,
            fw,
            target,
        }
    }

    fn expect_trigger(times: usize) -> Arc<dyn BackupTrigger> {
        let mut trigger = MockBackupTrigger::new();
        trigger
            .expect_trigger()
            .times(times)
            .returning(|_, _| Ok(Some(JobId::new())));
        Arc::new(trigger)
    }

    #[tokio::test]
    async fn test_plan_shows_diff_and_is_stable() {
        let f = fixture(ScriptedTransport::new(TransportMethod::SshCli));
        let restore = RestoreEngine::new(&f.engine, expect_trigger(0));

        let plan = restore.plan(&f.fw, &f.target).await.unwrap();
        assert_eq!(plan.summary.removed.len(), 1);
        assert_eq!(plan.summary.added.len(), 1);
        assert!(plan.summary.added[0].text.contains("admintimeout 5"));
        assert_eq!(plan.token.len(), TOKEN_LEN);
        assert!(plan.push_capable);

        let again = restore.plan(&f.fw, &f.target).await.unwrap();
        assert_eq!(plan.token, again.token);
        assert!(f.transport.pushes().is_empty());
    }

    #[tokio::test]
    async fn test_restore_with_valid_token_pushes_and_triggers_backup() {
        let f = fixture(ScriptedTransport::new(TransportMethod::SshCli));
        let restore = RestoreEngine::new(&f.engine, expect_trigger(1));
        let mut events = f.engine.events().subscribe();

        let plan = restore.plan(&f.fw, &f.target).await.unwrap();
        let result = restore.restore(&f.fw, &f.target, &plan.token).await.unwrap();
        assert_eq!(result.last_confirmed, LastConfirmedState::PostPush);
        assert!(result.post_restore_job.is_some());
        assert_eq!(f.transport.pushes(), vec![(f.fw.clone(), OLD.to_string())]);
        assert_eq!(f.transport.live(&f.fw).as_deref(), Some(OLD));
        assert!(!f.engine.store().is_pinned(&f.target));

        assert_eq!(events.recv().await.unwrap().kind(), "restore_completed");
    }

    #[tokio::test]
    async fn test_wrong_token_fails_closed() {
        let f = fixture(ScriptedTransport::new(TransportMethod::SshCli));
        let restore = RestoreEngine::new(&f.engine, expect_trigger(0));
        let mut events = f.engine.events().subscribe();

        let err = restore.restore(&f.fw, &f.target, "deadbeef").await.unwrap_err();
        assert!(matches!(err, VaultError::Confirmation(_)));
        assert!(f.transport.pushes().is_empty());
        match events.recv().await.unwrap() {
            EngineEvent::RestoreFailed { last_confirmed, .. } => {
                assert_eq!(last_confirmed, LastConfirmedState::PrePush)
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_token_goes_stale_when_device_changes() {
        let f = fixture(ScriptedTransport::new(TransportMethod::SshCli));
        let restore = RestoreEngine::new(&f.engine, expect_trigger(0));

        let plan = restore.plan(&f.fw, &f.target).await.unwrap();
        f.transport.set_live(
            &f.fw,
            "config system global\n    set hostname \"fw-01b\"\nend\n",
        );
        let err = restore.restore(&f.fw, &f.target, &plan.token).await.unwrap_err();
        assert!(matches!(err, VaultError::Confirmation(_)));
        assert!(f.transport.pushes().is_empty());
    }

    #[tokio::test]
    async fn test_push_failure_reports_pre_push_state() {
        let f = fixture(ScriptedTransport::new(TransportMethod::SshCli));
        f.transport
            .fail_pushes(&f.fw, TransportError::protocol("Command fail. Return code -61"));
        let restore = RestoreEngine::new(&f.engine, expect_trigger(0));
        let mut events = f.engine.events().subscribe();

        let plan = restore.plan(&f.fw, &f.target).await.unwrap();
        let err = restore.restore(&f.fw, &f.target, &plan.token).await.unwrap_err();
        assert!(matches!(err, VaultError::Transport(TransportError::Protocol(_))));
        assert_eq!(f.transport.live(&f.fw).as_deref(), Some(NEW));
        assert!(!f.engine.claims().is_held(&f.fw));
        assert_eq!(failed_state(&mut events).await, LastConfirmedState::PrePush);
    }

    async fn failed_state(
        events: &mut tokio::sync::broadcast::Receiver<EngineEvent>,
    ) -> LastConfirmedState {
        match events.recv().await.unwrap() {
            EngineEvent::RestoreFailed { last_confirmed, .. } => last_confirmed,
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_partially_applied_push_reports_unknown_state() {
        let f = fixture(ScriptedTransport::new(TransportMethod::SshCli));
        let half = "config system global\n    set hostname \"fw-01\"\nend\n";
        f.transport.fail_pushes_partway(
            &f.fw,
            half,
            TransportError::protocol("session closed during paste"),
        );
        let restore = RestoreEngine::new(&f.engine, expect_trigger(0));
        let mut events = f.engine.events().subscribe();

        let plan = restore.plan(&f.fw, &f.target).await.unwrap();
        let fetches = f.transport.fetch_count();
        assert!(restore.restore(&f.fw, &f.target, &plan.token).await.is_err());
        assert_eq!(f.transport.live(&f.fw).as_deref(), Some(half));
        // Plan recompute plus the read back
        assert_eq!(f.transport.fetch_count(), fetches + 2);
        assert_eq!(failed_state(&mut events).await, LastConfirmedState::Unknown);
    }

    #[tokio::test]
    async fn test_push_applied_before_error_reports_post_push_state() {
        let f = fixture(ScriptedTransport::new(TransportMethod::SshCli));
        f.transport
            .fail_pushes_partway(&f.fw, OLD, TransportError::protocol("connection reset"));
        let restore = RestoreEngine::new(&f.engine, expect_trigger(0));
        let mut events = f.engine.events().subscribe();

        let plan = restore.plan(&f.fw, &f.target).await.unwrap();
        assert!(restore.restore(&f.fw, &f.target, &plan.token).await.is_err());
        assert_eq!(failed_state(&mut events).await, LastConfirmedState::PostPush);
    }

    #[tokio::test]
    async fn test_unreadable_device_after_failed_push_reports_unknown_state() {
        let f = fixture(ScriptedTransport::new(TransportMethod::SshCli));
        f.transport
            .fail_pushes(&f.fw, TransportError::protocol("Command fail. Return code -61"));
        let restore = RestoreEngine::new(&f.engine, expect_trigger(0));
        let mut events = f.engine.events().subscribe();

        let plan = restore.plan(&f.fw, &f.target).await.unwrap();
        // Consumed by the plan recompute; the read back then fails
        f.transport.push_step(&f.fw, Step::Config(NEW.to_string()));
        f.transport
            .push_step(&f.fw, Step::Fail(TransportError::unreachable("link down")));
        assert!(restore.restore(&f.fw, &f.target, &plan.token).await.is_err());
        assert_eq!(failed_state(&mut events).await, LastConfirmedState::Unknown);
    }

    #[tokio::test]
    async fn test_read_only_transport_cannot_restore() {
        let f = fixture(ScriptedTransport::new(TransportMethod::SshCli).read_only());
        let restore = RestoreEngine::new(&f.engine, expect_trigger(0));

        let plan = restore.plan(&f.fw, &f.target).await.unwrap();
        assert!(!plan.push_capable);
        let err = restore.restore(&f.fw, &f.target, &plan.token).await.unwrap_err();
        assert!(matches!(err, VaultError::Unsupported(_)));
    }

    #[tokio::test]
    async fn test_busy_device_is_rejected() {
        let f = fixture(ScriptedTransport::new(TransportMethod::SshCli));
        let restore = RestoreEngine::new(&f.engine, expect_trigger(0));
        let plan = restore.plan(&f.fw, &f.target).await.unwrap();

        let _backup = f.engine.claims().try_claim(&f.fw, ClaimKind::Backup).unwrap();
        let err = restore.restore(&f.fw, &f.target, &plan.token).await.unwrap_err();
        assert!(matches!(err, VaultError::DeviceBusy(_)));
    }

    #[tokio::test]
    async fn test_snapshot_of_other_device_is_rejected() {
        let f = fixture(ScriptedTransport::new(TransportMethod::SshCli));
        let restore = RestoreEngine::new(&f.engine, expect_trigger(0));
        let other = SnapshotId::new(DeviceId::new("fw-02").unwrap(), 1);
        assert!(matches!(
            restore.plan(&f.fw, &other).await,
            Err(VaultError::Validation(_))
        ));
    }
}
