/*!
# fwvault Core Engine

Backup orchestration for firewall configurations.

For every managed device the engine picks a backup transport, runs it under
a caller-enforced timeout with retry and backoff, validates the capture,
stores it as an immutable snapshot, diffs it against the previous one and
emits typed events. Restores push a stored snapshot back after the operator
confirms a token bound to the pre-restore diff.

## Components

- [`registry`]: device records and just-in-time credential resolution
- [`snapshot`]: content-addressed artifact store with retention sweeps
- [`transport`]: SSH-CLI, SCP, REST-API and manager-proxied transports
- [`diff`]: normalized line diff between snapshots
- [`engine`]: the per-job state machine
- [`scheduler`]: cron-driven job dispatch with per-device exclusion
- [`restore`]: confirmed restore with post-restore capture
- [`service`]: initialization, teardown and the operator operations

## Usage

```rust,no_run
use fwvault_core::config::load_config_file;
use fwvault_core::service::QueuedJobs;
use fwvault_core::{BackupService, DeviceId};

# async fn demo() -> fwvault_core::Result<()> {
let service = BackupService::init(load_config_file("fwvault.yaml")?, QueuedJobs::Resume).await?;

let job = service.backup_device(&DeviceId::new("fw-01")?).await?;
let report = service.backup_all(None).await;
println!("{job:?} {}", report.status());

service.teardown().await?;
# Ok(())
# }
```
*/

pub mod claim;
pub mod compression;
pub mod config;
pub mod credential;
pub mod cron;
pub mod device;
pub mod diff;
pub mod engine;
pub mod error;
pub mod events;
pub mod job;
pub mod metadata;
pub mod normalize;
pub mod observability;
pub mod outcome;
pub mod registry;
pub mod restore;
pub mod retention;
pub mod scheduler;
pub mod service;
pub mod snapshot;
pub mod storage;
pub mod transport;
pub mod validation;

#[cfg(test)]
mod metadata_tests;

pub use compression::{CompressionAdapter, GzipCompressor};
pub use config::{LoadedConfig, Settings};
pub use device::{Device, DeviceId, TransportMethod};
pub use error::{Result, TransportError, VaultError};
pub use events::EngineEvent;
pub use job::{Job, JobId, JobState};
pub use metadata::{SnapshotId, SnapshotMetadata};
pub use outcome::{BatchReport, RunStatus};
pub use service::BackupService;
pub use snapshot::ArtifactStore;
pub use storage::{LocalFileStorage, StorageAdapter};
