/*!
fwvault CLI - operator interface for the firewall backup engine.

Runs the scheduler as a long-lived process, or performs one-shot backups,
diffs, restores and store maintenance against the configured inventory.
*/

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand, ValueEnum};
use fwvault_core::config::{load_config_file, write_sample_config};
use fwvault_core::job::Job;
use fwvault_core::observability::{gather_metrics, init_observability, LogFormat};
use fwvault_core::service::QueuedJobs;
use fwvault_core::{BackupService, DeviceId, JobId, JobState, RunStatus, SnapshotId, VaultError};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tabled::{Table, Tabled};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "fwvault")]
#[command(about = "Scheduled backup, drift tracking and restore for firewalls")]
#[command(version)]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, env = "FWVAULT_CONFIG", default_value = "fwvault.yaml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log line format
    #[arg(long, global = true, value_enum, default_value = "pretty")]
    log_format: LogFormatArg,

    #[command(subcommand)]
    command: Commands,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum LogFormatArg {
    Pretty,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Pretty => LogFormat::Pretty,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler until interrupted
    Run,
    /// Back up one device now
    Backup { device: String },
    /// Back up every device, or one group
    BackupAll {
        #[arg(short, long)]
        group: Option<String>,
    },
    /// List stored snapshots of a device
    History { device: String },
    /// Show recent jobs
    Jobs {
        /// Only jobs for this device
        device: Option<String>,
    },
    /// List the device inventory
    Devices {
        #[arg(short, long)]
        group: Option<String>,
    },
    /// Diff two snapshots, or the latest against its predecessor
    Diff {
        device: String,
        from: Option<String>,
        to: Option<String>,
    },
    /// Show what restoring a snapshot would change and its confirmation token
    RestorePlan { device: String, snapshot: String },
    /// Push a snapshot back to its device
    Restore {
        device: String,
        snapshot: String,
        /// Token printed by `restore-plan`
        #[arg(short, long)]
        token: String,
    },
    /// Re-hash stored snapshots of a device, or a single snapshot
    Verify { target: String },
    /// Store a capture whose job failed at the storage step
    RetryStore { job_id: String },
    /// Apply retention to every device
    Sweep,
    /// Fetch a configuration without storing it
    Test { device: String },
    /// Write a sample configuration file
    Init {
        #[arg(default_value = "fwvault.yaml")]
        path: PathBuf,
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

impl Commands {
    /// Only commands that back up devices run jobs left over from an earlier run
    fn queued_jobs(&self) -> QueuedJobs {
        match self {
            Self::Run | Self::Backup { .. } | Self::BackupAll { .. } => QueuedJobs::Resume,
            _ => QueuedJobs::Hold,
        }
    }
}

#[derive(Tabled)]
struct SnapshotRow {
    #[tabled(rename = "Snapshot")]
    id: String,
    #[tabled(rename = "Captured")]
    captured_at: String,
    #[tabled(rename = "Size")]
    size: String,
    #[tabled(rename = "Hash")]
    hash: String,
    #[tabled(rename = "Version")]
    version: String,
}

#[derive(Tabled)]
struct DeviceRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Group")]
    group: String,
    #[tabled(rename = "Transport")]
    transport: String,
    #[tabled(rename = "Host")]
    host: String,
    #[tabled(rename = "Schedule")]
    schedule: String,
}

#[derive(Tabled)]
struct JobRow {
    #[tabled(rename = "Job")]
    id: String,
    #[tabled(rename = "Device")]
    device: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Attempts")]
    attempts: u32,
    #[tabled(rename = "Finished")]
    finished: String,
    #[tabled(rename = "Result")]
    result: String,
}

impl From<&Job> for JobRow {
    fn from(job: &Job) -> Self {
        let result = match (&job.error, &job.diff) {
            (Some(err), _) => err.to_string(),
            (None, Some(diff)) if diff.previous.is_none() => "first capture".to_string(),
            (None, Some(diff)) if diff.change_detected => format!("drift {}", diff.summary.stat()),
            (None, Some(_)) => "unchanged".to_string(),
            (None, None) => String::new(),
        };
        Self {
            id: job.id.to_string(),
            device: job.device_id.to_string(),
            state: job.state.to_string(),
            attempts: job.attempts,
            finished: job
                .finished_at
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_default(),
            result,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_observability(cli.log_format.into(), cli.verbose) {
        eprintln!("Error: {e}");
        return ExitCode::from(1);
    }

    match execute(cli).await {
        Ok(status) => exit_code(status),
        Err(e) => {
            error!("{e:#}");
            let status = e
                .downcast_ref::<VaultError>()
                .map(RunStatus::from)
                .unwrap_or(RunStatus::TotalFailure);
            exit_code(status)
        }
    }
}

fn exit_code(status: RunStatus) -> ExitCode {
    ExitCode::from(status.exit_code() as u8)
}

async fn execute(cli: Cli) -> anyhow::Result<RunStatus> {
    if let Commands::Init { path, force } = &cli.command {
        return init_config(path, *force);
    }

    let config = load_config_file(&cli.config)?;
    let service = BackupService::init(config, cli.command.queued_jobs()).await?;
    let report = service.init_report();
    for rejected in &report.inventory.rejected {
        warn!(index = rejected.index, id = ?rejected.id, reason = %rejected.reason, "Device entry rejected");
    }
    for rejected in &report.rejected_schedules {
        warn!(index = rejected.index, id = ?rejected.id, reason = %rejected.reason, "Schedule entry rejected");
    }
    if report.held_jobs > 0 {
        info!(held = report.held_jobs, "Queued jobs from the previous run left for the next backup");
    }

    let status = dispatch(&service, cli.command).await;
    service.teardown().await?;
    status
}

async fn dispatch(service: &BackupService, command: Commands) -> anyhow::Result<RunStatus> {
    match command {
        Commands::Run => run_daemon(service).await,
        Commands::Backup { device } => backup(service, &parse_device(&device)?).await,
        Commands::BackupAll { group } => backup_all(service, group.as_deref()).await,
        Commands::History { device } => history(service, &parse_device(&device)?),
        Commands::Jobs { device } => {
            let device = device.as_deref().map(parse_device).transpose()?;
            jobs(service, device.as_ref())
        }
        Commands::Devices { group } => devices(service, group.as_deref()),
        Commands::Diff { device, from, to } => diff(service, &parse_device(&device)?, from, to),
        Commands::RestorePlan { device, snapshot } => {
            restore_plan(service, &parse_device(&device)?, &SnapshotId::parse(&snapshot)?).await
        }
        Commands::Restore {
            device,
            snapshot,
            token,
        } => restore(service, &parse_device(&device)?, &SnapshotId::parse(&snapshot)?, &token).await,
        Commands::Verify { target } => verify(service, &target),
        Commands::RetryStore { job_id } => {
            let metadata = service.retry_store(JobId::parse(&job_id)?).await?;
            println!("✓ Stored {} ({} bytes)", metadata.snapshot_id, metadata.size);
            Ok(RunStatus::Success)
        }
        Commands::Sweep => sweep(service),
        Commands::Test { device } => test_connection(service, &parse_device(&device)?).await,
        Commands::Init { .. } => unreachable!("handled before the service starts"),
    }
}

fn parse_device(raw: &str) -> anyhow::Result<DeviceId> {
    Ok(DeviceId::new(raw)?)
}

fn init_config(path: &Path, force: bool) -> anyhow::Result<RunStatus> {
    if path.exists() && !force {
        return Err(anyhow!(
            "{} already exists; pass --force to overwrite",
            path.display()
        ));
    }
    write_sample_config(path)?;
    println!("✓ Wrote sample configuration to {}", path.display());
    Ok(RunStatus::Success)
}

async fn run_daemon(service: &BackupService) -> anyhow::Result<RunStatus> {
    info!(devices = service.devices(None).len(), "Starting scheduler");
    tokio::select! {
        _ = service.run() => {}
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl-c")?;
            info!("Interrupt received, shutting down");
        }
    }
    if let Some(metrics) = gather_metrics()? {
        info!(bytes = metrics.len(), "Final metrics snapshot gathered");
        tracing::debug!("{metrics}");
    }
    Ok(RunStatus::Success)
}

async fn backup(service: &BackupService, device: &DeviceId) -> anyhow::Result<RunStatus> {
    let Some(job) = service.backup_device(device).await? else {
        println!("{device} already has a job in flight; nothing queued");
        return Ok(RunStatus::Success);
    };
    println!("{}", Table::new([JobRow::from(&job)]));
    Ok(match job.state {
        JobState::Succeeded => RunStatus::Success,
        _ => RunStatus::TotalFailure,
    })
}

async fn backup_all(service: &BackupService, group: Option<&str>) -> anyhow::Result<RunStatus> {
    let report = service.backup_all(group).await;
    if report.jobs.is_empty() && report.skipped.is_empty() {
        println!("No devices matched");
    } else {
        println!("{}", Table::new(report.jobs.iter().map(JobRow::from)));
    }
    for device in &report.skipped {
        println!("Skipped {device}: job already in flight");
    }
    let status = report.status();
    println!(
        "{}: {} succeeded, {} failed",
        status,
        report.succeeded().count(),
        report.failed().count()
    );
    Ok(status)
}

fn history(service: &BackupService, device: &DeviceId) -> anyhow::Result<RunStatus> {
    let snapshots = service.history(device)?;
    if snapshots.is_empty() {
        println!("No snapshots stored for {device}");
        return Ok(RunStatus::Success);
    }
    let rows = snapshots.iter().map(|meta| SnapshotRow {
        id: meta.snapshot_id.to_string(),
        captured_at: meta.captured_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        size: format_size(meta.size as u64),
        hash: meta.short_hash().to_string(),
        version: meta
            .device_info
            .as_ref()
            .and_then(|info| info.version.clone())
            .unwrap_or_default(),
    });
    println!("{}", Table::new(rows));
    Ok(RunStatus::Success)
}

fn jobs(service: &BackupService, device: Option<&DeviceId>) -> anyhow::Result<RunStatus> {
    let jobs = service.job_history(device);
    if jobs.is_empty() {
        println!("No jobs recorded");
    } else {
        println!("{}", Table::new(jobs.iter().map(JobRow::from)));
    }
    Ok(RunStatus::Success)
}

fn devices(service: &BackupService, group: Option<&str>) -> anyhow::Result<RunStatus> {
    let rows = service.devices(group).into_iter().map(|device| DeviceRow {
        id: device.id.to_string(),
        group: device.group.clone(),
        transport: device.transport.to_string(),
        host: format!("{}:{}", device.connection.host, device.port()),
        schedule: device.schedule.clone().unwrap_or_default(),
    });
    println!("{}", Table::new(rows));
    Ok(RunStatus::Success)
}

fn diff(
    service: &BackupService,
    device: &DeviceId,
    from: Option<String>,
    to: Option<String>,
) -> anyhow::Result<RunStatus> {
    let record = match (from, to) {
        (Some(from), Some(to)) => {
            service.diff(device, &SnapshotId::parse(&from)?, &SnapshotId::parse(&to)?)?
        }
        (None, None) => match service.diff_latest(device)? {
            Some(record) => record,
            None => {
                println!("{device} has fewer than two snapshots");
                return Ok(RunStatus::Success);
            }
        },
        _ => return Err(anyhow!("pass both snapshot ids or neither")),
    };

    if record.change_detected {
        println!("{} -> {} ({})", describe(record.previous.as_ref()), record.current, record.summary.stat());
        print!("{}", record.summary.render());
    } else {
        println!("No changes");
    }
    Ok(RunStatus::Success)
}

fn describe(id: Option<&SnapshotId>) -> String {
    id.map(ToString::to_string).unwrap_or_else(|| "(none)".to_string())
}

async fn restore_plan(
    service: &BackupService,
    device: &DeviceId,
    snapshot: &SnapshotId,
) -> anyhow::Result<RunStatus> {
    let plan = service.plan_restore(device, snapshot).await?;
    if !plan.push_capable {
        warn!(%device, "Transport of this device cannot push configurations");
    }
    if plan.is_noop() {
        println!("Live configuration already matches {snapshot}");
    } else {
        println!("Restoring {snapshot} changes the live configuration ({}):", plan.summary.stat());
        print!("{}", plan.summary.render());
    }
    println!();
    println!("Confirm with: fwvault restore {device} {snapshot} --token {}", plan.token);
    Ok(RunStatus::Success)
}

async fn restore(
    service: &BackupService,
    device: &DeviceId,
    snapshot: &SnapshotId,
    token: &str,
) -> anyhow::Result<RunStatus> {
    let result = service.restore(device, snapshot, token).await?;
    println!("✓ Restored {} to {}", result.snapshot_id, result.device_id);
    if result.post_restore_job.is_some() {
        service.wait_idle().await;
        if let Some(job) = service.job_history(Some(device)).first() {
            println!("{}", Table::new([JobRow::from(job)]));
        }
    }
    Ok(RunStatus::Success)
}

fn verify(service: &BackupService, target: &str) -> anyhow::Result<RunStatus> {
    if target.contains(':') {
        let metadata = service.verify(&SnapshotId::parse(target)?)?;
        println!("✓ {} integrity check passed ({})", metadata.snapshot_id, metadata.short_hash());
        return Ok(RunStatus::Success);
    }

    let report = service.verify_device(&parse_device(target)?)?;
    println!("✓ {} snapshots verified", report.verified.len());
    for (id, reason) in &report.failed {
        println!("✗ {id}: {reason}");
    }
    Ok(if report.failed.is_empty() {
        RunStatus::Success
    } else {
        RunStatus::TotalFailure
    })
}

fn sweep(service: &BackupService) -> anyhow::Result<RunStatus> {
    let reports = service.sweep_all()?;
    let removed: usize = reports.iter().map(|r| r.removed.len()).sum();
    let freed: u64 = reports.iter().map(|r| r.bytes_freed).sum();
    for report in reports.iter().filter(|r| !r.removed.is_empty()) {
        if let Some(device) = &report.device_id {
            println!(
                "{device}: removed {}, kept {} ({} pinned)",
                report.removed.len(),
                report.kept,
                report.pinned
            );
        }
    }
    println!("Removed {removed} snapshots, freed {}", format_size(freed));
    Ok(RunStatus::Success)
}

async fn test_connection(service: &BackupService, device: &DeviceId) -> anyhow::Result<RunStatus> {
    let probe = service.test_connection(device).await?;
    println!(
        "✓ {} responded with {} in {:.2?}",
        probe.device_id,
        format_size(probe.bytes as u64),
        probe.elapsed
    );
    if let Some(info) = &probe.device_info {
        println!("{}", serde_json::to_string_pretty(info)?);
    }
    Ok(RunStatus::Success)
}

fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}
