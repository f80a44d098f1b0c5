//! snapcheck entry point.
//!
//! Runs snapshot scenarios against a real Firecracker binary:
//!
//! - **roundtrip**: build, boot, snapshot, then restore in a fresh instance
//! - **snapshot**: build, boot and snapshot, keeping the files and writing a
//!   manifest another binary can restore from
//! - **restore**: restore from a manifest
//! - **check**: evaluate the compatibility policy without starting anything
//!
//! Binary paths and the root directory come from `SNAPCHECK_*` variables
//! (see `HarnessConfig::from_env`) and can be overridden by flags.

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use snapcheck_core::{
    Artifact, BuildSpec, CompatPolicy, HarnessConfig, MicrovmBuilder, Snapshot, SnapshotBuilder,
    SnapshotSpec, SnapshotType, UnknownVersion, Verdict,
};
use snapcheck_vm::{CpuTemplate, Microvm, NetIfaceConfig};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "snapcheck")]
#[command(about = "Firecracker snapshot compatibility scenarios", long_about = None)]
#[command(version)]
struct Cli {
    /// Firecracker binary (overrides SNAPCHECK_FIRECRACKER)
    #[arg(long, global = true)]
    firecracker: Option<PathBuf>,

    /// Jailer binary (overrides SNAPCHECK_JAILER)
    #[arg(long, global = true)]
    jailer: Option<PathBuf>,

    /// Directory instance roots are created in (overrides SNAPCHECK_ROOT)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Leave instance roots on disk
    #[arg(long, global = true)]
    keep: bool,

    /// Refuse snapshot versions without a known device ceiling
    #[arg(long, global = true)]
    strict_versions: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build, boot, snapshot and restore in one process
    Roundtrip {
        #[command(flatten)]
        artifacts: ArtifactArgs,

        #[command(flatten)]
        snapshot: SnapshotArgs,

        /// Leave the restored instance paused
        #[arg(long)]
        no_resume: bool,
    },
    /// Build, boot and snapshot; write a manifest for a later restore
    Snapshot {
        #[command(flatten)]
        artifacts: ArtifactArgs,

        #[command(flatten)]
        snapshot: SnapshotArgs,

        /// Where to write the snapshot manifest
        #[arg(long)]
        manifest: PathBuf,
    },
    /// Restore from a snapshot manifest
    Restore {
        /// Manifest written by `snapcheck snapshot`
        #[arg(long)]
        manifest: PathBuf,

        /// Leave the restored instance paused
        #[arg(long)]
        no_resume: bool,

        /// Track dirty pages in the restored instance
        #[arg(long)]
        diff: bool,
    },
    /// Check a device count against a snapshot version
    Check {
        /// Snapshot format version, e.g. 0.23.0
        #[arg(long)]
        target_version: String,

        /// Attached devices, root drive included
        #[arg(long)]
        devices: usize,
    },
}

#[derive(Args)]
struct ArtifactArgs {
    /// Guest kernel image
    #[arg(long, env = "SNAPCHECK_KERNEL")]
    kernel: PathBuf,

    /// Root filesystem image
    #[arg(long, env = "SNAPCHECK_ROOTFS")]
    rootfs: PathBuf,

    /// Private key for the guest
    #[arg(long, env = "SNAPCHECK_SSH_KEY")]
    ssh_key: PathBuf,

    /// Machine configuration JSON (vcpu_count, mem_size_mib, ht_enabled)
    #[arg(long, env = "SNAPCHECK_MACHINE_CONFIG")]
    machine_config: PathBuf,

    /// CPU template (C3, T2, T2S, None)
    #[arg(long)]
    cpu_template: Option<CpuTemplate>,
}

#[derive(Args)]
struct SnapshotArgs {
    /// Snapshot format version to serialize for
    #[arg(long)]
    target_version: Option<String>,

    /// Number of guest network interfaces
    #[arg(long, default_value_t = 1)]
    net_ifaces: u8,

    /// Take a diff snapshot (enables dirty page tracking)
    #[arg(long)]
    diff: bool,

    /// Keep the root disk and snapshot files in a ramfs
    #[arg(long)]
    ramdisk: bool,
}

impl ArtifactArgs {
    fn rootfs(&self) -> Artifact {
        Artifact::disk(&self.rootfs)
    }

    fn ssh_key(&self) -> Artifact {
        Artifact::ssh_key(&self.ssh_key)
    }

    fn build_spec(&self, snapshot: &SnapshotArgs) -> BuildSpec {
        let ifaces = (0..snapshot.net_ifaces).map(NetIfaceConfig::with_id).collect();
        let spec = BuildSpec::new(
            Artifact::kernel(&self.kernel),
            vec![self.rootfs()],
            self.ssh_key(),
            Artifact::machine_config(&self.machine_config),
        )
        .net_ifaces(ifaces)
        .enable_diff_snapshots(snapshot.diff)
        .use_ramdisk(snapshot.ramdisk);

        match self.cpu_template {
            Some(template) => spec.cpu_template(template),
            None => spec,
        }
    }
}

impl SnapshotArgs {
    fn spec(&self, artifacts: &ArtifactArgs) -> SnapshotSpec {
        let spec = SnapshotSpec::new(vec![artifacts.rootfs()], artifacts.ssh_key())
            .snapshot_type(if self.diff {
                SnapshotType::Diff
            } else {
                SnapshotType::Full
            })
            .use_ramdisk(self.ramdisk);

        match &self.target_version {
            Some(version) => spec.target_version(version),
            None => spec,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries the JSON result
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("snapcheck=info".parse()?))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let mut config = HarnessConfig::from_env();
    if let Some(firecracker) = cli.firecracker {
        config.firecracker_path = firecracker;
    }
    if cli.jailer.is_some() {
        config.jailer_path = cli.jailer;
    }
    if let Some(root) = cli.root {
        config.root_base = root;
    }
    if cli.strict_versions {
        config.unknown_versions = UnknownVersion::Reject;
    }
    config.keep_roots |= cli.keep;

    if let Command::Check {
        target_version,
        devices,
    } = &cli.command
    {
        return check(config.policy(), target_version, *devices);
    }

    tracing::info!(?config, "Configuration loaded");
    config.validate().context("invalid harness configuration")?;
    if let Err(e) = config.launcher().prepare_binaries() {
        tracing::warn!(error = %e, "Could not make binaries read-only");
    }

    match cli.command {
        Command::Roundtrip {
            artifacts,
            snapshot,
            no_resume,
        } => roundtrip(&config, &artifacts, &snapshot, !no_resume).await,
        Command::Snapshot {
            artifacts,
            snapshot,
            manifest,
        } => {
            // Manifest paths point into the source root
            config.keep_roots = true;
            snapshot_only(&config, &artifacts, &snapshot, &manifest).await
        }
        Command::Restore {
            manifest,
            no_resume,
            diff,
        } => restore(&config, &manifest, !no_resume, diff).await,
        Command::Check { .. } => Ok(()),
    }
}

fn check(policy: CompatPolicy, version: &str, devices: usize) -> anyhow::Result<()> {
    let verdict = policy.evaluate(Some(version), devices);
    let (allowed, reason) = match &verdict {
        Verdict::Allowed => (true, None),
        Verdict::Rejected(reason) => (false, Some(reason.as_str())),
    };
    println!(
        "{}",
        serde_json::json!({
            "target_version": version,
            "devices": devices,
            "ceiling": CompatPolicy::ceiling(version),
            "allowed": allowed,
            "reason": reason,
        })
    );
    if !allowed {
        anyhow::bail!("snapshot version {version} rejected");
    }
    Ok(())
}

async fn booted(
    builder: &MicrovmBuilder,
    artifacts: &ArtifactArgs,
    snapshot: &SnapshotArgs,
) -> anyhow::Result<Microvm> {
    let mut vm = builder
        .build(artifacts.build_spec(snapshot))
        .await
        .context("failed to build microVM")?;
    if let Err(e) = vm.start().await {
        vm.destroy().await?;
        return Err(e).context("failed to start microVM");
    }
    Ok(vm)
}

async fn take_snapshot(
    config: &HarnessConfig,
    vm: &mut Microvm,
    artifacts: &ArtifactArgs,
    snapshot: &SnapshotArgs,
) -> anyhow::Result<Snapshot> {
    let taken = SnapshotBuilder::new(vm)
        .with_policy(config.policy())
        .create(snapshot.spec(artifacts))
        .await;
    match taken {
        Ok(taken) => Ok(taken),
        Err(e) => {
            tracing::error!(status = ?e.status(), error = %e, "Snapshot failed");
            Err(e).context("failed to create snapshot")
        }
    }
}

async fn roundtrip(
    config: &HarnessConfig,
    artifacts: &ArtifactArgs,
    snapshot_args: &SnapshotArgs,
    resume: bool,
) -> anyhow::Result<()> {
    let builder = MicrovmBuilder::from_config(config);
    let mut vm = booted(&builder, artifacts, snapshot_args).await?;

    let snapshot = match take_snapshot(config, &mut vm, artifacts, snapshot_args).await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            vm.destroy().await?;
            return Err(e);
        }
    };
    let source_id = vm.id();
    vm.destroy().await?;

    let (restored, metrics) = builder
        .build_from_snapshot(&snapshot, resume, snapshot_args.diff)
        .await
        .context("failed to restore snapshot")?;

    let records = metrics.read_available().await.unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Could not read metrics");
        Vec::new()
    });

    println!(
        "{}",
        serde_json::json!({
            "source": source_id.to_string(),
            "restored": restored.id().to_string(),
            "state": restored.state().to_string(),
            "target_version": snapshot.format_version(),
            "snapshot_type": format!("{:?}", snapshot.snapshot_type()),
            "net_ifaces": restored.net_ifaces().len(),
            "devices": restored.device_count(),
            "metrics_records": records.len(),
            "created_at": snapshot.created_at().to_rfc3339(),
        })
    );

    restored.destroy().await?;
    Ok(())
}

async fn snapshot_only(
    config: &HarnessConfig,
    artifacts: &ArtifactArgs,
    snapshot_args: &SnapshotArgs,
    manifest: &std::path::Path,
) -> anyhow::Result<()> {
    let builder = MicrovmBuilder::from_config(config);
    let mut vm = booted(&builder, artifacts, snapshot_args).await?;

    let snapshot = match take_snapshot(config, &mut vm, artifacts, snapshot_args).await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            vm.destroy().await?;
            return Err(e);
        }
    };
    vm.destroy().await?;

    snapshot
        .save_manifest(manifest)
        .await
        .with_context(|| format!("failed to write {}", manifest.display()))?;

    println!(
        "{}",
        serde_json::json!({
            "manifest": manifest.display().to_string(),
            "mem_file": snapshot.mem_file().to_string(),
            "state_file": snapshot.state_file().to_string(),
            "target_version": snapshot.format_version(),
        })
    );
    Ok(())
}

async fn restore(
    config: &HarnessConfig,
    manifest: &std::path::Path,
    resume: bool,
    diff: bool,
) -> anyhow::Result<()> {
    let snapshot = Snapshot::load_manifest(manifest)
        .await
        .with_context(|| format!("failed to read {}", manifest.display()))?;

    let builder = MicrovmBuilder::from_config(config);
    let (restored, _metrics) = builder
        .build_from_snapshot(&snapshot, resume, diff)
        .await
        .context("failed to restore snapshot")?;

    println!(
        "{}",
        serde_json::json!({
            "restored": restored.id().to_string(),
            "state": restored.state().to_string(),
            "target_version": snapshot.format_version(),
            "net_ifaces": restored.net_ifaces().len(),
        })
    );

    restored.destroy().await?;
    Ok(())
}
