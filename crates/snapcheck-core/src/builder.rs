//! Building instances from artifacts or from a snapshot.

use crate::artifacts::Artifact;
use crate::config::HarnessConfig;
use crate::error::{CoreError, Result};
use crate::snapshot::Snapshot;
use snapcheck_vm::{
    resolve_ifaces, validate_ifaces, CpuTemplate, Drive, InstanceRoot, IpTapProvisioner, Jail,
    LaunchOptions, LogLevel, MetricsFifo, Microvm, MonitorLauncher, NetIfaceConfig,
    SnapshotLoad, TapProvisioner, DEFAULT_BOOT_ARGS,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// Name of the metrics fifo inside the chroot of restored instances.
pub const METRICS_FIFO: &str = "metrics.fifo";

const ROOT_DRIVE_ID: &str = "rootfs";

/// Parameters for [`MicrovmBuilder::build`].
#[derive(Debug, Clone)]
pub struct BuildSpec {
    kernel: Artifact,
    disks: Vec<Artifact>,
    ssh_key: Artifact,
    config: Artifact,
    net_ifaces: Option<Vec<NetIfaceConfig>>,
    enable_diff_snapshots: bool,
    cpu_template: Option<CpuTemplate>,
    use_ramdisk: bool,
}

impl BuildSpec {
    /// `disks[0]` is attached as the root device.
    pub fn new(kernel: Artifact, disks: Vec<Artifact>, ssh_key: Artifact, config: Artifact) -> Self {
        Self {
            kernel,
            disks,
            ssh_key,
            config,
            net_ifaces: None,
            enable_diff_snapshots: false,
            cpu_template: None,
            use_ramdisk: false,
        }
    }

    /// Interfaces to attach. Empty or unset means one default interface.
    ///
    /// Unless the instance gets its own network namespace, tap names are
    /// suffixed with the instance id on the host.
    pub fn net_ifaces(mut self, ifaces: Vec<NetIfaceConfig>) -> Self {
        self.net_ifaces = Some(ifaces);
        self
    }

    /// Track dirty pages so diff snapshots can be taken.
    pub fn enable_diff_snapshots(mut self, enable: bool) -> Self {
        self.enable_diff_snapshots = enable;
        self
    }

    pub fn cpu_template(mut self, template: CpuTemplate) -> Self {
        self.cpu_template = Some(template);
        self
    }

    /// Copy the root disk into the jail's RAM-backed area instead of linking it.
    pub fn use_ramdisk(mut self, use_ramdisk: bool) -> Self {
        self.use_ramdisk = use_ramdisk;
        self
    }
}

/// Builds ready-to-start instances.
///
/// Holds no per-build state; share it behind an `Arc` to build concurrently.
pub struct MicrovmBuilder {
    root_base: PathBuf,
    launcher: Arc<dyn MonitorLauncher>,
    network: Arc<dyn TapProvisioner>,
    keep_roots: bool,
}

impl MicrovmBuilder {
    /// Instance roots are allocated below `root_base`.
    pub fn new(
        root_base: impl Into<PathBuf>,
        launcher: Arc<dyn MonitorLauncher>,
        network: Arc<dyn TapProvisioner>,
    ) -> Self {
        Self {
            root_base: root_base.into(),
            launcher,
            network,
            keep_roots: false,
        }
    }

    /// Builder using the configured binaries and iproute2 for taps.
    pub fn from_config(config: &HarnessConfig) -> Self {
        Self::new(
            &config.root_base,
            Arc::new(config.launcher()),
            Arc::new(IpTapProvisioner::default()),
        )
        .keep_roots(config.keep_roots)
    }

    /// Leave roots of successfully built instances on disk.
    pub fn keep_roots(mut self, keep: bool) -> Self {
        self.keep_roots = keep;
        self
    }

    pub fn root_base(&self) -> &Path {
        &self.root_base
    }

    /// Allocate a fresh root and lay out its jail. No process is started.
    fn allocate(&self) -> Result<Microvm> {
        let root = InstanceRoot::allocate(&self.root_base)?;
        let jail = Jail::new(Uuid::new_v4(), root, &self.launcher.isolation())?;
        Ok(Microvm::new(jail, Arc::clone(&self.network)))
    }

    /// Spawn a monitor with nothing configured.
    pub async fn create_basevm(&self) -> Result<Microvm> {
        let mut vm = self.allocate()?;
        if let Err(e) = self.spawn(&mut vm, &LaunchOptions::default()).await {
            self.abandon(vm, &e).await;
            return Err(e);
        }
        self.finish(&vm);
        Ok(vm)
    }

    /// Build a configured, not yet started instance.
    pub async fn build(&self, spec: BuildSpec) -> Result<Microvm> {
        if spec.disks.is_empty() {
            return Err(CoreError::NoDisks);
        }
        let machine = spec
            .config
            .load_machine_config()
            .await?
            .into_machine_config(spec.cpu_template, spec.enable_diff_snapshots);
        machine.validate()?;
        let ifaces = resolve_ifaces(spec.net_ifaces.as_deref());
        validate_ifaces(&ifaces)?;

        let start = std::time::Instant::now();
        let mut vm = self.allocate()?;

        let configured = async {
            self.spawn(
                &mut vm,
                &LaunchOptions {
                    log_level: LogLevel::default(),
                    use_ramdisk: spec.use_ramdisk,
                },
            )
            .await?;

            let rootfs = spec.disks[0].host_path();
            let rootfs = if spec.use_ramdisk {
                vm.jail().copy_to_jail_ramfs(&rootfs).await?
            } else {
                vm.jail().create_jailed_resource(&rootfs).await?
            };

            let key = spec.ssh_key.copy_into(vm.root().path()).await?;
            vm.set_ssh_key(key);

            for iface in &ifaces {
                vm.add_net_iface(iface).await?;
            }

            let kernel = vm
                .jail()
                .create_jailed_resource(&spec.kernel.host_path())
                .await?;
            vm.set_boot_source(&kernel, DEFAULT_BOOT_ARGS).await?;

            vm.add_drive(Drive {
                drive_id: ROOT_DRIVE_ID.into(),
                path_on_host: rootfs.to_string(),
                is_root_device: true,
                is_read_only: false,
            })
            .await?;

            vm.configure_machine(machine).await?;
            Ok::<(), CoreError>(())
        }
        .await;

        if let Err(e) = configured {
            self.abandon(vm, &e).await;
            return Err(e);
        }

        tracing::info!(
            vm_id = %vm.id(),
            root = %vm.root().path().display(),
            net_ifaces = ifaces.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "MicroVM built"
        );
        self.finish(&vm);
        Ok(vm)
    }

    /// Restore an instance from `snapshot` into a fresh root.
    ///
    /// The returned fifo receives the restored monitor's metrics.
    pub async fn build_from_snapshot(
        &self,
        snapshot: &Snapshot,
        resume: bool,
        enable_diff_snapshots: bool,
    ) -> Result<(Microvm, MetricsFifo)> {
        if snapshot.disks().is_empty() {
            return Err(CoreError::NoDisks);
        }

        let start = std::time::Instant::now();
        let mut vm = self.allocate()?;

        let restored = async {
            self.spawn(
                &mut vm,
                &LaunchOptions {
                    log_level: LogLevel::Info,
                    use_ramdisk: false,
                },
            )
            .await?;

            let fifo = MetricsFifo::create(&vm.jail().chroot_path().join(METRICS_FIFO))?;
            vm.jail().chown(fifo.path().as_path())?;
            let metrics = vm.jail().jailed_path(fifo.path().as_path())?;
            vm.set_metrics(&metrics).await?;

            let mem_file = vm.jail().create_jailed_resource(snapshot.mem_file()).await?;
            let state_file = vm
                .jail()
                .create_jailed_resource(snapshot.state_file())
                .await?;

            for (i, disk) in snapshot.disks().iter().enumerate() {
                let jailed = vm.jail().create_jailed_resource(disk).await?;
                vm.track_restored_drive(Drive {
                    drive_id: if i == 0 {
                        ROOT_DRIVE_ID.to_string()
                    } else {
                        format!("disk{i}")
                    },
                    path_on_host: jailed.to_string(),
                    is_root_device: i == 0,
                    is_read_only: false,
                });
            }

            vm.set_ssh_key(snapshot.ssh_key().clone());

            // Devices come back with the state file; only the host side is rebuilt
            for iface in snapshot.net_ifaces() {
                vm.create_tap(iface).await?;
            }

            vm.load_snapshot(
                &SnapshotLoad {
                    snapshot_path: state_file.to_string(),
                    mem_file_path: mem_file.to_string(),
                    enable_diff_snapshots,
                    resume_vm: resume,
                },
                snapshot.machine_config().cloned(),
            )
            .await?;
            Ok::<MetricsFifo, CoreError>(fifo)
        }
        .await;

        let fifo = match restored {
            Ok(fifo) => fifo,
            Err(e) => {
                self.abandon(vm, &e).await;
                return Err(e);
            }
        };

        tracing::info!(
            vm_id = %vm.id(),
            root = %vm.root().path().display(),
            version = ?snapshot.format_version(),
            resumed = resume,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "MicroVM restored from snapshot"
        );
        self.finish(&vm);
        Ok((vm, fifo))
    }

    async fn spawn(&self, vm: &mut Microvm, options: &LaunchOptions) -> Result<()> {
        if let Some(ns) = vm.jail().netns() {
            self.network.create_netns(ns).await?;
        }
        vm.spawn(self.launcher.as_ref(), options).await?;
        Ok(())
    }

    fn finish(&self, vm: &Microvm) {
        if self.keep_roots {
            vm.root().persist();
        }
    }

    /// Tear down a half-built instance; its root goes with the handle.
    async fn abandon(&self, vm: Microvm, error: &CoreError) {
        tracing::error!(
            vm_id = %vm.id(),
            state = %vm.state(),
            error = %error,
            "Build failed, releasing instance"
        );
        if let Err(e) = vm.destroy().await {
            tracing::warn!(error = %e, "Failed to destroy abandoned instance");
        }
    }
}
