//! Microvm handle - lifecycle of one monitor instance under test.

use crate::api::{
    ApiRequest, BootSource, ControlChannel, Drive, Metrics, NetworkInterface, SnapshotCreate,
    SnapshotLoad, VmStateChange,
};
use crate::config::MachineConfig;
use crate::error::{Result, VmError};
use crate::jail::{HostPath, InstanceRoot, Jail, JailedPath};
use crate::launcher::{LaunchOptions, MonitorLauncher};
use crate::network::{NetIfaceConfig, TapProvisioner};
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::process::Child;
use uuid::Uuid;

/// Lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    /// Jail laid out, no monitor yet
    Created,
    /// Monitor running, nothing configured
    Spawned,
    /// Devices and machine configured (or snapshot loaded), not running
    Configured,
    /// Guest running after a fresh boot
    Running,
    /// vCPUs paused
    Paused,
    /// Guest running again after a pause or a resuming restore
    Resumed,
    /// Monitor gone
    Terminated,
}

impl VmState {
    pub fn is_running(self) -> bool {
        matches!(self, VmState::Running | VmState::Resumed)
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmState::Created => write!(f, "created"),
            VmState::Spawned => write!(f, "spawned"),
            VmState::Configured => write!(f, "configured"),
            VmState::Running => write!(f, "running"),
            VmState::Paused => write!(f, "paused"),
            VmState::Resumed => write!(f, "resumed"),
            VmState::Terminated => write!(f, "terminated"),
        }
    }
}

/// How to reach the guest over SSH.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshConfig {
    pub username: String,
    pub hostname: Option<Ipv4Addr>,
    pub key_path: Option<HostPath>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            username: "root".into(),
            hostname: None,
            key_path: None,
        }
    }
}

/// One instance under test.
///
/// Dropping the handle kills the monitor. Tap devices are only removed by
/// [`Microvm::destroy`].
pub struct Microvm {
    jail: Jail,
    network: Arc<dyn TapProvisioner>,
    api: Option<Arc<dyn ControlChannel>>,
    process: Option<Child>,
    state: VmState,
    machine_config: Option<MachineConfig>,
    dirty_page_tracking: bool,
    drives: Vec<Drive>,
    net_ifaces: Vec<NetIfaceConfig>,
    taps: Vec<String>,
    ssh: SshConfig,
}

impl Microvm {
    /// Wrap a freshly laid out jail. No process is started.
    pub fn new(jail: Jail, network: Arc<dyn TapProvisioner>) -> Self {
        Self {
            jail,
            network,
            api: None,
            process: None,
            state: VmState::Created,
            machine_config: None,
            dirty_page_tracking: false,
            drives: Vec::new(),
            net_ifaces: Vec::new(),
            taps: Vec::new(),
            ssh: SshConfig::default(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.jail.id()
    }

    pub fn state(&self) -> VmState {
        self.state
    }

    pub fn jail(&self) -> &Jail {
        &self.jail
    }

    pub fn root(&self) -> &InstanceRoot {
        self.jail.root()
    }

    /// Machine configuration applied to (or restored into) this instance.
    pub fn machine_config(&self) -> Option<&MachineConfig> {
        self.machine_config.as_ref()
    }

    /// Whether the monitor tracks dirty pages, i.e. diff snapshots are possible.
    pub fn dirty_page_tracking(&self) -> bool {
        self.dirty_page_tracking
    }

    pub fn drives(&self) -> &[Drive] {
        &self.drives
    }

    /// Interfaces attached to the guest, with the host tap names in use.
    pub fn net_ifaces(&self) -> &[NetIfaceConfig] {
        &self.net_ifaces
    }

    /// Number of attached devices that consume an interrupt line.
    pub fn device_count(&self) -> usize {
        self.drives.len() + self.net_ifaces.len()
    }

    pub fn ssh_config(&self) -> &SshConfig {
        &self.ssh
    }

    pub fn set_ssh_key(&mut self, key_path: HostPath) {
        self.ssh.key_path = Some(key_path);
    }

    /// Start the monitor process.
    pub async fn spawn(
        &mut self,
        launcher: &dyn MonitorLauncher,
        options: &LaunchOptions,
    ) -> Result<()> {
        self.expect_state(&[VmState::Created], "created")?;

        let monitor = launcher.launch(&self.jail, options).await?;
        self.api = Some(monitor.api);
        self.process = monitor.child;
        self.state = VmState::Spawned;

        tracing::info!(vm_id = %self.id(), "Monitor spawned");
        Ok(())
    }

    /// Send a request and require `204 No Content`.
    pub async fn call(&self, request: ApiRequest) -> Result<()> {
        let api = self.api.as_ref().ok_or_else(|| VmError::InvalidState {
            expected: "spawned".into(),
            actual: self.state.to_string(),
        })?;

        let response = api.send(request.clone()).await?;
        if !response.is_no_content() {
            tracing::warn!(
                vm_id = %self.id(),
                operation = %request.operation(),
                status = response.status,
                body = %response.body,
                "Monitor rejected request"
            );
        }
        response.into_result(&request)
    }

    /// Create the host tap for `iface` without registering it with the monitor.
    ///
    /// The tap name is used as given. Restores rely on this: the serialized
    /// state names the taps the source instance used.
    pub async fn create_tap(&mut self, iface: &NetIfaceConfig) -> Result<()> {
        self.provision_tap(iface).await?;
        self.record_iface(iface);
        Ok(())
    }

    /// Create the tap for `iface` and attach it as a guest network device.
    ///
    /// Without a network namespace the tap name is scoped to this instance,
    /// see [`NetIfaceConfig::scoped_to`].
    pub async fn add_net_iface(&mut self, iface: &NetIfaceConfig) -> Result<()> {
        let iface = match self.jail.netns() {
            Some(_) => iface.clone(),
            None => iface.scoped_to(self.id())?,
        };

        self.provision_tap(&iface).await?;
        self.call(ApiRequest::network_interface(&NetworkInterface {
            iface_id: iface.dev_name.clone(),
            host_dev_name: iface.tap_name.clone(),
            guest_mac: iface.guest_mac(),
            allow_mmds_requests: true,
        })?)
        .await?;

        tracing::debug!(
            vm_id = %self.id(),
            dev = %iface.dev_name,
            tap = %iface.tap_name,
            guest_ip = %iface.guest_ip,
            "Network interface attached"
        );
        self.record_iface(&iface);
        Ok(())
    }

    /// Create the host tap; it is deleted on destroy even if never attached.
    async fn provision_tap(&mut self, iface: &NetIfaceConfig) -> Result<()> {
        self.expect_state(&[VmState::Spawned, VmState::Configured], "spawned")?;
        self.network.create_tap(self.jail.netns(), iface).await?;
        self.taps.push(iface.tap_name.clone());
        Ok(())
    }

    fn record_iface(&mut self, iface: &NetIfaceConfig) {
        self.net_ifaces.push(iface.clone());
        if self.ssh.hostname.is_none() {
            self.ssh.hostname = Some(iface.guest_ip);
        }
    }

    /// Attach a block device.
    pub async fn add_drive(&mut self, drive: Drive) -> Result<()> {
        self.expect_state(&[VmState::Spawned, VmState::Configured], "spawned")?;
        self.call(ApiRequest::drive(&drive)?).await?;
        tracing::debug!(vm_id = %self.id(), drive_id = %drive.drive_id, "Drive attached");
        self.drives.push(drive);
        Ok(())
    }

    /// Record a drive that comes back with restored state.
    pub fn track_restored_drive(&mut self, drive: Drive) {
        self.drives.push(drive);
    }

    /// Point the monitor at a jailed kernel image.
    pub async fn set_boot_source(&mut self, kernel: &JailedPath, boot_args: &str) -> Result<()> {
        self.expect_state(&[VmState::Spawned, VmState::Configured], "spawned")?;
        self.call(ApiRequest::boot_source(&BootSource {
            kernel_image_path: kernel.to_string(),
            boot_args: Some(boot_args.to_string()),
        })?)
        .await
    }

    /// Register a jailed metrics sink.
    pub async fn set_metrics(&mut self, metrics: &JailedPath) -> Result<()> {
        self.expect_state(&[VmState::Spawned], "spawned")?;
        self.call(ApiRequest::metrics(&Metrics {
            metrics_path: metrics.to_string(),
        })?)
        .await
    }

    /// Apply machine configuration; the instance becomes `Configured`.
    pub async fn configure_machine(&mut self, config: MachineConfig) -> Result<()> {
        self.expect_state(&[VmState::Spawned, VmState::Configured], "spawned")?;
        config.validate()?;
        self.call(ApiRequest::machine_config(&config)?).await?;

        tracing::info!(
            vm_id = %self.id(),
            vcpus = config.vcpu_count,
            mem_size_mib = config.mem_size_mib,
            track_dirty_pages = config.track_dirty_pages,
            "Machine configured"
        );
        self.dirty_page_tracking = config.track_dirty_pages;
        self.machine_config = Some(config);
        self.state = VmState::Configured;
        Ok(())
    }

    /// Boot the guest.
    pub async fn start(&mut self) -> Result<()> {
        self.expect_state(&[VmState::Configured], "configured")?;
        self.call(ApiRequest::instance_start()?).await?;
        self.state = VmState::Running;
        tracing::info!(vm_id = %self.id(), "MicroVM started");
        Ok(())
    }

    /// Pause all vCPUs.
    pub async fn pause(&mut self) -> Result<()> {
        if !self.state.is_running() {
            return Err(VmError::InvalidState {
                expected: "running".into(),
                actual: self.state.to_string(),
            });
        }
        self.call(ApiRequest::vm_state(VmStateChange::Paused)?).await?;
        self.state = VmState::Paused;
        tracing::debug!(vm_id = %self.id(), "MicroVM paused");
        Ok(())
    }

    /// Resume a paused instance.
    pub async fn resume(&mut self) -> Result<()> {
        self.expect_state(&[VmState::Paused], "paused")?;
        self.call(ApiRequest::vm_state(VmStateChange::Resumed)?).await?;
        self.state = VmState::Resumed;
        tracing::debug!(vm_id = %self.id(), "MicroVM resumed");
        Ok(())
    }

    /// Serialize a paused instance. The instance stays paused either way.
    pub async fn create_snapshot(&mut self, params: &SnapshotCreate) -> Result<()> {
        self.expect_state(&[VmState::Paused], "paused")?;
        let start = std::time::Instant::now();
        self.call(ApiRequest::snapshot_create(params)?).await?;
        tracing::info!(
            vm_id = %self.id(),
            snapshot_type = ?params.snapshot_type,
            version = ?params.version,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Snapshot created"
        );
        Ok(())
    }

    /// Pause if running, then serialize.
    pub async fn pause_to_snapshot(&mut self, params: &SnapshotCreate) -> Result<()> {
        if self.state.is_running() {
            self.pause().await?;
        }
        self.create_snapshot(params).await
    }

    /// Load serialized state into a freshly spawned monitor.
    ///
    /// `machine_config` is what the snapshot was taken with; the monitor
    /// restores it from the state file, it is only recorded here.
    pub async fn load_snapshot(
        &mut self,
        params: &SnapshotLoad,
        machine_config: Option<MachineConfig>,
    ) -> Result<()> {
        self.expect_state(&[VmState::Spawned], "spawned")?;
        let start = std::time::Instant::now();
        self.call(ApiRequest::snapshot_load(params)?).await?;

        self.dirty_page_tracking = params.enable_diff_snapshots;
        self.machine_config = machine_config.map(|mut config| {
            config.track_dirty_pages = params.enable_diff_snapshots;
            config
        });
        self.state = if params.resume_vm {
            VmState::Resumed
        } else {
            VmState::Configured
        };

        tracing::info!(
            vm_id = %self.id(),
            resumed = params.resume_vm,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Snapshot loaded"
        );
        Ok(())
    }

    /// Kill the monitor process, if any.
    pub async fn kill(&mut self) -> Result<()> {
        if let Some(mut child) = self.process.take() {
            tracing::warn!(vm_id = %self.id(), "Killing monitor");
            if let Err(e) = child.kill().await {
                tracing::warn!(vm_id = %self.id(), error = %e, "Failed to kill monitor");
            }
        }
        self.api = None;
        self.state = VmState::Terminated;
        Ok(())
    }

    /// Tear the instance down: kill the monitor and remove its taps.
    ///
    /// The instance root goes away once no snapshot refers to it any more.
    pub async fn destroy(mut self) -> Result<()> {
        tracing::info!(vm_id = %self.id(), "Destroying MicroVM");
        self.kill().await?;
        self.release_network().await;
        Ok(())
    }

    /// Remove taps and the network namespace, logging failures.
    async fn release_network(&mut self) {
        let netns = self.jail.netns().map(str::to_string);
        for tap in std::mem::take(&mut self.taps) {
            if let Err(e) = self.network.delete_tap(netns.as_deref(), &tap).await {
                tracing::warn!(vm_id = %self.id(), tap = %tap, error = %e, "Failed to delete tap");
            }
        }
        if let Some(ns) = netns {
            if let Err(e) = self.network.delete_netns(&ns).await {
                tracing::warn!(vm_id = %self.id(), netns = %ns, error = %e, "Failed to delete netns");
            }
        }
    }

    fn expect_state(&self, allowed: &[VmState], expected: &str) -> Result<()> {
        if allowed.contains(&self.state) {
            return Ok(());
        }
        Err(VmError::InvalidState {
            expected: expected.into(),
            actual: self.state.to_string(),
        })
    }
}

impl fmt::Debug for Microvm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Microvm")
            .field("id", &self.id())
            .field("state", &self.state)
            .field("root", self.root())
            .field("devices", &self.device_count())
            .finish()
    }
}
