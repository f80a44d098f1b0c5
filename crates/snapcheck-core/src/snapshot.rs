//! Pausing an instance and serializing it to a [`Snapshot`].

use crate::artifacts::Artifact;
use crate::compat::{CompatPolicy, Verdict};
use crate::error::{CoreError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snapcheck_vm::{
    resolve_ifaces, HostPath, InstanceRoot, MachineConfig, Microvm, NetIfaceConfig,
    SnapshotCreate, SnapshotKind, VmError, RAMFS_DIR,
};
use std::path::Path;
use tokio::io::AsyncWriteExt;

/// Name of the snapshot directory inside the chroot.
pub const SNAPSHOT_DIR: &str = "snapshot";

const MIB: usize = 1024 * 1024;

/// Full or incremental snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SnapshotType {
    #[default]
    Full,
    /// Only pages dirtied since the last snapshot; needs dirty page tracking
    Diff,
}

impl SnapshotType {
    fn kind(self) -> SnapshotKind {
        match self {
            SnapshotType::Full => SnapshotKind::Full,
            SnapshotType::Diff => SnapshotKind::Diff,
        }
    }
}

/// Serialized instance state on disk.
///
/// Immutable once created. A snapshot taken from a live instance keeps that
/// instance's root alive, so its files stay readable after the instance is
/// dropped. Disks are referenced, not copied: the caller keeps them around.
#[derive(Debug, Clone)]
pub struct Snapshot {
    manifest: SnapshotManifest,
    _root: Option<InstanceRoot>,
}

/// On-disk description of a [`Snapshot`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SnapshotManifest {
    mem_file: HostPath,
    state_file: HostPath,
    disks: Vec<HostPath>,
    net_ifaces: Vec<NetIfaceConfig>,
    ssh_key: HostPath,
    snapshot_type: SnapshotType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    format_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    machine_config: Option<MachineConfig>,
    created_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn mem_file(&self) -> &HostPath {
        &self.manifest.mem_file
    }

    pub fn state_file(&self) -> &HostPath {
        &self.manifest.state_file
    }

    /// Disks in attachment order; the first one is the root device.
    pub fn disks(&self) -> &[HostPath] {
        &self.manifest.disks
    }

    pub fn net_ifaces(&self) -> &[NetIfaceConfig] {
        &self.manifest.net_ifaces
    }

    pub fn ssh_key(&self) -> &HostPath {
        &self.manifest.ssh_key
    }

    pub fn snapshot_type(&self) -> SnapshotType {
        self.manifest.snapshot_type
    }

    /// Format version the snapshot was serialized for; `None` is the
    /// producing monitor's native format.
    pub fn format_version(&self) -> Option<&str> {
        self.manifest.format_version.as_deref()
    }

    pub fn machine_config(&self) -> Option<&MachineConfig> {
        self.manifest.machine_config.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.manifest.created_at
    }

    /// Write a JSON manifest so another process can restore this snapshot.
    ///
    /// The files it points to are only kept if the source root is persisted.
    pub async fn save_manifest(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(&self.manifest)?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    /// Read a manifest written by [`Snapshot::save_manifest`].
    pub async fn load_manifest(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read(path).await?;
        let manifest: SnapshotManifest = serde_json::from_slice(&raw)?;
        if manifest.disks.is_empty() {
            return Err(CoreError::NoDisks);
        }
        Ok(Self {
            manifest,
            _root: None,
        })
    }
}

/// Parameters for [`SnapshotBuilder::create`].
#[derive(Debug, Clone)]
pub struct SnapshotSpec {
    disks: Vec<Artifact>,
    ssh_key: Artifact,
    snapshot_type: SnapshotType,
    target_version: Option<String>,
    mem_file_name: String,
    snapshot_name: String,
    net_ifaces: Option<Vec<NetIfaceConfig>>,
    use_ramdisk: bool,
}

impl SnapshotSpec {
    /// `disks[0]` is the root device.
    pub fn new(disks: Vec<Artifact>, ssh_key: Artifact) -> Self {
        Self {
            disks,
            ssh_key,
            snapshot_type: SnapshotType::Full,
            target_version: None,
            mem_file_name: "vm.mem".into(),
            snapshot_name: "vm.vmstate".into(),
            net_ifaces: None,
            use_ramdisk: false,
        }
    }

    pub fn snapshot_type(mut self, snapshot_type: SnapshotType) -> Self {
        self.snapshot_type = snapshot_type;
        self
    }

    /// Serialize for an older snapshot format version.
    pub fn target_version(mut self, version: impl Into<String>) -> Self {
        self.target_version = Some(version.into());
        self
    }

    pub fn mem_file_name(mut self, name: impl Into<String>) -> Self {
        self.mem_file_name = name.into();
        self
    }

    pub fn snapshot_name(mut self, name: impl Into<String>) -> Self {
        self.snapshot_name = name.into();
        self
    }

    /// Interfaces to record. Defaults to the instance's own interfaces.
    ///
    /// A restore recreates these tap names on the host, so they must match
    /// the taps the instance was built with.
    pub fn net_ifaces(mut self, ifaces: Vec<NetIfaceConfig>) -> Self {
        self.net_ifaces = Some(ifaces);
        self
    }

    /// Write the snapshot files into the jail's RAM-backed area.
    pub fn use_ramdisk(mut self, use_ramdisk: bool) -> Self {
        self.use_ramdisk = use_ramdisk;
        self
    }
}

/// Takes snapshots of one instance.
pub struct SnapshotBuilder<'a> {
    vm: &'a mut Microvm,
    policy: CompatPolicy,
}

impl<'a> SnapshotBuilder<'a> {
    pub fn new(vm: &'a mut Microvm) -> Self {
        Self {
            vm,
            policy: CompatPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: CompatPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Create `<chroot>/snapshot` owned by the jail user. Idempotent.
    pub async fn create_snapshot_dir(&self) -> Result<HostPath> {
        Ok(self.vm.jail().create_dir(SNAPSHOT_DIR).await?)
    }

    /// Pause the instance (if running) and serialize it.
    ///
    /// Once paused the instance stays paused, whether or not the monitor
    /// accepts the snapshot.
    pub async fn create(&mut self, spec: SnapshotSpec) -> Result<Snapshot> {
        if spec.snapshot_type == SnapshotType::Diff && !self.vm.dirty_page_tracking() {
            return Err(CoreError::DiffSnapshotsDisabled {
                vm_id: self.vm.id(),
            });
        }
        if spec.disks.is_empty() {
            return Err(CoreError::NoDisks);
        }

        let dir = if spec.use_ramdisk {
            let dir = self.vm.jail().create_dir(RAMFS_DIR).await?;
            self.preallocate_mem_file(&dir.as_path().join(&spec.mem_file_name))
                .await?;
            dir
        } else {
            self.create_snapshot_dir().await?
        };
        let mem_file = HostPath::new(dir.as_path().join(&spec.mem_file_name));
        let state_file = HostPath::new(dir.as_path().join(&spec.snapshot_name));

        if self.vm.state().is_running() {
            self.vm.pause().await?;
        }

        let devices = self.vm.device_count();
        let version = spec.target_version.as_deref();
        if let Verdict::Rejected(reason) = self.policy.evaluate(version, devices) {
            tracing::warn!(
                vm_id = %self.vm.id(),
                version = ?version,
                devices,
                reason = %reason,
                "Snapshot rejected by compatibility policy"
            );
            return Err(CoreError::CompatibilityRejected {
                version: version.unwrap_or_default().to_string(),
                devices,
                reason,
            });
        }

        let jail = self.vm.jail();
        let params = SnapshotCreate {
            snapshot_type: spec.snapshot_type.kind(),
            snapshot_path: jail.jailed_path(state_file.as_path())?.to_string(),
            mem_file_path: jail.jailed_path(mem_file.as_path())?.to_string(),
            version: spec.target_version.clone(),
        };
        self.vm.create_snapshot(&params).await?;

        let ssh_key = spec.ssh_key.copy_into(dir.as_path()).await?;
        let net_ifaces = match spec.net_ifaces {
            Some(ifaces) => resolve_ifaces(Some(ifaces.as_slice())),
            None if !self.vm.net_ifaces().is_empty() => self.vm.net_ifaces().to_vec(),
            None => resolve_ifaces(None),
        };

        Ok(Snapshot {
            manifest: SnapshotManifest {
                mem_file,
                state_file,
                disks: spec.disks.iter().map(Artifact::host_path).collect(),
                net_ifaces,
                ssh_key,
                snapshot_type: spec.snapshot_type,
                format_version: spec.target_version,
                machine_config: self.vm.machine_config().cloned(),
                created_at: Utc::now(),
            },
            _root: Some(self.vm.root().clone()),
        })
    }

    /// Fill the memory file with zeros so the ramfs has room for it.
    async fn preallocate_mem_file(&self, path: &Path) -> Result<()> {
        let mem_size_mib = self
            .vm
            .machine_config()
            .map(|config| config.mem_size_mib)
            .ok_or_else(|| {
                VmError::Config("memory size unknown; instance has no machine config".into())
            })?;

        let mut file = tokio::fs::File::create(path).await?;
        let chunk = vec![0u8; MIB];
        for _ in 0..mem_size_mib {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        self.vm.jail().chown(path)?;

        tracing::debug!(
            vm_id = %self.vm.id(),
            path = %path.display(),
            mem_size_mib,
            "Preallocated memory file"
        );
        Ok(())
    }
}
