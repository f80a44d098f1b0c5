//! Test artifacts: kernels, disks, SSH keys and machine configurations.

use crate::error::{CoreError, Result};
use serde::Deserialize;
use snapcheck_vm::{CpuTemplate, HostPath, MachineConfig};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// What an artifact is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Kernel,
    Disk,
    SshKey,
    MachineConfig,
}

/// A file already present on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    kind: ArtifactKind,
    local_path: PathBuf,
}

impl Artifact {
    pub fn new(kind: ArtifactKind, local_path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            local_path: local_path.into(),
        }
    }

    pub fn kernel(path: impl Into<PathBuf>) -> Self {
        Self::new(ArtifactKind::Kernel, path)
    }

    pub fn disk(path: impl Into<PathBuf>) -> Self {
        Self::new(ArtifactKind::Disk, path)
    }

    pub fn ssh_key(path: impl Into<PathBuf>) -> Self {
        Self::new(ArtifactKind::SshKey, path)
    }

    pub fn machine_config(path: impl Into<PathBuf>) -> Self {
        Self::new(ArtifactKind::MachineConfig, path)
    }

    pub fn kind(&self) -> ArtifactKind {
        self.kind
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    pub fn host_path(&self) -> HostPath {
        HostPath::new(&self.local_path)
    }

    fn invalid(&self, reason: impl Into<String>) -> CoreError {
        CoreError::InvalidArtifact {
            path: self.local_path.display().to_string(),
            reason: reason.into(),
        }
    }

    /// Copy the artifact into `dir`, keeping its file name.
    ///
    /// SSH keys end up owner-read-only (`0400`), as ssh requires. An existing
    /// copy is replaced.
    pub async fn copy_into(&self, dir: &Path) -> Result<HostPath> {
        let name = self
            .local_path
            .file_name()
            .ok_or_else(|| self.invalid("no file name"))?;
        let dest = dir.join(name);

        if tokio::fs::try_exists(&dest).await.unwrap_or(false) {
            tokio::fs::remove_file(&dest).await?;
        }
        tokio::fs::copy(&self.local_path, &dest)
            .await
            .map_err(|e| self.invalid(format!("copy to {}: {e}", dir.display())))?;

        if self.kind == ArtifactKind::SshKey {
            tokio::fs::set_permissions(&dest, std::fs::Permissions::from_mode(0o400)).await?;
        }
        Ok(HostPath::new(dest))
    }

    /// Parse a machine configuration artifact.
    pub async fn load_machine_config(&self) -> Result<MachineConfigFile> {
        if self.kind != ArtifactKind::MachineConfig {
            return Err(self.invalid(format!("{:?} is not a machine config", self.kind)));
        }
        let raw = tokio::fs::read(&self.local_path)
            .await
            .map_err(|e| self.invalid(e.to_string()))?;
        serde_json::from_slice(&raw).map_err(|e| self.invalid(e.to_string()))
    }
}

/// Contents of a machine configuration artifact. All fields are required.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct MachineConfigFile {
    pub vcpu_count: u8,
    pub mem_size_mib: u32,
    pub ht_enabled: bool,
}

impl MachineConfigFile {
    pub fn into_machine_config(
        self,
        cpu_template: Option<CpuTemplate>,
        track_dirty_pages: bool,
    ) -> MachineConfig {
        MachineConfig {
            vcpu_count: self.vcpu_count,
            mem_size_mib: self.mem_size_mib,
            ht_enabled: self.ht_enabled,
            cpu_template,
            track_dirty_pages,
        }
    }
}
