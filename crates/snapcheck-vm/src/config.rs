//! Machine configuration for Firecracker instances.

use crate::error::{Result, VmError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default kernel command line for test instances.
pub const DEFAULT_BOOT_ARGS: &str = "console=ttyS0 reboot=k panic=1";

/// Machine resources applied through `PUT /machine-config`.
///
/// The struct serializes to the exact request body the monitor expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineConfig {
    /// Number of virtual CPUs (1-32)
    pub vcpu_count: u8,
    /// Memory size in MiB
    pub mem_size_mib: u32,
    /// Hyperthreading
    pub ht_enabled: bool,
    /// CPU feature template, monitor default when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_template: Option<CpuTemplate>,
    /// Dirty page tracking, required for diff snapshots
    #[serde(default)]
    pub track_dirty_pages: bool,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            vcpu_count: 2,
            mem_size_mib: 256,
            ht_enabled: false,
            cpu_template: None,
            track_dirty_pages: false,
        }
    }
}

impl MachineConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    /// Returns an error if any configuration value is invalid.
    pub fn validate(&self) -> Result<()> {
        // Firecracker supports 1-32 vCPUs
        if self.vcpu_count == 0 || self.vcpu_count > 32 {
            return Err(VmError::Config(format!(
                "vcpu_count must be 1-32, got {}",
                self.vcpu_count
            )));
        }

        if self.ht_enabled && self.vcpu_count > 1 && self.vcpu_count % 2 != 0 {
            return Err(VmError::Config(format!(
                "vcpu_count must be 1 or even when ht_enabled, got {}",
                self.vcpu_count
            )));
        }

        if self.mem_size_mib == 0 {
            return Err(VmError::Config("mem_size_mib must be > 0".into()));
        }

        Ok(())
    }
}

/// CPU feature templates understood by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CpuTemplate {
    C3,
    T2,
    T2S,
    None,
}

impl fmt::Display for CpuTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CpuTemplate::C3 => write!(f, "C3"),
            CpuTemplate::T2 => write!(f, "T2"),
            CpuTemplate::T2S => write!(f, "T2S"),
            CpuTemplate::None => write!(f, "None"),
        }
    }
}

impl std::str::FromStr for CpuTemplate {
    type Err = VmError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "C3" => Ok(Self::C3),
            "T2" => Ok(Self::T2),
            "T2S" => Ok(Self::T2S),
            "NONE" => Ok(Self::None),
            other => Err(VmError::Config(format!("unknown cpu template: {other}"))),
        }
    }
}

/// Monitor log verbosity passed on the command line (`--level`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Error,
    #[default]
    Warning,
    Info,
    Debug,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Error => write!(f, "Error"),
            LogLevel::Warning => write!(f, "Warning"),
            LogLevel::Info => write!(f, "Info"),
            LogLevel::Debug => write!(f, "Debug"),
        }
    }
}
