//! # snapcheck-vm
//!
//! Instance-level building blocks for Firecracker snapshot testing: per-instance
//! roots and jails, host tap devices, monitor launch, and the control channel
//! used to drive a monitor through configure → run → pause → snapshot.
//!
//! ## Quick Start
//!
//! ```no_run
//! use snapcheck_vm::{
//!     FirecrackerLauncher, InstanceRoot, IpTapProvisioner, Jail, LaunchOptions,
//!     MonitorLauncher, Microvm,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> snapcheck_vm::Result<()> {
//! let launcher = FirecrackerLauncher::new("/usr/local/bin/firecracker");
//! let root = InstanceRoot::allocate(std::path::Path::new("/tmp/snapcheck"))?;
//! let jail = Jail::new(uuid::Uuid::new_v4(), root, &launcher.isolation())?;
//!
//! let mut vm = Microvm::new(jail, Arc::new(IpTapProvisioner::default()));
//! vm.spawn(&launcher, &LaunchOptions::default()).await?;
//! assert_eq!(vm.state(), snapcheck_vm::VmState::Spawned);
//!
//! vm.destroy().await?;
//! # Ok(())
//! # }
//! ```

mod api;
mod client;
mod config;
mod error;
mod jail;
mod launcher;
mod machine;
mod metrics;
mod network;

pub use api::{
    ApiMethod, ApiRequest, ApiResponse, BootSource, ControlChannel, Drive, Metrics,
    NetworkInterface, SnapshotCreate, SnapshotKind, SnapshotLoad, VmStateChange,
    STATUS_NO_CONTENT,
};
pub use client::{FirecrackerApi, DEFAULT_API_TIMEOUT};
pub use config::{CpuTemplate, LogLevel, MachineConfig, DEFAULT_BOOT_ARGS};
pub use error::{Result, VmError};
pub use jail::{HostPath, InstanceRoot, Isolation, Jail, JailedPath, RAMFS_DIR, ROOT_PREFIX};
pub use launcher::{FirecrackerLauncher, JailerOptions, LaunchOptions, MonitorLauncher, MonitorProcess};
pub use machine::{Microvm, SshConfig, VmState};
pub use metrics::MetricsFifo;
pub use network::{
    mac_from_ip, resolve_ifaces, validate_ifaces, IpTapProvisioner, NetIfaceConfig, TapProvisioner,
    MAX_TAP_NAME_LEN,
};
