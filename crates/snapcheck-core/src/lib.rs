//! # snapcheck-core
//!
//! Orchestration layer for Firecracker snapshot compatibility tests.
//!
//! This crate builds microVMs from test artifacts, snapshots them for a
//! target snapshot format version, and restores them from those snapshots.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     snapcheck-core                       │
//! ├──────────────────────────────────────────────────────────┤
//! │                                                          │
//! │  ┌──────────────────────┐     ┌──────────────────────┐   │
//! │  │ MicrovmBuilder       │────▶│ Microvm              │   │
//! │  │  - build()           │     │ (from snapcheck-vm)  │   │
//! │  │  - build_from_       │     └──────────────────────┘   │
//! │  │    snapshot()        │                │               │
//! │  └──────────────────────┘                ▼               │
//! │             ▲                 ┌──────────────────────┐   │
//! │             │                 │ SnapshotBuilder      │   │
//! │  ┌──────────────────────┐     │  - create()          │   │
//! │  │ Snapshot             │◀────│  CompatPolicy        │   │
//! │  │ (mem, state, disks)  │     └──────────────────────┘   │
//! │  └──────────────────────┘                                │
//! │                                                          │
//! └──────────────────────────────────────────────────────────┘
//!                           │
//!                           ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │        firecracker (optionally under the jailer)         │
//! │           HTTP API on a Unix socket in the jail          │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use snapcheck_core::{
//!     Artifact, BuildSpec, HarnessConfig, MicrovmBuilder, SnapshotBuilder, SnapshotSpec,
//! };
//!
//! # async fn example() -> snapcheck_core::Result<()> {
//! let builder = MicrovmBuilder::from_config(&HarnessConfig::from_env());
//!
//! let rootfs = Artifact::disk("/var/lib/snapcheck/rootfs.ext4");
//! let ssh_key = Artifact::ssh_key("/var/lib/snapcheck/id_rsa");
//! let spec = BuildSpec::new(
//!     Artifact::kernel("/var/lib/snapcheck/vmlinux.bin"),
//!     vec![rootfs.clone()],
//!     ssh_key.clone(),
//!     Artifact::machine_config("/var/lib/snapcheck/2vcpu_256mb.json"),
//! );
//!
//! let mut vm = builder.build(spec).await?;
//! vm.start().await?;
//!
//! // Serialize for an older snapshot format
//! let snapshot = SnapshotBuilder::new(&mut vm)
//!     .create(SnapshotSpec::new(vec![rootfs], ssh_key).target_version("0.23.0"))
//!     .await?;
//! vm.destroy().await?;
//!
//! let (restored, _metrics) = builder.build_from_snapshot(&snapshot, true, false).await?;
//! restored.destroy().await?;
//! # Ok(())
//! # }
//! ```

mod artifacts;
mod builder;
mod compat;
mod config;
mod error;
mod snapshot;

pub use artifacts::{Artifact, ArtifactKind, MachineConfigFile};
pub use builder::{BuildSpec, MicrovmBuilder, METRICS_FIFO};
pub use compat::{CompatPolicy, UnknownVersion, Verdict, FC_V0_23_MAX_DEVICES_ATTACHED};
pub use config::{ConfigError, HarnessConfig, DEFAULT_API_TIMEOUT_MS, DEFAULT_JAIL_ID};
pub use error::{CoreError, Result};
pub use snapshot::{Snapshot, SnapshotBuilder, SnapshotSpec, SnapshotType, SNAPSHOT_DIR};
