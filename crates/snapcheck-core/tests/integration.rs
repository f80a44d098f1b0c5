//! End-to-end snapshot tests against a real Firecracker.
//!
//! These tests require:
//! - Linux with /dev/kvm access
//! - Firecracker binary (SNAPCHECK_FIRECRACKER)
//! - Kernel, rootfs, SSH key and machine config artifacts
//! - CAP_NET_ADMIN for tap devices
//!
//! Run with: `cargo test -p snapcheck-core -- --ignored`

use snapcheck_core::{
    Artifact, BuildSpec, HarnessConfig, MicrovmBuilder, SnapshotBuilder, SnapshotSpec,
};
use snapcheck_vm::{NetIfaceConfig, VmState};
use std::path::Path;

struct Artifacts {
    kernel: Artifact,
    rootfs: Artifact,
    ssh_key: Artifact,
    config: Artifact,
}

fn artifacts() -> Option<Artifacts> {
    let var = |name: &str, default: &str| std::env::var(name).unwrap_or_else(|_| default.into());
    let kernel = var("SNAPCHECK_KERNEL", "/var/lib/snapcheck/vmlinux.bin");
    let rootfs = var("SNAPCHECK_ROOTFS", "/var/lib/snapcheck/rootfs.ext4");
    let ssh_key = var("SNAPCHECK_SSH_KEY", "/var/lib/snapcheck/id_rsa");
    let config = var(
        "SNAPCHECK_MACHINE_CONFIG",
        "/var/lib/snapcheck/2vcpu_256mb.json",
    );

    // Skip if files don't exist
    for path in [&kernel, &rootfs, &ssh_key, &config] {
        if !Path::new(path).exists() {
            eprintln!("Skipping test: {path} not found");
            return None;
        }
    }

    Some(Artifacts {
        kernel: Artifact::kernel(kernel),
        rootfs: Artifact::disk(rootfs),
        ssh_key: Artifact::ssh_key(ssh_key),
        config: Artifact::machine_config(config),
    })
}

fn builder() -> Option<MicrovmBuilder> {
    let config = HarnessConfig::from_env();
    if let Err(e) = config.validate() {
        eprintln!("Skipping test: {e}");
        return None;
    }
    Some(MicrovmBuilder::from_config(&config))
}

/// Test build -> start -> snapshot for 0.23.0 -> restore with ten interfaces
#[tokio::test]
#[ignore = "requires Linux + KVM + Firecracker"]
async fn test_snapshot_v0_23_with_ten_ifaces() {
    let Some(artifacts) = artifacts() else { return };
    let Some(builder) = builder() else { return };

    let ifaces: Vec<_> = (0..10).map(NetIfaceConfig::with_id).collect();
    let mut vm = builder
        .build(
            BuildSpec::new(
                artifacts.kernel.clone(),
                vec![artifacts.rootfs.clone()],
                artifacts.ssh_key.clone(),
                artifacts.config.clone(),
            )
            .net_ifaces(ifaces.clone()),
        )
        .await
        .expect("Failed to build microVM");
    vm.start().await.expect("Failed to start microVM");

    let snapshot = SnapshotBuilder::new(&mut vm)
        .create(
            SnapshotSpec::new(vec![artifacts.rootfs.clone()], artifacts.ssh_key.clone())
                .target_version("0.23.0"),
        )
        .await
        .expect("Failed to snapshot microVM");
    vm.destroy().await.unwrap();

    let (restored, _metrics) = builder
        .build_from_snapshot(&snapshot, true, false)
        .await
        .expect("Failed to restore microVM");
    assert_eq!(restored.state(), VmState::Resumed);
    assert_eq!(restored.net_ifaces(), snapshot.net_ifaces());
    assert_eq!(restored.net_ifaces().len(), ifaces.len());

    restored.destroy().await.unwrap();
}
