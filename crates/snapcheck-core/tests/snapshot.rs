//! Snapshot creation and restore against scripted monitors.

mod common;

use common::{ifaces, Harness, RecordingLauncher, FIXTURE_MEM_MIB};
use snapcheck_core::{Artifact, CoreError, Snapshot, SnapshotBuilder, SnapshotSpec, SnapshotType};
use snapcheck_vm::{LogLevel, Microvm, VmError, VmState};
use tokio_test::{assert_err, assert_ok};

fn spec(h: &Harness) -> SnapshotSpec {
    SnapshotSpec::new(vec![h.fixture.rootfs.clone()], h.fixture.ssh_key.clone())
}

async fn running_vm(h: &Harness, diff: bool, count: u8) -> Microvm {
    let mut vm = h
        .builder
        .build(
            h.fixture
                .build_spec()
                .net_ifaces(ifaces(count))
                .enable_diff_snapshots(diff),
        )
        .await
        .unwrap();
    vm.start().await.unwrap();
    vm
}

#[tokio::test]
async fn test_snapshot_dir_is_idempotent() {
    let h = Harness::new();
    let mut vm = h.builder.build(h.fixture.build_spec()).await.unwrap();
    let snapshots = SnapshotBuilder::new(&mut vm);

    let first = snapshots.create_snapshot_dir().await.unwrap();
    let second = snapshots.create_snapshot_dir().await.unwrap();
    assert_eq!(first, second);
    assert!(first.as_path().is_dir());
    assert!(first.as_path().ends_with("root/snapshot"));
}

#[tokio::test]
async fn test_full_snapshot_roundtrip() {
    let h = Harness::new();
    let mut vm = running_vm(&h, false, 3).await;
    let source = h.launcher.last_monitor();

    let snapshot = SnapshotBuilder::new(&mut vm)
        .create(spec(&h))
        .await
        .unwrap();
    assert_eq!(vm.state(), VmState::Paused);
    assert_eq!(snapshot.snapshot_type(), SnapshotType::Full);
    assert_eq!(snapshot.net_ifaces().to_vec(), ifaces(3));
    assert_eq!(snapshot.disks(), [h.fixture.rootfs.host_path()]);
    assert_eq!(snapshot.machine_config().unwrap().mem_size_mib, FIXTURE_MEM_MIB);
    assert!(snapshot.format_version().is_none());

    let paths = source.paths();
    assert_eq!(&paths[paths.len() - 3..], ["/actions", "/vm", "/snapshot/create"]);
    let create = source.request("/snapshot/create").unwrap().body.unwrap();
    assert_eq!(create["snapshot_type"], "Full");
    assert_eq!(create["snapshot_path"], "/snapshot/vm.vmstate");
    assert_eq!(create["mem_file_path"], "/snapshot/vm.mem");
    assert!(create.get("version").is_none());

    // The snapshot outlives the instance it was taken from
    let ssh_key = snapshot.ssh_key().clone();
    assert!(ssh_key.as_path().ends_with("snapshot/id_rsa"));
    assert_ok!(vm.destroy().await);
    assert!(snapshot.mem_file().as_path().exists());
    assert!(snapshot.state_file().as_path().exists());
    assert!(ssh_key.as_path().exists());

    let (restored, metrics) = h
        .builder
        .build_from_snapshot(&snapshot, true, false)
        .await
        .unwrap();
    assert_eq!(restored.state(), VmState::Resumed);
    assert_eq!(restored.net_ifaces().to_vec(), ifaces(3));
    assert_eq!(restored.device_count(), 4);
    assert_eq!(restored.ssh_config().key_path.as_ref(), Some(&ssh_key));
    assert!(!restored.dirty_page_tracking());
    assert!(metrics.path().as_path().starts_with(restored.jail().chroot_path()));

    let target = h.launcher.last_monitor();
    assert_eq!(target.paths(), ["/metrics", "/snapshot/load"]);
    let load = target.request("/snapshot/load").unwrap().body.unwrap();
    assert_eq!(load["snapshot_path"], "/vm.vmstate");
    assert_eq!(load["mem_file_path"], "/vm.mem");
    assert_eq!(load["resume_vm"], true);
    assert_eq!(load["enable_diff_snapshots"], false);
    assert_eq!(
        target.request("/metrics").unwrap().body.unwrap()["metrics_path"],
        "/metrics.fifo"
    );

    assert_eq!(h.launcher.options()[1].log_level, LogLevel::Info);
    // Three taps for the build, three more for the restore
    assert_eq!(h.network.taps().len(), 6);
}

#[tokio::test]
async fn test_restore_without_resume() {
    let h = Harness::new();
    let mut vm = running_vm(&h, false, 1).await;
    let snapshot = SnapshotBuilder::new(&mut vm)
        .create(spec(&h))
        .await
        .unwrap();

    let (restored, _metrics) = h
        .builder
        .build_from_snapshot(&snapshot, false, false)
        .await
        .unwrap();
    assert_eq!(restored.state(), VmState::Configured);
    assert_eq!(restored.drives()[0].path_on_host, "/rootfs.ext4");
    assert!(restored.drives()[0].is_root_device);
}

#[tokio::test]
async fn test_diff_snapshot_requires_dirty_tracking() {
    let h = Harness::new();
    let mut vm = running_vm(&h, false, 1).await;

    let err = assert_err!(
        SnapshotBuilder::new(&mut vm)
            .create(spec(&h).snapshot_type(SnapshotType::Diff))
            .await
    );
    assert!(matches!(err, CoreError::DiffSnapshotsDisabled { vm_id } if vm_id == vm.id()));

    // Rejected before anything reached the monitor
    assert_eq!(vm.state(), VmState::Running);
    assert_eq!(h.launcher.last_monitor().paths().last().unwrap(), "/actions");
}

#[tokio::test]
async fn test_diff_snapshot_with_dirty_tracking() {
    let h = Harness::new();
    let mut vm = running_vm(&h, true, 1).await;

    let snapshot = SnapshotBuilder::new(&mut vm)
        .create(spec(&h).snapshot_type(SnapshotType::Diff))
        .await
        .unwrap();
    assert_eq!(snapshot.snapshot_type(), SnapshotType::Diff);
    let create = h
        .launcher
        .last_monitor()
        .request("/snapshot/create")
        .unwrap()
        .body
        .unwrap();
    assert_eq!(create["snapshot_type"], "Diff");

    let (restored, _metrics) = h
        .builder
        .build_from_snapshot(&snapshot, true, true)
        .await
        .unwrap();
    assert!(restored.dirty_page_tracking());
    assert!(restored.machine_config().unwrap().track_dirty_pages);
}

#[tokio::test]
async fn test_snapshot_of_paused_instance() {
    let h = Harness::new();
    let mut vm = running_vm(&h, false, 1).await;
    vm.pause().await.unwrap();

    assert_ok!(SnapshotBuilder::new(&mut vm).create(spec(&h)).await);
    let pauses = h
        .launcher
        .last_monitor()
        .paths()
        .into_iter()
        .filter(|p| p == "/vm")
        .count();
    assert_eq!(pauses, 1);
}

#[tokio::test]
async fn test_ramdisk_snapshot_preallocates_memory() {
    let h = Harness::new();
    let mut vm = running_vm(&h, false, 1).await;

    let snapshot = SnapshotBuilder::new(&mut vm)
        .create(
            spec(&h)
                .use_ramdisk(true)
                .mem_file_name("ram.mem")
                .snapshot_name("ram.vmstate"),
        )
        .await
        .unwrap();

    let mem_file = vm.jail().ramfs_path().join("ram.mem");
    assert_eq!(snapshot.mem_file().as_path(), mem_file);
    assert_eq!(
        std::fs::metadata(&mem_file).unwrap().len(),
        u64::from(FIXTURE_MEM_MIB) * 1024 * 1024
    );

    let create = h
        .launcher
        .last_monitor()
        .request("/snapshot/create")
        .unwrap()
        .body
        .unwrap();
    assert_eq!(create["mem_file_path"], "/ramfs/ram.mem");
    assert_eq!(create["snapshot_path"], "/ramfs/ram.vmstate");
}

#[tokio::test]
async fn test_snapshot_requires_disks() {
    let h = Harness::new();
    let mut vm = running_vm(&h, false, 1).await;

    let err = assert_err!(
        SnapshotBuilder::new(&mut vm)
            .create(SnapshotSpec::new(Vec::new(), h.fixture.ssh_key.clone()))
            .await
    );
    assert!(matches!(err, CoreError::NoDisks));
}

#[tokio::test]
async fn test_restore_from_manifest() {
    let h = Harness::new();
    let mut vm = running_vm(&h, false, 2).await;
    let snapshot = SnapshotBuilder::new(&mut vm)
        .create(spec(&h).target_version("0.23.0"))
        .await
        .unwrap();

    let manifest = h.fixture.dir.join("snapshot.json");
    snapshot.save_manifest(&manifest).await.unwrap();
    let loaded = Snapshot::load_manifest(&manifest).await.unwrap();
    assert_eq!(loaded.format_version(), Some("0.23.0"));
    assert_eq!(loaded.net_ifaces(), snapshot.net_ifaces());
    assert_eq!(loaded.created_at(), snapshot.created_at());

    let (restored, _metrics) = h
        .builder
        .build_from_snapshot(&loaded, true, false)
        .await
        .unwrap();
    assert_eq!(restored.net_ifaces().len(), 2);
}

#[tokio::test]
async fn test_failed_restore_releases_everything() {
    let h = Harness::with_launcher(RecordingLauncher::new().rejecting(
        "/snapshot/load",
        400,
        "Cannot deserialize the microVM state",
    ));
    let mut vm = running_vm(&h, false, 2).await;
    let snapshot = SnapshotBuilder::new(&mut vm)
        .create(spec(&h))
        .await
        .unwrap();

    let err = assert_err!(h.builder.build_from_snapshot(&snapshot, true, false).await);
    assert_eq!(err.status(), Some(400));
    assert!(err
        .to_string()
        .contains("Cannot deserialize the microVM state"));

    let roots = h.launcher.roots();
    assert!(!roots[1].exists());
    // The source instance and its snapshot are untouched
    assert!(roots[0].exists());
    assert_eq!(vm.state(), VmState::Paused);
    assert_eq!(h.network.deleted(), ["tap0", "tap1"]);
}

#[tokio::test]
async fn test_restore_refuses_disks_sharing_a_name() {
    let h = Harness::new();
    let mut vm = running_vm(&h, false, 1).await;

    let other_dir = h.fixture.dir.join("other");
    std::fs::create_dir_all(&other_dir).unwrap();
    let other = other_dir.join("rootfs.ext4");
    std::fs::write(&other, b"other rootfs").unwrap();

    let snapshot = SnapshotBuilder::new(&mut vm)
        .create(SnapshotSpec::new(
            vec![h.fixture.rootfs.clone(), Artifact::disk(&other)],
            h.fixture.ssh_key.clone(),
        ))
        .await
        .unwrap();

    let err = assert_err!(h.builder.build_from_snapshot(&snapshot, true, false).await);
    match &err {
        CoreError::Vm(VmError::ResourceAllocation { what, .. }) => {
            assert!(what.contains("other/rootfs.ext4"));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(err.to_string().contains("already holds a different file"));

    // Nothing reached the monitor and the half-built root is gone
    assert!(h.launcher.last_monitor().request("/snapshot/load").is_none());
    assert!(!h.launcher.roots()[1].exists());
}

#[tokio::test]
async fn test_host_network_restore_waits_for_source_taps() {
    let h = Harness::with_launcher(RecordingLauncher::new().host_network());
    let mut vm = running_vm(&h, false, 2).await;
    let snapshot = SnapshotBuilder::new(&mut vm)
        .create(spec(&h))
        .await
        .unwrap();
    assert_eq!(snapshot.net_ifaces(), vm.net_ifaces());
    let source_taps = h.network.live_host_taps();
    assert_eq!(source_taps.len(), 2);

    // The restored state names the source's taps, which are still in use
    let err = assert_err!(h.builder.build_from_snapshot(&snapshot, true, false).await);
    assert!(matches!(
        err,
        CoreError::Vm(VmError::ResourceAllocation { .. })
    ));
    assert!(h.network.deleted().is_empty());
    assert_eq!(h.network.live_host_taps(), source_taps);

    assert_ok!(vm.destroy().await);
    let (restored, _metrics) = assert_ok!(
        h.builder
            .build_from_snapshot(&snapshot, true, false)
            .await
    );
    assert_eq!(restored.net_ifaces(), snapshot.net_ifaces());
    assert_eq!(h.network.live_host_taps(), source_taps);
}
