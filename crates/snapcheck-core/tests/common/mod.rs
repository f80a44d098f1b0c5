//! In-process stand-ins for the monitor, its launcher and the host network.
//!
//! The scripted monitor answers every request with 204 unless told
//! otherwise, writes placeholder snapshot files where a real monitor would,
//! and enforces its own device ceilings on `PUT /snapshot/create`.

#![allow(dead_code)]

use async_trait::async_trait;
use snapcheck_core::{Artifact, BuildSpec, MicrovmBuilder};
use snapcheck_vm::{
    ApiMethod, ApiRequest, ApiResponse, ControlChannel, Isolation, Jail, LaunchOptions,
    MonitorLauncher, MonitorProcess, NetIfaceConfig, SnapshotCreate, SnapshotLoad,
    TapProvisioner, VmError,
};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// A canned failure for requests whose path starts with `path_prefix`.
#[derive(Debug, Clone)]
pub struct Rejection {
    pub path_prefix: String,
    pub status: u16,
    pub body: String,
}

pub struct ScriptedMonitor {
    chroot: PathBuf,
    chrooted: bool,
    rejection: Option<Rejection>,
    ceilings: HashMap<String, usize>,
    devices: Mutex<BTreeSet<String>>,
    requests: Mutex<Vec<ApiRequest>>,
}

impl ScriptedMonitor {
    pub fn requests(&self) -> Vec<ApiRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn paths(&self) -> Vec<String> {
        self.requests().into_iter().map(|r| r.path).collect()
    }

    /// First request sent to `path`.
    pub fn request(&self, path: &str) -> Option<ApiRequest> {
        self.requests().into_iter().find(|r| r.path == path)
    }

    fn host(&self, jailed: &str) -> PathBuf {
        if self.chrooted {
            self.chroot.join(jailed.trim_start_matches('/'))
        } else {
            PathBuf::from(jailed)
        }
    }

    fn bad_request(message: String) -> ApiResponse {
        ApiResponse {
            status: 400,
            body: serde_json::json!({ "fault_message": message }).to_string(),
        }
    }

    fn snapshot_create(&self, params: SnapshotCreate) -> ApiResponse {
        let devices = self.devices.lock().unwrap().len();
        if let Some(ceiling) = params.version.as_ref().and_then(|v| self.ceilings.get(v)) {
            if devices > *ceiling {
                return Self::bad_request(format!(
                    "Too many devices attached: {devices}. The maximum number allowed for the \
                     snapshot data version requested is {ceiling}."
                ));
            }
        }

        // Append so preallocated memory files keep their size
        for path in [&params.mem_file_path, &params.snapshot_path] {
            let host = self.host(path);
            if let Err(e) = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&host)
            {
                return Self::bad_request(format!("cannot create {}: {e}", host.display()));
            }
        }
        ApiResponse::no_content()
    }

    fn snapshot_load(&self, params: SnapshotLoad) -> ApiResponse {
        for path in [&params.mem_file_path, &params.snapshot_path] {
            if !self.host(path).exists() {
                return Self::bad_request(format!("cannot open {path}"));
            }
        }
        ApiResponse::no_content()
    }
}

#[async_trait]
impl ControlChannel for ScriptedMonitor {
    async fn send(&self, request: ApiRequest) -> snapcheck_vm::Result<ApiResponse> {
        self.requests.lock().unwrap().push(request.clone());

        if let Some(rejection) = &self.rejection {
            if request.path.starts_with(&rejection.path_prefix) {
                return Ok(ApiResponse {
                    status: rejection.status,
                    body: rejection.body.clone(),
                });
            }
        }

        let body = request.body.clone().unwrap_or_default();
        let response = match (request.method, request.path.as_str()) {
            (ApiMethod::Put, "/snapshot/create") => {
                self.snapshot_create(serde_json::from_value(body)?)
            }
            (ApiMethod::Put, "/snapshot/load") => self.snapshot_load(serde_json::from_value(body)?),
            (ApiMethod::Put, path)
                if path.starts_with("/drives/") || path.starts_with("/network-interfaces/") =>
            {
                self.devices.lock().unwrap().insert(path.to_string());
                ApiResponse::no_content()
            }
            _ => ApiResponse::no_content(),
        };
        Ok(response)
    }
}

/// Launcher that hands out scripted monitors instead of processes.
pub struct RecordingLauncher {
    isolation: Isolation,
    rejection: Option<Rejection>,
    ceilings: HashMap<String, usize>,
    monitors: Mutex<Vec<Arc<ScriptedMonitor>>>,
    roots: Mutex<Vec<PathBuf>>,
    options: Mutex<Vec<LaunchOptions>>,
}

impl RecordingLauncher {
    pub fn new() -> Self {
        Self {
            isolation: Isolation::Jailer {
                exec_name: "firecracker".into(),
                uid: nix::unistd::getuid().as_raw(),
                gid: nix::unistd::getgid().as_raw(),
                netns: true,
            },
            rejection: None,
            ceilings: HashMap::new(),
            monitors: Mutex::new(Vec::new()),
            roots: Mutex::new(Vec::new()),
            options: Mutex::new(Vec::new()),
        }
    }

    /// Run instances in the host network namespace.
    pub fn host_network(mut self) -> Self {
        if let Isolation::Jailer { netns, .. } = &mut self.isolation {
            *netns = false;
        }
        self
    }

    pub fn rejecting(mut self, path_prefix: &str, status: u16, body: &str) -> Self {
        self.rejection = Some(Rejection {
            path_prefix: path_prefix.into(),
            status,
            body: body.into(),
        });
        self
    }

    /// Make monitors refuse snapshots for `version` above `ceiling` devices.
    pub fn with_ceiling(mut self, version: &str, ceiling: usize) -> Self {
        self.ceilings.insert(version.into(), ceiling);
        self
    }

    pub fn monitor(&self, index: usize) -> Arc<ScriptedMonitor> {
        Arc::clone(&self.monitors.lock().unwrap()[index])
    }

    pub fn last_monitor(&self) -> Arc<ScriptedMonitor> {
        let monitors = self.monitors.lock().unwrap();
        Arc::clone(monitors.last().expect("no monitor launched"))
    }

    pub fn roots(&self) -> Vec<PathBuf> {
        self.roots.lock().unwrap().clone()
    }

    pub fn options(&self) -> Vec<LaunchOptions> {
        self.options.lock().unwrap().clone()
    }
}

#[async_trait]
impl MonitorLauncher for RecordingLauncher {
    fn isolation(&self) -> Isolation {
        self.isolation.clone()
    }

    async fn launch(
        &self,
        jail: &Jail,
        options: &LaunchOptions,
    ) -> snapcheck_vm::Result<MonitorProcess> {
        let monitor = Arc::new(ScriptedMonitor {
            chroot: jail.chroot_path().to_path_buf(),
            chrooted: jail.is_chrooted(),
            rejection: self.rejection.clone(),
            ceilings: self.ceilings.clone(),
            devices: Mutex::new(BTreeSet::new()),
            requests: Mutex::new(Vec::new()),
        });
        self.monitors.lock().unwrap().push(Arc::clone(&monitor));
        self.roots
            .lock()
            .unwrap()
            .push(jail.root().path().to_path_buf());
        self.options.lock().unwrap().push(options.clone());

        Ok(MonitorProcess {
            api: monitor,
            child: None,
        })
    }
}

/// Tap provisioner that only keeps books.
///
/// Like the kernel, it refuses a tap name that is already live in the same
/// namespace.
#[derive(Default)]
pub struct RecordingNetwork {
    live: Mutex<HashSet<(Option<String>, String)>>,
    taps: Mutex<Vec<(Option<String>, NetIfaceConfig)>>,
    deleted: Mutex<Vec<String>>,
    netns: Mutex<Vec<String>>,
    deleted_netns: Mutex<Vec<String>>,
}

impl RecordingNetwork {
    pub fn taps(&self) -> Vec<(Option<String>, NetIfaceConfig)> {
        self.taps.lock().unwrap().clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    pub fn netns(&self) -> Vec<String> {
        self.netns.lock().unwrap().clone()
    }

    pub fn deleted_netns(&self) -> Vec<String> {
        self.deleted_netns.lock().unwrap().clone()
    }

    /// Tap names currently present in the host namespace.
    pub fn live_host_taps(&self) -> Vec<String> {
        let mut taps: Vec<_> = self
            .live
            .lock()
            .unwrap()
            .iter()
            .filter(|(netns, _)| netns.is_none())
            .map(|(_, tap)| tap.clone())
            .collect();
        taps.sort();
        taps
    }
}

#[async_trait]
impl TapProvisioner for RecordingNetwork {
    async fn create_netns(&self, name: &str) -> snapcheck_vm::Result<()> {
        self.netns.lock().unwrap().push(name.into());
        Ok(())
    }

    async fn delete_netns(&self, name: &str) -> snapcheck_vm::Result<()> {
        self.live
            .lock()
            .unwrap()
            .retain(|(netns, _)| netns.as_deref() != Some(name));
        self.deleted_netns.lock().unwrap().push(name.into());
        Ok(())
    }

    async fn create_tap(
        &self,
        netns: Option<&str>,
        iface: &NetIfaceConfig,
    ) -> snapcheck_vm::Result<()> {
        let key = (netns.map(str::to_string), iface.tap_name.clone());
        if !self.live.lock().unwrap().insert(key) {
            return Err(VmError::allocation(
                format!("tap {}", iface.tap_name),
                std::io::Error::new(std::io::ErrorKind::AlreadyExists, "Device or resource busy"),
            ));
        }
        self.taps
            .lock()
            .unwrap()
            .push((netns.map(str::to_string), iface.clone()));
        Ok(())
    }

    async fn delete_tap(&self, netns: Option<&str>, tap_name: &str) -> snapcheck_vm::Result<()> {
        self.live
            .lock()
            .unwrap()
            .remove(&(netns.map(str::to_string), tap_name.to_string()));
        self.deleted.lock().unwrap().push(tap_name.into());
        Ok(())
    }
}

/// Kernel, disk, key and machine config in a scratch directory.
pub struct Fixture {
    pub dir: PathBuf,
    pub kernel: Artifact,
    pub rootfs: Artifact,
    pub ssh_key: Artifact,
    pub config: Artifact,
}

/// Memory size of the fixture machine config; small enough to preallocate.
pub const FIXTURE_MEM_MIB: u32 = 2;

impl Fixture {
    pub fn new() -> Self {
        let dir = std::env::temp_dir()
            .join("snapcheck-core-tests")
            .join(uuid::Uuid::new_v4().simple().to_string());
        std::fs::create_dir_all(&dir).unwrap();

        let write = |name: &str, contents: &[u8]| -> PathBuf {
            let path = dir.join(name);
            std::fs::write(&path, contents).unwrap();
            path
        };

        let kernel = Artifact::kernel(write("vmlinux.bin", b"kernel"));
        let rootfs = Artifact::disk(write("rootfs.ext4", b"rootfs"));
        let ssh_key = Artifact::ssh_key(write("id_rsa", b"-----BEGIN KEY-----"));
        let config = Artifact::machine_config(write(
            "1vcpu_2mb.json",
            format!(
                r#"{{"vcpu_count": 1, "mem_size_mib": {FIXTURE_MEM_MIB}, "ht_enabled": false}}"#
            )
            .as_bytes(),
        ));

        Self {
            dir,
            kernel,
            rootfs,
            ssh_key,
            config,
        }
    }

    pub fn build_spec(&self) -> BuildSpec {
        BuildSpec::new(
            self.kernel.clone(),
            vec![self.rootfs.clone()],
            self.ssh_key.clone(),
            self.config.clone(),
        )
    }

    /// Directory instance roots go in.
    pub fn root_base(&self) -> PathBuf {
        self.dir.join("roots")
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

pub struct Harness {
    pub builder: MicrovmBuilder,
    pub launcher: Arc<RecordingLauncher>,
    pub network: Arc<RecordingNetwork>,
    pub fixture: Fixture,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_launcher(RecordingLauncher::new())
    }

    pub fn with_launcher(launcher: RecordingLauncher) -> Self {
        let fixture = Fixture::new();
        let launcher = Arc::new(launcher);
        let network = Arc::new(RecordingNetwork::default());
        let builder = MicrovmBuilder::new(fixture.root_base(), launcher.clone(), network.clone());
        Self {
            builder,
            launcher,
            network,
            fixture,
        }
    }
}

/// `count` distinct interfaces `eth0..eth{count-1}`.
pub fn ifaces(count: u8) -> Vec<NetIfaceConfig> {
    (0..count).map(NetIfaceConfig::with_id).collect()
}
