//! Spawning the monitor process for an instance.

use crate::api::ControlChannel;
use crate::client::{FirecrackerApi, DEFAULT_API_TIMEOUT};
use crate::config::LogLevel;
use crate::error::{Result, VmError};
use crate::jail::{Isolation, Jail};
use async_trait::async_trait;
use std::fs::File;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};

/// Options for one monitor launch.
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    pub log_level: LogLevel,
    /// Mount a tmpfs inside the jail before the monitor starts
    pub use_ramdisk: bool,
}

/// A launched monitor and the channel to drive it.
pub struct MonitorProcess {
    pub api: Arc<dyn ControlChannel>,
    /// `None` when the launcher does not own a host process
    pub child: Option<Child>,
}

/// Starts monitor processes bound to an instance jail.
#[async_trait]
pub trait MonitorLauncher: Send + Sync {
    /// Isolation used for jails this launcher starts monitors in.
    fn isolation(&self) -> Isolation;

    /// Start a monitor inside `jail` and wait until its API socket is ready.
    async fn launch(&self, jail: &Jail, options: &LaunchOptions) -> Result<MonitorProcess>;
}

/// Jailer settings for [`FirecrackerLauncher`].
#[derive(Debug, Clone)]
pub struct JailerOptions {
    pub jailer_path: PathBuf,
    pub uid: u32,
    pub gid: u32,
    pub netns: bool,
}

/// Launches the `firecracker` binary, directly or under the jailer.
#[derive(Debug, Clone)]
pub struct FirecrackerLauncher {
    firecracker_path: PathBuf,
    jailer: Option<JailerOptions>,
    api_timeout: Duration,
    socket_wait: Duration,
}

impl FirecrackerLauncher {
    pub fn new(firecracker_path: impl Into<PathBuf>) -> Self {
        Self {
            firecracker_path: firecracker_path.into(),
            jailer: None,
            api_timeout: DEFAULT_API_TIMEOUT,
            socket_wait: Duration::from_secs(5),
        }
    }

    /// Run the monitor under the jailer.
    pub fn with_jailer(mut self, jailer: JailerOptions) -> Self {
        self.jailer = Some(jailer);
        self
    }

    /// Set the per-request timeout of the control channel.
    pub fn with_api_timeout(mut self, timeout: Duration) -> Self {
        self.api_timeout = timeout;
        self
    }

    /// Set how long to wait for the API socket to appear.
    pub fn with_socket_wait(mut self, wait: Duration) -> Self {
        self.socket_wait = wait;
        self
    }

    /// Make the monitor (and jailer) binaries read+execute only (`0555`).
    pub fn prepare_binaries(&self) -> Result<()> {
        let mut binaries = vec![self.firecracker_path.as_path()];
        if let Some(jailer) = &self.jailer {
            binaries.push(jailer.jailer_path.as_path());
        }
        for binary in binaries {
            std::fs::set_permissions(binary, std::fs::Permissions::from_mode(0o555))
                .map_err(|e| VmError::Config(format!("chmod {}: {e}", binary.display())))?;
        }
        Ok(())
    }

    fn command(&self, jail: &Jail, options: &LaunchOptions) -> Command {
        let level = options.log_level.to_string();
        match &self.jailer {
            None => {
                let mut cmd = Command::new(&self.firecracker_path);
                cmd.arg("--api-sock")
                    .arg(jail.api_socket_path())
                    .arg("--level")
                    .arg(level);
                cmd
            }
            Some(jailer) => {
                let mut cmd = Command::new(&jailer.jailer_path);
                cmd.arg("--id")
                    .arg(jail.id().to_string())
                    .arg("--exec-file")
                    .arg(&self.firecracker_path)
                    .arg("--uid")
                    .arg(jailer.uid.to_string())
                    .arg("--gid")
                    .arg(jailer.gid.to_string())
                    .arg("--chroot-base-dir")
                    .arg(jail.root().path());
                if let Some(ns) = jail.netns() {
                    cmd.arg("--netns").arg(format!("/var/run/netns/{ns}"));
                }
                cmd.arg("--")
                    .arg("--api-sock")
                    .arg("/run/firecracker.socket")
                    .arg("--level")
                    .arg(level);
                cmd
            }
        }
    }
}

#[async_trait]
impl MonitorLauncher for FirecrackerLauncher {
    fn isolation(&self) -> Isolation {
        match &self.jailer {
            None => Isolation::Direct,
            Some(jailer) => Isolation::Jailer {
                exec_name: self
                    .firecracker_path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "firecracker".into()),
                uid: jailer.uid,
                gid: jailer.gid,
                netns: jailer.netns,
            },
        }
    }

    async fn launch(&self, jail: &Jail, options: &LaunchOptions) -> Result<MonitorProcess> {
        let start = std::time::Instant::now();
        let socket_path = jail.api_socket_path();

        if options.use_ramdisk {
            jail.mount_ramfs()?;
        }

        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| VmError::allocation(format!("socket dir {}", parent.display()), e))?;
            jail.chown(parent)?;
        }
        if socket_path.exists() {
            tokio::fs::remove_file(&socket_path).await?;
        }

        // Serial console and monitor logs end up next to the jail
        let log_path = jail.root().path().join("monitor.log");
        let log = File::create(&log_path)
            .map_err(|e| VmError::allocation(format!("log file {}", log_path.display()), e))?;
        let log_err = log.try_clone()?;

        tracing::info!(
            vm_id = %jail.id(),
            jailed = self.jailer.is_some(),
            log = %log_path.display(),
            "Spawning monitor"
        );

        let mut child = self
            .command(jail, options)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| VmError::Spawn(format!("{}: {e}", self.firecracker_path.display())))?;

        wait_for_socket(&socket_path, &mut child, self.socket_wait).await?;

        tracing::debug!(
            vm_id = %jail.id(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Monitor API socket ready"
        );

        let api = FirecrackerApi::new(socket_path).with_timeout(self.api_timeout);
        Ok(MonitorProcess {
            api: Arc::new(api),
            child: Some(child),
        })
    }
}

async fn wait_for_socket(socket: &Path, child: &mut Child, wait: Duration) -> Result<()> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        if socket.exists() {
            return Ok(());
        }
        if let Some(status) = child.try_wait()? {
            return Err(VmError::Spawn(format!(
                "monitor exited with {status} before creating {}",
                socket.display()
            )));
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(VmError::Timeout(wait));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
