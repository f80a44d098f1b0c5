//! Per-instance roots and the jailed view of host artifacts.
//!
//! Every instance gets its own [`InstanceRoot`]. When the monitor runs under
//! the jailer it is chrooted into a directory below that root, and files have
//! to be linked or copied in before the monitor can open them. [`HostPath`]
//! and [`JailedPath`] keep the two namespaces apart.

use crate::error::{Result, VmError};
use nix::mount::{MntFlags, MsFlags};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Prefix of every instance root directory.
pub const ROOT_PREFIX: &str = "fctest-";

/// Name of the RAM-backed directory inside the chroot.
pub const RAMFS_DIR: &str = "ramfs";

/// A path in the host's global filesystem namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostPath(PathBuf);

impl HostPath {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    pub fn file_name(&self) -> Result<&std::ffi::OsStr> {
        self.0
            .file_name()
            .ok_or_else(|| VmError::Config(format!("{} has no file name", self.0.display())))
    }
}

impl AsRef<Path> for HostPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for HostPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// A path as the monitor sees it from inside its jail.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JailedPath(String);

impl JailedPath {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JailedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

struct RootDir {
    path: PathBuf,
    ramfs: Mutex<Option<PathBuf>>,
    keep: AtomicBool,
}

impl Drop for RootDir {
    fn drop(&mut self) {
        if let Ok(mut ramfs) = self.ramfs.lock() {
            if let Some(mount) = ramfs.take() {
                if let Err(e) = nix::mount::umount2(&mount, MntFlags::MNT_DETACH) {
                    tracing::warn!(path = %mount.display(), error = %e, "Failed to unmount ramfs");
                }
            }
        }

        if self.keep.load(Ordering::Relaxed) {
            tracing::debug!(path = %self.path.display(), "Keeping instance root");
            return;
        }

        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => tracing::debug!(path = %self.path.display(), "Removed instance root"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove instance root")
            }
        }
    }
}

/// A uniquely named directory owned by one instance.
///
/// Clones share the directory; it is removed when the last clone is dropped.
/// Snapshots hold a clone so their files outlive the instance handle.
#[derive(Clone)]
pub struct InstanceRoot(Arc<RootDir>);

impl InstanceRoot {
    /// Create a fresh `fctest-<uuid>` directory below `base`.
    pub fn allocate(base: &Path) -> Result<Self> {
        std::fs::create_dir_all(base)
            .map_err(|e| VmError::allocation(format!("root base {}", base.display()), e))?;

        let path = base.join(format!("{ROOT_PREFIX}{}", Uuid::new_v4().simple()));
        std::fs::create_dir(&path)
            .map_err(|e| VmError::allocation(format!("instance root {}", path.display()), e))?;

        tracing::debug!(path = %path.display(), "Allocated instance root");
        Ok(Self(Arc::new(RootDir {
            path,
            ramfs: Mutex::new(None),
            keep: AtomicBool::new(false),
        })))
    }

    pub fn path(&self) -> &Path {
        &self.0.path
    }

    /// Leave the directory on disk when the last handle goes away.
    pub fn persist(&self) {
        self.0.keep.store(true, Ordering::Relaxed);
    }

    fn register_ramfs(&self, mount: PathBuf) {
        if let Ok(mut ramfs) = self.0.ramfs.lock() {
            *ramfs = Some(mount);
        }
    }
}

impl fmt::Debug for InstanceRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("InstanceRoot").field(&self.0.path).finish()
    }
}

/// How the monitor is isolated from the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Isolation {
    /// The monitor runs directly and resolves host paths.
    Direct,
    /// The monitor runs under the jailer: chrooted, privileges dropped.
    Jailer {
        /// File name of the monitor binary; the jailer uses it in the chroot path
        exec_name: String,
        uid: u32,
        gid: u32,
        /// Run in a network namespace named after the instance
        netns: bool,
    },
}

/// The isolated filesystem view of one instance.
#[derive(Debug, Clone)]
pub struct Jail {
    id: Uuid,
    root: InstanceRoot,
    chroot: PathBuf,
    uid: u32,
    gid: u32,
    chrooted: bool,
    netns: Option<String>,
}

impl Jail {
    /// Lay out the jail for instance `id` inside `root`.
    pub fn new(id: Uuid, root: InstanceRoot, isolation: &Isolation) -> Result<Self> {
        let (chroot, uid, gid, chrooted, netns) = match isolation {
            Isolation::Direct => (
                root.path().to_path_buf(),
                nix::unistd::getuid().as_raw(),
                nix::unistd::getgid().as_raw(),
                false,
                None,
            ),
            Isolation::Jailer {
                exec_name,
                uid,
                gid,
                netns,
            } => (
                root.path()
                    .join(exec_name)
                    .join(id.to_string())
                    .join("root"),
                *uid,
                *gid,
                true,
                netns.then(|| format!("fc-{}", id.simple())),
            ),
        };

        std::fs::create_dir_all(&chroot)
            .map_err(|e| VmError::allocation(format!("chroot {}", chroot.display()), e))?;

        let jail = Self {
            id,
            root,
            chroot,
            uid,
            gid,
            chrooted,
            netns,
        };
        jail.chown(&jail.chroot)?;
        Ok(jail)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn root(&self) -> &InstanceRoot {
        &self.root
    }

    /// Directory the monitor sees as `/` (the instance root when not chrooted).
    pub fn chroot_path(&self) -> &Path {
        &self.chroot
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn gid(&self) -> u32 {
        self.gid
    }

    pub fn is_chrooted(&self) -> bool {
        self.chrooted
    }

    /// Network namespace the instance's taps live in, if any.
    pub fn netns(&self) -> Option<&str> {
        self.netns.as_deref()
    }

    /// Host location of the monitor's API socket.
    pub fn api_socket_path(&self) -> PathBuf {
        if self.chrooted {
            self.chroot.join("run").join("firecracker.socket")
        } else {
            self.chroot.join("firecracker.socket")
        }
    }

    /// Host location of the RAM-backed area.
    pub fn ramfs_path(&self) -> PathBuf {
        self.chroot.join(RAMFS_DIR)
    }

    /// Translate a host path below the chroot into the monitor's view.
    pub fn jailed_path(&self, host: &Path) -> Result<JailedPath> {
        if !self.chrooted {
            return Ok(JailedPath(host.to_string_lossy().into_owned()));
        }
        let relative = host.strip_prefix(&self.chroot).map_err(|_| {
            VmError::Config(format!(
                "{} is outside the jail {}",
                host.display(),
                self.chroot.display()
            ))
        })?;
        Ok(JailedPath(format!("/{}", relative.to_string_lossy())))
    }

    /// Translate a jailed path back to the host.
    pub fn host_path(&self, jailed: &JailedPath) -> HostPath {
        if !self.chrooted {
            return HostPath::new(jailed.as_str());
        }
        HostPath::new(self.chroot.join(jailed.as_str().trim_start_matches('/')))
    }

    /// Hard-link a host file into the jail (copying across filesystems).
    ///
    /// Linking the same file twice is a no-op. A different file that would
    /// land on an occupied jailed path is refused.
    pub async fn create_jailed_resource(&self, host: &HostPath) -> Result<JailedPath> {
        let dest = self.chroot.join(host.file_name()?);

        match tokio::fs::metadata(&dest).await {
            Ok(existing) => {
                let source = tokio::fs::metadata(host)
                    .await
                    .map_err(|e| VmError::allocation(format!("jailed link of {host}"), e))?;
                if (existing.dev(), existing.ino()) != (source.dev(), source.ino()) {
                    return Err(VmError::allocation(
                        format!("jailed link of {host}"),
                        std::io::Error::new(
                            std::io::ErrorKind::AlreadyExists,
                            format!("{} already holds a different file", dest.display()),
                        ),
                    ));
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                match tokio::fs::hard_link(host, &dest).await {
                    Ok(()) => {}
                    Err(e) if e.raw_os_error() == Some(nix::errno::Errno::EXDEV as i32) => {
                        tracing::debug!(src = %host, "Cross-device link, copying into jail");
                        tokio::fs::copy(host, &dest).await.map_err(|e| {
                            VmError::allocation(format!("jailed copy of {host}"), e)
                        })?;
                    }
                    Err(e) => {
                        return Err(VmError::allocation(format!("jailed link of {host}"), e))
                    }
                }
            }
            Err(e) => return Err(VmError::allocation(format!("jailed link of {host}"), e)),
        }

        self.chown(&dest)?;
        let jailed = self.jailed_path(&dest)?;
        tracing::trace!(vm_id = %self.id, src = %host, jailed = %jailed, "Jailed resource");
        Ok(jailed)
    }

    /// Copy a host file into the RAM-backed area of the jail.
    pub async fn copy_to_jail_ramfs(&self, host: &HostPath) -> Result<JailedPath> {
        let ramfs = self.ramfs_path();
        tokio::fs::create_dir_all(&ramfs)
            .await
            .map_err(|e| VmError::allocation(format!("ramfs dir {}", ramfs.display()), e))?;

        let dest = ramfs.join(host.file_name()?);
        tokio::fs::copy(host, &dest)
            .await
            .map_err(|e| VmError::allocation(format!("ramfs copy of {host}"), e))?;

        self.chown(&dest)?;
        self.jailed_path(&dest)
    }

    /// Create (if needed) a directory below the chroot owned by the jail user.
    pub async fn create_dir(&self, relative: &str) -> Result<HostPath> {
        let dir = self.chroot.join(relative);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| VmError::allocation(format!("directory {}", dir.display()), e))?;
        self.chown(&dir)?;
        Ok(HostPath::new(dir))
    }

    /// Mount a tmpfs at [`Jail::ramfs_path`]; unmounted when the root goes away.
    pub fn mount_ramfs(&self) -> Result<()> {
        let ramfs = self.ramfs_path();
        std::fs::create_dir_all(&ramfs)
            .map_err(|e| VmError::allocation(format!("ramfs dir {}", ramfs.display()), e))?;

        nix::mount::mount(
            Some("tmpfs"),
            &ramfs,
            Some("tmpfs"),
            MsFlags::empty(),
            None::<&str>,
        )
        .map_err(|e| VmError::allocation(format!("tmpfs at {}", ramfs.display()), e.into()))?;

        self.root.register_ramfs(ramfs.clone());
        self.chown(&ramfs)?;
        tracing::debug!(vm_id = %self.id, path = %ramfs.display(), "Mounted ramfs");
        Ok(())
    }

    /// Hand ownership of `path` to the jail's execution identity.
    pub fn chown(&self, path: &Path) -> Result<()> {
        std::os::unix::fs::chown(path, Some(self.uid), Some(self.gid))
            .map_err(|e| VmError::allocation(format!("ownership of {}", path.display()), e))
    }
}
