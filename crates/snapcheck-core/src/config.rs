//! Harness configuration.
//!
//! Configuration is loaded from environment variables with defaults that
//! match a typical CI host.

use crate::compat::{CompatPolicy, UnknownVersion};
use snapcheck_vm::{FirecrackerLauncher, JailerOptions};
use std::path::PathBuf;
use std::time::Duration;

/// Default per-request timeout of the control channel.
pub const DEFAULT_API_TIMEOUT_MS: u64 = 10_000;

/// Default jailer uid/gid.
pub const DEFAULT_JAIL_ID: u32 = 1234;

/// Where the harness finds its binaries and puts instance roots.
#[derive(Debug, Clone, PartialEq)]
pub struct HarnessConfig {
    /// Path to the Firecracker binary.
    pub firecracker_path: PathBuf,

    /// Path to the jailer. Without it the monitor runs unjailed.
    pub jailer_path: Option<PathBuf>,

    /// Directory instance roots are created in.
    pub root_base: PathBuf,

    /// Identity the jailer drops privileges to.
    pub uid: u32,
    pub gid: u32,

    /// Give each jailed instance its own network namespace.
    pub netns: bool,

    /// Per-request timeout of the control channel.
    pub api_timeout: Duration,

    /// How snapshot versions missing from the ceiling table are treated.
    pub unknown_versions: UnknownVersion,

    /// Leave instance roots on disk for inspection.
    pub keep_roots: bool,
}

/// Configuration validation error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("firecracker binary not found: {0}")]
    MissingFirecracker(PathBuf),

    #[error("jailer binary not found: {0}")]
    MissingJailer(PathBuf),

    #[error("root base parent directory not found: {0}")]
    InvalidRootBase(PathBuf),

    #[error("API timeout must be > 0")]
    ZeroTimeout,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            firecracker_path: PathBuf::from("/usr/local/bin/firecracker"),
            jailer_path: None,
            root_base: PathBuf::from("/tmp/snapcheck"),
            uid: DEFAULT_JAIL_ID,
            gid: DEFAULT_JAIL_ID,
            netns: false,
            api_timeout: Duration::from_millis(DEFAULT_API_TIMEOUT_MS),
            unknown_versions: UnknownVersion::Unconstrained,
            keep_roots: false,
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name).ok().map(|v| v != "false" && v != "0")
}

/// `SNAPCHECK_UNKNOWN_VERSIONS` value, falling back to `default` with a warning.
fn unknown_versions(value: &str, default: UnknownVersion) -> UnknownVersion {
    UnknownVersion::parse(value).unwrap_or_else(|| {
        tracing::warn!(
            value,
            fallback = ?default,
            "Unrecognized SNAPCHECK_UNKNOWN_VERSIONS, expected `allow` or `reject`"
        );
        default
    })
}

impl HarnessConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `SNAPCHECK_FIRECRACKER` | `/usr/local/bin/firecracker` |
    /// | `SNAPCHECK_JAILER` | unset (no jailer) |
    /// | `SNAPCHECK_ROOT` | `/tmp/snapcheck` |
    /// | `SNAPCHECK_UID` | `1234` |
    /// | `SNAPCHECK_GID` | `1234` |
    /// | `SNAPCHECK_NETNS` | `false` |
    /// | `SNAPCHECK_API_TIMEOUT_MS` | `10000` |
    /// | `SNAPCHECK_UNKNOWN_VERSIONS` | `allow` (allow, reject) |
    /// | `SNAPCHECK_KEEP_ROOTS` | `false` |
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            firecracker_path: std::env::var("SNAPCHECK_FIRECRACKER")
                .map(PathBuf::from)
                .unwrap_or(default.firecracker_path),
            jailer_path: std::env::var("SNAPCHECK_JAILER")
                .ok()
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            root_base: std::env::var("SNAPCHECK_ROOT")
                .map(PathBuf::from)
                .unwrap_or(default.root_base),
            uid: std::env::var("SNAPCHECK_UID")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.uid),
            gid: std::env::var("SNAPCHECK_GID")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.gid),
            netns: env_flag("SNAPCHECK_NETNS").unwrap_or(default.netns),
            api_timeout: std::env::var("SNAPCHECK_API_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(default.api_timeout),
            unknown_versions: std::env::var("SNAPCHECK_UNKNOWN_VERSIONS")
                .map(|v| unknown_versions(&v, default.unknown_versions))
                .unwrap_or(default.unknown_versions),
            keep_roots: env_flag("SNAPCHECK_KEEP_ROOTS").unwrap_or(default.keep_roots),
        }
    }

    /// Validate that the configured binaries exist.
    ///
    /// Call this at startup to get clear error messages about missing files.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.firecracker_path.exists() {
            return Err(ConfigError::MissingFirecracker(
                self.firecracker_path.clone(),
            ));
        }

        if let Some(jailer) = &self.jailer_path {
            if !jailer.exists() {
                return Err(ConfigError::MissingJailer(jailer.clone()));
            }
        }

        // The root base is created on demand, so just check its parent
        if let Some(parent) = self.root_base.parent() {
            if !parent.exists() {
                return Err(ConfigError::InvalidRootBase(self.root_base.clone()));
            }
        }

        if self.api_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }

        Ok(())
    }

    /// Validate configuration but only log warnings instead of failing.
    ///
    /// Use this for development environments where paths may not exist yet.
    pub fn validate_warn(&self) {
        if !self.firecracker_path.exists() {
            tracing::warn!("Firecracker not found: {:?}", self.firecracker_path);
        }

        if let Some(jailer) = &self.jailer_path {
            if !jailer.exists() {
                tracing::warn!("Jailer not found: {:?}", jailer);
            }
        }
    }

    /// Launcher for the configured binaries.
    pub fn launcher(&self) -> FirecrackerLauncher {
        let launcher =
            FirecrackerLauncher::new(&self.firecracker_path).with_api_timeout(self.api_timeout);
        match &self.jailer_path {
            Some(jailer_path) => launcher.with_jailer(JailerOptions {
                jailer_path: jailer_path.clone(),
                uid: self.uid,
                gid: self.gid,
                netns: self.netns,
            }),
            None => launcher,
        }
    }

    /// Compatibility policy for snapshot creation.
    pub fn policy(&self) -> CompatPolicy {
        CompatPolicy::new(self.unknown_versions)
    }
}
