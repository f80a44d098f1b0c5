//! Host-side network interfaces for test instances.

use crate::error::{Result, VmError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use tokio::process::Command;
use uuid::Uuid;

/// Longest interface name the kernel accepts (`IFNAMSIZ` minus the NUL).
pub const MAX_TAP_NAME_LEN: usize = 15;

/// Hex digits of the instance id appended to taps in the host namespace.
const TAP_SUFFIX_LEN: usize = 8;

/// One guest network interface and the tap device backing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetIfaceConfig {
    pub host_ip: Ipv4Addr,
    pub guest_ip: Ipv4Addr,
    pub netmask_len: u8,
    pub tap_name: String,
    pub dev_name: String,
}

impl Default for NetIfaceConfig {
    fn default() -> Self {
        Self::with_id(0)
    }
}

impl NetIfaceConfig {
    /// Interface `i`: `192.168.i.1` on the host, `192.168.i.2` in the guest.
    pub fn with_id(i: u8) -> Self {
        Self {
            host_ip: Ipv4Addr::new(192, 168, i, 1),
            guest_ip: Ipv4Addr::new(192, 168, i, 2),
            netmask_len: 30,
            tap_name: format!("tap{i}"),
            dev_name: format!("eth{i}"),
        }
    }

    /// MAC address the guest uses on this interface.
    pub fn guest_mac(&self) -> String {
        mac_from_ip(self.guest_ip)
    }

    /// The same interface with its tap renamed to `<tap>-<id prefix>`.
    ///
    /// Instances sharing the host namespace need distinct tap names; the
    /// guest side (addresses, MAC, device name) is unchanged.
    pub fn scoped_to(&self, id: Uuid) -> Result<Self> {
        let max_base = MAX_TAP_NAME_LEN - TAP_SUFFIX_LEN - 1;
        if self.tap_name.len() > max_base {
            return Err(VmError::Config(format!(
                "tap name {} is too long to scope to an instance (max {max_base} chars)",
                self.tap_name
            )));
        }
        let suffix = &id.simple().to_string()[..TAP_SUFFIX_LEN];
        Ok(Self {
            tap_name: format!("{}-{suffix}", self.tap_name),
            ..self.clone()
        })
    }
}

/// Derive a locally administered MAC from an IPv4 address.
///
/// `192.168.0.2` becomes `06:00:c0:a8:00:02`.
pub fn mac_from_ip(ip: Ipv4Addr) -> String {
    let [a, b, c, d] = ip.octets();
    format!("06:00:{a:02x}:{b:02x}:{c:02x}:{d:02x}")
}

/// Interfaces to configure: the requested ones, or a single default.
pub fn resolve_ifaces(requested: Option<&[NetIfaceConfig]>) -> Vec<NetIfaceConfig> {
    match requested {
        Some(ifaces) if !ifaces.is_empty() => ifaces.to_vec(),
        _ => vec![NetIfaceConfig::default()],
    }
}

/// Reject interface sets that would collide inside one instance.
pub fn validate_ifaces(ifaces: &[NetIfaceConfig]) -> Result<()> {
    let mut macs = HashSet::new();
    let mut taps = HashSet::new();
    let mut devs = HashSet::new();

    for iface in ifaces {
        if !macs.insert(iface.guest_mac()) {
            return Err(VmError::Config(format!(
                "duplicate guest address {} (mac {})",
                iface.guest_ip,
                iface.guest_mac()
            )));
        }
        if iface.tap_name.is_empty() || iface.tap_name.len() > MAX_TAP_NAME_LEN {
            return Err(VmError::Config(format!(
                "tap name {:?} must be 1 to {MAX_TAP_NAME_LEN} chars",
                iface.tap_name
            )));
        }
        if !taps.insert(iface.tap_name.as_str()) {
            return Err(VmError::Config(format!(
                "duplicate tap name: {}",
                iface.tap_name
            )));
        }
        if !devs.insert(iface.dev_name.as_str()) {
            return Err(VmError::Config(format!(
                "duplicate device name: {}",
                iface.dev_name
            )));
        }
        if iface.netmask_len > 32 {
            return Err(VmError::Config(format!(
                "netmask_len must be <= 32, got {}",
                iface.netmask_len
            )));
        }
    }
    Ok(())
}

/// Creates and removes host network resources for instances.
#[async_trait]
pub trait TapProvisioner: Send + Sync {
    /// Create a network namespace (no-op if it exists).
    async fn create_netns(&self, name: &str) -> Result<()>;

    /// Remove a network namespace and everything in it.
    async fn delete_netns(&self, name: &str) -> Result<()>;

    /// Create `iface.tap_name`, give it `host_ip/netmask_len` and bring it up.
    async fn create_tap(&self, netns: Option<&str>, iface: &NetIfaceConfig) -> Result<()>;

    /// Delete a tap device. Missing devices are not an error.
    async fn delete_tap(&self, netns: Option<&str>, tap_name: &str) -> Result<()>;
}

/// [`TapProvisioner`] driving iproute2 (`ip`).
#[derive(Debug, Clone)]
pub struct IpTapProvisioner {
    ip_binary: String,
}

impl Default for IpTapProvisioner {
    fn default() -> Self {
        Self {
            ip_binary: "ip".into(),
        }
    }
}

impl IpTapProvisioner {
    pub fn new(ip_binary: impl Into<String>) -> Self {
        Self {
            ip_binary: ip_binary.into(),
        }
    }

    async fn run(&self, netns: Option<&str>, args: &[&str]) -> Result<()> {
        let mut cmd = Command::new(&self.ip_binary);
        if let Some(ns) = netns {
            cmd.arg("-n").arg(ns);
        }
        cmd.args(args);

        tracing::trace!(netns = ?netns, args = ?args, "Running ip");
        let output = cmd
            .output()
            .await
            .map_err(|e| VmError::allocation(format!("`ip {}`", args.join(" ")), e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VmError::allocation(
                format!("`ip {}`", args.join(" ")),
                std::io::Error::other(stderr.trim().to_string()),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl TapProvisioner for IpTapProvisioner {
    async fn create_netns(&self, name: &str) -> Result<()> {
        if tokio::fs::try_exists(format!("/var/run/netns/{name}"))
            .await
            .unwrap_or(false)
        {
            return Ok(());
        }
        self.run(None, &["netns", "add", name]).await?;
        tracing::debug!(netns = name, "Created network namespace");
        Ok(())
    }

    async fn delete_netns(&self, name: &str) -> Result<()> {
        self.run(None, &["netns", "del", name]).await?;
        tracing::debug!(netns = name, "Deleted network namespace");
        Ok(())
    }

    async fn create_tap(&self, netns: Option<&str>, iface: &NetIfaceConfig) -> Result<()> {
        let tap = iface.tap_name.as_str();
        let addr = format!("{}/{}", iface.host_ip, iface.netmask_len);

        self.run(netns, &["tuntap", "add", "mode", "tap", "name", tap])
            .await?;
        self.run(netns, &["addr", "add", &addr, "dev", tap]).await?;
        self.run(netns, &["link", "set", tap, "up"]).await?;

        tracing::debug!(netns = ?netns, tap, host_ip = %addr, "Tap device ready");
        Ok(())
    }

    async fn delete_tap(&self, netns: Option<&str>, tap_name: &str) -> Result<()> {
        match self.run(netns, &["link", "del", tap_name]).await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::debug!(tap = tap_name, error = %e, "Tap already gone");
                Ok(())
            }
        }
    }
}
