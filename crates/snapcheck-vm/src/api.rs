//! Requests understood by the monitor's control socket.
//!
//! Every configuration step is a single JSON request answered by
//! `204 No Content` on success. Anything else is a failure and the response
//! body carries the monitor's own explanation.

use crate::config::MachineConfig;
use crate::error::{Result, VmError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// HTTP status the monitor uses to acknowledge a successful request.
pub const STATUS_NO_CONTENT: u16 = 204;

/// HTTP method of a control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiMethod {
    Get,
    Put,
    Patch,
}

impl fmt::Display for ApiMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiMethod::Get => write!(f, "GET"),
            ApiMethod::Put => write!(f, "PUT"),
            ApiMethod::Patch => write!(f, "PATCH"),
        }
    }
}

/// A single request on the control channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: ApiMethod,
    pub path: String,
    pub body: Option<serde_json::Value>,
}

impl ApiRequest {
    fn put<T: Serialize>(path: impl Into<String>, body: &T) -> Result<Self> {
        Ok(Self {
            method: ApiMethod::Put,
            path: path.into(),
            body: Some(serde_json::to_value(body)?),
        })
    }

    /// `PUT /network-interfaces/{iface_id}`
    pub fn network_interface(iface: &NetworkInterface) -> Result<Self> {
        Self::put(format!("/network-interfaces/{}", iface.iface_id), iface)
    }

    /// `PUT /drives/{drive_id}`
    pub fn drive(drive: &Drive) -> Result<Self> {
        Self::put(format!("/drives/{}", drive.drive_id), drive)
    }

    /// `PUT /machine-config`
    pub fn machine_config(config: &MachineConfig) -> Result<Self> {
        Self::put("/machine-config", config)
    }

    /// `PUT /boot-source`
    pub fn boot_source(boot: &BootSource) -> Result<Self> {
        Self::put("/boot-source", boot)
    }

    /// `PUT /metrics`
    pub fn metrics(metrics: &Metrics) -> Result<Self> {
        Self::put("/metrics", metrics)
    }

    /// `PUT /actions` with `InstanceStart`
    pub fn instance_start() -> Result<Self> {
        Self::put(
            "/actions",
            &Action {
                action_type: "InstanceStart".into(),
            },
        )
    }

    /// `PATCH /vm`
    pub fn vm_state(state: VmStateChange) -> Result<Self> {
        Ok(Self {
            method: ApiMethod::Patch,
            path: "/vm".into(),
            body: Some(serde_json::to_value(VmStateBody { state })?),
        })
    }

    /// `PUT /snapshot/create`
    pub fn snapshot_create(params: &SnapshotCreate) -> Result<Self> {
        Self::put("/snapshot/create", params)
    }

    /// `PUT /snapshot/load`
    pub fn snapshot_load(params: &SnapshotLoad) -> Result<Self> {
        Self::put("/snapshot/load", params)
    }

    /// Short description used in errors and logs, e.g. `PUT /drives/rootfs`.
    pub fn operation(&self) -> String {
        format!("{} {}", self.method, self.path)
    }
}

/// Raw response from the monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
}

impl ApiResponse {
    pub fn no_content() -> Self {
        Self {
            status: STATUS_NO_CONTENT,
            body: String::new(),
        }
    }

    pub fn is_no_content(&self) -> bool {
        self.status == STATUS_NO_CONTENT
    }

    pub fn is_bad_request(&self) -> bool {
        self.status == 400
    }

    /// Turn a non-204 response into [`VmError::ConfigurationRejected`].
    pub fn into_result(self, request: &ApiRequest) -> Result<()> {
        if self.is_no_content() {
            return Ok(());
        }
        Err(VmError::ConfigurationRejected {
            operation: request.operation(),
            status: self.status,
            body: self.body,
        })
    }
}

/// Synchronous request/response channel to one monitor instance.
///
/// Implementations must bound every exchange with their own timeout.
#[async_trait]
pub trait ControlChannel: Send + Sync {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse>;
}

/// Body of `PUT /network-interfaces/{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub iface_id: String,
    pub host_dev_name: String,
    pub guest_mac: String,
    pub allow_mmds_requests: bool,
}

/// Body of `PUT /drives/{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Drive {
    pub drive_id: String,
    pub path_on_host: String,
    pub is_root_device: bool,
    pub is_read_only: bool,
}

/// Body of `PUT /boot-source`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootSource {
    pub kernel_image_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boot_args: Option<String>,
}

/// Body of `PUT /metrics`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metrics {
    pub metrics_path: String,
}

#[derive(Debug, Serialize)]
struct Action {
    action_type: String,
}

/// Target of `PATCH /vm`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VmStateChange {
    Paused,
    Resumed,
}

#[derive(Debug, Serialize)]
struct VmStateBody {
    state: VmStateChange,
}

/// Snapshot flavour as named by the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotKind {
    Full,
    Diff,
}

/// Body of `PUT /snapshot/create`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotCreate {
    pub snapshot_type: SnapshotKind,
    pub snapshot_path: String,
    pub mem_file_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Body of `PUT /snapshot/load`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotLoad {
    pub snapshot_path: String,
    pub mem_file_path: String,
    pub enable_diff_snapshots: bool,
    pub resume_vm: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_interface_request() {
        let req = ApiRequest::network_interface(&NetworkInterface {
            iface_id: "eth1".into(),
            host_dev_name: "tap1".into(),
            guest_mac: "06:00:c0:a8:01:02".into(),
            allow_mmds_requests: true,
        })
        .unwrap();
        assert_eq!(req.method, ApiMethod::Put);
        assert_eq!(req.path, "/network-interfaces/eth1");
        assert_eq!(req.body.unwrap()["host_dev_name"], "tap1");
    }

    #[test]
    fn test_vm_state_request() {
        let req = ApiRequest::vm_state(VmStateChange::Paused).unwrap();
        assert_eq!(req.operation(), "PATCH /vm");
        assert_eq!(req.body.unwrap()["state"], "Paused");
    }

    #[test]
    fn test_snapshot_create_omits_missing_version() {
        let params = SnapshotCreate {
            snapshot_type: SnapshotKind::Diff,
            snapshot_path: "/snapshot/vm.vmstate".into(),
            mem_file_path: "/snapshot/vm.mem".into(),
            version: None,
        };
        let body = ApiRequest::snapshot_create(&params).unwrap().body.unwrap();
        assert_eq!(body["snapshot_type"], "Diff");
        assert!(body.get("version").is_none());
    }

    #[test]
    fn test_into_result() {
        let req = ApiRequest::instance_start().unwrap();
        assert!(ApiResponse::no_content().into_result(&req).is_ok());

        let rejected = ApiResponse {
            status: 400,
            body: "boot source missing".into(),
        };
        assert!(rejected.is_bad_request());
        let err = rejected.into_result(&req).unwrap_err();
        assert_eq!(err.status(), Some(400));
        assert!(err.to_string().contains("PUT /actions"));
        assert!(err.to_string().contains("boot source missing"));
    }
}
