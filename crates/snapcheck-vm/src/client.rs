//! HTTP control channel over the Firecracker API socket.

use crate::api::{ApiMethod, ApiRequest, ApiResponse, ControlChannel};
use crate::error::{Result, VmError};
use async_trait::async_trait;
use hyper::{Body, Client, Method, Request};
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default bound on a single request/response exchange.
pub const DEFAULT_API_TIMEOUT: Duration = Duration::from_secs(10);

/// Control channel talking HTTP/1.1 to the monitor's Unix socket.
pub struct FirecrackerApi {
    socket_path: PathBuf,
    client: Client<UnixConnector, Body>,
    timeout: Duration,
}

impl FirecrackerApi {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            client: Client::unix(),
            timeout: DEFAULT_API_TIMEOUT,
        }
    }

    /// Set the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Path to the API socket on the host.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    async fn exchange(&self, request: &ApiRequest) -> Result<ApiResponse> {
        let method = match request.method {
            ApiMethod::Get => Method::GET,
            ApiMethod::Put => Method::PUT,
            ApiMethod::Patch => Method::PATCH,
        };

        let body = match &request.body {
            Some(value) => Body::from(serde_json::to_string(value)?),
            None => Body::empty(),
        };

        let uri: hyper::Uri = Uri::new(&self.socket_path, &request.path).into();
        let http_request = Request::builder()
            .method(method)
            .uri(uri)
            .header("Accept", "application/json")
            .header("Content-Type", "application/json")
            .body(body)
            .map_err(|e| VmError::Transport(format!("failed to build request: {e}")))?;

        let response = self.client.request(http_request).await.map_err(|e| {
            tracing::error!(error = %e, operation = %request.operation(), "API request failed");
            VmError::Transport(format!("{} failed: {e}", request.operation()))
        })?;

        let status = response.status().as_u16();
        let body_bytes = hyper::body::to_bytes(response.into_body())
            .await
            .map_err(|e| VmError::Transport(format!("failed to read response body: {e}")))?;

        Ok(ApiResponse {
            status,
            body: String::from_utf8_lossy(&body_bytes).into_owned(),
        })
    }
}

#[async_trait]
impl ControlChannel for FirecrackerApi {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse> {
        let start = std::time::Instant::now();
        tracing::trace!(
            operation = %request.operation(),
            socket = %self.socket_path.display(),
            "Sending API request"
        );

        let response = tokio::time::timeout(self.timeout, self.exchange(&request))
            .await
            .map_err(|_| VmError::Timeout(self.timeout))??;

        tracing::debug!(
            operation = %request.operation(),
            status = response.status,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "API request completed"
        );
        Ok(response)
    }
}
