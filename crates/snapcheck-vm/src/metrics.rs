//! Named pipe the monitor writes its metrics to.

use crate::error::{Result, VmError};
use crate::jail::HostPath;
use nix::sys::stat::Mode;
use std::path::Path;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::unix::pipe;

/// A fifo created on the host and handed to the monitor through `PUT /metrics`.
#[derive(Debug, Clone)]
pub struct MetricsFifo {
    path: HostPath,
}

impl MetricsFifo {
    /// Create the fifo at `path`.
    pub fn create(path: &Path) -> Result<Self> {
        nix::unistd::mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR).map_err(|e| {
            VmError::allocation(format!("metrics fifo {}", path.display()), e.into())
        })?;
        Ok(Self {
            path: HostPath::new(path),
        })
    }

    pub fn path(&self) -> &HostPath {
        &self.path
    }

    /// Open the read end without waiting for the monitor to open its side.
    pub fn receiver(&self) -> Result<pipe::Receiver> {
        Ok(pipe::OpenOptions::new().open_receiver(self.path.as_path())?)
    }

    /// Read whatever metric lines are currently buffered in the fifo.
    ///
    /// Each line the monitor flushes is one JSON document.
    pub async fn read_available(&self) -> Result<Vec<serde_json::Value>> {
        let receiver = self.receiver()?;
        let mut lines = BufReader::new(receiver).lines();
        let mut metrics = Vec::new();

        loop {
            let next = tokio::time::timeout(
                std::time::Duration::from_millis(50),
                lines.next_line(),
            )
            .await;
            match next {
                Ok(Ok(Some(line))) if line.trim().is_empty() => continue,
                Ok(Ok(Some(line))) => metrics.push(serde_json::from_str(&line)?),
                Ok(Ok(None)) | Err(_) => break,
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Ok(Err(e)) => return Err(e.into()),
            }
        }
        Ok(metrics)
    }
}
