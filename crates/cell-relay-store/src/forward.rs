//! Best-effort forwarding of execution records to an external collector.

use std::time::Duration;

use cell_relay_core::ExecutionRecord;
use cell_relay_filter::ForwardTarget;
use serde::Serialize;
use tokio::{io::AsyncWriteExt, net::TcpStream, time::timeout};

use crate::StoreError;

const SEND_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Serialize)]
struct ForwardedRecord<'a> {
    tag: &'a str,
    #[serde(flatten)]
    record: &'a ExecutionRecord,
}

/// Ships finished execution records to a `host:port` collector as one JSON
/// line per record. Failures are reported, never fatal; the relay treats
/// forwarding as fire-and-forget.
pub struct LogForwarder {
    target: ForwardTarget,
}

impl LogForwarder {
    /// Create a forwarder for the given target.
    #[must_use]
    pub const fn new(target: ForwardTarget) -> Self {
        Self { target }
    }

    /// Send one record, bounded by a short timeout.
    ///
    /// # Errors
    /// Returns error if the connection or write fails or times out.
    pub async fn send(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        let line = serde_json::to_string(&ForwardedRecord {
            tag: &self.target.tag,
            record,
        })?;

        timeout(SEND_TIMEOUT, self.send_line(&line))
            .await
            .map_err(|_| StoreError::Forward(format!("timed out reaching {}", self.target.host)))?
    }

    async fn send_line(&self, line: &str) -> Result<(), StoreError> {
        let mut stream = TcpStream::connect((self.target.host.as_str(), self.target.port))
            .await
            .map_err(|e| StoreError::Forward(e.to_string()))?;
        stream
            .write_all(line.as_bytes())
            .await
            .map_err(|e| StoreError::Forward(e.to_string()))?;
        stream
            .write_all(b"\n")
            .await
            .map_err(|e| StoreError::Forward(e.to_string()))?;
        stream
            .shutdown()
            .await
            .map_err(|e| StoreError::Forward(e.to_string()))?;
        Ok(())
    }
}
