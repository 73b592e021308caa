//! Client configuration

use proven_protocol::attachment::DEFAULT_CHUNK_SIZE;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a `ManagementClient`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Bytes per chunk when streaming envelope attachments to the controller
    pub attachment_chunk_size: usize,

    /// Budget used by `PendingPrepare::recv_default`
    pub prepare_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            attachment_chunk_size: DEFAULT_CHUNK_SIZE,
            prepare_timeout_ms: 5 * 60 * 1000,
        }
    }
}

impl ClientConfig {
    /// Set attachment chunk size
    pub fn with_attachment_chunk_size(mut self, size: usize) -> Self {
        self.attachment_chunk_size = size;
        self
    }

    /// Set the default prepare timeout
    pub fn with_prepare_timeout(mut self, timeout: Duration) -> Self {
        self.prepare_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn prepare_timeout(&self) -> Duration {
        Duration::from_millis(self.prepare_timeout_ms)
    }
}
