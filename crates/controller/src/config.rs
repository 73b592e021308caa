//! Controller configuration

use proven_protocol::attachment::DEFAULT_CHUNK_SIZE;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a `ManagementController`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Threads in the pool created by `ManagementController::start`
    pub worker_threads: usize,

    /// Bytes per chunk when streaming response attachments
    pub attachment_chunk_size: usize,

    /// How many finished operation ids are remembered to recognise late
    /// Complete requests
    pub completed_history: usize,

    /// How long a Complete that arrived before its Execute is kept waiting
    pub orphan_ttl_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            attachment_chunk_size: DEFAULT_CHUNK_SIZE,
            completed_history: 1024,
            orphan_ttl_ms: 60_000,
        }
    }
}

impl ControllerConfig {
    /// Set worker thread count
    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    /// Set completed-id history capacity
    pub fn with_completed_history(mut self, capacity: usize) -> Self {
        self.completed_history = capacity;
        self
    }

    /// Set orphan TTL
    pub fn with_orphan_ttl(mut self, ttl: Duration) -> Self {
        self.orphan_ttl_ms = ttl.as_millis() as u64;
        self
    }

    pub fn orphan_ttl(&self) -> Duration {
        Duration::from_millis(self.orphan_ttl_ms)
    }
}
