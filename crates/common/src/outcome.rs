//! Outcome documents and terminal responses

use crate::attachment::Attachments;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Structured result of an operation
///
/// Serializes as a document tagged by `outcome`, e.g.
/// `{"outcome": "success", "result": ...}` or
/// `{"outcome": "failed", "failure-description": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum OperationOutcome {
    Success {
        #[serde(default)]
        result: Value,
    },
    Failed {
        #[serde(rename = "failure-description")]
        failure_description: String,
        #[serde(rename = "rolled-back", default)]
        rolled_back: bool,
        #[serde(rename = "timed-out", default)]
        timed_out: bool,
    },
    Cancelled,
}

impl OperationOutcome {
    pub fn success(result: Value) -> Self {
        Self::Success { result }
    }

    pub fn failed(description: impl Into<String>) -> Self {
        Self::Failed {
            failure_description: description.into(),
            rolled_back: false,
            timed_out: false,
        }
    }

    /// A failure that was rolled back after the prepare phase
    pub fn rolled_back(description: impl Into<String>) -> Self {
        Self::Failed {
            failure_description: description.into(),
            rolled_back: true,
            timed_out: false,
        }
    }

    /// A failure synthesized locally because the peer did not answer in time
    pub fn timed_out(description: impl Into<String>) -> Self {
        Self::Failed {
            failure_description: description.into(),
            rolled_back: true,
            timed_out: true,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, Self::Failed { timed_out: true, .. })
    }

    pub fn result(&self) -> Option<&Value> {
        match self {
            Self::Success { result } => Some(result),
            _ => None,
        }
    }

    pub fn failure_description(&self) -> Option<&str> {
        match self {
            Self::Failed {
                failure_description,
                ..
            } => Some(failure_description),
            _ => None,
        }
    }

    /// Render as an untyped document
    pub fn to_document(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Terminal result delivered to a caller: the outcome plus any result streams
/// the controller attached.
#[derive(Debug, Clone)]
pub struct OperationResponse {
    outcome: OperationOutcome,
    streams: Attachments,
}

impl OperationResponse {
    /// Simple response without attached streams
    pub fn new(outcome: OperationOutcome) -> Self {
        Self {
            outcome,
            streams: Vec::new(),
        }
    }

    /// Response carrying result streams
    pub fn with_streams(outcome: OperationOutcome, streams: Attachments) -> Self {
        Self { outcome, streams }
    }

    pub fn outcome(&self) -> &OperationOutcome {
        &self.outcome
    }

    pub fn streams(&self) -> &Attachments {
        &self.streams
    }

    pub fn into_outcome(self) -> OperationOutcome {
        self.outcome
    }

    pub fn into_parts(self) -> (OperationOutcome, Attachments) {
        (self.outcome, self.streams)
    }
}
