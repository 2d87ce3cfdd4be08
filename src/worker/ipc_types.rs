//! Envelope types exchanged between controller and worker.
//!
//! Each envelope is one JSON object. Over a child process the worker's stdout
//! carries [`WireFrame`]s, one per line, naming the channel the body belongs to.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, ErrorKind, Result};

/// Request sent from controller to worker.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RequestEnvelope {
    /// Monotonic per controller, never reused.
    pub id: u64,
    pub action: String,
    #[serde(default)]
    pub payload: Value,
}

/// Exactly one of a result or an error.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum Outcome {
    Error {
        error: ErrorKind,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        trace: Option<String>,
    },
    Success {
        result: Value,
    },
}

/// Final reply to a request.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ResultEnvelope {
    pub id: u64,
    #[serde(flatten)]
    pub outcome: Outcome,
}

impl ResultEnvelope {
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            id,
            outcome: Outcome::Success { result },
        }
    }

    pub fn failure(id: u64, error: &EngineError, trace: Option<String>) -> Self {
        Self {
            id,
            outcome: Outcome::Error {
                error: error.kind(),
                message: error.message(),
                trace,
            },
        }
    }

    /// The result value, or the reconstructed remote error.
    pub fn into_result(self) -> Result<Value> {
        match self.outcome {
            Outcome::Success { result } => Ok(result),
            Outcome::Error {
                error,
                message,
                trace,
            } => Err(EngineError::from_remote(error, message, trace)),
        }
    }
}

/// Partial progress for a request. Later snapshots overwrite earlier fields.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ProgressEnvelope {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate: Option<f64>,
    /// Base64 PNG previews.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
}

impl ProgressEnvelope {
    pub fn task(id: u64, task: impl Into<String>) -> Self {
        Self {
            id,
            task: Some(task.into()),
            ..Self::default()
        }
    }

    /// Last write per field wins.
    pub fn merge(&mut self, newer: ProgressEnvelope) {
        if newer.step.is_some() {
            self.step = newer.step;
        }
        if newer.total.is_some() {
            self.total = newer.total;
        }
        if newer.rate.is_some() {
            self.rate = newer.rate;
        }
        if newer.images.is_some() {
            self.images = newer.images;
        }
        if newer.task.is_some() {
            self.task = newer.task;
        }
    }
}

/// Which controller-bound channel a frame belongs to.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FrameChannel {
    Results,
    Progress,
}

/// One line of a worker's stdout.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WireFrame {
    pub channel: FrameChannel,
    pub body: Value,
}

/// Read the `id` of a serialized envelope without decoding the rest.
pub fn peek_id(raw: &str) -> Option<u64> {
    #[derive(Deserialize)]
    struct IdOnly {
        id: Option<u64>,
    }
    serde_json::from_str::<IdOnly>(raw).ok().and_then(|e| e.id)
}
