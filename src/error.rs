//! Error types shared by the controller and the worker.
//!
//! Worker-side failures cross the process boundary as `{kind, message, trace}`
//! and are rebuilt into an [`EngineError`] by the controller.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::log_error;

/// Wire name of an error variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Lifecycle,
    Protocol,
    Configuration,
    Timeout,
    Pipeline,
    Io,
    Serialization,
    Image,
    #[serde(other)]
    Unknown,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Lifecycle => "lifecycle",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Pipeline => "pipeline",
            ErrorKind::Io => "io",
            ErrorKind::Serialization => "serialization",
            ErrorKind::Image => "image",
            ErrorKind::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    /// Worker could not be started, stopped, or disappeared.
    #[error("worker lifecycle error: {0}")]
    Lifecycle(String),

    /// Unexpected message shape or reply.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Invalid configuration value, raised before anything is mutated.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("timed out after {0:?} waiting for the worker")]
    Timeout(Duration),

    /// Failure reported by a pipeline backend.
    #[error("pipeline error: {0}")]
    Pipeline(String),

    /// Worker-side error whose kind has no local counterpart.
    #[error("remote {} error: {message}", .kind.as_str())]
    Remote { kind: ErrorKind, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Lifecycle(_) => ErrorKind::Lifecycle,
            EngineError::Protocol(_) => ErrorKind::Protocol,
            EngineError::Configuration(_) => ErrorKind::Configuration,
            EngineError::Timeout(_) => ErrorKind::Timeout,
            EngineError::Pipeline(_) => ErrorKind::Pipeline,
            EngineError::Remote { kind, .. } => *kind,
            EngineError::Io(_) => ErrorKind::Io,
            EngineError::Serialization(_) => ErrorKind::Serialization,
            EngineError::Image(_) => ErrorKind::Image,
        }
    }

    /// Message without the variant prefix, as carried on the wire.
    pub fn message(&self) -> String {
        match self {
            EngineError::Lifecycle(m)
            | EngineError::Protocol(m)
            | EngineError::Configuration(m)
            | EngineError::Pipeline(m) => m.clone(),
            EngineError::Remote { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Rebuild an error reported by the worker. The trace is logged, not kept.
    pub fn from_remote(kind: ErrorKind, message: String, trace: Option<String>) -> Self {
        if let Some(trace) = trace.as_deref() {
            log_error!("remote", "Worker {} error: {message}\n{trace}", kind.as_str());
        }
        match kind {
            ErrorKind::Lifecycle => EngineError::Lifecycle(message),
            ErrorKind::Protocol => EngineError::Protocol(message),
            ErrorKind::Configuration => EngineError::Configuration(message),
            ErrorKind::Pipeline => EngineError::Pipeline(message),
            kind => EngineError::Remote { kind, message },
        }
    }
}
