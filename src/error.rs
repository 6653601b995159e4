use thiserror::Error;

use crate::types::{Quantity, RunState};

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("{device} unavailable: {reason}")]
    DeviceUnavailable { device: String, reason: String },
    #[error("{device} timed out during {operation}")]
    DeviceTimeout { device: String, operation: String },
    #[error("Invalid {quantity} entry: {text:?}")]
    InvalidInput { quantity: Quantity, text: String },
    #[error("Data log write failed ({context}): {source}")]
    SinkWrite {
        #[source]
        source: std::io::Error,
        context: String,
    },
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Commit not allowed while {0}")]
    CommitNotAllowed(RunState),
    #[error("Control loop stopped")]
    Disconnected,
}

/// Coarse failure classes the orchestrator and poller act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    DeviceUnavailable,
    DeviceTimeout,
    InvalidInput,
    SinkWriteFailure,
    Other,
}

impl ControlError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ControlError::DeviceUnavailable { .. } | ControlError::Protocol(_) => {
                ErrorKind::DeviceUnavailable
            }
            ControlError::DeviceTimeout { .. } => ErrorKind::DeviceTimeout,
            ControlError::InvalidInput { .. } => ErrorKind::InvalidInput,
            ControlError::SinkWrite { .. } => ErrorKind::SinkWriteFailure,
            _ => ErrorKind::Other,
        }
    }

    /// Convert a transport-level I/O failure into the channel taxonomy.
    pub fn from_io(device: &str, operation: &str, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                ControlError::DeviceTimeout {
                    device: device.to_string(),
                    operation: operation.to_string(),
                }
            }
            _ => ControlError::DeviceUnavailable {
                device: device.to_string(),
                reason: format!("{operation}: {err}"),
            },
        }
    }

    pub fn unavailable(device: &str, reason: impl Into<String>) -> Self {
        ControlError::DeviceUnavailable {
            device: device.to_string(),
            reason: reason.into(),
        }
    }

    pub fn timeout(device: &str, operation: impl Into<String>) -> Self {
        ControlError::DeviceTimeout {
            device: device.to_string(),
            operation: operation.into(),
        }
    }
}

impl From<config::ConfigError> for ControlError {
    fn from(err: config::ConfigError) -> Self {
        ControlError::Config(err.to_string())
    }
}
