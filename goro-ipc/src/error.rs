//! IPC error types

use thiserror::Error;

/// Errors raised by the protocol and transport layers
#[derive(Debug, Error)]
pub enum IpcError {
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(String),

    /// The in-memory channel to the worker is gone
    #[error("Worker channel closed")]
    ChannelClosed,

    /// Spawn failed
    #[error("Failed to spawn worker: {0}")]
    Spawn(String),

    /// Terminate failed
    #[error("Failed to terminate worker: {0}")]
    Terminate(String),
}

impl From<std::io::Error> for IpcError {
    fn from(err: std::io::Error) -> Self {
        IpcError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for IpcError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_io() {
            IpcError::Io(err.to_string())
        } else {
            IpcError::Serialization(err.to_string())
        }
    }
}
