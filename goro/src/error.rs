//! Error types for the facade and pool

use goro_codec::ErrorValue;
use goro_ipc::IpcError;
use thiserror::Error;

/// Fixed message raised by the serving side when a registry lookup fails or
/// the caller's signature does not match the local entry.
pub const REGISTRY_MALFORMED: &str =
    "Goroutine registry malformed, function call cannot be performed";

/// Everything a facade operation can fail with
#[derive(Debug, Error)]
pub enum GoroError {
    /// The target function failed; carries the decoded error
    #[error("{}", .0)]
    Call(ErrorValue),

    /// `start`, `call` and `terminate` belong to the main side
    #[error("goro::{0} must be called from the main side")]
    CalledFromWorker(&'static str),

    /// This operation only makes sense inside a worker
    #[error("goro::{0} must be called from inside a worker")]
    NotInWorker(&'static str),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A worker could not be spawned
    #[error("Failed to spawn worker: {0}")]
    SpawnFailed(String),

    /// The worker owning this call died before responding
    #[error("Worker died before responding")]
    WorkerDied,

    /// The pool supervisor is gone
    #[error("Pool is not running")]
    NotRunning,

    /// IPC error
    #[error("IPC error: {0}")]
    Ipc(#[from] IpcError),
}

impl GoroError {
    /// Message of the underlying call error, or the display form otherwise
    pub fn message(&self) -> String {
        match self {
            GoroError::Call(e) => e.message.clone(),
            other => other.to_string(),
        }
    }
}
