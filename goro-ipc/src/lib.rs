//! Inter-worker communication for goro
//!
//! This crate defines the message protocol spoken between the main side and
//! its workers, and the two transport adapters that carry it: in-process
//! worker threads and child subprocesses.

pub mod error;
pub mod protocol;
pub mod transport;

pub use error::IpcError;
pub use protocol::{
    CallRequest, CallResponse, CallTarget, Message, Uid, READY, STALE_AFTER_MS, TICK,
    TICK_INTERVAL_MS,
};
pub use transport::{
    stdio_worker_channel, LinkEvent, ProcessTransport, SpawnSpec, ThreadTransport,
    ThreadWorkerBody, ThreadWorkerEnv, Transport, TransportKind, WorkerExit, WorkerLink,
    THREAD_EXIT_TERMINATED, WORKER_DATA_PREFIX, WORKER_FLAG, WORKER_ID_PREFIX,
};
