//! Startup options, frozen when the facade starts

use std::path::PathBuf;

use goro_codec::Value;
use goro_ipc::TransportKind;

use crate::dispatch::DispatchMethod;
use crate::error::GoroError;

/// Worker-count budget: a fixed pool or a dynamic `[min, max]` range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerBudget {
    /// `start` spawns exactly this many workers eagerly
    Fixed(usize),
    /// `start` spawns `min` eagerly; the pool grows on demand up to `max`
    Range { min: usize, max: usize },
}

impl WorkerBudget {
    pub fn min(&self) -> usize {
        match self {
            WorkerBudget::Fixed(n) => *n,
            WorkerBudget::Range { min, .. } => *min,
        }
    }

    pub fn max(&self) -> usize {
        match self {
            WorkerBudget::Fixed(n) => *n,
            WorkerBudget::Range { max, .. } => *max,
        }
    }

    /// Policy used when no explicit override is given: a fixed pool walks
    /// round-robin, a dynamic one follows liveness.
    pub fn default_method(&self) -> DispatchMethod {
        match self {
            WorkerBudget::Fixed(_) => DispatchMethod::RoundRobin,
            WorkerBudget::Range { .. } => DispatchMethod::LeastTime,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), GoroError> {
        if self.min() < 1 {
            return Err(GoroError::Config(
                "worker count must be at least 1".to_string(),
            ));
        }
        if self.max() < self.min() {
            return Err(GoroError::Config(format!(
                "worker range max {} is below min {}",
                self.max(),
                self.min()
            )));
        }
        Ok(())
    }
}

/// Options accepted by [`crate::Goro::start`]
#[derive(Debug, Clone)]
pub struct GoroOptions {
    /// Program a process worker executes; defaults to the current
    /// executable. Ignored by the thread transport.
    pub filename: Option<PathBuf>,
    pub workers: WorkerBudget,
    /// Dispatch policy override; see [`WorkerBudget::default_method`]
    pub method: Option<DispatchMethod>,
    pub adapter: TransportKind,
    /// Extra flags forwarded to spawned worker processes
    pub exec_argv: Vec<String>,
    /// Delivered, encoded, to every worker; read back via
    /// [`crate::worker_data`]
    pub worker_data: Option<Value>,
    /// Stdio piping flags. The process channel owns stdin/stdout, so only
    /// `stderr` has an effect there: `true` inherits the parent's stderr,
    /// `false` discards it. The thread transport shares the process stdio
    /// and ignores all three.
    pub stdin: bool,
    pub stdout: bool,
    pub stderr: bool,
}

impl Default for GoroOptions {
    fn default() -> Self {
        Self {
            filename: None,
            workers: WorkerBudget::Fixed(num_cpus::get()),
            method: None,
            adapter: TransportKind::Thread,
            exec_argv: Vec::new(),
            worker_data: None,
            stdin: false,
            stdout: false,
            stderr: true,
        }
    }
}

impl GoroOptions {
    /// Fixed pool of `n` workers
    pub fn with_workers(mut self, n: usize) -> Self {
        self.workers = WorkerBudget::Fixed(n);
        self
    }

    /// Dynamic pool between `min` and `max` workers
    pub fn with_worker_range(mut self, min: usize, max: usize) -> Self {
        self.workers = WorkerBudget::Range { min, max };
        self
    }

    pub fn with_method(mut self, method: DispatchMethod) -> Self {
        self.method = Some(method);
        self
    }

    pub fn with_adapter(mut self, adapter: TransportKind) -> Self {
        self.adapter = adapter;
        self
    }

    pub fn with_filename(mut self, filename: impl Into<PathBuf>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn with_worker_data(mut self, data: Value) -> Self {
        self.worker_data = Some(data);
        self
    }

    /// Effective dispatch policy after applying the default derivation
    pub fn effective_method(&self) -> DispatchMethod {
        self.method.unwrap_or_else(|| self.workers.default_method())
    }
}
