//! goro: offload function calls to a pool of parallel workers
//!
//! The main side registers functions, starts a pool, and calls; each call
//! is dispatched to an OS-level worker (a thread or a child process),
//! executed there, and its result shipped back. Closures never cross the
//! wire: both sides run the same registration code, so a registry index
//! plus a 32-bit signature identifies the function to run.
//!
//! ```no_run
//! use goro::{register, Goro, GoroOptions, Value};
//!
//! fn main() -> Result<(), goro::GoroError> {
//!     let sum = register(|args| {
//!         let a = args[0].as_int().unwrap_or(0);
//!         let b = args[1].as_int().unwrap_or(0);
//!         Ok(Value::Int(a + b))
//!     });
//!
//!     // In a worker process this runs the worker runtime and never returns.
//!     goro::init();
//!
//!     let runtime = tokio::runtime::Runtime::new().expect("runtime");
//!     runtime.block_on(async {
//!         let pool = Goro::start(GoroOptions::default().with_workers(2)).await?;
//!         let result = pool.call(sum, vec![Value::Int(12), Value::Int(13)]).await?;
//!         assert_eq!(result, Value::Int(25));
//!         pool.terminate().await
//!     })
//! }
//! ```

mod context;
mod entry;
mod pool;
mod worker;

pub mod dispatch;
pub mod error;
pub mod options;
pub mod registry;

pub use goro_codec::{ErrorValue, SharedValue, Value, WireValue};
pub use goro_ipc::TransportKind;

pub use context::{is_main_thread, request_parent, thread_id, worker_data, workers};
pub use dispatch::DispatchMethod;
pub use error::{GoroError, REGISTRY_MALFORMED};
pub use options::{GoroOptions, WorkerBudget};
pub use pool::{PoolStats, WorkerStatus};
pub use registry::{register, register_async, use_exports, CallOutcome, Exports, GoFunc};

use goro_codec::encode_args;
use goro_ipc::CallTarget;

use crate::pool::{DispatchOutcome, PoolClient};

/// Handle to a started worker pool
#[derive(Clone)]
pub struct Goro {
    client: PoolClient,
}

impl Goro {
    /// Start a pool. Main side only; resolves once the eager minimum of
    /// workers is ready.
    pub async fn start(options: GoroOptions) -> Result<Goro, GoroError> {
        ensure_main("start")?;
        registry::flush_deferred();
        let client = pool::start(options).await?;
        context::set_main_pool(client.clone());
        Ok(Goro { client })
    }

    /// Offload a registered function and settle with its decoded result, or
    /// with the decoded error it failed with. With an empty pool the call
    /// runs on the main side instead, with a one-time advisory warning.
    pub async fn call(&self, func: GoFunc, args: Vec<Value>) -> Result<Value, GoroError> {
        ensure_main("call")?;
        registry::flush_deferred();
        self.dispatch(CallTarget::Index(func.index), func.signature, args)
            .await
    }

    /// Offload by exported name
    pub async fn call_named(&self, name: &str, args: Vec<Value>) -> Result<Value, GoroError> {
        ensure_main("call")?;
        registry::flush_deferred();
        self.dispatch(
            CallTarget::Name(name.to_string()),
            registry::hash32(name),
            args,
        )
        .await
    }

    async fn dispatch(
        &self,
        target: CallTarget,
        sig: u32,
        args: Vec<Value>,
    ) -> Result<Value, GoroError> {
        let wire_args = encode_args(&args);
        match self.client.dispatch(target.clone(), sig, wire_args).await? {
            DispatchOutcome::Sent(receiver) => {
                let wire = receiver.await.map_err(|_| GoroError::WorkerDied)??;
                Ok(goro_codec::decode(wire))
            }
            DispatchOutcome::Local => {
                let call = worker::resolve(&target, sig).map_err(GoroError::Call)?;
                call(args).await.map_err(GoroError::Call)
            }
        }
    }

    /// Current pool size
    pub async fn workers(&self) -> usize {
        self.client.workers().await
    }

    /// Aggregate pool counters
    pub async fn stats(&self) -> PoolStats {
        self.client.stats().await
    }

    /// Terminate every worker and drain the pool. Main side only.
    pub async fn terminate(&self) -> Result<(), GoroError> {
        ensure_main("terminate")?;
        self.client.terminate().await
    }
}

fn ensure_main(op: &'static str) -> Result<(), GoroError> {
    if context::is_main_thread() {
        Ok(())
    } else {
        Err(GoroError::CalledFromWorker(op))
    }
}

/// Detect the worker role. In a process spawned as a worker this runs the
/// worker runtime and exits; on the main side it returns immediately. Call
/// it near the top of `main`, after registrations, so parent and child
/// build the same registry. Pools on the thread transport do not need it.
pub fn init() {
    let args: Vec<String> = std::env::args().collect();
    if !args.iter().any(|a| a == goro_ipc::WORKER_FLAG) {
        return;
    }

    let worker_id = args
        .iter()
        .find_map(|a| a.strip_prefix(goro_ipc::WORKER_ID_PREFIX))
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let worker_data = args
        .iter()
        .find_map(|a| a.strip_prefix(goro_ipc::WORKER_DATA_PREFIX))
        .and_then(|json| serde_json::from_str::<WireValue>(json).ok())
        .map(goro_codec::decode);

    let code = worker::run_process_worker(worker_id, worker_data);
    std::process::exit(code);
}
