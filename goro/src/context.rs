//! Role and identity of the current execution side
//!
//! The main side and each worker share one process image but different
//! contexts: a worker thread carries its context thread-locally, a worker
//! process carries it process-wide. User code reads the role through
//! [`is_main_thread`], [`thread_id`] and [`worker_data`], and a worker may
//! reach back to its parent with [`request_parent`].

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use once_cell::sync::{Lazy, OnceCell};
use tokio::sync::{mpsc, oneshot};

use goro_codec::{decode, encode_args, Value};
use goro_ipc::{CallRequest, CallResponse, CallTarget, Message, Uid};

use crate::error::GoroError;
use crate::pool::{next_uid, PoolClient, WORKERS_TARGET};
use crate::registry;

/// A worker's line back to its parent: the outbound sender plus the pending
/// table its own requests settle against.
#[derive(Clone)]
pub(crate) struct HomePort {
    tx: mpsc::UnboundedSender<Message>,
    pending: Arc<Mutex<HashMap<Uid, oneshot::Sender<CallResponse>>>>,
}

impl HomePort {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            tx,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Send upward; false once the parent is gone
    pub(crate) fn send(&self, message: Message) -> bool {
        self.tx.send(message).is_ok()
    }

    /// Settle one of this worker's own requests
    pub(crate) fn settle(&self, response: CallResponse) {
        let sender = self.lock_pending().remove(&response.uid());
        if let Some(sender) = sender {
            let _ = sender.send(response);
        }
    }

    /// Ship a request to the parent and wait for the matching response
    pub(crate) async fn roundtrip(
        &self,
        target: CallTarget,
        sig: u32,
        args: Vec<Value>,
    ) -> Result<Value, GoroError> {
        let uid = next_uid();
        let (tx, rx) = oneshot::channel();
        self.lock_pending().insert(uid, tx);

        let request = Message::Request(CallRequest(uid, target, sig, encode_args(&args)));
        if !self.send(request) {
            self.lock_pending().remove(&uid);
            return Err(GoroError::WorkerDied);
        }

        let CallResponse(_, error, result) = rx.await.map_err(|_| GoroError::WorkerDied)?;
        match error {
            Some(error) => Err(GoroError::Call(error)),
            None => Ok(decode(result)),
        }
    }

    fn lock_pending(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<Uid, oneshot::Sender<CallResponse>>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct WorkerCtx {
    id: u32,
    data: Option<Value>,
    home: HomePort,
}

thread_local! {
    static WORKER_CTX: RefCell<Option<WorkerCtx>> = const { RefCell::new(None) };
}

// Set once by init() in a worker process so role checks hold on every
// thread of that process, not just the runtime thread.
static PROCESS_WORKER: OnceCell<(u32, Option<Value>)> = OnceCell::new();

static MAIN_POOL: Lazy<Mutex<Option<PoolClient>>> = Lazy::new(|| Mutex::new(None));

pub(crate) fn set_worker_ctx(id: u32, data: Option<Value>, home: HomePort) {
    WORKER_CTX.with(|ctx| {
        *ctx.borrow_mut() = Some(WorkerCtx { id, data, home });
    });
}

pub(crate) fn set_process_worker(id: u32, data: Option<Value>) {
    let _ = PROCESS_WORKER.set((id, data));
}

pub(crate) fn set_main_pool(client: PoolClient) {
    *MAIN_POOL.lock().unwrap_or_else(|e| e.into_inner()) = Some(client);
}

fn main_pool() -> Option<PoolClient> {
    MAIN_POOL.lock().unwrap_or_else(|e| e.into_inner()).clone()
}

fn current_home() -> Option<HomePort> {
    WORKER_CTX.with(|ctx| ctx.borrow().as_ref().map(|c| c.home.clone()))
}

/// True on the main side, false inside any worker
pub fn is_main_thread() -> bool {
    let in_worker_thread = WORKER_CTX.with(|ctx| ctx.borrow().is_some());
    !in_worker_thread && PROCESS_WORKER.get().is_none()
}

/// 0 on the main side, the worker id inside a worker
pub fn thread_id() -> u32 {
    if let Some(id) = WORKER_CTX.with(|ctx| ctx.borrow().as_ref().map(|c| c.id)) {
        return id;
    }
    PROCESS_WORKER.get().map(|(id, _)| *id).unwrap_or(0)
}

/// The decoded worker data this pool was started with, inside a worker
pub fn worker_data() -> Option<Value> {
    if let Some(data) = WORKER_CTX.with(|ctx| ctx.borrow().as_ref().map(|c| c.data.clone())) {
        return data;
    }
    PROCESS_WORKER.get().and_then(|(_, data)| data.clone())
}

/// From inside a worker, run a named call on the main side and wait for its
/// result, the symmetric half of the protocol.
pub async fn request_parent(name: &str, args: Vec<Value>) -> Result<Value, GoroError> {
    let home = current_home().ok_or(GoroError::NotInWorker("request_parent"))?;
    home.roundtrip(
        CallTarget::Name(name.to_string()),
        registry::hash32(name),
        args,
    )
    .await
}

/// Pool size: answered locally on the main side, asked of the parent from
/// inside a worker. An unreachable pool reads as zero.
pub async fn workers() -> usize {
    if current_home().is_some() {
        return match request_parent(WORKERS_TARGET, Vec::new()).await {
            Ok(value) => value.as_int().unwrap_or(0).max(0) as usize,
            Err(_) => 0,
        };
    }
    match main_pool() {
        Some(client) => client.workers().await,
        None => 0,
    }
}

#[cfg(test)]
pub(crate) struct WorkerCtxGuard;

#[cfg(test)]
impl Drop for WorkerCtxGuard {
    fn drop(&mut self) {
        WORKER_CTX.with(|ctx| *ctx.borrow_mut() = None);
    }
}

#[cfg(test)]
pub(crate) fn fake_worker_ctx(id: u32) -> WorkerCtxGuard {
    let (tx, _rx) = mpsc::unbounded_channel();
    set_worker_ctx(id, None, HomePort::new(tx));
    WorkerCtxGuard
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_main_side_identity() {
        assert!(is_main_thread());
        assert_eq!(thread_id(), 0);
        assert_eq!(worker_data(), None);
    }

    #[test]
    fn test_worker_ctx_flips_identity() {
        let _guard = fake_worker_ctx(4);
        assert!(!is_main_thread());
        assert_eq!(thread_id(), 4);
    }

    #[tokio::test]
    async fn test_roundtrip_settles_by_uid() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let home = HomePort::new(tx);

        let settle_home = home.clone();
        let responder = tokio::spawn(async move {
            if let Some(Message::Request(request)) = rx.recv().await {
                settle_home.settle(CallResponse::ok(
                    request.uid(),
                    goro_codec::WireValue::Int(3),
                ));
            }
        });

        let result = home
            .roundtrip(CallTarget::Name("x".into()), registry::hash32("x"), vec![])
            .await
            .unwrap();
        assert_eq!(result, Value::Int(3));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_roundtrip_fails_when_parent_gone() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let home = HomePort::new(tx);

        let result = home
            .roundtrip(CallTarget::Name("x".into()), 0, vec![])
            .await;
        assert!(matches!(result, Err(GoroError::WorkerDied)));
    }
}
