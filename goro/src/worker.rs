//! The runtime that serves calls inside a worker
//!
//! On boot the runtime installs its message pump, yields once to the
//! scheduler, emits READY, then starts the periodic TICK task. Each request
//! is served on its own task so responses to this worker's parent-bound
//! requests keep flowing across user await points, and so a worker that is
//! holding the CPU stops ticking, which is exactly the staleness signal the
//! pool scales on. Malformed input never takes the runtime down.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error};

use goro_codec::{decode, decode_args, encode, ErrorValue, Value};
use goro_ipc::{
    stdio_worker_channel, CallRequest, CallResponse, CallTarget, LinkEvent, Message,
    ThreadWorkerEnv, THREAD_EXIT_TERMINATED, TICK_INTERVAL_MS,
};

use crate::context::{self, HomePort};
use crate::error::REGISTRY_MALFORMED;
use crate::registry::{self, BoxedCall};

/// Resolve a call target against this side's registry
pub(crate) fn resolve(target: &CallTarget, sig: u32) -> Result<BoxedCall, ErrorValue> {
    let malformed = || ErrorValue::msg(REGISTRY_MALFORMED);
    match target {
        CallTarget::Index(index) => registry::entry_call(*index, sig).ok_or_else(malformed),
        CallTarget::Name(name) => {
            if registry::hash32(name) != sig {
                return Err(malformed());
            }
            registry::named_call(name).ok_or_else(malformed)
        }
    }
}

/// Serve one request: resolve, decode, invoke, await, encode. A panicking
/// callable surfaces as an error response, like any thrown value.
pub(crate) async fn serve_request(request: CallRequest) -> CallResponse {
    let CallRequest(uid, target, sig, args) = request;

    let call = match resolve(&target, sig) {
        Ok(call) => call,
        Err(error) => return CallResponse::err(uid, error),
    };

    let args = decode_args(args);
    let outcome = std::panic::AssertUnwindSafe(call(args)).catch_unwind().await;
    match outcome {
        Ok(Ok(value)) => CallResponse::ok(uid, encode(&value)),
        Ok(Err(error)) => CallResponse::err(uid, error),
        Err(payload) => CallResponse::err(uid, ErrorValue::msg(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "worker function panicked".to_string()
    }
}

/// Main loop of a worker. Returns the exit code the transport reports.
pub(crate) async fn worker_main(
    worker_id: u32,
    mut inbound: mpsc::UnboundedReceiver<Message>,
    home: HomePort,
    mut stop: mpsc::UnboundedReceiver<()>,
) -> i32 {
    registry::flush_deferred();

    // Handler is installed; READY goes out on the next scheduler turn.
    tokio::task::yield_now().await;
    if !home.send(Message::ready()) {
        return 0;
    }

    let ticker = tokio::spawn(tick_task(home.clone()));
    let served = Arc::new(AtomicU64::new(0));
    let failed = Arc::new(AtomicU64::new(0));

    let code = loop {
        tokio::select! {
            _ = stop.recv() => break THREAD_EXIT_TERMINATED,
            incoming = inbound.recv() => match incoming {
                // Parent link gone
                None => break 0,
                Some(Message::Request(request)) => {
                    let home = home.clone();
                    let served = served.clone();
                    let failed = failed.clone();
                    tokio::spawn(async move {
                        let response = serve_request(request).await;
                        served.fetch_add(1, Ordering::Relaxed);
                        if response.1.is_some() {
                            failed.fetch_add(1, Ordering::Relaxed);
                        }
                        home.send(Message::Response(response));
                    });
                }
                Some(Message::Response(response)) => home.settle(response),
                Some(Message::Control(_)) => {}
            }
        }
    };

    ticker.abort();
    debug!(
        worker_id,
        served = served.load(Ordering::Relaxed),
        failed = failed.load(Ordering::Relaxed),
        "worker runtime stopped"
    );
    code
}

async fn tick_task(home: HomePort) {
    let mut ticker = interval(Duration::from_millis(TICK_INTERVAL_MS));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if !home.send(Message::tick()) {
            break;
        }
    }
}

/// Body of a thread-transport worker: its own current-thread runtime over
/// the in-memory channels the adapter handed it.
pub(crate) fn thread_worker_body(env: ThreadWorkerEnv) -> i32 {
    let ThreadWorkerEnv {
        worker_id,
        worker_data,
        inbound,
        outbound,
        stop,
    } = env;

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(worker_id, "worker runtime build failed: {}", e);
            return 2;
        }
    };

    runtime.block_on(async move {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                if outbound.send(LinkEvent::Message(message)).is_err() {
                    break;
                }
            }
        });

        let home = HomePort::new(out_tx);
        context::set_worker_ctx(worker_id, worker_data.map(decode), home.clone());
        worker_main(worker_id, inbound, home, stop).await
    })
}

/// Body of a process-transport worker, entered from `init()`. The protocol
/// rides this process's stdin/stdout; termination comes as a signal, so the
/// stop channel never fires.
pub(crate) fn run_process_worker(worker_id: u32, worker_data: Option<Value>) -> i32 {
    context::set_process_worker(worker_id, worker_data.clone());

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(worker_id, "worker runtime build failed: {}", e);
            return 2;
        }
    };

    runtime.block_on(async move {
        let (out_tx, in_rx) = stdio_worker_channel();
        let home = HomePort::new(out_tx);
        context::set_worker_ctx(worker_id, worker_data, home.clone());

        let (_stop_tx, stop_rx) = mpsc::unbounded_channel();
        worker_main(worker_id, in_rx, home, stop_rx).await
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{register, CallOutcome};

    fn sum(args: Vec<Value>) -> CallOutcome {
        let a = args.first().and_then(Value::as_int).unwrap_or(0);
        let b = args.get(1).and_then(Value::as_int).unwrap_or(0);
        Ok(Value::Int(a + b))
    }

    #[tokio::test]
    async fn test_serve_registered_call() {
        let handle = register(sum);
        let request = CallRequest(
            1,
            CallTarget::Index(handle.index),
            handle.signature,
            goro_codec::encode_args(&[Value::Int(12), Value::Int(13)]),
        );

        let CallResponse(uid, error, result) = serve_request(request).await;
        assert_eq!(uid, 1);
        assert!(error.is_none());
        assert_eq!(decode(result), Value::Int(25));
    }

    #[tokio::test]
    async fn test_missing_entry_is_registry_malformed() {
        let request = CallRequest(2, CallTarget::Index(u32::MAX), 0, vec![]);
        let CallResponse(_, error, _) = serve_request(request).await;
        assert_eq!(error.unwrap().message, REGISTRY_MALFORMED);
    }

    #[tokio::test]
    async fn test_signature_drift_is_registry_malformed() {
        let handle = register(|_args| Ok(Value::Null));
        let request = CallRequest(
            3,
            CallTarget::Index(handle.index),
            handle.signature.wrapping_add(1),
            vec![],
        );
        let CallResponse(_, error, _) = serve_request(request).await;
        assert_eq!(error.unwrap().message, REGISTRY_MALFORMED);
    }

    #[tokio::test]
    async fn test_thrown_error_propagates() {
        let handle = register(|_args| Err(ErrorValue::msg("Something went wrong")));
        let request = CallRequest(4, CallTarget::Index(handle.index), handle.signature, vec![]);

        let CallResponse(_, error, _) = serve_request(request).await;
        assert_eq!(error.unwrap().message, "Something went wrong");
    }

    #[tokio::test]
    async fn test_panic_becomes_error_response() {
        let handle = register(|_args| -> CallOutcome { panic!("boom") });
        let request = CallRequest(5, CallTarget::Index(handle.index), handle.signature, vec![]);

        let CallResponse(_, error, _) = serve_request(request).await;
        assert_eq!(error.unwrap().message, "boom");
    }

    #[tokio::test]
    async fn test_name_target_resolution() {
        registry::use_exports(
            registry::Exports::new().function("worker_test_named_sum", sum),
        );
        registry::flush_deferred();

        let sig = registry::hash32("worker_test_named_sum");
        let request = CallRequest(
            6,
            CallTarget::Name("worker_test_named_sum".to_string()),
            sig,
            goro_codec::encode_args(&[Value::Int(2), Value::Int(3)]),
        );
        let CallResponse(_, error, result) = serve_request(request).await;
        assert!(error.is_none());
        assert_eq!(decode(result), Value::Int(5));

        // Wrong signature for the name is drift, not a hit
        let request = CallRequest(
            7,
            CallTarget::Name("worker_test_named_sum".to_string()),
            sig.wrapping_add(1),
            vec![],
        );
        let CallResponse(_, error, _) = serve_request(request).await;
        assert_eq!(error.unwrap().message, REGISTRY_MALFORMED);
    }
}
