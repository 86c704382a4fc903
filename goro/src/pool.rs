//! The worker pool: spawn, ready gating, dispatch, replacement, teardown
//!
//! All mutable pool state lives on one supervisor task that consumes a
//! merged stream of facade commands and per-worker link events. Workers
//! advance their slot's tick instant with every TICK; dispatch reads those
//! instants; an unexpected exit triggers an immediate replacement with the
//! options frozen at start.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use goro_codec::{ErrorValue, WireValue};
use goro_ipc::{
    CallRequest, CallResponse, CallTarget, LinkEvent, Message, ProcessTransport, SpawnSpec,
    ThreadTransport, Transport, TransportKind, Uid, WorkerExit, WorkerLink, TICK,
};

use crate::dispatch::{self, DispatchMethod};
use crate::entry;
use crate::error::{GoroError, REGISTRY_MALFORMED};
use crate::options::GoroOptions;
use crate::registry;
use crate::worker;

/// Builtin name target a worker queries the parent's pool size with
pub(crate) const WORKERS_TARGET: &str = "goro.workers";

/// Next uid on this side's stream. Monotonic for the process lifetime; the
/// round-robin walk takes these modulo the pool size.
pub(crate) fn next_uid() -> Uid {
    static NEXT_UID: AtomicU64 = AtomicU64::new(0);
    NEXT_UID.fetch_add(1, Ordering::Relaxed)
}

fn warn_local_once() {
    static WARNED: Once = Once::new();
    WARNED.call_once(|| {
        warn!("goro pool is empty; calls run on the main side");
    });
}

/// Counters surfaced by [`crate::Goro::stats`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub workers: usize,
    pub calls_served: u64,
    pub calls_failed: u64,
    pub replacements: u64,
    pub per_worker: Vec<WorkerStatus>,
}

/// Live snapshot of one worker slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStatus {
    pub id: u32,
    pub calls_served: u64,
    pub calls_failed: u64,
    /// Time since the worker's latest liveness tick
    pub last_tick_age: Duration,
}

pub(crate) enum DispatchOutcome {
    /// Sent to a worker; the receiver settles with its response
    Sent(oneshot::Receiver<Result<WireValue, GoroError>>),
    /// Pool is empty: the caller runs the call on the main side
    Local,
}

enum Command {
    Dispatch {
        target: CallTarget,
        sig: u32,
        args: Vec<WireValue>,
        reply: oneshot::Sender<DispatchOutcome>,
    },
    Workers {
        reply: oneshot::Sender<usize>,
    },
    Stats {
        reply: oneshot::Sender<PoolStats>,
    },
    Terminate {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to a running pool supervisor
#[derive(Clone)]
pub(crate) struct PoolClient {
    commands: mpsc::UnboundedSender<Command>,
}

impl PoolClient {
    pub(crate) async fn dispatch(
        &self,
        target: CallTarget,
        sig: u32,
        args: Vec<WireValue>,
    ) -> Result<DispatchOutcome, GoroError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Dispatch {
                target,
                sig,
                args,
                reply: tx,
            })
            .map_err(|_| GoroError::NotRunning)?;
        rx.await.map_err(|_| GoroError::NotRunning)
    }

    pub(crate) async fn workers(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Workers { reply: tx }).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub(crate) async fn stats(&self) -> PoolStats {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Stats { reply: tx }).is_err() {
            return PoolStats::default();
        }
        rx.await.unwrap_or_default()
    }

    pub(crate) async fn terminate(&self) -> Result<(), GoroError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Terminate { reply: tx })
            .map_err(|_| GoroError::NotRunning)?;
        rx.await.map_err(|_| GoroError::NotRunning)
    }
}

struct WorkerSlot {
    id: u32,
    link: WorkerLink,
    last_tick: Instant,
    served: u64,
    failed: u64,
}

struct PendingCall {
    worker: u32,
    reply: oneshot::Sender<Result<WireValue, GoroError>>,
}

struct Supervisor {
    transport: Arc<dyn Transport>,
    method: DispatchMethod,
    max_workers: usize,
    base_spec: SpawnSpec,
    next_worker_id: u32,
    slots: Vec<WorkerSlot>,
    pending: HashMap<Uid, PendingCall>,
    terminating: bool,
    stats: PoolStats,
    events_tx: mpsc::UnboundedSender<(u32, LinkEvent)>,
    events_rx: mpsc::UnboundedReceiver<(u32, LinkEvent)>,
}

/// Start a pool per the options: spawn the eager minimum, then hand the
/// supervisor loop to its own task.
pub(crate) async fn start(options: GoroOptions) -> Result<PoolClient, GoroError> {
    let transport: Arc<dyn Transport> = match options.adapter {
        TransportKind::Thread => Arc::new(ThreadTransport::new(Arc::new(
            worker::thread_worker_body,
        ))),
        TransportKind::Process => Arc::new(ProcessTransport),
    };
    start_with_transport(options, transport).await
}

pub(crate) async fn start_with_transport(
    options: GoroOptions,
    transport: Arc<dyn Transport>,
) -> Result<PoolClient, GoroError> {
    options.workers.validate()?;

    let program = match options.adapter {
        TransportKind::Process => entry::resolve_entry(options.filename.as_deref())?,
        TransportKind::Thread => std::path::PathBuf::new(),
    };

    let base_spec = SpawnSpec {
        worker_id: 0,
        program,
        argv: std::env::args().skip(1).collect(),
        exec_argv: options.exec_argv.clone(),
        worker_data: options.worker_data.as_ref().map(goro_codec::encode),
        pipe_stdin: options.stdin,
        pipe_stdout: options.stdout,
        pipe_stderr: options.stderr,
    };

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();

    let mut supervisor = Supervisor {
        transport,
        method: options.effective_method(),
        max_workers: options.workers.max(),
        base_spec,
        next_worker_id: 1,
        slots: Vec::new(),
        pending: HashMap::new(),
        terminating: false,
        stats: PoolStats::default(),
        events_tx,
        events_rx,
    };

    for _ in 0..options.workers.min() {
        supervisor.spawn_worker().await?;
    }
    info!(workers = supervisor.slots.len(), "goro pool started");

    tokio::spawn(supervisor.run(commands_rx));

    Ok(PoolClient {
        commands: commands_tx,
    })
}

impl Supervisor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    // Every facade handle is gone
                    None => break,
                },
                Some((id, event)) = self.events_rx.recv() => {
                    self.handle_event(id, event).await;
                }
            }
        }
        debug!("pool supervisor stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Dispatch {
                target,
                sig,
                args,
                reply,
            } => {
                let outcome = self.dispatch(target, sig, args).await;
                let _ = reply.send(outcome);
            }
            Command::Workers { reply } => {
                let _ = reply.send(self.slots.len());
            }
            Command::Stats { reply } => {
                let now = Instant::now();
                let mut stats = self.stats.clone();
                stats.workers = self.slots.len();
                stats.per_worker = self
                    .slots
                    .iter()
                    .map(|slot| WorkerStatus {
                        id: slot.id,
                        calls_served: slot.served,
                        calls_failed: slot.failed,
                        last_tick_age: now.duration_since(slot.last_tick),
                    })
                    .collect();
                let _ = reply.send(stats);
            }
            Command::Terminate { reply } => {
                self.terminate().await;
                let _ = reply.send(());
            }
        }
    }

    async fn handle_event(&mut self, id: u32, event: LinkEvent) {
        match event {
            LinkEvent::Message(message) => self.handle_message(id, message).await,
            LinkEvent::Exited(exit) => self.handle_exit(id, exit).await,
        }
    }

    async fn dispatch(
        &mut self,
        target: CallTarget,
        sig: u32,
        args: Vec<WireValue>,
    ) -> DispatchOutcome {
        if self.slots.is_empty() {
            warn_local_once();
            return DispatchOutcome::Local;
        }

        let uid = next_uid();
        let now = Instant::now();
        let ticks: Vec<Instant> = self.slots.iter().map(|s| s.last_tick).collect();
        let at_max = self.slots.len() >= self.max_workers;

        let selection = match dispatch::select_worker(&ticks, self.method, at_max, uid, now) {
            Some(selection) => selection,
            None => {
                warn_local_once();
                return DispatchOutcome::Local;
            }
        };

        let mut index = selection.index;
        if selection.stale && self.slots.len() < self.max_workers {
            debug!(worker = self.slots[index].id, "chosen worker is stale, scaling up");
            match self.spawn_worker().await {
                Ok(()) => index = self.slots.len() - 1,
                Err(e) => warn!("scale-up failed, keeping the stale pick: {}", e),
            }
        }

        let slot = &self.slots[index];
        let (tx, rx) = oneshot::channel();
        let message = Message::Request(CallRequest(uid, target, sig, args));
        if slot.link.send(message).is_err() {
            // The exit event is on its way; fail this call now
            let _ = tx.send(Err(GoroError::WorkerDied));
            return DispatchOutcome::Sent(rx);
        }

        self.pending.insert(
            uid,
            PendingCall {
                worker: slot.id,
                reply: tx,
            },
        );
        DispatchOutcome::Sent(rx)
    }

    async fn handle_message(&mut self, id: u32, message: Message) {
        match message {
            Message::Control(token) => {
                if token == TICK {
                    if let Some(slot) = self.slots.iter_mut().find(|s| s.id == id) {
                        slot.last_tick = Instant::now();
                    }
                }
            }
            Message::Response(CallResponse(uid, error, result)) => {
                match self.pending.remove(&uid) {
                    Some(pending) => {
                        self.stats.calls_served += 1;
                        if let Some(slot) = self.slots.iter_mut().find(|s| s.id == id) {
                            slot.served += 1;
                            if error.is_some() {
                                slot.failed += 1;
                            }
                        }
                        let outcome = match error {
                            Some(error) => {
                                self.stats.calls_failed += 1;
                                Err(GoroError::Call(error))
                            }
                            None => Ok(result),
                        };
                        let _ = pending.reply.send(outcome);
                    }
                    None => debug!(worker = id, uid, "response for unknown call"),
                }
            }
            Message::Request(request) => self.serve_worker_request(id, request),
        }
    }

    /// The symmetric half: a worker may send a request up to its parent.
    /// The pool-size builtin answers inline; anything else resolves against
    /// the main side's registry, off the supervisor task.
    fn serve_worker_request(&mut self, id: u32, request: CallRequest) {
        let Some(slot) = self.slots.iter().find(|s| s.id == id) else {
            return;
        };
        let sender = slot.link.sender();

        if let CallTarget::Name(name) = request.target() {
            if name == WORKERS_TARGET {
                let response = if registry::hash32(name) == request.sig() {
                    CallResponse::ok(request.uid(), WireValue::Int(self.slots.len() as i64))
                } else {
                    CallResponse::err(request.uid(), ErrorValue::msg(REGISTRY_MALFORMED))
                };
                let _ = sender.send(Message::Response(response));
                return;
            }
        }

        tokio::spawn(async move {
            let response = worker::serve_request(request).await;
            let _ = sender.send(Message::Response(response));
        });
    }

    async fn handle_exit(&mut self, id: u32, exit: WorkerExit) {
        let normal = self.terminating || self.transport.is_normal_exit(&exit);
        self.reap(id, &exit);
        if normal {
            return;
        }

        warn!(worker = id, ?exit, "worker died unexpectedly, spawning replacement");
        self.stats.replacements += 1;
        if let Err(e) = self.spawn_worker().await {
            error!("failed to replace worker {}: {}", id, e);
        }
    }

    /// Remove the slot and reject every pending call it owned
    fn reap(&mut self, id: u32, exit: &WorkerExit) {
        let Some(position) = self.slots.iter().position(|s| s.id == id) else {
            return;
        };
        self.slots.remove(position);
        debug!(worker = id, ?exit, "worker reaped");

        let lost: Vec<Uid> = self
            .pending
            .iter()
            .filter(|(_, p)| p.worker == id)
            .map(|(uid, _)| *uid)
            .collect();
        for uid in lost {
            if let Some(pending) = self.pending.remove(&uid) {
                self.stats.calls_failed += 1;
                let _ = pending.reply.send(Err(GoroError::WorkerDied));
            }
        }
    }

    async fn spawn_worker(&mut self) -> Result<(), GoroError> {
        let mut spec = self.base_spec.clone();
        spec.worker_id = self.next_worker_id;
        self.next_worker_id += 1;
        let id = spec.worker_id;

        let mut link = self
            .transport
            .spawn(spec)
            .await
            .map_err(|e| GoroError::SpawnFailed(e.to_string()))?;
        let mut events = link
            .take_events()
            .ok_or_else(|| GoroError::SpawnFailed("event stream unavailable".to_string()))?;

        // Ready gate: the first non-TICK message marks the worker live;
        // dying in the gate is a failed start.
        loop {
            match events.recv().await {
                Some(LinkEvent::Message(message)) if message.is_tick() => continue,
                Some(LinkEvent::Message(_)) => break,
                Some(LinkEvent::Exited(exit)) => {
                    return Err(GoroError::SpawnFailed(format!(
                        "worker {} exited during startup: {:?}",
                        id, exit
                    )));
                }
                None => {
                    return Err(GoroError::SpawnFailed(
                        "worker went away during startup".to_string(),
                    ));
                }
            }
        }

        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if events_tx.send((id, event)).is_err() {
                    break;
                }
            }
        });

        debug!(worker = id, "worker ready");
        self.slots.push(WorkerSlot {
            id,
            link,
            last_tick: Instant::now(),
            served: 0,
            failed: 0,
        });
        Ok(())
    }

    /// Terminate every worker concurrently and wait for each exit event, so
    /// later spawns never race a half-dead worker.
    async fn terminate(&mut self) {
        self.terminating = true;
        info!(workers = self.slots.len(), "terminating pool");

        for slot in &self.slots {
            if let Err(e) = slot.link.begin_terminate() {
                warn!(worker = slot.id, "terminate request failed: {}", e);
            }
        }

        while !self.slots.is_empty() {
            match self.events_rx.recv().await {
                Some((id, LinkEvent::Exited(exit))) => self.reap(id, &exit),
                Some((id, LinkEvent::Message(message))) => self.handle_message(id, message).await,
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use goro_ipc::{ThreadWorkerEnv, THREAD_EXIT_TERMINATED};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn thread_options(workers: usize) -> GoroOptions {
        GoroOptions::default().with_workers(workers)
    }

    // Serves every request with Int(base + uid) until stopped.
    fn serving_body(env: &mut ThreadWorkerEnv, base: i64) -> i32 {
        loop {
            if env.stop.try_recv().is_ok() {
                return THREAD_EXIT_TERMINATED;
            }
            match env.inbound.try_recv() {
                Ok(Message::Request(request)) => {
                    let response = CallResponse::ok(
                        request.uid(),
                        WireValue::Int(base + request.uid() as i64),
                    );
                    let _ = env
                        .outbound
                        .send(LinkEvent::Message(Message::Response(response)));
                }
                Ok(_) => {}
                Err(mpsc::error::TryRecvError::Empty) => {
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(mpsc::error::TryRecvError::Disconnected) => return 0,
            }
        }
    }

    async fn wait_for<F: Fn(&PoolStats) -> bool>(client: &PoolClient, predicate: F) -> PoolStats {
        for _ in 0..500 {
            let stats = client.stats().await;
            if predicate(&stats) {
                return stats;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("pool never reached the expected state");
    }

    #[tokio::test]
    async fn test_unexpected_exit_is_replaced() {
        let spawned = Arc::new(AtomicUsize::new(0));
        let body_spawned = spawned.clone();
        let transport = Arc::new(ThreadTransport::new(Arc::new(
            move |mut env: ThreadWorkerEnv| {
                let instance = body_spawned.fetch_add(1, Ordering::SeqCst);
                let _ = env.outbound.send(LinkEvent::Message(Message::ready()));
                if instance == 0 {
                    // First incarnation dies right away with a non-normal code
                    return 0;
                }
                serving_body(&mut env, 100)
            },
        )));

        let client = start_with_transport(thread_options(1), transport)
            .await
            .unwrap();

        let stats = wait_for(&client, |s| s.replacements == 1 && s.workers == 1).await;
        assert_eq!(stats.replacements, 1);
        assert_eq!(spawned.load(Ordering::SeqCst), 2);

        client.terminate().await.unwrap();
        assert_eq!(client.workers().await, 0);
    }

    #[tokio::test]
    async fn test_pending_call_rejected_when_worker_dies() {
        let spawned = Arc::new(AtomicUsize::new(0));
        let body_spawned = spawned.clone();
        let transport = Arc::new(ThreadTransport::new(Arc::new(
            move |mut env: ThreadWorkerEnv| {
                let instance = body_spawned.fetch_add(1, Ordering::SeqCst);
                let _ = env.outbound.send(LinkEvent::Message(Message::ready()));
                if instance == 0 {
                    // Take one request and die without answering it
                    loop {
                        match env.inbound.try_recv() {
                            Ok(Message::Request(_)) => return 3,
                            Ok(_) => {}
                            Err(mpsc::error::TryRecvError::Empty) => {
                                std::thread::sleep(Duration::from_millis(1));
                            }
                            Err(mpsc::error::TryRecvError::Disconnected) => return 0,
                        }
                    }
                }
                serving_body(&mut env, 0)
            },
        )));

        let client = start_with_transport(thread_options(1), transport)
            .await
            .unwrap();

        let outcome = client
            .dispatch(CallTarget::Index(0), 0, vec![])
            .await
            .unwrap();
        let DispatchOutcome::Sent(receiver) = outcome else {
            panic!("expected a dispatched call");
        };
        let result = receiver.await.unwrap();
        assert!(matches!(result, Err(GoroError::WorkerDied)));

        // The replacement serves the next call
        let stats = wait_for(&client, |s| s.replacements == 1 && s.workers == 1).await;
        assert_eq!(stats.replacements, 1);

        let outcome = client
            .dispatch(CallTarget::Index(0), 0, vec![])
            .await
            .unwrap();
        let DispatchOutcome::Sent(receiver) = outcome else {
            panic!("expected a dispatched call");
        };
        assert!(receiver.await.unwrap().is_ok());

        client.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_terminate_drains_the_pool() {
        let transport = Arc::new(ThreadTransport::new(Arc::new(
            |mut env: ThreadWorkerEnv| {
                let _ = env.outbound.send(LinkEvent::Message(Message::ready()));
                serving_body(&mut env, 0)
            },
        )));

        let client = start_with_transport(thread_options(3), transport)
            .await
            .unwrap();
        assert_eq!(client.workers().await, 3);

        client.terminate().await.unwrap();
        assert_eq!(client.workers().await, 0);

        // No replacements for a requested shutdown
        assert_eq!(client.stats().await.replacements, 0);
    }

    #[tokio::test]
    async fn test_empty_pool_dispatch_goes_local() {
        let transport = Arc::new(ThreadTransport::new(Arc::new(
            |mut env: ThreadWorkerEnv| {
                let _ = env.outbound.send(LinkEvent::Message(Message::ready()));
                serving_body(&mut env, 0)
            },
        )));

        let client = start_with_transport(thread_options(1), transport)
            .await
            .unwrap();
        client.terminate().await.unwrap();

        let outcome = client
            .dispatch(CallTarget::Index(0), 0, vec![])
            .await
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::Local));
    }

    #[tokio::test]
    async fn test_per_worker_counters() {
        let transport = Arc::new(ThreadTransport::new(Arc::new(
            |mut env: ThreadWorkerEnv| {
                let _ = env.outbound.send(LinkEvent::Message(Message::ready()));
                serving_body(&mut env, 0)
            },
        )));

        let client = start_with_transport(thread_options(1), transport)
            .await
            .unwrap();

        for _ in 0..3 {
            let outcome = client
                .dispatch(CallTarget::Index(0), 0, vec![])
                .await
                .unwrap();
            let DispatchOutcome::Sent(receiver) = outcome else {
                panic!("expected a dispatched call");
            };
            receiver.await.unwrap().unwrap();
        }

        let stats = client.stats().await;
        assert_eq!(stats.per_worker.len(), 1);
        assert_eq!(stats.per_worker[0].calls_served, 3);
        assert_eq!(stats.per_worker[0].calls_failed, 0);

        client.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_uid_stream_is_unique() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(next_uid()));
        }
    }
}
