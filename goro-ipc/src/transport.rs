//! Transport adapters: thread workers and child-process workers
//!
//! Both adapters expose the same capability set (spawn a worker, stream
//! its messages and terminal exit upward, terminate it) and differ only in
//! the spawn mechanism and how startup arguments and worker data reach the
//! other side. Everything above this layer speaks encoded [`Message`]s.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use goro_codec::WireValue;

use crate::error::IpcError;
use crate::protocol::Message;

/// Worker-role marker injected into a child's argv
pub const WORKER_FLAG: &str = "--go-worker=true";
/// Prefix of the worker-id argv token
pub const WORKER_ID_PREFIX: &str = "--worker-id=";
/// Prefix of the worker-data argv token
pub const WORKER_DATA_PREFIX: &str = "--worker-data=";

/// Which concrete adapter a pool runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Thread,
    Process,
}

/// Worker startup bundle, frozen by the pool at spawn time
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub worker_id: u32,
    /// Program the process transport executes; unused by the thread
    /// transport, which shares the parent's image.
    pub program: PathBuf,
    /// The parent's own argv (program name excluded), forwarded so worker
    /// code observes the same startup arguments as the main side.
    pub argv: Vec<String>,
    /// Extra flags appended before the worker tokens
    pub exec_argv: Vec<String>,
    /// Encoded worker data, delivered before the first request
    pub worker_data: Option<WireValue>,
    pub pipe_stdin: bool,
    pub pipe_stdout: bool,
    pub pipe_stderr: bool,
}

/// Terminal exit report for a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    pub code: Option<i32>,
    pub signal: Option<String>,
}

/// Everything a worker link emits upward
#[derive(Debug)]
pub enum LinkEvent {
    Message(Message),
    Exited(WorkerExit),
}

enum Terminator {
    Process { pid: i32 },
    Thread { stop: mpsc::UnboundedSender<()> },
}

/// Live connection to one spawned worker
pub struct WorkerLink {
    pub id: u32,
    outbound: mpsc::UnboundedSender<Message>,
    events: Option<mpsc::UnboundedReceiver<LinkEvent>>,
    terminator: Terminator,
}

impl WorkerLink {
    /// Send a message down to the worker
    pub fn send(&self, message: Message) -> Result<(), IpcError> {
        self.outbound
            .send(message)
            .map_err(|_| IpcError::ChannelClosed)
    }

    /// Clone of the downward sender, for replying off the pool task
    pub fn sender(&self) -> mpsc::UnboundedSender<Message> {
        self.outbound.clone()
    }

    /// The event stream; taken exactly once by the pool's pump
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<LinkEvent>> {
        self.events.take()
    }

    /// Ask the worker to exit. The terminal `Exited` event still arrives on
    /// the event stream; callers wait for it there so replacements never
    /// race a half-dead worker.
    pub fn begin_terminate(&self) -> Result<(), IpcError> {
        match &self.terminator {
            Terminator::Process { pid } => signal::kill(Pid::from_raw(*pid), Signal::SIGTERM)
                .map_err(|e| IpcError::Terminate(e.to_string())),
            Terminator::Thread { stop } => {
                let _ = stop.send(());
                Ok(())
            }
        }
    }
}

/// Capability set shared by both adapters
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    async fn spawn(&self, spec: SpawnSpec) -> Result<WorkerLink, IpcError>;

    /// Whether an exit was the one `begin_terminate` asks for
    fn is_normal_exit(&self, exit: &WorkerExit) -> bool;
}

/// Child-subprocess adapter. The protocol rides newline-delimited JSON on
/// the worker's piped stdin/stdout; stderr follows the spawn spec.
pub struct ProcessTransport;

/// Assemble the child argv: forwarded parent argv, extra flags, then the
/// worker tokens the child detects its role by.
pub(crate) fn worker_args(spec: &SpawnSpec) -> Result<Vec<String>, IpcError> {
    let mut args = spec.argv.clone();
    args.extend(spec.exec_argv.iter().cloned());
    args.push(WORKER_FLAG.to_string());
    args.push(format!("{}{}", WORKER_ID_PREFIX, spec.worker_id));
    if let Some(data) = &spec.worker_data {
        let json = serde_json::to_string(data)?;
        args.push(format!("{}{}", WORKER_DATA_PREFIX, json));
    }
    Ok(args)
}

#[async_trait]
impl Transport for ProcessTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Process
    }

    async fn spawn(&self, spec: SpawnSpec) -> Result<WorkerLink, IpcError> {
        debug!(worker_id = spec.worker_id, program = %spec.program.display(), "spawning worker process");

        let mut cmd = Command::new(&spec.program);
        cmd.args(worker_args(&spec)?)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(if spec.pipe_stderr {
                Stdio::inherit()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| IpcError::Spawn(e.to_string()))?;
        let pid = child
            .id()
            .ok_or_else(|| IpcError::Spawn("child exited before it got a pid".to_string()))?
            as i32;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| IpcError::Spawn("failed to capture child stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| IpcError::Spawn("failed to capture child stdout".to_string()))?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        tokio::spawn(stdin_writer_task(spec.worker_id, stdin, outbound_rx));
        tokio::spawn(stdout_reader_task(spec.worker_id, stdout, event_tx.clone()));
        tokio::spawn(exit_task(spec.worker_id, child, event_tx));

        Ok(WorkerLink {
            id: spec.worker_id,
            outbound: outbound_tx,
            events: Some(event_rx),
            terminator: Terminator::Process { pid },
        })
    }

    fn is_normal_exit(&self, exit: &WorkerExit) -> bool {
        exit.signal.as_deref() == Some("SIGTERM")
    }
}

async fn stdin_writer_task(
    worker_id: u32,
    mut stdin: tokio::process::ChildStdin,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(message) = rx.recv().await {
        let line = match message.to_line() {
            Ok(line) => line,
            Err(e) => {
                error!(worker_id, "failed to serialize message: {}", e);
                continue;
            }
        };

        if let Err(e) = stdin.write_all(format!("{}\n", line).as_bytes()).await {
            // Expected while the worker is going down
            if e.kind() == std::io::ErrorKind::BrokenPipe {
                debug!(worker_id, "stdin closed");
            } else {
                error!(worker_id, "stdin write failed: {}", e);
            }
            break;
        }
        if let Err(e) = stdin.flush().await {
            if e.kind() == std::io::ErrorKind::BrokenPipe {
                debug!(worker_id, "stdin closed during flush");
            } else {
                error!(worker_id, "stdin flush failed: {}", e);
            }
            break;
        }
    }
}

async fn stdout_reader_task(
    worker_id: u32,
    stdout: tokio::process::ChildStdout,
    events: mpsc::UnboundedSender<LinkEvent>,
) {
    let mut reader = BufReader::new(stdout);
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!(worker_id, "stdout closed");
                break;
            }
            Ok(_) => match Message::parse(line.trim_end()) {
                Some(message) => {
                    if events.send(LinkEvent::Message(message)).is_err() {
                        break;
                    }
                }
                None => debug!(worker_id, "dropped unrecognized line"),
            },
            Err(e) => {
                error!(worker_id, "stdout read failed: {}", e);
                break;
            }
        }
    }
}

async fn exit_task(
    worker_id: u32,
    mut child: tokio::process::Child,
    events: mpsc::UnboundedSender<LinkEvent>,
) {
    let exit = match child.wait().await {
        Ok(status) => {
            use std::os::unix::process::ExitStatusExt;
            let signal = status
                .signal()
                .and_then(|n| Signal::try_from(n).ok())
                .map(|s| s.as_str().to_string());
            WorkerExit {
                code: status.code(),
                signal,
            }
        }
        Err(e) => {
            warn!(worker_id, "wait for worker failed: {}", e);
            WorkerExit {
                code: None,
                signal: None,
            }
        }
    };

    debug!(worker_id, ?exit, "worker process exited");
    let _ = events.send(LinkEvent::Exited(exit));
}

/// Environment handed to the body of a thread worker
pub struct ThreadWorkerEnv {
    pub worker_id: u32,
    pub worker_data: Option<WireValue>,
    /// Messages from the parent
    pub inbound: mpsc::UnboundedReceiver<Message>,
    /// Messages back to the parent
    pub outbound: mpsc::UnboundedSender<LinkEvent>,
    /// Fires when the parent terminates this worker
    pub stop: mpsc::UnboundedReceiver<()>,
}

/// What a thread worker runs; returns its exit code
pub type ThreadWorkerBody = Arc<dyn Fn(ThreadWorkerEnv) -> i32 + Send + Sync>;

/// Exit code the thread worker body returns on a terminate request
pub const THREAD_EXIT_TERMINATED: i32 = 1;
/// Exit code reported when a thread worker body panics
pub const THREAD_EXIT_PANICKED: i32 = 101;

/// In-process adapter: each worker is a named OS thread driving the body
/// over in-memory channels. Worker data and argv are shared with the parent
/// by construction.
pub struct ThreadTransport {
    body: ThreadWorkerBody,
}

impl ThreadTransport {
    pub fn new(body: ThreadWorkerBody) -> Self {
        Self { body }
    }
}

#[async_trait]
impl Transport for ThreadTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Thread
    }

    async fn spawn(&self, spec: SpawnSpec) -> Result<WorkerLink, IpcError> {
        debug!(worker_id = spec.worker_id, "spawning worker thread");

        let (outbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = mpsc::unbounded_channel();

        let env = ThreadWorkerEnv {
            worker_id: spec.worker_id,
            worker_data: spec.worker_data.clone(),
            inbound: inbound_rx,
            outbound: event_tx.clone(),
            stop: stop_rx,
        };

        let body = self.body.clone();
        let worker_id = spec.worker_id;
        std::thread::Builder::new()
            .name(format!("goro-worker-{}", worker_id))
            .spawn(move || {
                let outcome =
                    std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| body(env)));
                let code = match outcome {
                    Ok(code) => code,
                    Err(_) => {
                        warn!(worker_id, "worker thread panicked");
                        THREAD_EXIT_PANICKED
                    }
                };
                let _ = event_tx.send(LinkEvent::Exited(WorkerExit {
                    code: Some(code),
                    signal: None,
                }));
            })
            .map_err(|e| IpcError::Spawn(e.to_string()))?;

        Ok(WorkerLink {
            id: worker_id,
            outbound: outbound_tx,
            events: Some(event_rx),
            terminator: Terminator::Thread { stop: stop_tx },
        })
    }

    fn is_normal_exit(&self, exit: &WorkerExit) -> bool {
        exit.code == Some(THREAD_EXIT_TERMINATED)
    }
}

/// Worker-side stdio endpoint for a process worker: returns the sender its
/// runtime writes responses to and the receiver parent messages arrive on.
/// Must be called inside a runtime; the pump tasks live on it.
pub fn stdio_worker_channel() -> (
    mpsc::UnboundedSender<Message>,
    mpsc::UnboundedReceiver<Message>,
) {
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<Message>();

    tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(message) = out_rx.recv().await {
            let line = match message.to_line() {
                Ok(line) => line,
                Err(e) => {
                    error!("failed to serialize outbound message: {}", e);
                    continue;
                }
            };
            if stdout
                .write_all(format!("{}\n", line).as_bytes())
                .await
                .is_err()
            {
                break;
            }
            if stdout.flush().await.is_err() {
                break;
            }
        }
    });

    tokio::spawn(async move {
        let mut reader = BufReader::new(tokio::io::stdin());
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    if let Some(message) = Message::parse(line.trim_end()) {
                        if in_tx.send(message).is_err() {
                            break;
                        }
                    }
                }
                Err(_) => break,
            }
        }
    });

    (out_tx, in_rx)
}
