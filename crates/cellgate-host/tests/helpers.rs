#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cellgate_host::daemon::{ControlMsg, KernelDaemon, KernelStatus};
use cellgate_host::error::HostError;
use cellgate_host::http::{self, HttpState};
use cellgate_host::kernel::{KernelBackend, KernelLauncher};
use cellgate_kernel::{Channel, ExecutionOutcome, KernelError, KernelInfo, ReplyStatus};
use cellgate_protocol::KernelState;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

/// Shared view into every kernel a [`StubLauncher`] has produced.
#[derive(Default)]
pub struct Recorder {
    pub executed: Mutex<Vec<String>>,
    pub launches: AtomicU32,
    pub shutdowns: AtomicUsize,
    pub fail_launch: AtomicBool,
    /// Cleared to simulate the current kernel process dying.
    pub alive: AtomicBool,
    /// Makes every heartbeat time out, as a wedged kernel would.
    pub heartbeat_fails: AtomicBool,
    pub in_flight: AtomicUsize,
    pub overlapped: AtomicBool,
}

impl Recorder {
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

/// Scripted kernel:
///
/// - `raise` fails inside the cell (status `error`, traceback as output)
/// - `slow` takes 300ms
/// - `hang` times out on the shell channel
/// - anything else prints `ran: <code>`
pub struct StubKernel {
    pid: u32,
    count: u32,
    recorder: Arc<Recorder>,
}

#[async_trait]
impl KernelBackend for StubKernel {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn is_alive(&mut self) -> bool {
        self.recorder.alive.load(Ordering::SeqCst)
    }

    async fn execute(&mut self, code: &str) -> Result<ExecutionOutcome, KernelError> {
        if self.recorder.in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
            self.recorder.overlapped.store(true, Ordering::SeqCst);
        }
        self.recorder.executed.lock().unwrap().push(code.to_string());
        let res = match code {
            "hang" => Err(KernelError::Timeout {
                channel: Channel::Shell,
                timeout: Duration::from_secs(10),
            }),
            "raise" => {
                self.count += 1;
                Ok(ExecutionOutcome {
                    output: "Traceback (most recent call last):\nValueError: nope".into(),
                    status: ReplyStatus::Error,
                    execution_count: Some(self.count),
                })
            }
            _ => {
                if code == "slow" {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                }
                self.count += 1;
                Ok(ExecutionOutcome {
                    output: format!("ran: {code}\n"),
                    status: ReplyStatus::Ok,
                    execution_count: Some(self.count),
                })
            }
        };
        self.recorder.in_flight.fetch_sub(1, Ordering::SeqCst);
        res
    }

    async fn kernel_info(&mut self) -> Result<KernelInfo, KernelError> {
        Ok(KernelInfo {
            protocol_version: "5.3".into(),
            implementation: "stub".into(),
            implementation_version: "0.0.1".into(),
            language: "python".into(),
            language_version: "3.12".into(),
            banner: "stub kernel".into(),
        })
    }

    async fn heartbeat(&mut self) -> Result<Duration, KernelError> {
        if self.recorder.heartbeat_fails.load(Ordering::SeqCst) {
            return Err(KernelError::Timeout {
                channel: Channel::Heartbeat,
                timeout: Duration::from_secs(3),
            });
        }
        Ok(Duration::from_millis(2))
    }

    async fn shutdown(self: Box<Self>, _grace: Duration) -> Result<(), KernelError> {
        self.recorder.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out [`StubKernel`]s with pids 1, 2, 3, ...
pub struct StubLauncher {
    pub recorder: Arc<Recorder>,
}

#[async_trait]
impl KernelLauncher for StubLauncher {
    async fn launch(&self) -> Result<Box<dyn KernelBackend>, KernelError> {
        if self.recorder.fail_launch.load(Ordering::SeqCst) {
            return Err(KernelError::Spawn("stub launcher told to fail".into()));
        }
        let pid = self.recorder.launches.fetch_add(1, Ordering::SeqCst) + 1;
        self.recorder.alive.store(true, Ordering::SeqCst);
        Ok(Box::new(StubKernel {
            pid,
            count: 0,
            recorder: self.recorder.clone(),
        }))
    }
}

/// A running [`KernelDaemon`] over stub kernels, plus the handles an HTTP
/// server would hold.
pub struct DaemonHarness {
    pub state: HttpState,
    pub recorder: Arc<Recorder>,
    pub daemon: JoinHandle<Result<(), HostError>>,
}

impl DaemonHarness {
    pub async fn start() -> Self {
        Self::try_start(Arc::new(Recorder::default()))
            .await
            .expect("daemon start")
    }

    pub async fn try_start(recorder: Arc<Recorder>) -> Result<Self, HostError> {
        let (control_tx, control_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let (status_tx, status_rx) = watch::channel(KernelStatus::starting());
        let launcher = StubLauncher {
            recorder: recorder.clone(),
        };
        let mut daemon = KernelDaemon::start(
            Box::new(launcher),
            control_rx,
            shutdown_rx,
            status_tx,
            Duration::from_millis(100),
        )
        .await?;
        let daemon = tokio::spawn(async move { daemon.run().await });
        Ok(Self {
            state: HttpState::new(control_tx, status_rx, shutdown_tx),
            recorder,
            daemon,
        })
    }

    pub fn status(&self) -> KernelStatus {
        self.state.status()
    }
}

/// Status channel for tests that answer control messages by hand.
pub fn idle_status() -> (watch::Sender<KernelStatus>, watch::Receiver<KernelStatus>) {
    watch::channel(KernelStatus {
        state: KernelState::Idle,
        pid: Some(7),
        heartbeat: None,
        running_cell: false,
    })
}

/// Serve the full application on an ephemeral port.
pub async fn spawn_app(state: HttpState, docs: bool) -> (SocketAddr, JoinHandle<()>) {
    let app = http::app(state, docs);
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0))
        .await
        .expect("bind listener");
    let addr: SocketAddr = listener.local_addr().expect("local addr");
    let server = tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    (addr, server)
}

/// Stub daemon that answers exactly one control message with `answer`.
pub fn answer_once(
    mut control_rx: mpsc::Receiver<ControlMsg>,
    answer: impl FnOnce(ControlMsg) + Send + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let msg = control_rx.recv().await.expect("control message");
        answer(msg);
    })
}
