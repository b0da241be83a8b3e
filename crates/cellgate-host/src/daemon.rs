//! Kernel daemon: the single owner of the running kernel.
//!
//! The daemon runs a select loop that:
//! 1. Processes control messages one at a time
//! 2. Handles graceful shutdown
//!
//! Serialising every request through one task keeps executions from
//! interleaving on the kernel's shell and iopub channels.

use std::time::Duration;

use cellgate_kernel::{ExecutionOutcome, KernelInfo};
use cellgate_protocol::KernelState;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::error::HostError;
use crate::kernel::{KernelBackend, KernelLauncher};

pub type Responder<T> = oneshot::Sender<Result<T, HostError>>;

/// Control message for the daemon.
#[derive(Debug)]
pub enum ControlMsg {
    Execute {
        code: String,
        resp: Responder<ExecutionOutcome>,
    },
    KernelInfo {
        resp: Responder<KernelInfo>,
    },
    Health {
        resp: Responder<KernelStatus>,
    },
    /// Replace the running kernel with a fresh one. Answers with the new pid.
    Restart {
        resp: Responder<Option<u32>>,
    },
    Shutdown {
        resp: Responder<()>,
        /// Optional sender to propagate shutdown to the HTTP server.
        shutdown_tx: Option<broadcast::Sender<()>>,
    },
}

/// Snapshot of the kernel published by the daemon after every state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelStatus {
    pub state: KernelState,
    pub pid: Option<u32>,
    /// Last measured heartbeat round trip.
    pub heartbeat: Option<Duration>,
    /// Set only while an `Execute` is in flight. A `Busy` state without it
    /// means the kernel missed its last heartbeat.
    pub running_cell: bool,
}

impl KernelStatus {
    pub fn starting() -> Self {
        Self {
            state: KernelState::Starting,
            pid: None,
            heartbeat: None,
            running_cell: false,
        }
    }

    pub fn dead() -> Self {
        Self {
            state: KernelState::Dead,
            ..Self::starting()
        }
    }
}

pub struct KernelDaemon {
    launcher: Box<dyn KernelLauncher>,
    kernel: Option<Box<dyn KernelBackend>>,
    control_rx: mpsc::Receiver<ControlMsg>,
    shutdown_rx: broadcast::Receiver<()>,
    status_tx: watch::Sender<KernelStatus>,
    shutdown_grace: Duration,
    /// Taken from a `Shutdown` message; answered once the kernel is stopped.
    pending_shutdown: Option<(Responder<()>, Option<broadcast::Sender<()>>)>,
}

impl KernelDaemon {
    /// Launch the first kernel and build the daemon around it.
    ///
    /// Fails if the kernel cannot be started, so a misconfigured server never
    /// starts accepting requests.
    pub async fn start(
        launcher: Box<dyn KernelLauncher>,
        control_rx: mpsc::Receiver<ControlMsg>,
        shutdown_rx: broadcast::Receiver<()>,
        status_tx: watch::Sender<KernelStatus>,
        shutdown_grace: Duration,
    ) -> Result<Self, HostError> {
        status_tx.send_replace(KernelStatus::starting());
        let kernel = match launcher.launch().await {
            Ok(kernel) => kernel,
            Err(err) => {
                status_tx.send_replace(KernelStatus::dead());
                return Err(err.into());
            }
        };
        let daemon = Self {
            launcher,
            kernel: Some(kernel),
            control_rx,
            shutdown_rx,
            status_tx,
            shutdown_grace,
            pending_shutdown: None,
        };
        daemon.publish(KernelState::Idle, None);
        Ok(daemon)
    }

    pub async fn run(&mut self) -> Result<(), HostError> {
        tracing::info!(pid = self.pid(), "kernel daemon started");

        loop {
            tokio::select! {
                msg = self.control_rx.recv() => {
                    match msg {
                        Some(cmd) => {
                            self.apply_control(cmd).await;
                            if self.pending_shutdown.is_some() {
                                tracing::info!("Shutdown requested via control channel");
                                break;
                            }
                        }
                        None => {
                            tracing::debug!("Control channel closed");
                            break;
                        }
                    }
                }

                _ = self.shutdown_rx.recv() => {
                    tracing::info!("Shutdown signal received");
                    break;
                }
            }
        }

        self.stop_kernel().await;
        if let Some((resp, shutdown_tx)) = self.pending_shutdown.take() {
            let _ = resp.send(Ok(()));
            if let Some(tx) = shutdown_tx {
                let _ = tx.send(());
            }
        }
        tracing::info!("kernel daemon stopped");
        Ok(())
    }

    async fn apply_control(&mut self, cmd: ControlMsg) {
        match cmd {
            ControlMsg::Execute { code, resp } => {
                let res = self.execute(&code).await;
                let _ = resp.send(res);
            }
            ControlMsg::KernelInfo { resp } => {
                let res = match self.live_kernel() {
                    Ok(kernel) => kernel.kernel_info().await.map_err(HostError::from),
                    Err(err) => Err(err),
                };
                let _ = resp.send(res);
            }
            ControlMsg::Health { resp } => {
                let _ = resp.send(Ok(self.health().await));
            }
            ControlMsg::Restart { resp } => {
                tracing::info!("Restarting kernel (by request)");
                let _ = resp.send(self.restart().await);
            }
            ControlMsg::Shutdown { resp, shutdown_tx } => {
                self.pending_shutdown = Some((resp, shutdown_tx));
            }
        }
    }

    async fn execute(&mut self, code: &str) -> Result<ExecutionOutcome, HostError> {
        let pid = self.live_kernel()?.pid();
        self.status_tx.send_replace(KernelStatus {
            state: KernelState::Busy,
            pid,
            heartbeat: None,
            running_cell: true,
        });
        tracing::debug!(pid, bytes = code.len(), "executing cell");

        let kernel = self.live_kernel()?;
        let res = kernel.execute(code).await;
        let alive = kernel.is_alive();
        match &res {
            Ok(outcome) => {
                tracing::debug!(pid, status = ?outcome.status, "cell finished");
            }
            Err(err) => tracing::warn!(pid, "execution failed: {err}"),
        }
        let state = if alive {
            KernelState::Idle
        } else {
            tracing::error!(pid, "kernel process exited");
            KernelState::Dead
        };
        self.publish(state, None);
        res.map_err(HostError::from)
    }

    async fn health(&mut self) -> KernelStatus {
        let Some(kernel) = self.kernel.as_mut() else {
            return self.publish(KernelState::Dead, None);
        };
        if !kernel.is_alive() {
            return self.publish(KernelState::Dead, None);
        }
        match kernel.heartbeat().await {
            Ok(rtt) => self.publish(KernelState::Idle, Some(rtt)),
            Err(err) => {
                // A running process that misses a heartbeat is wedged rather than
                // gone. Health keeps asking, so a later exit is still seen.
                tracing::warn!(pid = kernel.pid(), "heartbeat failed: {err}");
                self.publish(KernelState::Busy, None)
            }
        }
    }

    async fn restart(&mut self) -> Result<Option<u32>, HostError> {
        self.stop_kernel().await;
        self.status_tx.send_replace(KernelStatus::starting());
        match self.launcher.launch().await {
            Ok(kernel) => {
                self.kernel = Some(kernel);
                let status = self.publish(KernelState::Idle, None);
                tracing::info!(pid = status.pid, "kernel restarted");
                Ok(status.pid)
            }
            Err(err) => {
                tracing::error!("kernel restart failed: {err}");
                self.publish(KernelState::Dead, None);
                Err(err.into())
            }
        }
    }

    async fn stop_kernel(&mut self) {
        let Some(kernel) = self.kernel.take() else {
            return;
        };
        let pid = kernel.pid();
        if let Err(err) = kernel.shutdown(self.shutdown_grace).await {
            tracing::warn!(pid, "kernel shutdown failed: {err}");
        }
        self.publish(KernelState::Dead, None);
    }

    fn live_kernel(&mut self) -> Result<&mut Box<dyn KernelBackend>, HostError> {
        let Some(kernel) = self.kernel.as_mut() else {
            return Err(HostError::unavailable("no kernel is running"));
        };
        if !kernel.is_alive() {
            return Err(HostError::unavailable(
                "kernel process has exited; restart it via POST /api/kernel/restart",
            ));
        }
        Ok(kernel)
    }

    fn pid(&self) -> Option<u32> {
        self.kernel.as_ref().and_then(|k| k.pid())
    }

    fn publish(&self, state: KernelState, heartbeat: Option<Duration>) -> KernelStatus {
        let status = KernelStatus {
            state,
            pid: self.pid(),
            heartbeat,
            running_cell: false,
        };
        self.status_tx.send_replace(status);
        status
    }
}
