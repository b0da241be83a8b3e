//! A launched kernel: process, connection file and connected client together.

use std::path::PathBuf;
use std::time::Duration;

use tokio::time::Instant;

use crate::client::{ExecuteTimeouts, ExecutionOutcome, KernelClient, KernelInfo};
use crate::connection::ConnectionInfo;
use crate::error::KernelError;
use crate::launcher::{KernelProcess, KernelSpec};
use crate::wire::Session;

/// Everything needed to launch and talk to a kernel.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    pub spec: KernelSpec,
    pub kernel_name: String,
    /// Address the kernel binds its sockets on.
    pub ip: String,
    /// Directory for connection files.
    pub runtime_dir: PathBuf,
    pub startup_timeout: Duration,
    pub timeouts: ExecuteTimeouts,
    pub heartbeat_timeout: Duration,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            spec: KernelSpec::default(),
            kernel_name: "python3".into(),
            ip: "127.0.0.1".into(),
            runtime_dir: std::env::temp_dir().join("cellgate"),
            startup_timeout: Duration::from_secs(60),
            timeouts: ExecuteTimeouts::default(),
            heartbeat_timeout: Duration::from_secs(3),
        }
    }
}

pub struct Kernel {
    process: KernelProcess,
    client: KernelClient,
    connection_file: PathBuf,
    timeouts: ExecuteTimeouts,
    heartbeat_timeout: Duration,
}

impl Kernel {
    /// Start a kernel and wait until it answers `kernel_info_request`.
    pub async fn launch(config: &KernelConfig) -> Result<Self, KernelError> {
        let info = ConnectionInfo::allocate(&config.ip, &config.kernel_name)?;
        let connection_file = info.write_to(&config.runtime_dir)?;
        tracing::debug!(file = %connection_file.display(), "wrote connection file");

        let mut process = match KernelProcess::spawn(&config.spec, &connection_file) {
            Ok(process) => process,
            Err(err) => {
                let _ = std::fs::remove_file(&connection_file);
                return Err(err);
            }
        };

        let ready = tokio::select! {
            res = tokio::time::timeout(config.startup_timeout, wait_ready(info)) => {
                res.unwrap_or(Err(KernelError::StartupTimeout(config.startup_timeout)))
            }
            status = process.wait() => {
                Err(KernelError::Exited(status.ok().and_then(|s| s.code())))
            }
        };

        match ready {
            Ok((client, kernel_info)) => {
                tracing::info!(
                    pid = process.pid(),
                    implementation = %kernel_info.implementation,
                    language = %kernel_info.language,
                    "kernel ready"
                );
                Ok(Self::from_parts(process, client, connection_file, config))
            }
            Err(err) => {
                let _ = process.kill().await;
                let _ = std::fs::remove_file(&connection_file);
                Err(err)
            }
        }
    }

    /// Wrap an already running process and a client connected to it. The
    /// connection file is removed when the kernel is dropped.
    pub fn from_parts(
        process: KernelProcess,
        client: KernelClient,
        connection_file: PathBuf,
        config: &KernelConfig,
    ) -> Self {
        Self {
            process,
            client,
            connection_file,
            timeouts: config.timeouts,
            heartbeat_timeout: config.heartbeat_timeout,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    pub fn connection_file(&self) -> &PathBuf {
        &self.connection_file
    }

    pub fn is_alive(&mut self) -> bool {
        self.process.is_running()
    }

    pub async fn execute(&mut self, code: &str) -> Result<ExecutionOutcome, KernelError> {
        self.client.execute(code, self.timeouts).await
    }

    pub async fn kernel_info(&mut self) -> Result<KernelInfo, KernelError> {
        self.client.kernel_info(self.timeouts.shell).await
    }

    pub async fn heartbeat(&mut self) -> Result<Duration, KernelError> {
        self.client.heartbeat(self.heartbeat_timeout).await
    }

    /// Ask the kernel to exit, then kill it if it is still running after `grace`.
    ///
    /// `grace` covers both the `shutdown_reply` and the process exit.
    pub async fn shutdown(mut self, grace: Duration) -> Result<(), KernelError> {
        if self.process.is_running() {
            let deadline = Instant::now() + grace;
            if let Err(err) = self.client.shutdown(false, grace).await {
                tracing::warn!("shutdown_request failed: {err}");
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if self.process.wait_timeout(remaining).await?.is_none() {
                tracing::warn!(pid = self.pid(), "kernel ignored shutdown request; killing");
                self.process.kill().await?;
            }
        }
        tracing::info!(pid = self.pid(), "kernel stopped");
        Ok(())
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.connection_file);
    }
}

/// Connect and issue `kernel_info_request` until the kernel answers and its
/// iopub traffic reaches us.
///
/// Connecting can fail while the kernel has not bound its sockets yet, so
/// failures are retried until the caller's timeout fires.
async fn wait_ready(info: ConnectionInfo) -> Result<(KernelClient, KernelInfo), KernelError> {
    let session = Session::default();
    loop {
        match KernelClient::connect(info.clone(), session.clone()).await {
            Ok(mut client) => loop {
                match client.kernel_info(Duration::from_secs(2)).await {
                    Ok(kernel_info) => {
                        // The kernel publishes status for every request; seeing
                        // it means our iopub subscription has reached the kernel.
                        if client.drain_iopub(Duration::from_millis(500)).await? > 0 {
                            return Ok((client, kernel_info));
                        }
                        tracing::debug!("no iopub traffic yet; asking again");
                    }
                    Err(err) => {
                        tracing::debug!("kernel not ready yet: {err}");
                        break;
                    }
                }
            },
            Err(err) => tracing::debug!("kernel channels not reachable yet: {err}"),
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}
