//! Spawning the kernel process.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};

use crate::error::KernelError;

pub const CONNECTION_FILE_PLACEHOLDER: &str = "{connection_file}";

/// How to start a kernel. `{connection_file}` in `argv` is replaced with the
/// path of the generated connection file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelSpec {
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
}

impl Default for KernelSpec {
    fn default() -> Self {
        Self {
            argv: ["python3", "-m", "ipykernel_launcher", "-f", CONNECTION_FILE_PLACEHOLDER]
                .into_iter()
                .map(String::from)
                .collect(),
            env: Vec::new(),
            cwd: None,
        }
    }
}

impl KernelSpec {
    pub fn from_argv(argv: Vec<String>) -> Self {
        Self {
            argv,
            ..Self::default()
        }
    }

    /// Arguments with the connection file substituted.
    pub fn resolve_argv(&self, connection_file: &Path) -> Result<Vec<String>, KernelError> {
        if self.argv.is_empty() {
            return Err(KernelError::Spawn("kernel argv is empty".into()));
        }
        let file = connection_file.to_string_lossy();
        Ok(self
            .argv
            .iter()
            .map(|arg| arg.replace(CONNECTION_FILE_PLACEHOLDER, &file))
            .collect())
    }

    fn command(&self, connection_file: &Path) -> Result<Command, KernelError> {
        let argv = self.resolve_argv(connection_file)?;
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        cmd.envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        Ok(cmd)
    }
}

/// A running kernel process. Killed when dropped.
#[derive(Debug)]
pub struct KernelProcess {
    child: Child,
    pid: Option<u32>,
}

impl KernelProcess {
    pub fn spawn(spec: &KernelSpec, connection_file: &Path) -> Result<Self, KernelError> {
        let mut cmd = spec.command(connection_file)?;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let program = spec.argv[0].clone();
        let mut child = cmd
            .spawn()
            .map_err(|e| KernelError::Spawn(format!("{program}: {e}")))?;
        let pid = child.id();
        tracing::info!(pid, program = %program, "kernel process started");

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, "stdout", pid));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, "stderr", pid));
        }

        Ok(Self { child, pid })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Exit status if the process has already exited.
    pub fn exit_status(&mut self) -> Result<Option<ExitStatus>, KernelError> {
        Ok(self.child.try_wait()?)
    }

    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    pub async fn wait(&mut self) -> Result<ExitStatus, KernelError> {
        Ok(self.child.wait().await?)
    }

    /// Wait up to `timeout` for the process to exit on its own.
    pub async fn wait_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<ExitStatus>, KernelError> {
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(status) => Ok(Some(status?)),
            Err(_) => Ok(None),
        }
    }

    pub async fn kill(&mut self) -> Result<(), KernelError> {
        self.child.kill().await?;
        Ok(())
    }
}

async fn forward_lines<R: AsyncRead + Unpin>(reader: R, stream: &'static str, pid: Option<u32>) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(pid, stream, "kernel: {line}");
    }
}
