//! Command-line options. Every option can also be set through a `CELLGATE_*`
//! environment variable (or a `.env` file).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use cellgate_kernel::{ExecuteTimeouts, KernelConfig, KernelSpec};
use clap::{Args, Parser, Subcommand};

use crate::config::{HostConfig, HttpServerConfig};

#[derive(Parser, Debug)]
#[command(name = "cellgate", version, about = "HTTP gateway to a Jupyter kernel")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start a kernel and serve it over HTTP
    Serve(ServeArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Address to listen on (env: CELLGATE_BIND)
    #[arg(long, env = "CELLGATE_BIND", default_value = "127.0.0.1:8000")]
    pub bind: SocketAddr,

    /// Kernel command line, split on whitespace; `{connection_file}` is
    /// replaced with the connection file path (env: CELLGATE_KERNEL_ARGV)
    #[arg(
        long,
        env = "CELLGATE_KERNEL_ARGV",
        default_value = "python3 -m ipykernel_launcher -f {connection_file}"
    )]
    pub kernel_argv: String,

    /// Kernel name recorded in the connection file (env: CELLGATE_KERNEL_NAME)
    #[arg(long, env = "CELLGATE_KERNEL_NAME", default_value = "python3")]
    pub kernel_name: String,

    /// Address the kernel binds its channels on (env: CELLGATE_KERNEL_IP)
    #[arg(long, env = "CELLGATE_KERNEL_IP", default_value = "127.0.0.1")]
    pub kernel_ip: String,

    /// Directory for connection files (env: CELLGATE_RUNTIME_DIR, default: <tmp>/cellgate)
    #[arg(long, env = "CELLGATE_RUNTIME_DIR")]
    pub runtime_dir: Option<PathBuf>,

    /// How long to wait for `execute_reply` (env: CELLGATE_SHELL_TIMEOUT_MS)
    #[arg(long, env = "CELLGATE_SHELL_TIMEOUT_MS", default_value_t = 10_000)]
    pub shell_timeout_ms: u64,

    /// How long to wait for each output message (env: CELLGATE_IOPUB_TIMEOUT_MS)
    #[arg(long, env = "CELLGATE_IOPUB_TIMEOUT_MS", default_value_t = 1_000)]
    pub iopub_timeout_ms: u64,

    /// How long a new kernel may take to answer (env: CELLGATE_STARTUP_TIMEOUT_MS)
    #[arg(long, env = "CELLGATE_STARTUP_TIMEOUT_MS", default_value_t = 60_000)]
    pub startup_timeout_ms: u64,

    /// Grace period before a kernel is killed on shutdown (env: CELLGATE_SHUTDOWN_GRACE_MS)
    #[arg(long, env = "CELLGATE_SHUTDOWN_GRACE_MS", default_value_t = 5_000)]
    pub shutdown_grace_ms: u64,

    /// Do not serve Swagger UI or the OpenAPI document (env: CELLGATE_NO_DOCS)
    #[arg(long, env = "CELLGATE_NO_DOCS")]
    pub no_docs: bool,
}

impl ServeArgs {
    pub fn host_config(&self) -> HostConfig {
        let defaults = KernelConfig::default();
        let argv = self
            .kernel_argv
            .split_whitespace()
            .map(String::from)
            .collect();
        HostConfig {
            kernel: KernelConfig {
                spec: KernelSpec::from_argv(argv),
                kernel_name: self.kernel_name.clone(),
                ip: self.kernel_ip.clone(),
                runtime_dir: self.runtime_dir.clone().unwrap_or(defaults.runtime_dir),
                startup_timeout: Duration::from_millis(self.startup_timeout_ms),
                timeouts: ExecuteTimeouts {
                    shell: Duration::from_millis(self.shell_timeout_ms),
                    iopub: Duration::from_millis(self.iopub_timeout_ms),
                },
                heartbeat_timeout: defaults.heartbeat_timeout,
            },
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
        }
    }

    pub fn http_config(&self) -> HttpServerConfig {
        HttpServerConfig {
            bind: self.bind,
            docs: !self.no_docs,
        }
    }
}
