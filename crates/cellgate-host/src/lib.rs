//! HTTP gateway that runs code cells on a single long-lived Jupyter kernel.

pub mod cli;
pub mod config;
pub mod daemon;
pub mod error;
pub mod http;
pub mod kernel;

pub use config::{HostConfig, HttpServerConfig};
pub use daemon::{ControlMsg, KernelDaemon, KernelStatus};
pub use error::HostError;
pub use kernel::{KernelBackend, KernelLauncher, ProcessLauncher};
