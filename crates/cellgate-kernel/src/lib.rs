//! Client side of the Jupyter kernel messaging protocol.
//!
//! [`Kernel`] launches a kernel process, connects to its shell, control and
//! iopub channels, and runs code through [`Kernel::execute`]. The pieces are
//! usable on their own: [`ConnectionInfo`] for connection files,
//! [`wire`] for the signed multipart framing, [`OutputCollector`] for turning
//! iopub traffic into text.

pub mod client;
pub mod connection;
pub mod error;
pub mod launcher;
pub mod output;
pub mod session;
pub mod wire;

pub use client::{ExecuteTimeouts, ExecutionOutcome, KernelClient, KernelInfo, ReplyStatus};
pub use connection::{Channel, ConnectionInfo};
pub use error::{KernelError, WireError};
pub use launcher::{KernelProcess, KernelSpec};
pub use output::OutputCollector;
pub use session::{Kernel, KernelConfig};
pub use wire::{Header, JupyterMessage, Session, Signer};
