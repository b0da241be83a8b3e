use std::time::Duration;

use thiserror::Error;

use crate::connection::Channel;

/// Failures decoding or encoding a multipart kernel message.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("missing <IDS|MSG> delimiter")]
    MissingDelimiter,
    #[error("expected at least 5 frames after delimiter, got {0}")]
    TooFewFrames(usize),
    #[error("message signature mismatch")]
    BadSignature,
    #[error("invalid {frame} frame: {source}")]
    Json {
        frame: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("cannot send an empty message")]
    Empty,
}

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("failed to spawn kernel: {0}")]
    Spawn(String),
    #[error("kernel io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("socket error on {channel}: {message}")]
    Socket { channel: Channel, message: String },
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("timed out after {timeout:?} waiting on {channel} channel")]
    Timeout { channel: Channel, timeout: Duration },
    #[error("kernel did not become ready within {0:?}")]
    StartupTimeout(Duration),
    #[error("kernel exited before it became ready (exit code {0:?})")]
    Exited(Option<i32>),
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl KernelError {
    pub(crate) fn socket(channel: Channel, err: impl std::fmt::Display) -> Self {
        KernelError::Socket {
            channel,
            message: err.to_string(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            KernelError::Timeout { .. } | KernelError::StartupTimeout(_)
        )
    }
}
