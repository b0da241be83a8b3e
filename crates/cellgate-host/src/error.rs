use cellgate_kernel::KernelError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("kernel error: {0}")]
    Kernel(#[from] KernelError),
    #[error("kernel unavailable: {0}")]
    Unavailable(String),
}

impl HostError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        HostError::Unavailable(msg.into())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, HostError::Kernel(err) if err.is_timeout())
    }
}
