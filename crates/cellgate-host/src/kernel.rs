//! Seam between the daemon and a concrete kernel, so the daemon can be driven
//! by a scripted backend in tests.

use std::time::Duration;

use async_trait::async_trait;
use cellgate_kernel::{ExecutionOutcome, Kernel, KernelConfig, KernelError, KernelInfo};

#[async_trait]
pub trait KernelBackend: Send {
    fn pid(&self) -> Option<u32>;
    fn is_alive(&mut self) -> bool;
    async fn execute(&mut self, code: &str) -> Result<ExecutionOutcome, KernelError>;
    async fn kernel_info(&mut self) -> Result<KernelInfo, KernelError>;
    /// Heartbeat round trip.
    async fn heartbeat(&mut self) -> Result<Duration, KernelError>;
    async fn shutdown(self: Box<Self>, grace: Duration) -> Result<(), KernelError>;
}

#[async_trait]
pub trait KernelLauncher: Send + Sync {
    async fn launch(&self) -> Result<Box<dyn KernelBackend>, KernelError>;
}

#[async_trait]
impl KernelBackend for Kernel {
    fn pid(&self) -> Option<u32> {
        Kernel::pid(self)
    }

    fn is_alive(&mut self) -> bool {
        Kernel::is_alive(self)
    }

    async fn execute(&mut self, code: &str) -> Result<ExecutionOutcome, KernelError> {
        Kernel::execute(self, code).await
    }

    async fn kernel_info(&mut self) -> Result<KernelInfo, KernelError> {
        Kernel::kernel_info(self).await
    }

    async fn heartbeat(&mut self) -> Result<Duration, KernelError> {
        Kernel::heartbeat(self).await
    }

    async fn shutdown(self: Box<Self>, grace: Duration) -> Result<(), KernelError> {
        Kernel::shutdown(*self, grace).await
    }
}

/// Launches real kernel processes from a [`KernelConfig`].
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    config: KernelConfig,
}

impl ProcessLauncher {
    pub fn new(config: KernelConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl KernelLauncher for ProcessLauncher {
    async fn launch(&self) -> Result<Box<dyn KernelBackend>, KernelError> {
        let kernel = Kernel::launch(&self.config).await?;
        Ok(Box::new(kernel))
    }
}
