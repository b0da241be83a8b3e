use std::net::SocketAddr;
use std::time::Duration;

use cellgate_kernel::KernelConfig;

#[derive(Debug, Clone)]
pub struct HostConfig {
    pub kernel: KernelConfig,
    /// How long a kernel gets to exit after `shutdown_request` before it is killed.
    pub shutdown_grace: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            kernel: KernelConfig::default(),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpServerConfig {
    pub bind: SocketAddr,
    /// Serve Swagger UI at `/api/docs` and the OpenAPI document at `/api/openapi.json`.
    pub docs: bool,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8000)),
            docs: true,
        }
    }
}
