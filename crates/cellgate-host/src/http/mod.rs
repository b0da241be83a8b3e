pub mod api;

use std::net::SocketAddr;

use axum::Router;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use utoipa_swagger_ui::SwaggerUi;

use crate::config::HttpServerConfig;
use crate::daemon::{ControlMsg, KernelStatus, Responder};
use crate::error::HostError;

#[derive(Clone)]
pub struct HttpState {
    pub control_tx: mpsc::Sender<ControlMsg>,
    /// Latest status published by the daemon; readable while it is busy.
    pub status_rx: watch::Receiver<KernelStatus>,
    pub shutdown_tx: broadcast::Sender<()>,
}

impl HttpState {
    pub fn new(
        control_tx: mpsc::Sender<ControlMsg>,
        status_rx: watch::Receiver<KernelStatus>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        Self {
            control_tx,
            status_rx,
            shutdown_tx,
        }
    }

    pub fn status(&self) -> KernelStatus {
        *self.status_rx.borrow()
    }
}

/// Full application router: gateway routes at the root, extras under `/api`.
pub fn app(state: HttpState, docs: bool) -> Router {
    let mut router = Router::new()
        .merge(api::root_router())
        .nest("/api", api::router());
    if docs {
        router = router
            .merge(SwaggerUi::new("/api/docs").url("/api/openapi.json", api::openapi()));
    }
    router
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub fn spawn_http_server(config: HttpServerConfig, state: HttpState) -> JoinHandle<()> {
    let shutdown_tx = state.shutdown_tx.clone();
    let app = app(state, config.docs);

    tokio::spawn(async move {
        let addr = config.bind;
        if let Err(err) = serve(addr, app, shutdown_tx.clone()).await {
            tracing::error!("http server error: {err}");
            // No server, no point keeping the kernel.
            let _ = shutdown_tx.send(());
        }
    })
}

/// Send a request to the daemon and wait for its answer.
pub async fn control_call<T>(
    state: &HttpState,
    build: impl FnOnce(Responder<T>) -> ControlMsg,
) -> Result<T, HostError> {
    let (resp, rx) = oneshot::channel();
    state
        .control_tx
        .send(build(resp))
        .await
        .map_err(|_| HostError::unavailable("kernel daemon is not running"))?;
    rx.await
        .map_err(|_| HostError::unavailable("kernel daemon dropped the request"))?
}

async fn serve(
    addr: SocketAddr,
    app: Router,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(), String> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind {addr}: {e}"))?;
    tracing::info!("HTTP server listening on http://{}", addr);
    let mut shutdown_rx = shutdown_tx.subscribe();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
        })
        .await
        .map_err(|e| format!("serve {addr}: {e}"))
}
