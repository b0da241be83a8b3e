use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use cellgate_kernel::{ExecutionOutcome, KernelInfo, ReplyStatus};
use cellgate_protocol::{
    ErrorResponse, ExecuteCellRequest, ExecuteCellResponse, ExecutionStatus, HealthResponse,
    KernelInfoResponse, KernelState, RestartResponse, RootResponse,
};
use utoipa::OpenApi;

use crate::daemon::{ControlMsg, KernelStatus};
use crate::error::HostError;
use crate::http::{HttpState, control_call};

/// Routes served at the root, kept at the paths existing clients call.
pub fn root_router() -> Router<HttpState> {
    Router::new()
        .route("/", get(root))
        .route("/execute-cell", post(execute_cell))
}

pub fn router() -> Router<HttpState> {
    Router::new()
        .route("/health", get(health))
        .route("/kernel/info", get(kernel_info))
        .route("/kernel/restart", post(restart))
}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "cellgate",
        description = "Runs code cells on a persistent Jupyter kernel over HTTP."
    ),
    paths(root, execute_cell, health, kernel_info, restart),
    components(schemas(
        ExecuteCellRequest,
        ExecuteCellResponse,
        ExecutionStatus,
        ErrorResponse,
        HealthResponse,
        KernelState,
        KernelInfoResponse,
        RestartResponse,
        RootResponse,
    )),
    tags(
        (name = "cells", description = "Cell execution"),
        (name = "kernel", description = "Kernel lifecycle and status")
    )
)]
pub struct ApiDoc;

pub fn openapi() -> utoipa::openapi::OpenApi {
    ApiDoc::openapi()
}

#[derive(Debug)]
pub enum ApiError {
    Host(HostError),
}

impl From<HostError> for ApiError {
    fn from(err: HostError) -> Self {
        ApiError::Host(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let ApiError::Host(err) = self;
        let (status, code) = match &err {
            HostError::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
            err if err.is_timeout() => (StatusCode::INTERNAL_SERVER_ERROR, "timeout"),
            HostError::Kernel(_) => (StatusCode::INTERNAL_SERVER_ERROR, "kernel_error"),
        };
        if status.is_server_error() {
            tracing::warn!(code, "request failed: {err}");
        }
        (status, Json(ErrorResponse::new(code, err.to_string()))).into_response()
    }
}

#[utoipa::path(
    get,
    path = "/",
    responses((status = 200, description = "Liveness greeting", body = RootResponse)),
    tag = "cells"
)]
async fn root() -> Json<RootResponse> {
    Json(RootResponse::default())
}

/// Run one cell and return everything it printed.
///
/// Exceptions raised by the cell are not HTTP errors: the traceback is part
/// of `output` and `status` is `error`.
#[utoipa::path(
    post,
    path = "/execute-cell",
    request_body = ExecuteCellRequest,
    responses(
        (status = 200, description = "Cell ran to completion", body = ExecuteCellResponse),
        (status = 500, description = "Kernel failure or timeout", body = ErrorResponse),
        (status = 503, description = "No kernel available", body = ErrorResponse)
    ),
    tag = "cells"
)]
async fn execute_cell(
    State(state): State<HttpState>,
    Json(req): Json<ExecuteCellRequest>,
) -> Result<Json<ExecuteCellResponse>, ApiError> {
    let outcome = control_call(&state, |resp| ControlMsg::Execute {
        code: req.cell,
        resp,
    })
    .await?;
    Ok(Json(execute_response(outcome)))
}

#[utoipa::path(
    get,
    path = "/api/health",
    responses(
        (status = 200, description = "Kernel is running", body = HealthResponse),
        (status = 503, description = "Kernel is starting or dead, or the daemon has stopped", body = HealthResponse)
    ),
    tag = "kernel"
)]
async fn health(
    State(state): State<HttpState>,
) -> Result<(StatusCode, Json<HealthResponse>), ApiError> {
    let current = state.status();
    // The daemon answers one request at a time; don't queue behind a running cell.
    if current.running_cell || current.state == KernelState::Starting {
        return Ok(health_response(current));
    }
    let status = match control_call(&state, |resp| ControlMsg::Health { resp }).await {
        Ok(status) => status,
        Err(HostError::Unavailable(reason)) => {
            tracing::warn!("health check without a daemon: {reason}");
            KernelStatus::dead()
        }
        Err(err) => return Err(err.into()),
    };
    Ok(health_response(status))
}

#[utoipa::path(
    get,
    path = "/api/kernel/info",
    responses(
        (status = 200, description = "Kernel implementation details", body = KernelInfoResponse),
        (status = 500, description = "Kernel did not answer", body = ErrorResponse),
        (status = 503, description = "No kernel available", body = ErrorResponse)
    ),
    tag = "kernel"
)]
async fn kernel_info(
    State(state): State<HttpState>,
) -> Result<Json<KernelInfoResponse>, ApiError> {
    let info = control_call(&state, |resp| ControlMsg::KernelInfo { resp }).await?;
    Ok(Json(kernel_info_response(info)))
}

#[utoipa::path(
    post,
    path = "/api/kernel/restart",
    responses(
        (status = 200, description = "A fresh kernel is running", body = RestartResponse),
        (status = 500, description = "Relaunch failed", body = ErrorResponse)
    ),
    tag = "kernel"
)]
async fn restart(State(state): State<HttpState>) -> Result<Json<RestartResponse>, ApiError> {
    let pid = control_call(&state, |resp| ControlMsg::Restart { resp }).await?;
    Ok(Json(RestartResponse {
        restarted: true,
        pid,
    }))
}

fn execute_response(outcome: ExecutionOutcome) -> ExecuteCellResponse {
    let status = match outcome.status {
        ReplyStatus::Ok => ExecutionStatus::Ok,
        ReplyStatus::Error => ExecutionStatus::Error,
        ReplyStatus::Aborted => ExecutionStatus::Aborted,
    };
    ExecuteCellResponse {
        output: outcome.output,
        status,
        execution_count: outcome.execution_count,
    }
}

fn health_response(status: KernelStatus) -> (StatusCode, Json<HealthResponse>) {
    let ok = matches!(status.state, KernelState::Idle | KernelState::Busy);
    let code = if ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = HealthResponse {
        ok,
        kernel: status.state,
        pid: status.pid,
        heartbeat_ms: status
            .heartbeat
            .map(|rtt| u64::try_from(rtt.as_millis()).unwrap_or(u64::MAX)),
    };
    (code, Json(body))
}

fn kernel_info_response(info: KernelInfo) -> KernelInfoResponse {
    KernelInfoResponse {
        protocol_version: info.protocol_version,
        implementation: info.implementation,
        implementation_version: info.implementation_version,
        language: info.language,
        language_version: info.language_version,
        banner: info.banner,
    }
}
