use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post, put},
};
use axum_valid::Valid;

use crate::{
    dto::device::{
        ActionResponse, PairRequest, RecordingReportRequest, RoleRequest, StatusResponse,
        TrustedDeviceView,
    },
    error::AppError,
    services::{device_service, message_bus::Diagnostics},
    state::SharedState,
};

/// Status, connectivity, pairing and recording endpoints.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/api/status", get(status))
        .route("/api/diagnostics", get(diagnostics))
        .route("/api/connection/enable", post(enable))
        .route("/api/connection/disable", post(disable))
        .route("/api/trusted", get(list_trusted).post(pair))
        .route("/api/trusted/{id}", delete(unpair))
        .route("/api/role", put(switch_role))
        .route("/api/recording/start", post(start_recording))
        .route("/api/recording/stop", post(stop_recording))
        .route("/api/recording/state", put(report_recording))
}

/// Connection state, live game, recording flags and diagnostics in one payload.
#[utoipa::path(
    get,
    path = "/api/status",
    tag = "device",
    responses((status = 200, description = "Device status", body = StatusResponse))
)]
pub async fn status(State(state): State<SharedState>) -> Result<Json<StatusResponse>, AppError> {
    Ok(Json(device_service::status(&state).await?))
}

#[utoipa::path(
    get,
    path = "/api/diagnostics",
    tag = "device",
    responses((status = 200, description = "Message bus counters", body = Diagnostics))
)]
pub async fn diagnostics(State(state): State<SharedState>) -> Result<Json<Diagnostics>, AppError> {
    Ok(Json(device_service::diagnostics(&state).await?))
}

/// Start discovery and auto-connect to trusted peers.
#[utoipa::path(
    post,
    path = "/api/connection/enable",
    tag = "device",
    responses((status = 200, description = "Connectivity enabled", body = ActionResponse))
)]
pub async fn enable(State(state): State<SharedState>) -> Result<Json<ActionResponse>, AppError> {
    device_service::enable(&state).await?;
    Ok(Json(ActionResponse::new("connectivity enabled")))
}

/// Stop discovery and drop the session until re-enabled.
#[utoipa::path(
    post,
    path = "/api/connection/disable",
    tag = "device",
    responses((status = 200, description = "Connectivity disabled", body = ActionResponse))
)]
pub async fn disable(State(state): State<SharedState>) -> Result<Json<ActionResponse>, AppError> {
    device_service::disable(&state).await?;
    Ok(Json(ActionResponse::new("connectivity disabled")))
}

#[utoipa::path(
    get,
    path = "/api/trusted",
    tag = "device",
    responses((status = 200, description = "Trusted devices", body = [TrustedDeviceView]))
)]
pub async fn list_trusted(
    State(state): State<SharedState>,
) -> Result<Json<Vec<TrustedDeviceView>>, AppError> {
    Ok(Json(device_service::trusted_devices(&state).await?))
}

/// Trust a device. Pairing the same id again replaces its entry.
#[utoipa::path(
    post,
    path = "/api/trusted",
    tag = "device",
    request_body = PairRequest,
    responses(
        (status = 201, description = "Device trusted"),
        (status = 400, description = "Invalid pairing payload")
    )
)]
pub async fn pair(
    State(state): State<SharedState>,
    Valid(Json(payload)): Valid<Json<PairRequest>>,
) -> Result<StatusCode, AppError> {
    device_service::pair(&state, payload).await?;
    Ok(StatusCode::CREATED)
}

#[utoipa::path(
    delete,
    path = "/api/trusted/{id}",
    tag = "device",
    params(("id" = String, Path, description = "Identifier of the device to forget")),
    responses(
        (status = 200, description = "Device forgotten", body = TrustedDeviceView),
        (status = 404, description = "Device was not trusted")
    )
)]
pub async fn unpair(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<TrustedDeviceView>, AppError> {
    Ok(Json(device_service::unpair(&state, &id).await?))
}

/// Change the local role. Trusted devices expected to play the same role are dropped.
#[utoipa::path(
    put,
    path = "/api/role",
    tag = "device",
    request_body = RoleRequest,
    responses((status = 200, description = "Devices dropped by the switch", body = [TrustedDeviceView]))
)]
pub async fn switch_role(
    State(state): State<SharedState>,
    Json(payload): Json<RoleRequest>,
) -> Result<Json<Vec<TrustedDeviceView>>, AppError> {
    Ok(Json(device_service::switch_role(&state, payload.role).await?))
}

/// Ask the peer to start recording.
#[utoipa::path(
    post,
    path = "/api/recording/start",
    tag = "recording",
    responses((status = 202, description = "Signal sent or queued"))
)]
pub async fn start_recording(State(state): State<SharedState>) -> Result<StatusCode, AppError> {
    device_service::start_recording(&state).await?;
    Ok(StatusCode::ACCEPTED)
}

/// Ask the peer to stop recording.
#[utoipa::path(
    post,
    path = "/api/recording/stop",
    tag = "recording",
    responses((status = 202, description = "Signal sent or queued"))
)]
pub async fn stop_recording(State(state): State<SharedState>) -> Result<StatusCode, AppError> {
    device_service::stop_recording(&state).await?;
    Ok(StatusCode::ACCEPTED)
}

/// Publish whether the local recording subsystem is recording.
#[utoipa::path(
    put,
    path = "/api/recording/state",
    tag = "recording",
    request_body = RecordingReportRequest,
    responses((status = 204, description = "State reported"))
)]
pub async fn report_recording(
    State(state): State<SharedState>,
    Json(payload): Json<RecordingReportRequest>,
) -> Result<StatusCode, AppError> {
    device_service::report_recording(&state, payload.is_recording).await?;
    Ok(StatusCode::NO_CONTENT)
}
