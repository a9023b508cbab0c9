use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    routing::{get, post, put},
};
use axum_valid::Valid;

use crate::{
    dto::game::{
        ControlDecisionRequest, ControlOutcomeResponse, EndGameResponse, GameView,
        MutationResponse, OnCourtRequest, ScoreRequest, SetClockRequest, StartGameRequest,
        StatRequest,
    },
    error::AppError,
    services::game_service::{self, Mutation},
    state::SharedState,
};

/// Live game and control token endpoints.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/api/game", get(get_game).post(start_game))
        .route("/api/game/score", post(adjust_score))
        .route("/api/game/on-court", put(set_on_court))
        .route("/api/game/clock/start", post(start_clock))
        .route("/api/game/clock/stop", post(stop_clock))
        .route("/api/game/clock", put(set_clock))
        .route("/api/game/period/next", post(next_period))
        .route("/api/game/stats", post(record_stat))
        .route("/api/game/end", post(end_game))
        .route("/api/control/request", post(request_control))
        .route("/api/control/respond", post(respond_to_request))
        .route("/api/control/release", post(release_control))
}

async fn apply(state: &SharedState, mutation: Mutation) -> Result<Json<MutationResponse>, AppError> {
    let (changed, game) = game_service::mutate(state, mutation).await?;
    Ok(Json(MutationResponse { changed, game }))
}

/// Retrieve the live game with its clock evaluated now.
#[utoipa::path(
    get,
    path = "/api/game",
    tag = "game",
    responses(
        (status = 200, description = "Live game", body = GameView),
        (status = 404, description = "No game in progress")
    )
)]
pub async fn get_game(State(state): State<SharedState>) -> Result<Json<GameView>, AppError> {
    game_service::current_game(&state)
        .map(Json)
        .ok_or_else(|| AppError::NotFound("no game in progress".into()))
}

/// Start a new game controlled by this device.
#[utoipa::path(
    post,
    path = "/api/game",
    tag = "game",
    request_body = StartGameRequest,
    responses(
        (status = 201, description = "Game started", body = GameView),
        (status = 409, description = "Another device runs the current game")
    )
)]
pub async fn start_game(
    State(state): State<SharedState>,
    Valid(Json(payload)): Valid<Json<StartGameRequest>>,
) -> Result<(StatusCode, Json<GameView>), AppError> {
    let game = game_service::start_game(&state, payload).await?;
    Ok((StatusCode::CREATED, Json(game)))
}

#[utoipa::path(
    post,
    path = "/api/game/score",
    tag = "game",
    request_body = ScoreRequest,
    responses(
        (status = 200, description = "Score adjusted", body = MutationResponse),
        (status = 409, description = "This device does not hold control")
    )
)]
pub async fn adjust_score(
    State(state): State<SharedState>,
    Valid(Json(payload)): Valid<Json<ScoreRequest>>,
) -> Result<Json<MutationResponse>, AppError> {
    apply(&state, Mutation::Score(payload)).await
}

/// Move the tracked player on or off court. Repeating the current value changes nothing.
#[utoipa::path(
    put,
    path = "/api/game/on-court",
    tag = "game",
    request_body = OnCourtRequest,
    responses((status = 200, description = "Court status applied", body = MutationResponse))
)]
pub async fn set_on_court(
    State(state): State<SharedState>,
    Json(payload): Json<OnCourtRequest>,
) -> Result<Json<MutationResponse>, AppError> {
    apply(&state, Mutation::OnCourt(payload.on_court)).await
}

#[utoipa::path(
    post,
    path = "/api/game/clock/start",
    tag = "game",
    responses((status = 200, description = "Clock running", body = MutationResponse))
)]
pub async fn start_clock(State(state): State<SharedState>) -> Result<Json<MutationResponse>, AppError> {
    apply(&state, Mutation::StartClock).await
}

#[utoipa::path(
    post,
    path = "/api/game/clock/stop",
    tag = "game",
    responses((status = 200, description = "Clock stopped", body = MutationResponse))
)]
pub async fn stop_clock(State(state): State<SharedState>) -> Result<Json<MutationResponse>, AppError> {
    apply(&state, Mutation::StopClock).await
}

/// Overwrite the clock value. Rejected while the clock runs.
#[utoipa::path(
    put,
    path = "/api/game/clock",
    tag = "game",
    request_body = SetClockRequest,
    responses((status = 200, description = "Clock set", body = MutationResponse))
)]
pub async fn set_clock(
    State(state): State<SharedState>,
    Valid(Json(payload)): Valid<Json<SetClockRequest>>,
) -> Result<Json<MutationResponse>, AppError> {
    apply(&state, Mutation::SetClock(payload)).await
}

#[utoipa::path(
    post,
    path = "/api/game/period/next",
    tag = "game",
    responses((status = 200, description = "Next period started", body = MutationResponse))
)]
pub async fn next_period(State(state): State<SharedState>) -> Result<Json<MutationResponse>, AppError> {
    apply(&state, Mutation::NextPeriod).await
}

#[utoipa::path(
    post,
    path = "/api/game/stats",
    tag = "game",
    request_body = StatRequest,
    responses((status = 200, description = "Stat recorded", body = MutationResponse))
)]
pub async fn record_stat(
    State(state): State<SharedState>,
    Valid(Json(payload)): Valid<Json<StatRequest>>,
) -> Result<Json<MutationResponse>, AppError> {
    apply(&state, Mutation::Stat(payload)).await
}

/// Close the game and hand the final record to the durable store.
#[utoipa::path(
    post,
    path = "/api/game/end",
    tag = "game",
    responses(
        (status = 200, description = "Game ended", body = EndGameResponse),
        (status = 409, description = "This device does not hold control")
    )
)]
pub async fn end_game(State(state): State<SharedState>) -> Result<Json<EndGameResponse>, AppError> {
    Ok(Json(game_service::end_game(&state).await?))
}

/// Take control if free, otherwise ask the current holder.
#[utoipa::path(
    post,
    path = "/api/control/request",
    tag = "control",
    responses((status = 200, description = "Claim outcome", body = ControlOutcomeResponse))
)]
pub async fn request_control(
    State(state): State<SharedState>,
) -> Result<Json<ControlOutcomeResponse>, AppError> {
    Ok(Json(game_service::request_control(&state).await?))
}

/// Holder side: grant or deny the pending request.
#[utoipa::path(
    post,
    path = "/api/control/respond",
    tag = "control",
    request_body = ControlDecisionRequest,
    responses(
        (status = 204, description = "Answer applied"),
        (status = 409, description = "No pending request or not the holder")
    )
)]
pub async fn respond_to_request(
    State(state): State<SharedState>,
    Json(payload): Json<ControlDecisionRequest>,
) -> Result<StatusCode, AppError> {
    game_service::respond_to_request(&state, payload.accept).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/api/control/release",
    tag = "control",
    responses((status = 204, description = "Control released"))
)]
pub async fn release_control(State(state): State<SharedState>) -> Result<StatusCode, AppError> {
    game_service::release_control(&state).await?;
    Ok(StatusCode::NO_CONTENT)
}
