use utoipa::OpenApi;

#[derive(OpenApi)]
/// Aggregated OpenAPI document of the local HTTP bridge.
#[openapi(
    paths(
        crate::routes::health::healthcheck,
        crate::routes::sse::event_stream,
        crate::routes::device::status,
        crate::routes::device::diagnostics,
        crate::routes::device::enable,
        crate::routes::device::disable,
        crate::routes::device::list_trusted,
        crate::routes::device::pair,
        crate::routes::device::unpair,
        crate::routes::device::switch_role,
        crate::routes::device::start_recording,
        crate::routes::device::stop_recording,
        crate::routes::device::report_recording,
        crate::routes::game::get_game,
        crate::routes::game::start_game,
        crate::routes::game::adjust_score,
        crate::routes::game::set_on_court,
        crate::routes::game::start_clock,
        crate::routes::game::stop_clock,
        crate::routes::game::set_clock,
        crate::routes::game::next_period,
        crate::routes::game::record_stat,
        crate::routes::game::end_game,
        crate::routes::game::request_control,
        crate::routes::game::respond_to_request,
        crate::routes::game::release_control,
    ),
    components(
        schemas(
            crate::dto::health::HealthResponse,
            crate::dto::sse::Handshake,
            crate::state::hub::NodeEvent,
            crate::dto::device::StatusResponse,
            crate::dto::device::PairRequest,
            crate::dto::device::RoleRequest,
            crate::dto::device::RecordingReportRequest,
            crate::dto::device::TrustedDeviceView,
            crate::dto::device::ActionResponse,
            crate::dto::game::GameView,
            crate::dto::game::SegmentView,
            crate::dto::game::StartGameRequest,
            crate::dto::game::ScoreRequest,
            crate::dto::game::OnCourtRequest,
            crate::dto::game::SetClockRequest,
            crate::dto::game::StatRequest,
            crate::dto::game::ControlDecisionRequest,
            crate::dto::game::MutationResponse,
            crate::dto::game::EndGameResponse,
            crate::dto::game::ControlOutcomeResponse,
            crate::services::message_bus::Diagnostics,
            crate::services::node::RecordingStatus,
        )
    ),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "sse", description = "Server-sent events stream"),
        (name = "device", description = "Connectivity, pairing and role management"),
        (name = "game", description = "Live game intents"),
        (name = "control", description = "Control token arbitration"),
        (name = "recording", description = "Recording bridge"),
    )
)]
pub struct ApiDoc;
