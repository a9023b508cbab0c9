//! Request and response bodies of the game and control endpoints.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::{
    dao::models::FinalizedGameRecord,
    dto::format_timestamp,
    state::{
        control::ClaimOutcome,
        game::{LiveGameState, Side, StatKind, StatLine},
        segments::TimeSegment,
    },
};

/// Payload used to start a brand-new game controlled by this device.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct StartGameRequest {
    #[validate(length(min = 1, max = 64))]
    pub home_team: String,
    #[validate(length(min = 1, max = 64))]
    pub away_team: String,
    /// Player whose court time is tracked.
    #[validate(length(min = 1, max = 64))]
    pub tracked_player: String,
}

/// Request to adjust a team's score by a delta.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct ScoreRequest {
    pub side: Side,
    #[validate(range(min = -10, max = 10))]
    pub delta: i32,
}

/// Move the tracked player on or off court.
#[derive(Debug, Deserialize, ToSchema)]
pub struct OnCourtRequest {
    pub on_court: bool,
}

/// Overwrite the stopped clock.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct SetClockRequest {
    /// New remaining time in milliseconds.
    #[validate(range(max = 7_200_000))]
    pub value_ms: u64,
}

/// Adjust a player's counter.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct StatRequest {
    #[validate(length(min = 1, max = 64))]
    pub player: String,
    pub kind: StatKind,
    #[validate(range(min = -5, max = 5))]
    pub delta: i32,
}

/// Holder's answer to a pending control request.
#[derive(Debug, Deserialize, ToSchema)]
pub struct ControlDecisionRequest {
    pub accept: bool,
}

/// Court or bench interval of the tracked player.
#[derive(Debug, Serialize, ToSchema)]
pub struct SegmentView {
    pub start: String,
    pub end: Option<String>,
    pub on_court: bool,
    pub seconds: f64,
}

impl SegmentView {
    fn from_segment(segment: &TimeSegment, now: OffsetDateTime) -> Self {
        Self {
            start: format_timestamp(segment.start_time),
            end: segment.end_time.map(format_timestamp),
            on_court: segment.is_on_court,
            seconds: segment.duration(now).as_secs_f64(),
        }
    }
}

/// Live game as shown to the presentation layer, with clock and time totals evaluated now.
#[derive(Debug, Serialize, ToSchema)]
pub struct GameView {
    pub game_id: Uuid,
    pub version: u64,
    pub home_team: String,
    pub away_team: String,
    pub tracked_player: String,
    pub period: u32,
    pub home_score: u32,
    pub away_score: u32,
    pub clock_running: bool,
    /// Remaining period time in milliseconds.
    pub clock_ms: u64,
    /// Running clock that has counted down to zero.
    pub clock_expired: bool,
    pub controlling_device_id: Option<String>,
    pub requested_by: Option<String>,
    pub on_court: Option<bool>,
    pub court_seconds: f64,
    pub bench_seconds: f64,
    pub segments: Vec<SegmentView>,
    #[schema(value_type = Object)]
    pub stats: IndexMap<String, StatLine>,
    pub started_at: String,
}

impl GameView {
    pub fn from_state(game: &LiveGameState, now: OffsetDateTime) -> Self {
        Self {
            game_id: game.game_id,
            version: game.version,
            home_team: game.home_team.clone(),
            away_team: game.away_team.clone(),
            tracked_player: game.tracked_player.clone(),
            period: game.period,
            home_score: game.home_score,
            away_score: game.away_score,
            clock_running: game.clock.is_running(),
            clock_ms: u64::try_from(game.clock.current_value(now).as_millis()).unwrap_or(u64::MAX),
            clock_expired: game.clock.is_expired(now),
            controlling_device_id: game.control.holder().map(str::to_string),
            requested_by: game.control.requested_by().map(str::to_string),
            on_court: game.time.is_on_court(),
            court_seconds: game.time.total_court(now).as_secs_f64(),
            bench_seconds: game.time.total_bench(now).as_secs_f64(),
            segments: game
                .time
                .segments()
                .iter()
                .map(|segment| SegmentView::from_segment(segment, now))
                .collect(),
            stats: game.stats.clone(),
            started_at: format_timestamp(game.started_at),
        }
    }
}

/// Whether a mutation changed anything, plus the resulting game.
#[derive(Debug, Serialize, ToSchema)]
pub struct MutationResponse {
    /// `false` for no-ops such as repeating the current on-court value.
    pub changed: bool,
    pub game: Option<GameView>,
}

/// Summary of a finished game.
#[derive(Debug, Serialize, ToSchema)]
pub struct EndGameResponse {
    pub game_id: Uuid,
    pub home_team: String,
    pub away_team: String,
    pub final_period: u32,
    pub home_score: u32,
    pub away_score: u32,
    pub court_seconds: f64,
    pub bench_seconds: f64,
    pub final_version: u64,
}

impl From<FinalizedGameRecord> for EndGameResponse {
    fn from(record: FinalizedGameRecord) -> Self {
        Self {
            game_id: record.game_id,
            home_team: record.home_team,
            away_team: record.away_team,
            final_period: record.final_period,
            home_score: record.home_score,
            away_score: record.away_score,
            court_seconds: record.court_seconds,
            bench_seconds: record.bench_seconds,
            final_version: record.final_version,
        }
    }
}

/// Result of asking for the control token.
#[derive(Debug, Serialize, ToSchema)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ControlOutcomeResponse {
    /// Control was free and now belongs to this device.
    Granted,
    /// The request was sent to the current holder.
    Requested { holder: String },
}

impl From<ClaimOutcome> for ControlOutcomeResponse {
    fn from(outcome: ClaimOutcome) -> Self {
        match outcome {
            ClaimOutcome::Granted => ControlOutcomeResponse::Granted,
            ClaimOutcome::Requested { holder } => ControlOutcomeResponse::Requested { holder },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::time_source::from_millis;

    #[test]
    fn running_clock_is_evaluated_at_view_time() {
        let start = from_millis(1_000_000);
        let mut game = LiveGameState::new(
            "Hawks".into(),
            "Owls".into(),
            "Sam".into(),
            "a",
            Duration::from_secs(600),
            start,
        );
        game.clock.start(start);

        let view = GameView::from_state(&game, from_millis(1_012_500));
        assert!(view.clock_running);
        assert_eq!(view.clock_ms, 587_500);
        assert!(!view.clock_expired);
        assert_eq!(view.controlling_device_id.as_deref(), Some("a"));
        assert_eq!(view.on_court, Some(false));

        let late = GameView::from_state(&game, from_millis(1_700_000));
        assert_eq!(late.clock_ms, 0);
        assert!(late.clock_expired);
    }

    #[test]
    fn start_request_rejects_empty_names() {
        let request = StartGameRequest {
            home_team: String::new(),
            away_team: "Owls".into(),
            tracked_player: "Sam".into(),
        };
        assert!(request.validate().is_err());
    }

    #[test]
    fn score_delta_is_bounded() {
        let request = ScoreRequest {
            side: Side::Home,
            delta: 25,
        };
        assert!(request.validate().is_err());
    }
}
