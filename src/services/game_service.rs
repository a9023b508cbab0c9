//! Game and control operations exposed to the presentation layer.

use std::time::Duration;

use crate::{
    dto::game::{
        ControlOutcomeResponse, EndGameResponse, GameView, ScoreRequest, SetClockRequest,
        StartGameRequest, StatRequest,
    },
    error::ServiceError,
    state::SharedState,
};

/// Mutation applied through the node on behalf of the bridge.
pub enum Mutation {
    Score(ScoreRequest),
    OnCourt(bool),
    StartClock,
    StopClock,
    SetClock(SetClockRequest),
    NextPeriod,
    Stat(StatRequest),
}

/// Current live game, if any.
pub fn current_game(state: &SharedState) -> Option<GameView> {
    let now = state.clock().now();
    state
        .node()
        .game()
        .map(|game| GameView::from_state(&game, now))
}

pub async fn start_game(
    state: &SharedState,
    request: StartGameRequest,
) -> Result<GameView, ServiceError> {
    let game = state
        .node()
        .start_game(request.home_team, request.away_team, request.tracked_player)
        .await?;
    Ok(GameView::from_state(&game, state.clock().now()))
}

/// Apply `mutation`. Returns whether anything changed and the resulting game.
pub async fn mutate(
    state: &SharedState,
    mutation: Mutation,
) -> Result<(bool, Option<GameView>), ServiceError> {
    let node = state.node();
    let changed = match mutation {
        Mutation::Score(request) => node.mutate_score(request.side, request.delta).await?,
        Mutation::OnCourt(on_court) => node.set_on_court(on_court).await?,
        Mutation::StartClock => node.start_clock().await?,
        Mutation::StopClock => node.stop_clock().await?,
        Mutation::SetClock(request) => {
            node.set_clock(Duration::from_millis(request.value_ms))
                .await?
        }
        Mutation::NextPeriod => node.next_period().await?,
        Mutation::Stat(request) => {
            node.record_stat(request.player, request.kind, request.delta)
                .await?
        }
    };
    Ok((changed, current_game(state)))
}

pub async fn end_game(state: &SharedState) -> Result<EndGameResponse, ServiceError> {
    Ok(state.node().end_game().await?.into())
}

pub async fn request_control(state: &SharedState) -> Result<ControlOutcomeResponse, ServiceError> {
    Ok(state.node().request_control().await?.into())
}

pub async fn respond_to_request(state: &SharedState, accept: bool) -> Result<(), ServiceError> {
    state.node().respond_to_request(accept).await
}

pub async fn release_control(state: &SharedState) -> Result<(), ServiceError> {
    state.node().release_control().await
}
