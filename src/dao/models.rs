use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::{
    game::StatLine,
    segments::TimeSegment,
};

/// Field-keyed snapshot of a live game, identical to the `GameStateUpdate` payload.
pub type LiveGameDocument = IndexMap<String, String>;

/// Identifier the durable store assigns to a live game.
pub type StoreId = String;

/// Immutable record of a finished game handed to the durable store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizedGameRecord {
    pub game_id: Uuid,
    pub home_team: String,
    pub away_team: String,
    pub tracked_player: String,
    pub final_period: u32,
    pub home_score: u32,
    pub away_score: u32,
    /// Seconds the tracked player spent on court.
    pub court_seconds: f64,
    /// Seconds the tracked player spent on the bench.
    pub bench_seconds: f64,
    /// Closed timeline of the tracked player.
    pub segments: Vec<TimeSegment>,
    pub stats: IndexMap<String, StatLine>,
    /// Unix milliseconds.
    pub started_at: i64,
    /// Unix milliseconds.
    pub ended_at: i64,
    pub final_version: u64,
}
