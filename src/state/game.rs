use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    dao::models::FinalizedGameRecord,
    state::{
        clock::ClockAnchor,
        control::{ClaimOutcome, ControlError, ControlState},
        segments::TimeTracker,
    },
    time_source::to_millis,
};

/// Highest period a game can reach.
pub const MAX_PERIOD: u32 = 99;

/// Highest version a game can reach. Snapshots beyond it are rejected on decode.
pub const MAX_VERSION: u64 = i64::MAX as u64;

/// Team a score change applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Home,
    Away,
}

/// Counting statistic recorded for a player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum StatKind {
    FieldGoalMade,
    FieldGoalMissed,
    ThreePointMade,
    ThreePointMissed,
    FreeThrowMade,
    FreeThrowMissed,
    Rebound,
    Assist,
    Steal,
    Block,
    Foul,
    Turnover,
}

/// Counters for one player.
pub type StatLine = IndexMap<StatKind, u32>;

/// Mutation requested by the presentation layer. Only the control holder may apply one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GameIntent {
    /// Add `delta` points (negative to correct a mistake) to `side`.
    Score { side: Side, delta: i32 },
    /// Move the tracked player on or off court.
    SetOnCourt(bool),
    /// Start the game clock.
    StartClock,
    /// Stop the game clock.
    StopClock,
    /// Overwrite the value of a stopped clock.
    SetClock(Duration),
    /// Move to the next period and reset the clock.
    NextPeriod,
    /// Adjust a player's counter by `delta`.
    RecordStat {
        player: String,
        kind: StatKind,
        delta: i32,
    },
}

/// Single source of truth for an in-progress game, replicated to every connected peer.
///
/// `version` grows by one on every accepted mutation and gates incoming replacements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveGameState {
    pub game_id: Uuid,
    pub home_team: String,
    pub away_team: String,
    pub tracked_player: String,
    pub period: u32,
    pub period_length: Duration,
    pub home_score: u32,
    pub away_score: u32,
    pub clock: ClockAnchor,
    pub control: ControlState,
    pub time: TimeTracker,
    pub stats: IndexMap<String, StatLine>,
    pub started_at: OffsetDateTime,
    pub version: u64,
}

impl LiveGameState {
    /// Start a new game controlled by `controller`. The tracked player starts on the bench.
    pub fn new(
        home_team: String,
        away_team: String,
        tracked_player: String,
        controller: &str,
        period_length: Duration,
        now: OffsetDateTime,
    ) -> Self {
        let mut time = TimeTracker::default();
        time.set_on_court(false, now);

        Self {
            game_id: Uuid::new_v4(),
            home_team,
            away_team,
            tracked_player,
            period: 1,
            period_length,
            home_score: 0,
            away_score: 0,
            clock: ClockAnchor::stopped(period_length),
            control: ControlState::held_by(controller),
            time,
            stats: IndexMap::new(),
            started_at: now,
            version: 0,
        }
    }

    /// Whether `self`, received from a peer, should replace `local`.
    ///
    /// The same game only moves forward. Between two different games the one
    /// started last wins, with the game id breaking ties, so both devices pick
    /// the same game whichever side evaluates it.
    pub fn supersedes(&self, local: Option<&LiveGameState>) -> bool {
        match local {
            None => true,
            Some(local) if local.game_id != self.game_id => {
                (self.started_at, self.game_id) > (local.started_at, local.game_id)
            }
            Some(local) => self.version > local.version,
        }
    }

    /// Apply `intent` on behalf of `actor`.
    ///
    /// Returns `Ok(true)` when the state changed (and the version was bumped),
    /// `Ok(false)` for a no-op, and an error without side effects when `actor`
    /// does not hold control or the intent is unusable.
    pub fn apply(
        &mut self,
        actor: &str,
        intent: GameIntent,
        now: OffsetDateTime,
    ) -> Result<bool, ControlError> {
        self.control.ensure_holder(actor)?;
        if self.version >= MAX_VERSION {
            return Err(ControlError::InvalidInput(
                "the game reached its last version".into(),
            ));
        }

        let changed = match intent {
            GameIntent::Score { side, delta } => {
                let score = match side {
                    Side::Home => &mut self.home_score,
                    Side::Away => &mut self.away_score,
                };
                let next = score.saturating_add_signed(delta);
                let changed = next != *score;
                *score = next;
                changed
            }
            GameIntent::SetOnCourt(on_court) => self.time.set_on_court(on_court, now),
            GameIntent::StartClock => self.clock.start(now),
            GameIntent::StopClock => self.clock.stop(now),
            GameIntent::SetClock(value) => {
                if self.clock.is_running() {
                    return Err(ControlError::InvalidInput(
                        "the clock must be stopped before it can be set".into(),
                    ));
                }
                let changed = self.clock.value_at_anchor() != value;
                self.clock.set(value);
                changed
            }
            GameIntent::NextPeriod => {
                if self.period >= MAX_PERIOD {
                    return Err(ControlError::InvalidInput(format!(
                        "a game has at most {MAX_PERIOD} periods"
                    )));
                }
                self.period += 1;
                self.clock = ClockAnchor::stopped(self.period_length);
                true
            }
            GameIntent::RecordStat {
                player,
                kind,
                delta,
            } => {
                if player.trim().is_empty() {
                    return Err(ControlError::InvalidInput(
                        "player name must not be empty".into(),
                    ));
                }
                let line = self.stats.entry(player).or_default();
                let counter = line.entry(kind).or_insert(0);
                let next = counter.saturating_add_signed(delta);
                let changed = next != *counter;
                *counter = next;
                changed
            }
        };

        if changed {
            self.bump();
        }
        Ok(changed)
    }

    /// Ask for control on behalf of `actor`. A grant bumps the version; a request does not,
    /// since it only marks the local copy until the holder records it.
    pub fn claim_control(
        &mut self,
        actor: &str,
        now: OffsetDateTime,
    ) -> Result<ClaimOutcome, ControlError> {
        let outcome = self.control.claim(actor, now)?;
        if outcome == ClaimOutcome::Granted {
            self.bump();
        }
        Ok(outcome)
    }

    /// Holder side: remember that `requester` wants control.
    pub fn record_request(&mut self, holder: &str, requester: &str, at: OffsetDateTime) -> bool {
        if !self.control.is_held_by(holder) {
            return false;
        }
        let recorded = self.control.record_request(requester, at);
        if recorded {
            self.bump();
        }
        recorded
    }

    /// Holder side: hand control to the pending requester.
    pub fn grant_request(&mut self, holder: &str) -> Result<String, ControlError> {
        self.control.ensure_holder(holder)?;
        let requester = self
            .control
            .requested_by()
            .map(str::to_string)
            .ok_or(ControlError::NoPendingRequest)?;
        self.control.hand_over(&requester);
        self.bump();
        Ok(requester)
    }

    /// Holder side: refuse the pending request.
    pub fn deny_request(&mut self, holder: &str) -> Result<String, ControlError> {
        self.control.ensure_holder(holder)?;
        let requester = self.control.deny()?;
        self.bump();
        Ok(requester)
    }

    /// Holder side: give up control so anyone may claim it.
    pub fn release_control(&mut self, holder: &str) -> Result<(), ControlError> {
        self.control.ensure_holder(holder)?;
        self.control.release();
        self.bump();
        Ok(())
    }

    /// Close the game: stop the clock, close the open segment at `ended_at`, and
    /// produce the immutable record handed to the durable store.
    pub fn finalize(
        mut self,
        actor: &str,
        ended_at: OffsetDateTime,
    ) -> Result<FinalizedGameRecord, ControlError> {
        self.control.ensure_holder(actor)?;
        self.clock.stop(ended_at);
        self.time.close_open(ended_at);

        Ok(FinalizedGameRecord {
            game_id: self.game_id,
            home_team: self.home_team,
            away_team: self.away_team,
            tracked_player: self.tracked_player,
            final_period: self.period,
            home_score: self.home_score,
            away_score: self.away_score,
            court_seconds: self.time.total_court(ended_at).as_secs_f64(),
            bench_seconds: self.time.total_bench(ended_at).as_secs_f64(),
            segments: self.time.segments().to_vec(),
            stats: self.stats,
            started_at: to_millis(self.started_at),
            ended_at: to_millis(ended_at),
            final_version: self.version.saturating_add(1),
        })
    }

    fn bump(&mut self) {
        self.version = self.version.saturating_add(1).min(MAX_VERSION);
    }
}
