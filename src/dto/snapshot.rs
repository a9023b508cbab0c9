//! Field-keyed encoding of a full [`LiveGameState`] snapshot.
//!
//! `GameStateUpdate`, `GameStarting`, `GameEnded`, `ControlGrant` and
//! `ControlRelease` all carry the whole state, never a diff.

use std::{str::FromStr, time::Duration};

use indexmap::IndexMap;
use uuid::Uuid;

use crate::{
    dto::message::{DecodeError, Payload},
    state::{
        clock::ClockAnchor,
        control::ControlState,
        game::{LiveGameState, MAX_PERIOD, MAX_VERSION, StatLine},
        segments::{TimeSegment, TimeTracker},
    },
    time_source::{from_millis, to_millis},
};

pub const KEY_VERSION: &str = "version";
pub const KEY_GAME_ID: &str = "gameId";
pub const KEY_HOME_TEAM: &str = "homeTeam";
pub const KEY_AWAY_TEAM: &str = "awayTeam";
pub const KEY_TRACKED_PLAYER: &str = "trackedPlayer";
pub const KEY_PERIOD: &str = "period";
pub const KEY_PERIOD_LENGTH_MS: &str = "periodLengthMs";
pub const KEY_HOME_SCORE: &str = "homeScore";
pub const KEY_AWAY_SCORE: &str = "awayScore";
pub const KEY_CLOCK_RUNNING: &str = "clockRunning";
pub const KEY_CLOCK_VALUE_MS: &str = "clockValueMs";
pub const KEY_CLOCK_ANCHOR_MS: &str = "clockAnchorMs";
pub const KEY_CONTROLLING_DEVICE: &str = "controllingDeviceId";
pub const KEY_REQUESTED_BY: &str = "requestedBy";
pub const KEY_REQUEST_TIMESTAMP_MS: &str = "requestTimestampMs";
pub const KEY_SEGMENTS: &str = "segments";
pub const KEY_STATS: &str = "stats";
pub const KEY_STARTED_AT_MS: &str = "startedAtMs";

/// Grantee named by a `ControlGrant`.
pub const KEY_GRANTEE: &str = "grantee";
/// Requester named by a `ControlRequest`.
pub const KEY_REQUESTER: &str = "requester";
/// Flag carried by `RecordingStateUpdate`.
pub const KEY_IS_RECORDING: &str = "isRecording";

/// Encode every field of `state`, plus its version.
pub fn encode_snapshot(state: &LiveGameState) -> Payload {
    let mut payload = Payload::new();
    let mut put = |key: &str, value: String| {
        payload.insert(key.to_string(), value);
    };

    put(KEY_VERSION, state.version.to_string());
    put(KEY_GAME_ID, state.game_id.to_string());
    put(KEY_HOME_TEAM, state.home_team.clone());
    put(KEY_AWAY_TEAM, state.away_team.clone());
    put(KEY_TRACKED_PLAYER, state.tracked_player.clone());
    put(KEY_PERIOD, state.period.to_string());
    put(
        KEY_PERIOD_LENGTH_MS,
        state.period_length.as_millis().to_string(),
    );
    put(KEY_HOME_SCORE, state.home_score.to_string());
    put(KEY_AWAY_SCORE, state.away_score.to_string());
    put(KEY_CLOCK_RUNNING, state.clock.is_running().to_string());
    put(
        KEY_CLOCK_VALUE_MS,
        state.clock.value_at_anchor().as_millis().to_string(),
    );
    if let Some(anchor) = state.clock.anchor_timestamp() {
        put(KEY_CLOCK_ANCHOR_MS, to_millis(anchor).to_string());
    }
    if let Some(holder) = state.control.holder() {
        put(KEY_CONTROLLING_DEVICE, holder.to_string());
    }
    if let Some(requester) = state.control.requested_by() {
        put(KEY_REQUESTED_BY, requester.to_string());
    }
    if let Some(at) = state.control.request_timestamp() {
        put(KEY_REQUEST_TIMESTAMP_MS, to_millis(at).to_string());
    }
    put(
        KEY_SEGMENTS,
        serde_json::to_string(state.time.segments()).unwrap_or_else(|_| "[]".into()),
    );
    put(
        KEY_STATS,
        serde_json::to_string(&state.stats).unwrap_or_else(|_| "{}".into()),
    );
    put(KEY_STARTED_AT_MS, to_millis(state.started_at).to_string());

    payload
}

/// Rebuild a [`LiveGameState`] from a snapshot payload.
pub fn decode_snapshot(payload: &Payload) -> Result<LiveGameState, DecodeError> {
    let clock = if parse::<bool>(payload, KEY_CLOCK_RUNNING)? {
        ClockAnchor::running(
            millis_duration(payload, KEY_CLOCK_VALUE_MS)?,
            from_millis(parse(payload, KEY_CLOCK_ANCHOR_MS)?),
        )
    } else {
        ClockAnchor::stopped(millis_duration(payload, KEY_CLOCK_VALUE_MS)?)
    };

    let control = ControlState::from_parts(
        optional(payload, KEY_CONTROLLING_DEVICE),
        optional(payload, KEY_REQUESTED_BY),
        optional(payload, KEY_REQUEST_TIMESTAMP_MS)
            .map(|raw| {
                raw.parse::<i64>().map_err(|_| DecodeError::InvalidField {
                    field: KEY_REQUEST_TIMESTAMP_MS,
                    value: raw,
                })
            })
            .transpose()?
            .map(from_millis),
    );

    let segments: Vec<TimeSegment> = json_field(payload, KEY_SEGMENTS)?;
    let stats: IndexMap<String, StatLine> = json_field(payload, KEY_STATS)?;

    Ok(LiveGameState {
        game_id: parse::<Uuid>(payload, KEY_GAME_ID)?,
        home_team: required(payload, KEY_HOME_TEAM)?.to_string(),
        away_team: required(payload, KEY_AWAY_TEAM)?.to_string(),
        tracked_player: required(payload, KEY_TRACKED_PLAYER)?.to_string(),
        period: bounded(payload, KEY_PERIOD, 1, MAX_PERIOD)?,
        period_length: millis_duration(payload, KEY_PERIOD_LENGTH_MS)?,
        home_score: parse(payload, KEY_HOME_SCORE)?,
        away_score: parse(payload, KEY_AWAY_SCORE)?,
        clock,
        control,
        time: TimeTracker::from_segments(segments),
        stats,
        started_at: from_millis(parse(payload, KEY_STARTED_AT_MS)?),
        version: bounded(payload, KEY_VERSION, 0, MAX_VERSION)?,
    })
}

fn required<'a>(payload: &'a Payload, key: &'static str) -> Result<&'a str, DecodeError> {
    payload
        .get(key)
        .map(String::as_str)
        .ok_or(DecodeError::MissingField(key))
}

fn optional(payload: &Payload, key: &str) -> Option<String> {
    payload.get(key).filter(|value| !value.is_empty()).cloned()
}

fn parse<T: FromStr>(payload: &Payload, key: &'static str) -> Result<T, DecodeError> {
    let raw = required(payload, key)?;
    raw.parse().map_err(|_| DecodeError::InvalidField {
        field: key,
        value: raw.to_string(),
    })
}

fn bounded<T: FromStr + PartialOrd>(
    payload: &Payload,
    key: &'static str,
    min: T,
    max: T,
) -> Result<T, DecodeError> {
    let value: T = parse(payload, key)?;
    if value < min || value > max {
        return Err(DecodeError::InvalidField {
            field: key,
            value: required(payload, key)?.to_string(),
        });
    }
    Ok(value)
}

fn millis_duration(payload: &Payload, key: &'static str) -> Result<Duration, DecodeError> {
    parse::<u64>(payload, key).map(Duration::from_millis)
}

fn json_field<T: serde::de::DeserializeOwned>(
    payload: &Payload,
    key: &'static str,
) -> Result<T, DecodeError> {
    let raw = required(payload, key)?;
    serde_json::from_str(raw).map_err(|_| DecodeError::InvalidField {
        field: key,
        value: raw.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::game::{GameIntent, Side, StatKind};

    fn sample() -> LiveGameState {
        let start = from_millis(1_700_000_000_000);
        let mut game = LiveGameState::new(
            "Hawks".into(),
            "Owls".into(),
            "Sam".into(),
            "ctl",
            Duration::from_secs(600),
            start,
        );
        let later = from_millis(1_700_000_030_000);
        game.apply("ctl", GameIntent::Score { side: Side::Away, delta: 3 }, later)
            .unwrap();
        game.apply("ctl", GameIntent::SetOnCourt(true), later).unwrap();
        game.apply(
            "ctl",
            GameIntent::RecordStat {
                player: "Sam".into(),
                kind: StatKind::Assist,
                delta: 1,
            },
            later,
        )
        .unwrap();
        game.apply("ctl", GameIntent::StartClock, later).unwrap();
        game.record_request("ctl", "rec", later);
        game
    }

    #[test]
    fn snapshot_carries_every_field() {
        let game = sample();
        let decoded = decode_snapshot(&encode_snapshot(&game)).unwrap();
        assert_eq!(decoded, game);
    }

    #[test]
    fn stopped_clock_has_no_anchor_on_the_wire() {
        let mut game = sample();
        game.apply("ctl", GameIntent::StopClock, from_millis(1_700_000_040_000))
            .unwrap();
        let payload = encode_snapshot(&game);
        assert_eq!(payload[KEY_CLOCK_RUNNING], "false");
        assert!(!payload.contains_key(KEY_CLOCK_ANCHOR_MS));
    }

    #[test]
    fn running_clock_without_anchor_is_rejected() {
        let mut payload = encode_snapshot(&sample());
        payload.shift_remove(KEY_CLOCK_ANCHOR_MS);
        assert!(matches!(
            decode_snapshot(&payload),
            Err(DecodeError::MissingField(KEY_CLOCK_ANCHOR_MS))
        ));
    }

    #[test]
    fn invalid_numbers_are_reported_by_field() {
        let mut payload = encode_snapshot(&sample());
        payload.insert(KEY_HOME_SCORE.into(), "lots".into());
        match decode_snapshot(&payload) {
            Err(DecodeError::InvalidField { field, value }) => {
                assert_eq!(field, KEY_HOME_SCORE);
                assert_eq!(value, "lots");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn out_of_range_period_and_version_are_rejected() {
        for (key, value) in [
            (KEY_PERIOD, u32::MAX.to_string()),
            (KEY_PERIOD, "0".to_string()),
            (KEY_VERSION, u64::MAX.to_string()),
        ] {
            let mut payload = encode_snapshot(&sample());
            payload.insert(key.into(), value.clone());
            match decode_snapshot(&payload) {
                Err(DecodeError::InvalidField { field, value: got }) => {
                    assert_eq!(field, key);
                    assert_eq!(got, value);
                }
                other => panic!("unexpected result for {key}={value}: {other:?}"),
            }
        }

        let mut payload = encode_snapshot(&sample());
        payload.insert(KEY_PERIOD.into(), MAX_PERIOD.to_string());
        assert_eq!(decode_snapshot(&payload).unwrap().period, MAX_PERIOD);
    }
}
