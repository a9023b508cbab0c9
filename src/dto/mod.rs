use time::{OffsetDateTime, format_description::well_known::Rfc3339};

pub mod device;
pub mod game;
pub mod health;
pub mod message;
pub mod snapshot;
pub mod sse;
pub mod validation;

fn format_timestamp(at: OffsetDateTime) -> String {
    at.format(&Rfc3339)
        .unwrap_or_else(|_| "invalid-timestamp".into())
}
