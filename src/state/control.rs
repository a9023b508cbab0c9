use thiserror::Error;
use time::OffsetDateTime;

/// Policy violations returned synchronously to the caller. None of them has side effects.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlError {
    /// No live game exists to act on.
    #[error("no game is in progress")]
    NoActiveGame,
    /// Another device (or nobody) holds the control token.
    #[error("this device does not hold control (holder: {})", holder.as_deref().unwrap_or("nobody"))]
    NotInControl {
        /// Current holder, if any.
        holder: Option<String>,
    },
    /// Control was requested by the device that already holds it.
    #[error("this device already holds control")]
    AlreadyInControl,
    /// A new game was requested while another device runs the current one.
    #[error("a game is already in progress and controlled by another device")]
    GameAlreadyActive,
    /// There is no pending control request to answer.
    #[error("no control request is pending")]
    NoPendingRequest,
    /// The intent carried an unusable argument.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Outcome of asking for the control token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// Nobody held control; it now belongs to the requester.
    Granted,
    /// Another device holds control; a request was recorded for it.
    Requested {
        /// Device that must answer the request.
        holder: String,
    },
}

/// Single-writer token over the live game.
///
/// A request exists only while a *different* device holds control, and handing
/// control over clears it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControlState {
    controlling_device_id: Option<String>,
    requested_by: Option<String>,
    request_timestamp: Option<OffsetDateTime>,
}

impl ControlState {
    /// Control already held by `holder`.
    pub fn held_by(holder: impl Into<String>) -> Self {
        Self {
            controlling_device_id: Some(holder.into()),
            ..Self::default()
        }
    }

    /// Rebuild a received control state, dropping a request that would violate the invariant.
    pub fn from_parts(
        controlling_device_id: Option<String>,
        requested_by: Option<String>,
        request_timestamp: Option<OffsetDateTime>,
    ) -> Self {
        let request_valid = matches!(
            (&controlling_device_id, &requested_by),
            (Some(holder), Some(requester)) if holder != requester
        );
        if request_valid {
            Self {
                controlling_device_id,
                requested_by,
                request_timestamp,
            }
        } else {
            Self {
                controlling_device_id,
                requested_by: None,
                request_timestamp: None,
            }
        }
    }

    /// Device holding the token.
    pub fn holder(&self) -> Option<&str> {
        self.controlling_device_id.as_deref()
    }

    /// Device waiting for the token.
    pub fn requested_by(&self) -> Option<&str> {
        self.requested_by.as_deref()
    }

    /// When the pending request was made.
    pub fn request_timestamp(&self) -> Option<OffsetDateTime> {
        self.request_timestamp
    }

    /// Whether `device_id` holds the token.
    pub fn is_held_by(&self, device_id: &str) -> bool {
        self.holder() == Some(device_id)
    }

    /// Fail unless `device_id` holds the token.
    pub fn ensure_holder(&self, device_id: &str) -> Result<(), ControlError> {
        if self.is_held_by(device_id) {
            Ok(())
        } else {
            Err(ControlError::NotInControl {
                holder: self.controlling_device_id.clone(),
            })
        }
    }

    /// Ask for the token on behalf of `device_id`.
    pub fn claim(&mut self, device_id: &str, now: OffsetDateTime) -> Result<ClaimOutcome, ControlError> {
        match self.controlling_device_id.clone() {
            None => {
                self.hand_over(device_id);
                Ok(ClaimOutcome::Granted)
            }
            Some(holder) if holder == device_id => Err(ControlError::AlreadyInControl),
            Some(holder) => {
                self.requested_by = Some(device_id.to_string());
                self.request_timestamp = Some(now);
                Ok(ClaimOutcome::Requested { holder })
            }
        }
    }

    /// Record a request received by the holder. Returns `false` if it cannot be
    /// honoured or `requester` is already waiting.
    pub fn record_request(&mut self, requester: &str, at: OffsetDateTime) -> bool {
        if self.requested_by() == Some(requester) {
            return false;
        }
        match self.holder() {
            Some(holder) if holder != requester => {
                self.requested_by = Some(requester.to_string());
                self.request_timestamp = Some(at);
                true
            }
            _ => false,
        }
    }

    /// Give the token to `device_id`, clearing any request.
    pub fn hand_over(&mut self, device_id: &str) {
        self.controlling_device_id = Some(device_id.to_string());
        self.clear_request();
    }

    /// Drop the pending request. Returns the requester that was waiting.
    pub fn deny(&mut self) -> Result<String, ControlError> {
        let requester = self
            .requested_by
            .take()
            .ok_or(ControlError::NoPendingRequest)?;
        self.request_timestamp = None;
        Ok(requester)
    }

    /// Free the token.
    pub fn release(&mut self) {
        self.controlling_device_id = None;
        self.clear_request();
    }

    fn clear_request(&mut self) {
        self.requested_by = None;
        self.request_timestamp = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time_source::from_millis;

    #[test]
    fn free_token_is_granted_immediately() {
        let mut control = ControlState::default();
        let outcome = control.claim("a", from_millis(0)).unwrap();
        assert_eq!(outcome, ClaimOutcome::Granted);
        assert!(control.is_held_by("a"));
        assert_eq!(control.requested_by(), None);
    }

    #[test]
    fn claiming_a_held_token_records_a_request() {
        let mut control = ControlState::held_by("a");
        let outcome = control.claim("b", from_millis(5)).unwrap();
        assert_eq!(
            outcome,
            ClaimOutcome::Requested {
                holder: "a".into()
            }
        );
        assert!(control.is_held_by("a"));
        assert_eq!(control.requested_by(), Some("b"));
        assert_eq!(control.request_timestamp(), Some(from_millis(5)));
    }

    #[test]
    fn holder_cannot_claim_again() {
        let mut control = ControlState::held_by("a");
        assert_eq!(
            control.claim("a", from_millis(0)),
            Err(ControlError::AlreadyInControl)
        );
        assert_eq!(control, ControlState::held_by("a"));
    }

    #[test]
    fn non_holder_is_rejected() {
        let control = ControlState::held_by("a");
        assert_eq!(
            control.ensure_holder("b"),
            Err(ControlError::NotInControl {
                holder: Some("a".into())
            })
        );
        assert!(control.ensure_holder("a").is_ok());
        assert!(ControlState::default().ensure_holder("a").is_err());
    }

    #[test]
    fn hand_over_clears_the_request() {
        let mut control = ControlState::held_by("a");
        assert!(control.record_request("b", from_millis(1)));
        control.hand_over("b");
        assert!(control.is_held_by("b"));
        assert_eq!(control.requested_by(), None);
        assert_eq!(control.request_timestamp(), None);
    }

    #[test]
    fn requests_need_a_different_holder() {
        let mut free = ControlState::default();
        assert!(!free.record_request("b", from_millis(1)));

        let mut held = ControlState::held_by("a");
        assert!(!held.record_request("a", from_millis(1)));
    }

    #[test]
    fn repeated_request_keeps_the_first_timestamp() {
        let mut control = ControlState::held_by("a");
        assert!(control.record_request("b", from_millis(1)));
        assert!(!control.record_request("b", from_millis(2)));
        assert_eq!(control.request_timestamp(), Some(from_millis(1)));
    }

    #[test]
    fn deny_without_request_is_an_error() {
        let mut control = ControlState::held_by("a");
        assert_eq!(control.deny(), Err(ControlError::NoPendingRequest));
        control.record_request("b", from_millis(1));
        assert_eq!(control.deny(), Ok("b".into()));
        assert!(control.is_held_by("a"));
    }

    #[test]
    fn received_state_cannot_carry_a_self_request() {
        let control = ControlState::from_parts(Some("a".into()), Some("a".into()), Some(from_millis(1)));
        assert_eq!(control.requested_by(), None);
        assert_eq!(control.request_timestamp(), None);
    }
}
