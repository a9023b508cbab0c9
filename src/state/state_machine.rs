use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;

use crate::state::identity::DeviceIdentity;

/// Connection lifecycle of the single transport session this device owns.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, ToSchema)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum ConnectionState {
    /// Nothing running; waiting to be enabled or for the reconnect backoff.
    #[default]
    Idle,
    /// Discovery is running.
    Scanning,
    /// A trusted peer showed up (display name).
    FoundTrustedPeer(String),
    /// An outbound or accepted connection attempt is in flight (display name).
    Connecting(String),
    /// A session is established with the peer.
    Connected(DeviceIdentity),
    /// Scanning found nothing usable before the timeout.
    Unavailable,
    /// Turned off by the user; nothing runs until re-enabled.
    Disabled,
    /// Last attempt failed; a retry is scheduled.
    Error(String),
}

impl ConnectionState {
    /// Peer of the established session.
    pub fn connected_peer(&self) -> Option<&DeviceIdentity> {
        match self {
            ConnectionState::Connected(peer) => Some(peer),
            _ => None,
        }
    }

    /// Whether a connection attempt is in flight.
    pub fn is_connecting(&self) -> bool {
        matches!(self, ConnectionState::Connecting(_))
    }
}

/// Events driving [`ConnectionStateMachine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// User (or startup) turned connectivity on.
    Enable,
    /// User turned connectivity off.
    Disable,
    /// Discovery reported a peer, already classified against the trust list.
    PeerFound {
        identity: DeviceIdentity,
        trusted: bool,
    },
    /// Start connecting to the trusted peer that was just found.
    AttemptConnect,
    /// A trusted peer invited us and we accepted.
    InvitationAccepted(DeviceIdentity),
    /// The transport reports a live session.
    SessionEstablished(DeviceIdentity),
    /// The transport could not establish the session.
    ConnectFailed(String),
    /// The in-flight attempt exceeded its deadline.
    ConnectTimeout,
    /// The error backoff elapsed.
    RetryElapsed,
    /// The established session dropped.
    TransportLost,
    /// The reconnect backoff elapsed.
    ReconnectElapsed,
    /// Scanning exceeded its deadline.
    ScanTimeout,
}

/// Error returned when an event cannot be applied in the current state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition: {event:?} cannot be applied while in {from:?}")]
pub struct InvalidTransition {
    /// State the machine was in.
    pub from: ConnectionState,
    /// Rejected event.
    pub event: ConnectionEvent,
}

/// Pure transition table for the connection lifecycle.
///
/// Timers and transport side effects live in the node; this type only decides
/// which state follows which event.
#[derive(Debug, Clone, Default)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    pending_peer: Option<DeviceIdentity>,
}

impl ConnectionStateMachine {
    /// Create a machine in [`ConnectionState::Idle`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Trusted peer being connected to (set from `FoundTrustedPeer` until connected or failed).
    pub fn pending_peer(&self) -> Option<&DeviceIdentity> {
        self.pending_peer.as_ref()
    }

    /// Apply `event`, returning the new state. Invalid events leave the machine untouched.
    pub fn apply(&mut self, event: ConnectionEvent) -> Result<ConnectionState, InvalidTransition> {
        let (next, pending) = self.compute_transition(event)?;
        self.state = next;
        self.pending_peer = pending;
        Ok(self.state.clone())
    }

    fn compute_transition(
        &self,
        event: ConnectionEvent,
    ) -> Result<(ConnectionState, Option<DeviceIdentity>), InvalidTransition> {
        use ConnectionEvent as E;
        use ConnectionState as S;

        let keep_pending = self.pending_peer.clone();
        let next = match (&self.state, event) {
            (_, E::Disable) => (S::Disabled, None),
            (S::Idle | S::Unavailable | S::Disabled, E::Enable) => (S::Scanning, None),
            (S::Idle, E::ReconnectElapsed) => (S::Scanning, None),
            (S::Scanning, E::PeerFound { identity, trusted: true }) => {
                (S::FoundTrustedPeer(identity.display_name.clone()), Some(identity))
            }
            (S::FoundTrustedPeer(name), E::AttemptConnect) => {
                (S::Connecting(name.clone()), keep_pending)
            }
            (S::Scanning, E::InvitationAccepted(identity)) => {
                (S::Connecting(identity.display_name.clone()), Some(identity))
            }
            (S::Connecting(_), E::SessionEstablished(peer)) => (S::Connected(peer), None),
            (S::Connecting(_), E::ConnectFailed(reason)) => (S::Error(reason), None),
            (S::Connecting(_), E::ConnectTimeout) => {
                (S::Error("connection timed out".into()), None)
            }
            (S::Connecting(_), E::TransportLost) => {
                (S::Error("session dropped while connecting".into()), None)
            }
            (S::Error(_), E::RetryElapsed) => (S::Scanning, None),
            (S::Connected(_), E::TransportLost) => (S::Idle, None),
            (S::Scanning, E::ScanTimeout) => (S::Unavailable, None),
            (from, event) => {
                return Err(InvalidTransition {
                    from: from.clone(),
                    event,
                });
            }
        };

        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: &str) -> DeviceIdentity {
        DeviceIdentity::new(id, format!("{id}-phone"))
    }

    fn apply(sm: &mut ConnectionStateMachine, event: ConnectionEvent) -> ConnectionState {
        sm.apply(event).unwrap()
    }

    #[test]
    fn initial_state_is_idle() {
        assert_eq!(ConnectionStateMachine::new().state(), &ConnectionState::Idle);
    }

    #[test]
    fn full_happy_path_through_connection() {
        let mut sm = ConnectionStateMachine::new();
        assert_eq!(apply(&mut sm, ConnectionEvent::Enable), ConnectionState::Scanning);
        assert_eq!(
            apply(
                &mut sm,
                ConnectionEvent::PeerFound {
                    identity: peer("a"),
                    trusted: true
                }
            ),
            ConnectionState::FoundTrustedPeer("a-phone".into())
        );
        assert_eq!(sm.pending_peer(), Some(&peer("a")));
        assert_eq!(
            apply(&mut sm, ConnectionEvent::AttemptConnect),
            ConnectionState::Connecting("a-phone".into())
        );
        assert_eq!(sm.pending_peer(), Some(&peer("a")));
        assert_eq!(
            apply(&mut sm, ConnectionEvent::SessionEstablished(peer("a"))),
            ConnectionState::Connected(peer("a"))
        );
        assert_eq!(apply(&mut sm, ConnectionEvent::TransportLost), ConnectionState::Idle);
        assert_eq!(
            apply(&mut sm, ConnectionEvent::ReconnectElapsed),
            ConnectionState::Scanning
        );
    }

    #[test]
    fn untrusted_peers_are_ignored_while_scanning() {
        let mut sm = ConnectionStateMachine::new();
        apply(&mut sm, ConnectionEvent::Enable);
        let err = sm
            .apply(ConnectionEvent::PeerFound {
                identity: peer("stranger"),
                trusted: false,
            })
            .unwrap_err();
        assert_eq!(err.from, ConnectionState::Scanning);
        assert_eq!(sm.state(), &ConnectionState::Scanning);
    }

    #[test]
    fn second_trusted_peer_is_ignored_while_connecting() {
        let mut sm = ConnectionStateMachine::new();
        apply(&mut sm, ConnectionEvent::Enable);
        apply(
            &mut sm,
            ConnectionEvent::PeerFound {
                identity: peer("a"),
                trusted: true,
            },
        );
        apply(&mut sm, ConnectionEvent::AttemptConnect);
        assert!(
            sm.apply(ConnectionEvent::PeerFound {
                identity: peer("b"),
                trusted: true
            })
            .is_err()
        );
        assert_eq!(sm.pending_peer(), Some(&peer("a")));
    }

    #[test]
    fn timeout_then_retry_returns_to_scanning() {
        let mut sm = ConnectionStateMachine::new();
        apply(&mut sm, ConnectionEvent::Enable);
        apply(&mut sm, ConnectionEvent::InvitationAccepted(peer("a")));
        assert_eq!(
            apply(&mut sm, ConnectionEvent::ConnectTimeout),
            ConnectionState::Error("connection timed out".into())
        );
        assert_eq!(sm.pending_peer(), None);
        assert_eq!(apply(&mut sm, ConnectionEvent::RetryElapsed), ConnectionState::Scanning);
    }

    #[test]
    fn scan_timeout_makes_peer_unavailable_until_enabled() {
        let mut sm = ConnectionStateMachine::new();
        apply(&mut sm, ConnectionEvent::Enable);
        assert_eq!(apply(&mut sm, ConnectionEvent::ScanTimeout), ConnectionState::Unavailable);
        assert!(sm.apply(ConnectionEvent::ReconnectElapsed).is_err());
        assert_eq!(apply(&mut sm, ConnectionEvent::Enable), ConnectionState::Scanning);
    }

    #[test]
    fn disable_wins_from_any_state() {
        let mut sm = ConnectionStateMachine::new();
        apply(&mut sm, ConnectionEvent::Enable);
        apply(&mut sm, ConnectionEvent::InvitationAccepted(peer("a")));
        apply(&mut sm, ConnectionEvent::SessionEstablished(peer("a")));
        assert_eq!(apply(&mut sm, ConnectionEvent::Disable), ConnectionState::Disabled);
        assert!(sm.apply(ConnectionEvent::ReconnectElapsed).is_err());
        assert!(sm.apply(ConnectionEvent::ScanTimeout).is_err());
        assert_eq!(apply(&mut sm, ConnectionEvent::Enable), ConnectionState::Scanning);
    }

    #[test]
    fn enable_while_connected_is_invalid() {
        let mut sm = ConnectionStateMachine::new();
        apply(&mut sm, ConnectionEvent::Enable);
        apply(&mut sm, ConnectionEvent::InvitationAccepted(peer("a")));
        apply(&mut sm, ConnectionEvent::SessionEstablished(peer("a")));
        assert!(sm.apply(ConnectionEvent::Enable).is_err());
        assert_eq!(sm.state(), &ConnectionState::Connected(peer("a")));
        assert_eq!(sm.pending_peer(), None);
    }
}
