//! Typed send/receive over the active session.
//!
//! Outbound messages that cannot be transmitted wait in a FIFO retry queue that
//! is drained when a session comes back. Inbound frames are decoded, keep-alive
//! traffic is answered here, and everything else is handed to the node.

use std::collections::{HashSet, VecDeque};

use serde::Serialize;
use time::OffsetDateTime;
use tracing::{debug, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    dto::message::{GameMessage, MessageType},
    services::transport::Transport,
};

/// Counters exposed for diagnostics only.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
pub struct Diagnostics {
    /// Snapshots discarded because they were not newer than the local state.
    pub stale_updates: u64,
    /// Frames that could not be decoded.
    pub undecodable_messages: u64,
    /// Frames dropped because their id was already delivered.
    pub duplicate_messages: u64,
    /// Messages transmitted from the retry queue.
    pub retried_messages: u64,
    /// Messages dropped because the retry queue was full.
    pub dropped_messages: u64,
    /// Messages currently waiting in the retry queue.
    pub queued_messages: usize,
}

/// What happened to an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Handed to the transport.
    Sent,
    /// Waiting in the retry queue for the next session.
    Queued,
    /// Keep-alive traffic is never retried.
    Dropped,
}

/// Outbound retry queue and inbound duplicate filter of one node.
pub struct MessageBus {
    local_id: String,
    retry: VecDeque<GameMessage>,
    queued_ids: HashSet<Uuid>,
    capacity: usize,
    seen: VecDeque<Uuid>,
    seen_ids: HashSet<Uuid>,
    seen_window: usize,
    diagnostics: Diagnostics,
}

impl MessageBus {
    /// Bus for `local_id` with a bounded retry queue and duplicate window.
    pub fn new(local_id: impl Into<String>, capacity: usize, seen_window: usize) -> Self {
        Self {
            local_id: local_id.into(),
            retry: VecDeque::new(),
            queued_ids: HashSet::new(),
            capacity: capacity.max(1),
            seen: VecDeque::new(),
            seen_ids: HashSet::new(),
            seen_window: seen_window.max(1),
            diagnostics: Diagnostics::default(),
        }
    }

    /// Transmit `message` if a session is up, otherwise (or on failure) queue it.
    pub fn send(
        &mut self,
        transport: &dyn Transport,
        message: GameMessage,
        connected: bool,
    ) -> SendOutcome {
        if connected {
            match encode(&message) {
                Some(frame) => match transport.send(frame) {
                    Ok(()) => return SendOutcome::Sent,
                    Err(err) => {
                        debug!(id = %message.id(), kind = ?message.kind(), error = %err, "send failed");
                    }
                },
                None => return SendOutcome::Dropped,
            }
        }

        if message.kind().is_keepalive() {
            return SendOutcome::Dropped;
        }
        self.enqueue(message);
        SendOutcome::Queued
    }

    /// Resend queued messages in their original order. Stops at the first failure,
    /// leaving the rest queued. Returns how many went out.
    pub fn drain(&mut self, transport: &dyn Transport) -> usize {
        let mut sent = 0;
        while let Some(message) = self.retry.pop_front() {
            let Some(frame) = encode(&message) else {
                self.queued_ids.remove(&message.id());
                continue;
            };
            if let Err(err) = transport.send(frame) {
                warn!(error = %err, remaining = self.retry.len() + 1, "retry queue drain interrupted");
                self.retry.push_front(message);
                break;
            }
            self.queued_ids.remove(&message.id());
            self.diagnostics.retried_messages += 1;
            sent += 1;
        }
        if sent > 0 {
            debug!(sent, "retry queue drained");
        }
        sent
    }

    /// Decode one inbound frame.
    ///
    /// `Ping` is answered with `Pong` right here; keep-alive traffic, duplicates
    /// and undecodable frames yield `None`.
    pub fn receive(
        &mut self,
        transport: &dyn Transport,
        frame: &[u8],
        now: OffsetDateTime,
    ) -> Option<GameMessage> {
        let message = match GameMessage::decode(frame) {
            Ok(message) => message,
            Err(err) => {
                self.diagnostics.undecodable_messages += 1;
                warn!(error = %err, bytes = frame.len(), "dropping undecodable message");
                return None;
            }
        };

        match message.kind() {
            MessageType::Ping => {
                let pong = GameMessage::signal(MessageType::Pong, &self.local_id, now);
                self.send(transport, pong, true);
                None
            }
            MessageType::Pong => None,
            _ if !self.remember(message.id()) => {
                self.diagnostics.duplicate_messages += 1;
                debug!(id = %message.id(), kind = ?message.kind(), "dropping duplicate message");
                None
            }
            _ => Some(message),
        }
    }

    /// Count a snapshot that lost the version check.
    pub fn record_stale(&mut self) {
        self.diagnostics.stale_updates += 1;
    }

    /// Count a payload that decoded as a message but not as its content.
    pub fn record_undecodable(&mut self) {
        self.diagnostics.undecodable_messages += 1;
    }

    /// Counters so far, plus the current retry queue length.
    pub fn diagnostics(&self) -> Diagnostics {
        Diagnostics {
            queued_messages: self.retry.len(),
            ..self.diagnostics
        }
    }

    fn enqueue(&mut self, message: GameMessage) {
        if !self.queued_ids.insert(message.id()) {
            return;
        }
        if self.retry.len() >= self.capacity
            && let Some(oldest) = self.retry.pop_front()
        {
            self.queued_ids.remove(&oldest.id());
            self.diagnostics.dropped_messages += 1;
            warn!(id = %oldest.id(), kind = ?oldest.kind(), "retry queue full; dropping oldest message");
        }
        debug!(id = %message.id(), kind = ?message.kind(), "queued message for retry");
        self.retry.push_back(message);
    }

    /// Returns `false` when `id` was already seen.
    fn remember(&mut self, id: Uuid) -> bool {
        if !self.seen_ids.insert(id) {
            return false;
        }
        self.seen.push_back(id);
        if self.seen.len() > self.seen_window
            && let Some(evicted) = self.seen.pop_front()
        {
            self.seen_ids.remove(&evicted);
        }
        true
    }
}

fn encode(message: &GameMessage) -> Option<Vec<u8>> {
    match message.encode() {
        Ok(frame) => Some(frame),
        Err(err) => {
            warn!(id = %message.id(), error = %err, "failed to encode message");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicBool, Ordering},
    };

    use super::*;
    use crate::{
        dto::message::Payload,
        services::transport::TransportError,
        state::identity::DeviceIdentity,
        time_source::from_millis,
    };

    #[derive(Default)]
    struct FakeTransport {
        sent: Mutex<Vec<GameMessage>>,
        down: AtomicBool,
    }

    impl FakeTransport {
        fn sent_kinds(&self) -> Vec<MessageType> {
            self.sent.lock().unwrap().iter().map(GameMessage::kind).collect()
        }
    }

    impl Transport for FakeTransport {
        fn connect(&self, _peer: &DeviceIdentity) -> Result<(), TransportError> {
            Ok(())
        }
        fn accept(&self, _peer: &DeviceIdentity) -> Result<(), TransportError> {
            Ok(())
        }
        fn reject(&self, _peer: &DeviceIdentity) {}
        fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(TransportError::NotConnected);
            }
            self.sent
                .lock()
                .unwrap()
                .push(GameMessage::decode(&frame).unwrap());
            Ok(())
        }
        fn disconnect(&self) {}
    }

    fn message(kind: MessageType) -> GameMessage {
        GameMessage::new(kind, Payload::new(), "me", from_millis(0))
    }

    #[test]
    fn disconnected_sends_are_replayed_in_order_once() {
        let transport = FakeTransport::default();
        let mut bus = MessageBus::new("me", 8, 8);

        let first = message(MessageType::ControlRequest);
        let second = message(MessageType::StartRecording);
        assert_eq!(bus.send(&transport, first.clone(), false), SendOutcome::Queued);
        assert_eq!(bus.send(&transport, second.clone(), false), SendOutcome::Queued);
        assert_eq!(bus.send(&transport, first.clone(), false), SendOutcome::Queued);
        assert_eq!(bus.diagnostics().queued_messages, 2);

        assert_eq!(bus.drain(&transport), 2);
        assert_eq!(bus.drain(&transport), 0);
        let sent = transport.sent.lock().unwrap().clone();
        assert_eq!(sent, vec![first, second]);
        assert_eq!(bus.diagnostics().retried_messages, 2);
    }

    #[test]
    fn failed_send_is_queued_and_drain_stops_at_first_failure() {
        let transport = FakeTransport::default();
        transport.down.store(true, Ordering::SeqCst);
        let mut bus = MessageBus::new("me", 8, 8);

        assert_eq!(
            bus.send(&transport, message(MessageType::GameStateUpdate), true),
            SendOutcome::Queued
        );
        assert_eq!(bus.drain(&transport), 0);
        assert_eq!(bus.diagnostics().queued_messages, 1);

        transport.down.store(false, Ordering::SeqCst);
        assert_eq!(bus.drain(&transport), 1);
        assert_eq!(transport.sent_kinds(), vec![MessageType::GameStateUpdate]);
    }

    #[test]
    fn keepalive_is_never_queued() {
        let transport = FakeTransport::default();
        let mut bus = MessageBus::new("me", 8, 8);
        assert_eq!(
            bus.send(&transport, message(MessageType::Ping), false),
            SendOutcome::Dropped
        );
        assert_eq!(bus.diagnostics().queued_messages, 0);
    }

    #[test]
    fn full_queue_drops_the_oldest() {
        let transport = FakeTransport::default();
        let mut bus = MessageBus::new("me", 2, 8);
        let kinds = [
            MessageType::StartRecording,
            MessageType::StopRecording,
            MessageType::ControlRelease,
        ];
        for kind in kinds {
            bus.send(&transport, message(kind), false);
        }
        bus.drain(&transport);
        assert_eq!(
            transport.sent_kinds(),
            vec![MessageType::StopRecording, MessageType::ControlRelease]
        );
        assert_eq!(bus.diagnostics().dropped_messages, 1);
    }

    #[test]
    fn ping_is_answered_and_not_surfaced() {
        let transport = FakeTransport::default();
        let mut bus = MessageBus::new("me", 8, 8);
        let ping = GameMessage::signal(MessageType::Ping, "peer", from_millis(0))
            .encode()
            .unwrap();

        assert!(bus.receive(&transport, &ping, from_millis(1)).is_none());
        let sent = transport.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind(), MessageType::Pong);
        assert_eq!(sent[0].sender_id(), "me");
    }

    #[test]
    fn duplicates_and_garbage_are_dropped_and_counted() {
        let transport = FakeTransport::default();
        let mut bus = MessageBus::new("me", 8, 2);
        let update = message(MessageType::GameStateUpdate);
        let frame = update.encode().unwrap();

        assert_eq!(bus.receive(&transport, &frame, from_millis(0)), Some(update));
        assert!(bus.receive(&transport, &frame, from_millis(0)).is_none());
        assert!(bus.receive(&transport, b"\x00\x01", from_millis(0)).is_none());

        let diagnostics = bus.diagnostics();
        assert_eq!(diagnostics.duplicate_messages, 1);
        assert_eq!(diagnostics.undecodable_messages, 1);
    }

    #[test]
    fn seen_window_is_bounded() {
        let transport = FakeTransport::default();
        let mut bus = MessageBus::new("me", 8, 2);
        let first = message(MessageType::StartRecording);
        bus.receive(&transport, &first.encode().unwrap(), from_millis(0));
        for _ in 0..2 {
            let other = message(MessageType::StopRecording);
            bus.receive(&transport, &other.encode().unwrap(), from_millis(0));
        }
        assert!(
            bus.receive(&transport, &first.encode().unwrap(), from_millis(0))
                .is_some()
        );
    }
}
