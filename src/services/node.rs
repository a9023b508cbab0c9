//! The sync node: one task that owns the connection lifecycle, the message bus,
//! the trusted device registry and the live game.
//!
//! Every input (local intents, transport and discovery callbacks, timer
//! firings, persistence outcomes) is funnelled into the same loop and handled
//! one at a time, so nothing here needs a lock. Callers talk to the node
//! through a cloneable [`NodeHandle`] and observe it through watch channels and
//! the [`EventHub`].

use std::{
    collections::{HashSet, VecDeque},
    future::pending,
    sync::Arc,
    time::Duration,
};

use serde::Serialize;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::{Instant, sleep_until},
};
use tracing::{debug, info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    config::{AppConfig, Timings},
    dao::{
        game_store::GameStore,
        models::FinalizedGameRecord,
        trust_store::TrustStore,
    },
    dto::{
        message::{GameMessage, MessageType, Payload},
        snapshot::{KEY_GAME_ID, KEY_GRANTEE, KEY_IS_RECORDING, KEY_REQUESTER, decode_snapshot, encode_snapshot},
    },
    error::ServiceError,
    services::{
        discovery::{ActiveDiscovery, Discovery, DiscoveryEvent},
        message_bus::{Diagnostics, MessageBus},
        storage_supervisor::{self, PersistCommand, PersistOutcome},
        transport::{NetworkLink, Transport, TransportEvent},
        trust_writer,
    },
    state::{
        control::{ClaimOutcome, ControlError},
        game::{GameIntent, LiveGameState, Side, StatKind},
        hub::{EventHub, NodeEvent, RecordingSignal},
        identity::{DeviceIdentity, Role},
        registry::{TrustedDeviceRegistry, TrustedPeerEntry},
        state_machine::{ConnectionEvent, ConnectionState, ConnectionStateMachine},
    },
    time_source::WallClock,
};

const COMMAND_CAPACITY: usize = 64;
const ENDED_GAMES_REMEMBERED: usize = 64;

/// Tunables of a node.
#[derive(Debug, Clone)]
pub struct NodeSettings {
    /// Connection, keep-alive and persistence timers.
    pub timings: Timings,
    /// Clock value a new game and every new period start from.
    pub period_length: Duration,
    /// Messages kept for replay while no session is up.
    pub retry_queue_capacity: usize,
    /// Number of recent inbound message ids remembered for duplicate detection.
    pub seen_window: usize,
    /// Buffer of the [`EventHub`] broadcast channel.
    pub event_capacity: usize,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            timings: Timings::default(),
            period_length: Duration::from_secs(600),
            retry_queue_capacity: 512,
            seen_window: 1024,
            event_capacity: 64,
        }
    }
}

impl From<&AppConfig> for NodeSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            timings: config.timings,
            period_length: config.period_length(),
            retry_queue_capacity: config.retry_queue_capacity,
            ..Self::default()
        }
    }
}

/// Collaborators a node is built from.
pub struct NodeParts {
    /// This device.
    pub identity: DeviceIdentity,
    /// Role the device starts in.
    pub role: Role,
    /// Tunables.
    pub settings: NodeSettings,
    /// Source of wall-clock timestamps for games and messages.
    pub clock: Arc<dyn WallClock>,
    /// Where the trusted device list is loaded from and saved to.
    pub trust_store: Arc<dyn TrustStore>,
    /// Durable store for live and finalized games.
    pub game_store: Arc<dyn GameStore>,
    /// Transport and discovery, with their event receivers.
    pub link: NetworkLink,
}

/// Whether this device and its peer are currently recording.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
pub struct RecordingStatus {
    /// Reported by the local recording subsystem.
    pub local: bool,
    /// Last value the peer reported.
    pub peer: bool,
}

type Reply<T> = oneshot::Sender<T>;
type PolicyReply<T> = Reply<Result<T, ControlError>>;

enum NodeCommand {
    Enable(Reply<()>),
    Disable(Reply<()>),
    Pair {
        identity: DeviceIdentity,
        role: Role,
        reply: Reply<()>,
    },
    Unpair {
        id: String,
        reply: Reply<Option<TrustedPeerEntry>>,
    },
    SwitchRole {
        role: Role,
        reply: Reply<Vec<TrustedPeerEntry>>,
    },
    TrustedDevices(Reply<Vec<TrustedPeerEntry>>),
    StartGame {
        home_team: String,
        away_team: String,
        tracked_player: String,
        reply: PolicyReply<LiveGameState>,
    },
    Mutate {
        intent: GameIntent,
        reply: PolicyReply<bool>,
    },
    EndGame(PolicyReply<FinalizedGameRecord>),
    RequestControl(PolicyReply<ClaimOutcome>),
    RespondToRequest {
        accept: bool,
        reply: PolicyReply<()>,
    },
    ReleaseControl(PolicyReply<()>),
    SendRecording {
        signal: RecordingSignal,
        reply: Reply<()>,
    },
    ReportRecording {
        is_recording: bool,
        reply: Reply<()>,
    },
    Diagnostics(Reply<Diagnostics>),
}

enum LoopEvent {
    Command(NodeCommand),
    Transport(TransportEvent),
    Discovery(DiscoveryEvent),
    Persist(PersistOutcome),
    StateTimer,
    Keepalive,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    ScanTimeout,
    ConnectTimeout,
    ErrorRetry,
    Reconnect,
}

/// Progress of our own request for the control token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingClaim {
    None,
    /// Sent; the holder has not recorded it yet.
    Sent,
    /// The holder's snapshot names us as requester.
    Acknowledged,
}

/// Ids of the most recently ended games, oldest evicted first.
struct EndedGames {
    order: VecDeque<Uuid>,
    ids: HashSet<Uuid>,
    capacity: usize,
}

impl EndedGames {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            ids: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    fn insert(&mut self, game_id: Uuid) {
        if !self.ids.insert(game_id) {
            return;
        }
        self.order.push_back(game_id);
        if self.order.len() > self.capacity
            && let Some(evicted) = self.order.pop_front()
        {
            self.ids.remove(&evicted);
        }
    }

    fn contains(&self, game_id: &Uuid) -> bool {
        self.ids.contains(game_id)
    }
}

struct Channels {
    connection: watch::Sender<ConnectionState>,
    game: watch::Sender<Option<LiveGameState>>,
    recording: watch::Sender<RecordingStatus>,
    role: watch::Sender<Role>,
    hub: EventHub,
}

struct Node {
    identity: DeviceIdentity,
    role: Role,
    settings: NodeSettings,
    clock: Arc<dyn WallClock>,
    registry: TrustedDeviceRegistry,
    machine: ConnectionStateMachine,
    bus: MessageBus,
    transport: Arc<dyn Transport>,
    discovery: Arc<dyn Discovery>,
    active_discovery: ActiveDiscovery,
    game: Option<LiveGameState>,
    ended_games: EndedGames,
    claim: PendingClaim,
    published_holder: Option<String>,
    timer: Option<(Instant, TimerKind)>,
    keepalive: Option<Instant>,
    last_inbound: Instant,
    channels: Channels,
    commands: mpsc::Receiver<NodeCommand>,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    discovery_events: mpsc::UnboundedReceiver<DiscoveryEvent>,
    persist: mpsc::UnboundedSender<PersistCommand>,
    persist_outcomes: mpsc::UnboundedReceiver<PersistOutcome>,
    persist_task: JoinHandle<()>,
    trust_task: JoinHandle<()>,
}

/// Spawn a node and return the handle used to drive it.
///
/// The node starts [`ConnectionState::Idle`]; call [`NodeHandle::enable`] to start
/// discovery. It stops once every handle is dropped.
pub fn spawn(parts: NodeParts) -> (NodeHandle, JoinHandle<()>) {
    let NodeParts {
        identity,
        role,
        settings,
        clock,
        trust_store,
        game_store,
        link,
    } = parts;

    let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
    let (connection_tx, connection_rx) = watch::channel(ConnectionState::Idle);
    let (game_tx, game_rx) = watch::channel(None);
    let (recording_tx, recording_rx) = watch::channel(RecordingStatus::default());
    let (role_tx, role_rx) = watch::channel(role);
    let hub = EventHub::new(settings.event_capacity);

    let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();
    let (persist, persist_task) =
        storage_supervisor::spawn(game_store, settings.timings.persist_debounce(), outcomes_tx);
    let (trust_saves, trust_task) = trust_writer::spawn(trust_store.clone());
    let registry = TrustedDeviceRegistry::load(trust_store.as_ref(), trust_saves);

    let node = Node {
        bus: MessageBus::new(
            identity.id.clone(),
            settings.retry_queue_capacity,
            settings.seen_window,
        ),
        registry,
        identity: identity.clone(),
        role,
        settings,
        clock,
        machine: ConnectionStateMachine::new(),
        transport: link.transport,
        discovery: link.discovery,
        active_discovery: ActiveDiscovery::default(),
        game: None,
        ended_games: EndedGames::new(ENDED_GAMES_REMEMBERED),
        claim: PendingClaim::None,
        published_holder: None,
        timer: None,
        keepalive: None,
        last_inbound: Instant::now(),
        channels: Channels {
            connection: connection_tx,
            game: game_tx,
            recording: recording_tx,
            role: role_tx,
            hub: hub.clone(),
        },
        commands: commands_rx,
        transport_events: link.transport_events,
        discovery_events: link.discovery_events,
        persist,
        persist_outcomes: outcomes_rx,
        persist_task,
        trust_task,
    };

    let task = tokio::spawn(node.run());
    let handle = NodeHandle {
        identity,
        commands: commands_tx,
        connection: connection_rx,
        game: game_rx,
        recording: recording_rx,
        role: role_rx,
        hub,
    };
    (handle, task)
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending::<()>().await,
    }
}

impl Node {
    async fn run(mut self) {
        info!(device = %self.identity, role = %self.role, "sync node started");
        loop {
            match self.next_event().await {
                LoopEvent::Stop => break,
                event => self.handle(event),
            }
        }

        self.stop_activity();
        info!(device = %self.identity, "sync node stopped");

        let Node {
            persist,
            persist_task,
            registry,
            trust_task,
            ..
        } = self;
        drop(persist);
        drop(registry);
        if let Err(err) = persist_task.await {
            warn!(error = %err, "persistence worker ended abnormally");
        }
        if let Err(err) = trust_task.await {
            warn!(error = %err, "trust writer ended abnormally");
        }
    }

    async fn next_event(&mut self) -> LoopEvent {
        let state_deadline = self.timer.map(|(at, _)| at);
        let keepalive_deadline = self.keepalive;

        tokio::select! {
            command = self.commands.recv() => command.map_or(LoopEvent::Stop, LoopEvent::Command),
            Some(event) = self.transport_events.recv() => LoopEvent::Transport(event),
            Some(event) = self.discovery_events.recv() => LoopEvent::Discovery(event),
            Some(outcome) = self.persist_outcomes.recv() => LoopEvent::Persist(outcome),
            _ = sleep_until_deadline(state_deadline) => LoopEvent::StateTimer,
            _ = sleep_until_deadline(keepalive_deadline) => LoopEvent::Keepalive,
        }
    }

    fn handle(&mut self, event: LoopEvent) {
        match event {
            LoopEvent::Command(command) => self.handle_command(command),
            LoopEvent::Transport(event) => self.handle_transport(event),
            LoopEvent::Discovery(event) => self.handle_discovery(event),
            LoopEvent::Persist(outcome) => self.handle_persist(outcome),
            LoopEvent::StateTimer => {
                if let Some((_, kind)) = self.timer.take() {
                    self.handle_timer(kind);
                }
            }
            LoopEvent::Keepalive => self.handle_keepalive(),
            LoopEvent::Stop => {}
        }
    }

    fn handle_command(&mut self, command: NodeCommand) {
        match command {
            NodeCommand::Enable(reply) => {
                self.enable();
                let _ = reply.send(());
            }
            NodeCommand::Disable(reply) => {
                self.disable();
                let _ = reply.send(());
            }
            NodeCommand::Pair {
                identity,
                role,
                reply,
            } => {
                self.registry.add(identity, role);
                self.refresh_discovery();
                let _ = reply.send(());
            }
            NodeCommand::Unpair { id, reply } => {
                let removed = self.registry.remove(&id);
                if removed.is_some() {
                    self.drop_untrusted_peer(&[id]);
                    self.refresh_discovery();
                }
                let _ = reply.send(removed);
            }
            NodeCommand::SwitchRole { role, reply } => {
                let _ = reply.send(self.switch_role(role));
            }
            NodeCommand::TrustedDevices(reply) => {
                let _ = reply.send(self.registry.entries());
            }
            NodeCommand::StartGame {
                home_team,
                away_team,
                tracked_player,
                reply,
            } => {
                let _ = reply.send(self.start_game(home_team, away_team, tracked_player));
            }
            NodeCommand::Mutate { intent, reply } => {
                let _ = reply.send(self.mutate(intent));
            }
            NodeCommand::EndGame(reply) => {
                let _ = reply.send(self.end_game());
            }
            NodeCommand::RequestControl(reply) => {
                let _ = reply.send(self.request_control());
            }
            NodeCommand::RespondToRequest { accept, reply } => {
                let _ = reply.send(self.respond_to_request(accept));
            }
            NodeCommand::ReleaseControl(reply) => {
                let _ = reply.send(self.release_control());
            }
            NodeCommand::SendRecording { signal, reply } => {
                let kind = match signal {
                    RecordingSignal::Start => MessageType::StartRecording,
                    RecordingSignal::Stop => MessageType::StopRecording,
                };
                self.send(kind, Payload::new());
                let _ = reply.send(());
            }
            NodeCommand::ReportRecording {
                is_recording,
                reply,
            } => {
                self.channels
                    .recording
                    .send_modify(|status| status.local = is_recording);
                let payload =
                    Payload::from_iter([(KEY_IS_RECORDING.to_string(), is_recording.to_string())]);
                self.send(MessageType::RecordingStateUpdate, payload);
                let _ = reply.send(());
            }
            NodeCommand::Diagnostics(reply) => {
                let _ = reply.send(self.bus.diagnostics());
            }
        }
    }

    // Connection lifecycle

    fn transition(&mut self, event: ConnectionEvent) -> bool {
        match self.machine.apply(event) {
            Ok(state) => {
                info!(state = ?state, "connection state changed");
                self.channels.connection.send_replace(state.clone());
                self.channels
                    .hub
                    .broadcast(NodeEvent::ConnectionChanged { state });
                true
            }
            Err(err) => {
                debug!(error = %err, "ignoring connection event");
                false
            }
        }
    }

    fn is_connected(&self) -> bool {
        matches!(self.machine.state(), ConnectionState::Connected(_))
    }

    fn arm(&mut self, kind: TimerKind, after: Duration) {
        self.timer = Some((Instant::now() + after, kind));
    }

    fn enable(&mut self) {
        if self.transition(ConnectionEvent::Enable) {
            self.enter_scanning();
        }
    }

    fn disable(&mut self) {
        if matches!(self.machine.state(), ConnectionState::Disabled) {
            return;
        }
        self.stop_activity();
        self.transition(ConnectionEvent::Disable);
    }

    /// Stop timers, discovery and any session. The machine state is left alone.
    fn stop_activity(&mut self) {
        self.timer = None;
        self.keepalive = None;
        self.active_discovery.stop(self.discovery.as_ref());
        if matches!(
            self.machine.state(),
            ConnectionState::Connected(_)
                | ConnectionState::Connecting(_)
                | ConnectionState::FoundTrustedPeer(_)
        ) {
            self.transport.disconnect();
        }
    }

    fn enter_scanning(&mut self) {
        let mode = self.registry.discovery_mode();
        debug!(browse = mode.browse, advertise = ?mode.advertise, "starting discovery");
        self.active_discovery
            .start(self.discovery.as_ref(), &self.identity, mode);
        self.arm(TimerKind::ScanTimeout, self.settings.timings.scan_timeout());
    }

    /// Re-evaluate discovery sub-roles after the trust list changed.
    fn refresh_discovery(&mut self) {
        if matches!(self.machine.state(), ConnectionState::Scanning) {
            let mode = self.registry.discovery_mode();
            self.active_discovery
                .start(self.discovery.as_ref(), &self.identity, mode);
        }
    }

    fn enter_error(&mut self) {
        self.active_discovery.stop(self.discovery.as_ref());
        self.transport.disconnect();
        self.arm(TimerKind::ErrorRetry, self.settings.timings.error_retry());
    }

    fn connect_failed(&mut self, reason: String) {
        warn!(reason = %reason, "connection attempt failed");
        if self.transition(ConnectionEvent::ConnectFailed(reason)) {
            self.enter_error();
        }
    }

    fn start_connecting(&mut self, peer: &DeviceIdentity, accept: bool) {
        let result = if accept {
            self.transport.accept(peer)
        } else {
            self.transport.connect(peer)
        };
        match result {
            Ok(()) => self.arm(
                TimerKind::ConnectTimeout,
                self.settings.timings.connect_timeout(),
            ),
            Err(err) => self.connect_failed(err.to_string()),
        }
    }

    fn on_session_established(&mut self, peer: DeviceIdentity) {
        if !self.machine.state().is_connecting() {
            warn!(peer = %peer, state = ?self.machine.state(), "unexpected session; closing it");
            self.transport.disconnect();
            return;
        }
        self.transition(ConnectionEvent::SessionEstablished(peer.clone()));
        self.timer = None;
        self.active_discovery.stop(self.discovery.as_ref());

        let now = Instant::now();
        self.last_inbound = now;
        self.keepalive = Some(now + self.settings.timings.keepalive_interval());
        self.registry.update_last_connected(&peer, self.clock.now());

        let replayed = self.bus.drain(self.transport.as_ref());
        if replayed > 0 {
            info!(peer = %peer, replayed, "replayed queued messages");
        }
        if let Some(game) = &self.game {
            let payload = encode_snapshot(game);
            self.send(MessageType::GameStateUpdate, payload);
        }
    }

    fn on_session_lost(&mut self, reason: &str) {
        warn!(reason, "session lost");
        self.keepalive = None;
        if self.transition(ConnectionEvent::TransportLost) {
            self.arm(TimerKind::Reconnect, self.settings.timings.reconnect_delay());
        }
    }

    /// Close the session or attempt with a peer that is no longer trusted.
    fn drop_untrusted_peer(&mut self, ids: &[String]) {
        let state = self.machine.state().clone();
        match state {
            ConnectionState::Connected(peer) if ids.contains(&peer.id) => {
                self.transport.disconnect();
                self.on_session_lost("peer is no longer trusted");
            }
            ConnectionState::Connecting(_) | ConnectionState::FoundTrustedPeer(_)
                if self
                    .machine
                    .pending_peer()
                    .is_some_and(|peer| ids.contains(&peer.id)) =>
            {
                self.transport.disconnect();
                self.connect_failed("peer is no longer trusted".into());
            }
            _ => {}
        }
    }

    fn switch_role(&mut self, role: Role) -> Vec<TrustedPeerEntry> {
        info!(from = %self.role, to = %role, "switching local role");
        self.role = role;
        self.channels.role.send_replace(role);
        let removed = self.registry.remove_role(role);
        if !removed.is_empty() {
            let ids = removed
                .iter()
                .map(|entry| entry.identity.id.clone())
                .collect::<Vec<_>>();
            self.drop_untrusted_peer(&ids);
        }
        self.refresh_discovery();
        removed
    }

    fn handle_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::ScanTimeout => {
                if self.transition(ConnectionEvent::ScanTimeout) {
                    info!("no trusted peer found before the scan timeout");
                    self.active_discovery.stop(self.discovery.as_ref());
                }
            }
            TimerKind::ConnectTimeout => {
                if self.transition(ConnectionEvent::ConnectTimeout) {
                    warn!("connection attempt timed out");
                    self.enter_error();
                }
            }
            TimerKind::ErrorRetry => {
                if self.transition(ConnectionEvent::RetryElapsed) {
                    self.enter_scanning();
                }
            }
            TimerKind::Reconnect => {
                if self.transition(ConnectionEvent::ReconnectElapsed) {
                    self.enter_scanning();
                }
            }
        }
    }

    fn handle_keepalive(&mut self) {
        if !self.is_connected() {
            self.keepalive = None;
            return;
        }
        let now = Instant::now();
        let window = self.settings.timings.liveness_window();
        if now.duration_since(self.last_inbound) >= window {
            self.transport.disconnect();
            self.on_session_lost("no traffic within the keep-alive window");
            return;
        }
        self.send(MessageType::Ping, Payload::new());
        self.keepalive = Some(now + self.settings.timings.keepalive_interval());
    }

    fn handle_discovery(&mut self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::PeerFound { identity, role } => {
                if identity.id == self.identity.id {
                    return;
                }
                if !matches!(self.machine.state(), ConnectionState::Scanning) {
                    debug!(peer = %identity, state = ?self.machine.state(), "ignoring discovered peer");
                    return;
                }
                if !self.registry.is_trusted(&identity) {
                    debug!(peer = %identity, role = %role, "ignoring untrusted peer");
                    return;
                }
                if let Some(expected) = self.registry.role_expected(&identity)
                    && expected != role
                {
                    debug!(peer = %identity, %expected, advertised = %role, "trusted peer advertises an unexpected role");
                }

                self.transition(ConnectionEvent::PeerFound {
                    identity: identity.clone(),
                    trusted: true,
                });
                if self.transition(ConnectionEvent::AttemptConnect) {
                    self.start_connecting(&identity, false);
                }
            }
            DiscoveryEvent::PeerLost(identity) => {
                debug!(peer = %identity, "peer no longer visible");
            }
        }
    }

    fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Invited(peer) => self.on_invited(peer),
            TransportEvent::Connected(peer) => self.on_session_established(peer),
            TransportEvent::ConnectFailed { peer, reason } => {
                if self.machine.state().is_connecting() {
                    debug!(peer = %peer, "transport reported a failed attempt");
                    self.connect_failed(reason);
                }
            }
            TransportEvent::Disconnected(peer) => match self.machine.state() {
                ConnectionState::Connected(_) => {
                    debug!(peer = %peer, "transport reported a dropped session");
                    self.on_session_lost("transport lost");
                }
                ConnectionState::Connecting(_) => {
                    if self.transition(ConnectionEvent::TransportLost) {
                        self.enter_error();
                    }
                }
                _ => debug!(peer = %peer, "ignoring disconnect outside a session"),
            },
            TransportEvent::Received(frame) => self.on_frame(frame),
        }
    }

    fn on_invited(&mut self, peer: DeviceIdentity) {
        let trusted = self.registry.is_trusted(&peer);
        let state = self.machine.state().clone();
        match state {
            ConnectionState::Scanning if trusted => {
                info!(peer = %peer, "accepting invitation from trusted peer");
                if self.transition(ConnectionEvent::InvitationAccepted(peer.clone())) {
                    self.start_connecting(&peer, true);
                }
            }
            ConnectionState::Connecting(_)
                if self
                    .machine
                    .pending_peer()
                    .is_some_and(|pending| pending.id == peer.id) =>
            {
                debug!(peer = %peer, "peer invited us while we were connecting to it");
                if let Err(err) = self.transport.accept(&peer) {
                    warn!(peer = %peer, error = %err, "failed to accept crossing invitation");
                }
            }
            state => {
                debug!(peer = %peer, trusted, state = ?state, "rejecting invitation");
                self.transport.reject(&peer);
            }
        }
    }

    // Messages

    fn send(&mut self, kind: MessageType, payload: Payload) {
        let message = GameMessage::new(kind, payload, &self.identity.id, self.clock.now());
        let connected = self.is_connected();
        let outcome = self
            .bus
            .send(self.transport.as_ref(), message, connected);
        debug!(?kind, ?outcome, "message dispatched");
    }

    fn on_frame(&mut self, frame: Vec<u8>) {
        if !self.is_connected() {
            debug!(bytes = frame.len(), "dropping frame received outside a session");
            return;
        }
        self.last_inbound = Instant::now();
        let now = self.clock.now();
        if let Some(message) = self.bus.receive(self.transport.as_ref(), &frame, now) {
            self.dispatch(message);
        }
    }

    fn dispatch(&mut self, message: GameMessage) {
        debug!(id = %message.id(), kind = ?message.kind(), sender = message.sender_id(), "message received");
        match message.kind() {
            MessageType::StartRecording => self.channels.hub.broadcast(NodeEvent::Recording {
                signal: RecordingSignal::Start,
            }),
            MessageType::StopRecording => self.channels.hub.broadcast(NodeEvent::Recording {
                signal: RecordingSignal::Stop,
            }),
            MessageType::RecordingStateUpdate => {
                match message
                    .field(KEY_IS_RECORDING)
                    .ok()
                    .and_then(|value| value.parse::<bool>().ok())
                {
                    Some(is_recording) => {
                        self.channels
                            .recording
                            .send_modify(|status| status.peer = is_recording);
                        self.channels
                            .hub
                            .broadcast(NodeEvent::PeerRecording { is_recording });
                    }
                    None => {
                        self.bus.record_undecodable();
                        warn!(id = %message.id(), "recording update without a usable flag");
                    }
                }
            }
            MessageType::GameStarting | MessageType::GameStateUpdate => {
                if let Some(incoming) = self.decode(&message) {
                    self.accept_snapshot(incoming);
                }
            }
            MessageType::GameEnded => self.on_game_ended(&message),
            MessageType::ControlRequest => self.on_control_request(&message),
            MessageType::ControlGrant => self.on_control_grant(&message),
            MessageType::ControlRelease => self.on_control_release(&message),
            MessageType::Ping | MessageType::Pong => {}
        }
    }

    fn decode(&mut self, message: &GameMessage) -> Option<LiveGameState> {
        match decode_snapshot(message.payload()) {
            Ok(state) => Some(state),
            Err(err) => {
                self.bus.record_undecodable();
                warn!(id = %message.id(), kind = ?message.kind(), error = %err, "dropping snapshot that cannot be decoded");
                None
            }
        }
    }

    /// Replace the local game with `incoming` when it is newer. Returns whether it was applied.
    fn accept_snapshot(&mut self, incoming: LiveGameState) -> bool {
        if self.ended_games.contains(&incoming.game_id) {
            debug!(game_id = %incoming.game_id, "discarding snapshot of an ended game");
            self.bus.record_stale();
            return false;
        }
        if !incoming.supersedes(self.game.as_ref()) {
            debug!(
                incoming = incoming.version,
                local = self.game.as_ref().map(|game| game.version),
                "discarding stale snapshot"
            );
            self.bus.record_stale();
            return false;
        }
        self.install(incoming);
        true
    }

    fn install(&mut self, incoming: LiveGameState) {
        if let Some(local) = &self.game
            && local.game_id != incoming.game_id
        {
            info!(from = %local.game_id, to = %incoming.game_id, "peer replaced the live game");
        }
        self.game = Some(incoming);
        self.publish_game();
        self.track_claim();
    }

    fn publish_game(&mut self) {
        let holder = self
            .game
            .as_ref()
            .and_then(|game| game.control.holder().map(str::to_string));
        if let Some(game) = &self.game {
            self.channels.hub.broadcast(NodeEvent::GameUpdated {
                game_id: game.game_id,
                version: game.version,
            });
        }
        self.channels.game.send_replace(self.game.clone());

        if holder != self.published_holder {
            self.published_holder = holder.clone();
            if self.game.is_some() {
                info!(holder = ?holder, "control changed hands");
                self.channels
                    .hub
                    .broadcast(NodeEvent::ControlChanged { holder });
            }
        }
    }

    /// Follow our pending control request through the holder's snapshots.
    fn track_claim(&mut self) {
        let Some(game) = &self.game else {
            self.claim = PendingClaim::None;
            return;
        };
        let me = self.identity.id.as_str();
        let control = &game.control;

        let mut denied = false;
        self.claim = match (self.claim, control.holder(), control.requested_by()) {
            (_, Some(holder), _) if holder == me => PendingClaim::None,
            (PendingClaim::None, _, _) => PendingClaim::None,
            (_, _, Some(requester)) if requester == me => PendingClaim::Acknowledged,
            (_, _, Some(_)) => PendingClaim::None,
            (PendingClaim::Acknowledged, Some(_), None) => {
                denied = true;
                PendingClaim::None
            }
            (claim, _, None) => claim,
        };
        if denied {
            info!("control request was denied");
            self.channels.hub.broadcast(NodeEvent::ControlDenied);
        }
    }

    fn on_game_ended(&mut self, message: &GameMessage) {
        let Some(game_id) = message
            .field(KEY_GAME_ID)
            .ok()
            .and_then(|raw| raw.parse::<Uuid>().ok())
        else {
            self.bus.record_undecodable();
            warn!(id = %message.id(), "game ended message without a game id");
            return;
        };

        self.ended_games.insert(game_id);
        if self.game.as_ref().is_some_and(|game| game.game_id == game_id) {
            info!(%game_id, "peer ended the live game");
            self.game = None;
            self.claim = PendingClaim::None;
            self.publish_game();
            self.channels.hub.broadcast(NodeEvent::GameEnded { game_id });
        }
    }

    fn on_control_request(&mut self, message: &GameMessage) {
        let requester = message
            .field(KEY_REQUESTER)
            .unwrap_or(message.sender_id())
            .to_string();
        let me = self.identity.id.clone();
        let Some(game) = self.game.as_mut() else {
            debug!(requester, "control request without a live game");
            return;
        };
        if !game.control.is_held_by(&me) {
            debug!(requester, holder = ?game.control.holder(), "ignoring control request; not the holder");
            return;
        }
        if !game.record_request(&me, &requester, message.sent_at()) {
            return;
        }

        info!(requester, "control requested by peer");
        self.commit(MessageType::GameStateUpdate, None);
        self.channels
            .hub
            .broadcast(NodeEvent::ControlRequested { requester });
    }

    fn on_control_grant(&mut self, message: &GameMessage) {
        let Some(incoming) = self.decode(message) else {
            return;
        };
        let grantee = message
            .field(KEY_GRANTEE)
            .ok()
            .map(str::to_string)
            .or_else(|| incoming.control.holder().map(str::to_string));

        let me = self.identity.id.as_str();
        let concurrent = self.game.as_ref().is_some_and(|local| {
            local.game_id == incoming.game_id
                && local.version == incoming.version
                && local.control.is_held_by(me)
        });
        if concurrent && let Some(grantee) = grantee.filter(|grantee| grantee != me) {
            if grantee.as_str() < me {
                info!(winner = %grantee, "concurrent control grant; yielding to lower device id");
                self.install(incoming);
            } else {
                info!(loser = %grantee, "concurrent control grant; keeping control");
            }
            return;
        }

        self.accept_snapshot(incoming);
    }

    fn on_control_release(&mut self, message: &GameMessage) {
        let Some(incoming) = self.decode(message) else {
            return;
        };
        let waiting = self.claim != PendingClaim::None;
        if !self.accept_snapshot(incoming) {
            return;
        }
        let free = self
            .game
            .as_ref()
            .is_some_and(|game| game.control.holder().is_none());
        if waiting && free {
            info!("control released while our request was pending; claiming it");
            if let Err(err) = self.request_control() {
                warn!(error = %err, "failed to claim released control");
            }
        }
    }

    /// Publish, broadcast and persist the local game after a local change.
    fn commit(&mut self, kind: MessageType, grantee: Option<String>) {
        let Some(game) = &self.game else {
            return;
        };
        let game_id = game.game_id;
        let document = encode_snapshot(game);
        let mut payload = document.clone();
        if let Some(grantee) = grantee {
            payload.insert(KEY_GRANTEE.to_string(), grantee);
        }

        self.publish_game();
        self.send(kind, payload);
        self.persist(PersistCommand::Update { game_id, document });
    }

    fn persist(&mut self, command: PersistCommand) {
        if self.persist.send(command).is_err() {
            warn!("persistence worker is gone; dropping store call");
        }
    }

    fn handle_persist(&mut self, outcome: PersistOutcome) {
        match outcome {
            PersistOutcome::Created { game_id, store_id } => {
                debug!(%game_id, %store_id, "live game persisted");
            }
            PersistOutcome::Finalized { game_id } => {
                debug!(%game_id, "finalized game persisted");
            }
            PersistOutcome::Failed {
                game_id,
                operation,
                error,
            } => {
                debug!(%game_id, operation = operation.as_str(), "reporting persistence failure");
                self.channels.hub.broadcast(NodeEvent::PersistFailed {
                    operation: operation.as_str().to_string(),
                    message: error.to_string(),
                });
            }
        }
    }

    // Game intents

    fn start_game(
        &mut self,
        home_team: String,
        away_team: String,
        tracked_player: String,
    ) -> Result<LiveGameState, ControlError> {
        if let Some(game) = &self.game
            && game.control.holder().is_some()
            && !game.control.is_held_by(&self.identity.id)
        {
            return Err(ControlError::GameAlreadyActive);
        }
        for (field, value) in [
            ("home team", &home_team),
            ("away team", &away_team),
            ("tracked player", &tracked_player),
        ] {
            if value.trim().is_empty() {
                return Err(ControlError::InvalidInput(format!("{field} must not be empty")));
            }
        }

        let game = LiveGameState::new(
            home_team,
            away_team,
            tracked_player,
            &self.identity.id,
            self.settings.period_length,
            self.clock.now(),
        );
        info!(game_id = %game.game_id, home = %game.home_team, away = %game.away_team, "starting game");

        let document = encode_snapshot(&game);
        self.game = Some(game.clone());
        self.claim = PendingClaim::None;
        self.publish_game();
        self.send(MessageType::GameStarting, document.clone());
        self.persist(PersistCommand::Create {
            game_id: game.game_id,
            document,
        });
        Ok(game)
    }

    fn mutate(&mut self, intent: GameIntent) -> Result<bool, ControlError> {
        let now = self.clock.now();
        let game = self.game.as_mut().ok_or(ControlError::NoActiveGame)?;
        let changed = game.apply(&self.identity.id, intent, now)?;
        if changed {
            self.commit(MessageType::GameStateUpdate, None);
        }
        Ok(changed)
    }

    fn end_game(&mut self) -> Result<FinalizedGameRecord, ControlError> {
        let game = self.game.as_ref().ok_or(ControlError::NoActiveGame)?;
        game.control.ensure_holder(&self.identity.id)?;
        let Some(game) = self.game.take() else {
            return Err(ControlError::NoActiveGame);
        };

        let game_id = game.game_id;
        let payload = encode_snapshot(&game);
        let record = game.finalize(&self.identity.id, self.clock.now())?;
        info!(%game_id, home = record.home_score, away = record.away_score, "game ended");

        self.ended_games.insert(game_id);
        self.claim = PendingClaim::None;
        self.publish_game();
        self.send(MessageType::GameEnded, payload);
        self.persist(PersistCommand::Finalize {
            game_id,
            record: record.clone(),
        });
        self.channels.hub.broadcast(NodeEvent::GameEnded { game_id });
        Ok(record)
    }

    fn request_control(&mut self) -> Result<ClaimOutcome, ControlError> {
        let me = self.identity.id.clone();
        let now = self.clock.now();
        let game = self.game.as_mut().ok_or(ControlError::NoActiveGame)?;
        if self.claim != PendingClaim::None
            && let Some(holder) = game.control.holder().filter(|holder| *holder != me)
        {
            debug!(holder, "control request already pending");
            return Ok(ClaimOutcome::Requested {
                holder: holder.to_string(),
            });
        }
        let outcome = game.claim_control(&me, now)?;

        match &outcome {
            ClaimOutcome::Granted => {
                info!("control was free; taking it");
                self.claim = PendingClaim::None;
                self.commit(MessageType::ControlGrant, Some(me));
            }
            ClaimOutcome::Requested { holder } => {
                info!(holder = %holder, "requesting control");
                self.claim = PendingClaim::Sent;
                self.publish_game();
                let payload = Payload::from_iter([(KEY_REQUESTER.to_string(), me)]);
                self.send(MessageType::ControlRequest, payload);
            }
        }
        Ok(outcome)
    }

    fn respond_to_request(&mut self, accept: bool) -> Result<(), ControlError> {
        let me = self.identity.id.clone();
        let game = self.game.as_mut().ok_or(ControlError::NoActiveGame)?;
        if accept {
            let requester = game.grant_request(&me)?;
            info!(requester, "handing control over");
            self.commit(MessageType::ControlGrant, Some(requester));
        } else {
            let requester = game.deny_request(&me)?;
            info!(requester, "denying control request");
            self.commit(MessageType::GameStateUpdate, None);
        }
        Ok(())
    }

    fn release_control(&mut self) -> Result<(), ControlError> {
        let me = self.identity.id.clone();
        let game = self.game.as_mut().ok_or(ControlError::NoActiveGame)?;
        game.release_control(&me)?;
        info!("releasing control");
        self.commit(MessageType::ControlRelease, None);
        Ok(())
    }
}

/// Cloneable front door to a running node.
#[derive(Clone)]
pub struct NodeHandle {
    identity: DeviceIdentity,
    commands: mpsc::Sender<NodeCommand>,
    connection: watch::Receiver<ConnectionState>,
    game: watch::Receiver<Option<LiveGameState>>,
    recording: watch::Receiver<RecordingStatus>,
    role: watch::Receiver<Role>,
    hub: EventHub,
}

impl NodeHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> NodeCommand,
    ) -> Result<T, ServiceError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| ServiceError::NodeStopped)?;
        response.await.map_err(|_| ServiceError::NodeStopped)
    }

    async fn policy<T>(
        &self,
        build: impl FnOnce(PolicyReply<T>) -> NodeCommand,
    ) -> Result<T, ServiceError> {
        Ok(self.request(build).await??)
    }

    async fn mutate(&self, intent: GameIntent) -> Result<bool, ServiceError> {
        self.policy(|reply| NodeCommand::Mutate { intent, reply })
            .await
    }

    /// This device.
    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Current local role.
    pub fn role(&self) -> Role {
        *self.role.borrow()
    }

    /// Latest published connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.connection.borrow().clone()
    }

    /// Follow connection state changes.
    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.clone()
    }

    /// Latest published live game, if any.
    pub fn game(&self) -> Option<LiveGameState> {
        self.game.borrow().clone()
    }

    /// Follow every published version of the live game.
    pub fn watch_game(&self) -> watch::Receiver<Option<LiveGameState>> {
        self.game.clone()
    }

    /// Local and peer recording flags.
    pub fn recording(&self) -> RecordingStatus {
        *self.recording.borrow()
    }

    /// Follow recording flag changes.
    pub fn watch_recording(&self) -> watch::Receiver<RecordingStatus> {
        self.recording.clone()
    }

    /// Receive every [`NodeEvent`] emitted from now on.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<NodeEvent> {
        self.hub.subscribe()
    }

    /// Turn connectivity on. A no-op while already scanning or connected.
    pub async fn enable(&self) -> Result<(), ServiceError> {
        self.request(NodeCommand::Enable).await
    }

    /// Stop discovery, timers and the session, and stay [`ConnectionState::Disabled`].
    pub async fn disable(&self) -> Result<(), ServiceError> {
        self.request(NodeCommand::Disable).await
    }

    /// Trust `identity`, expecting it to play `role` for us.
    pub async fn pair(&self, identity: DeviceIdentity, role: Role) -> Result<(), ServiceError> {
        self.request(|reply| NodeCommand::Pair {
            identity,
            role,
            reply,
        })
        .await
    }

    /// Forget a trusted device, closing the session with it if there is one.
    pub async fn unpair(&self, id: &str) -> Result<TrustedPeerEntry, ServiceError> {
        let id = id.to_string();
        self.request(|reply| NodeCommand::Unpair {
            id: id.clone(),
            reply,
        })
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("trusted device {id}")))
    }

    /// Change the local role. Returns the trusted entries that no longer make sense.
    pub async fn switch_role(&self, role: Role) -> Result<Vec<TrustedPeerEntry>, ServiceError> {
        self.request(|reply| NodeCommand::SwitchRole { role, reply })
            .await
    }

    /// Trusted devices in pairing order.
    pub async fn trusted_devices(&self) -> Result<Vec<TrustedPeerEntry>, ServiceError> {
        self.request(NodeCommand::TrustedDevices).await
    }

    /// Start a new game controlled by this device.
    pub async fn start_game(
        &self,
        home_team: impl Into<String>,
        away_team: impl Into<String>,
        tracked_player: impl Into<String>,
    ) -> Result<LiveGameState, ServiceError> {
        let (home_team, away_team, tracked_player) =
            (home_team.into(), away_team.into(), tracked_player.into());
        self.policy(|reply| NodeCommand::StartGame {
            home_team,
            away_team,
            tracked_player,
            reply,
        })
        .await
    }

    /// Add `delta` points to `side`. Scores never drop below zero.
    pub async fn mutate_score(&self, side: Side, delta: i32) -> Result<bool, ServiceError> {
        self.mutate(GameIntent::Score { side, delta }).await
    }

    /// Move the tracked player on or off court. Repeating the current value is a no-op.
    pub async fn set_on_court(&self, on_court: bool) -> Result<bool, ServiceError> {
        self.mutate(GameIntent::SetOnCourt(on_court)).await
    }

    /// Start the game clock from its current value.
    pub async fn start_clock(&self) -> Result<bool, ServiceError> {
        self.mutate(GameIntent::StartClock).await
    }

    /// Freeze the game clock at its current value.
    pub async fn stop_clock(&self) -> Result<bool, ServiceError> {
        self.mutate(GameIntent::StopClock).await
    }

    /// Overwrite the clock value; only allowed while it is stopped.
    pub async fn set_clock(&self, value: Duration) -> Result<bool, ServiceError> {
        self.mutate(GameIntent::SetClock(value)).await
    }

    /// Advance to the next period with a stopped, full clock.
    pub async fn next_period(&self) -> Result<bool, ServiceError> {
        self.mutate(GameIntent::NextPeriod).await
    }

    /// Adjust `player`'s `kind` counter by `delta`, never below zero.
    pub async fn record_stat(
        &self,
        player: impl Into<String>,
        kind: StatKind,
        delta: i32,
    ) -> Result<bool, ServiceError> {
        self.mutate(GameIntent::RecordStat {
            player: player.into(),
            kind,
            delta,
        })
        .await
    }

    /// Close the game and hand the finalized record to the durable store.
    pub async fn end_game(&self) -> Result<FinalizedGameRecord, ServiceError> {
        self.policy(NodeCommand::EndGame).await
    }

    /// Take control if it is free, otherwise ask the holder for it.
    pub async fn request_control(&self) -> Result<ClaimOutcome, ServiceError> {
        self.policy(NodeCommand::RequestControl).await
    }

    /// Holder side: hand control to the pending requester, or refuse it.
    pub async fn respond_to_request(&self, accept: bool) -> Result<(), ServiceError> {
        self.policy(|reply| NodeCommand::RespondToRequest { accept, reply })
            .await
    }

    /// Give the control token up, leaving it free for either device.
    pub async fn release_control(&self) -> Result<(), ServiceError> {
        self.policy(NodeCommand::ReleaseControl).await
    }

    /// Ask the peer's recording subsystem to start.
    pub async fn start_recording(&self) -> Result<(), ServiceError> {
        self.request(|reply| NodeCommand::SendRecording {
            signal: RecordingSignal::Start,
            reply,
        })
        .await
    }

    /// Ask the peer's recording subsystem to stop.
    pub async fn stop_recording(&self) -> Result<(), ServiceError> {
        self.request(|reply| NodeCommand::SendRecording {
            signal: RecordingSignal::Stop,
            reply,
        })
        .await
    }

    /// Publish whether the local recording subsystem is recording.
    pub async fn report_recording(&self, is_recording: bool) -> Result<(), ServiceError> {
        self.request(|reply| NodeCommand::ReportRecording {
            is_recording,
            reply,
        })
        .await
    }

    /// Message bus counters.
    pub async fn diagnostics(&self) -> Result<Diagnostics, ServiceError> {
        self.request(NodeCommand::Diagnostics).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ended_games_forget_the_oldest_beyond_capacity() {
        let mut ended = EndedGames::new(2);
        let ids = [Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
        for id in ids {
            ended.insert(id);
        }
        ended.insert(ids[2]);

        assert!(!ended.contains(&ids[0]));
        assert!(ended.contains(&ids[1]));
        assert!(ended.contains(&ids[2]));
        assert_eq!(ended.order.len(), 2);
        assert_eq!(ended.ids.len(), 2);
    }
}
