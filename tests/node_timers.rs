//! One node driven through a scripted transport, so timers and arbitration
//! can be checked step by step under paused time.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use courtside_link::{
    dao::{game_store::memory::MemoryGameStore, trust_store::MemoryTrustStore},
    dto::{
        message::{GameMessage, MessageType, Payload},
        snapshot::{KEY_GRANTEE, encode_snapshot},
    },
    services::{
        discovery::{Discovery, DiscoveryEvent},
        node::{self, NodeHandle, NodeParts, NodeSettings},
        transport::{NetworkLink, Transport, TransportError, TransportEvent},
    },
    state::{
        control::ClaimOutcome,
        game::{GameIntent, LiveGameState, Side},
        hub::NodeEvent,
        identity::{DeviceIdentity, Role},
        state_machine::ConnectionState,
    },
    time_source::{ManualClock, WallClock, from_millis},
};
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
    time::{Instant, sleep, timeout},
};

const WAIT: Duration = Duration::from_secs(120);

/// Transport and discovery that record what the node asks for and never answer on their own.
#[derive(Default)]
struct ScriptedWire {
    calls: Mutex<Vec<String>>,
    sent: Mutex<Vec<GameMessage>>,
}

impl ScriptedWire {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn sent(&self, kind: MessageType) -> Vec<GameMessage> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|message| message.kind() == kind)
            .cloned()
            .collect()
    }
}

impl Transport for ScriptedWire {
    fn connect(&self, peer: &DeviceIdentity) -> Result<(), TransportError> {
        self.calls.lock().unwrap().push(format!("connect {}", peer.id));
        Ok(())
    }

    fn accept(&self, peer: &DeviceIdentity) -> Result<(), TransportError> {
        self.calls.lock().unwrap().push(format!("accept {}", peer.id));
        Ok(())
    }

    fn reject(&self, peer: &DeviceIdentity) {
        self.calls.lock().unwrap().push(format!("reject {}", peer.id));
    }

    fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        let message = GameMessage::decode(&frame).expect("node sent an undecodable frame");
        self.sent.lock().unwrap().push(message);
        Ok(())
    }

    fn disconnect(&self) {
        self.calls.lock().unwrap().push("disconnect".into());
    }
}

impl Discovery for ScriptedWire {
    fn advertise(&self, _identity: &DeviceIdentity, _role: Role) {}
    fn stop_advertise(&self) {}
    fn browse(&self) {}
    fn stop_browse(&self) {}
}

struct Rig {
    handle: NodeHandle,
    _task: JoinHandle<()>,
    wire: Arc<ScriptedWire>,
    transport_tx: mpsc::UnboundedSender<TransportEvent>,
    discovery_tx: mpsc::UnboundedSender<DiscoveryEvent>,
    events: broadcast::Receiver<NodeEvent>,
    clock: ManualClock,
    peer: DeviceIdentity,
}

fn identity(id: &str) -> DeviceIdentity {
    DeviceIdentity::new(id, format!("{id} phone"))
}

/// Enabled node `local` that trusts `peer` as a controller, so it browses for it.
async fn rig(local: &str, peer: &str) -> Rig {
    let wire = Arc::new(ScriptedWire::default());
    let (transport_tx, transport_events) = mpsc::unbounded_channel();
    let (discovery_tx, discovery_events) = mpsc::unbounded_channel();
    let clock = ManualClock::new(from_millis(1_773_514_800_000));

    let (handle, task) = node::spawn(NodeParts {
        identity: identity(local),
        role: Role::Recorder,
        settings: NodeSettings::default(),
        clock: Arc::new(clock.clone()),
        trust_store: Arc::new(MemoryTrustStore::default()),
        game_store: Arc::new(MemoryGameStore::new()),
        link: NetworkLink {
            transport: wire.clone(),
            discovery: wire.clone(),
            transport_events,
            discovery_events,
        },
    });
    handle.pair(identity(peer), Role::Controller).await.unwrap();
    let mut events = handle.subscribe();
    handle.enable().await.unwrap();
    assert_eq!(next_state(&mut events).await, ConnectionState::Scanning);

    Rig {
        handle,
        _task: task,
        wire,
        transport_tx,
        discovery_tx,
        events,
        clock,
        peer: identity(peer),
    }
}

async fn next_state(events: &mut broadcast::Receiver<NodeEvent>) -> ConnectionState {
    timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(NodeEvent::ConnectionChanged { state }) => return state,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event hub closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for a connection change")
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !check() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

impl Rig {
    fn find_peer(&self) {
        self.discovery_tx
            .send(DiscoveryEvent::PeerFound {
                identity: self.peer.clone(),
                role: Role::Controller,
            })
            .unwrap();
    }

    async fn connect(&mut self) {
        self.find_peer();
        assert!(matches!(
            next_state(&mut self.events).await,
            ConnectionState::FoundTrustedPeer(_)
        ));
        assert!(next_state(&mut self.events).await.is_connecting());
        self.transport_tx
            .send(TransportEvent::Connected(self.peer.clone()))
            .unwrap();
        assert_eq!(
            next_state(&mut self.events).await,
            ConnectionState::Connected(self.peer.clone())
        );
    }

    fn deliver(&self, kind: MessageType, payload: Payload) {
        let message = GameMessage::new(kind, payload, &self.peer.id, self.clock.now());
        self.transport_tx
            .send(TransportEvent::Received(message.encode().unwrap()))
            .unwrap();
    }

    fn deliver_game(&self, kind: MessageType, game: &LiveGameState) {
        self.deliver(kind, encode_snapshot(game));
    }

    /// Deliver a ping and wait for its pong, so every frame delivered before it was handled.
    async fn settle(&self) {
        let before = self.wire.sent(MessageType::Pong).len();
        self.deliver(MessageType::Ping, Payload::new());
        eventually("pong", || self.wire.sent(MessageType::Pong).len() > before).await;
    }

    fn peer_game(&self) -> LiveGameState {
        LiveGameState::new(
            "Hawks".into(),
            "Otters".into(),
            "Sam".into(),
            &self.peer.id,
            Duration::from_secs(600),
            self.clock.now(),
        )
    }
}

#[tokio::test(start_paused = true)]
async fn unanswered_attempt_times_out_into_error_then_rescans() {
    let mut rig = rig("rec", "ctl").await;
    rig.find_peer();
    assert!(matches!(
        next_state(&mut rig.events).await,
        ConnectionState::FoundTrustedPeer(_)
    ));
    assert!(next_state(&mut rig.events).await.is_connecting());
    let attempt_started = Instant::now();

    let state = next_state(&mut rig.events).await;
    assert!(matches!(state, ConnectionState::Error(_)), "got {state:?}");
    let waited = attempt_started.elapsed();
    assert!(waited >= Duration::from_secs(15) && waited < Duration::from_secs(16), "{waited:?}");

    let failed_at = Instant::now();
    assert_eq!(next_state(&mut rig.events).await, ConnectionState::Scanning);
    let backoff = failed_at.elapsed();
    assert!(backoff >= Duration::from_secs(3) && backoff < Duration::from_secs(4), "{backoff:?}");

    let calls = rig.wire.calls();
    assert_eq!(calls.first().map(String::as_str), Some("connect ctl"));
    assert!(calls.iter().any(|call| call == "disconnect"));
}

#[tokio::test(start_paused = true)]
async fn silent_peer_is_dropped_after_the_keepalive_window() {
    let mut rig = rig("rec", "ctl").await;
    rig.connect().await;
    let connected_at = Instant::now();

    assert_eq!(next_state(&mut rig.events).await, ConnectionState::Idle);
    let silent_for = connected_at.elapsed();
    assert!(
        silent_for >= Duration::from_secs(15) && silent_for < Duration::from_secs(16),
        "{silent_for:?}"
    );
    assert!(rig.wire.sent(MessageType::Ping).len() >= 2);
    assert!(rig.wire.calls().iter().any(|call| call == "disconnect"));

    let lost_at = Instant::now();
    assert_eq!(next_state(&mut rig.events).await, ConnectionState::Scanning);
    assert!(lost_at.elapsed() >= Duration::from_secs(2) && lost_at.elapsed() < Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn inbound_pings_keep_the_session_alive() {
    let mut rig = rig("rec", "ctl").await;
    rig.connect().await;

    for _ in 0..10 {
        sleep(Duration::from_secs(4)).await;
        rig.deliver(MessageType::Ping, Payload::new());
    }
    rig.settle().await;

    assert!(matches!(
        rig.handle.connection_state(),
        ConnectionState::Connected(_)
    ));
    assert!(rig.wire.sent(MessageType::Pong).len() >= 10);
    assert!(!rig.wire.calls().iter().any(|call| call == "disconnect"));
}

#[tokio::test(start_paused = true)]
async fn dropped_session_goes_idle_then_scans_after_the_reconnect_delay() {
    let mut rig = rig("rec", "ctl").await;
    rig.connect().await;

    rig.transport_tx
        .send(TransportEvent::Disconnected(rig.peer.clone()))
        .unwrap();
    let dropped_at = Instant::now();
    assert_eq!(next_state(&mut rig.events).await, ConnectionState::Idle);
    assert_eq!(next_state(&mut rig.events).await, ConnectionState::Scanning);
    let waited = dropped_at.elapsed();
    assert!(waited >= Duration::from_secs(2) && waited < Duration::from_secs(3), "{waited:?}");
}

#[tokio::test(start_paused = true)]
async fn stale_snapshot_is_discarded_and_counted() {
    let mut rig = rig("rec", "ctl").await;
    rig.connect().await;

    let mut game = rig.peer_game();
    let now = rig.clock.now();
    game.apply("ctl", GameIntent::Score { side: Side::Home, delta: 2 }, now)
        .unwrap();
    let older = game.clone();
    game.apply("ctl", GameIntent::Score { side: Side::Home, delta: 1 }, now)
        .unwrap();
    game.apply("ctl", GameIntent::StartClock, now).unwrap();
    assert_eq!(game.version, 3);

    rig.deliver_game(MessageType::GameStateUpdate, &game);
    rig.settle().await;
    assert_eq!(rig.handle.game().map(|g| g.version), Some(3));

    rig.deliver_game(MessageType::GameStateUpdate, &older);
    rig.deliver_game(MessageType::GameStateUpdate, &game);
    rig.settle().await;

    let local = rig.handle.game().unwrap();
    assert_eq!(local.version, 3);
    assert_eq!(local.home_score, 3);
    assert_eq!(rig.handle.diagnostics().await.unwrap().stale_updates, 2);
}

#[tokio::test(start_paused = true)]
async fn pending_request_is_sent_once_and_claims_released_control() {
    let mut rig = rig("rec", "ctl").await;
    rig.connect().await;

    let mut game = rig.peer_game();
    rig.deliver_game(MessageType::GameStarting, &game);
    rig.settle().await;
    assert!(rig.handle.game().is_some());

    for _ in 0..3 {
        let outcome = rig.handle.request_control().await.unwrap();
        assert!(matches!(outcome, ClaimOutcome::Requested { ref holder } if holder == "ctl"));
    }
    assert_eq!(rig.wire.sent(MessageType::ControlRequest).len(), 1);

    game.release_control("ctl").unwrap();
    rig.deliver_game(MessageType::ControlRelease, &game);
    let mut watch = rig.handle.watch_game();
    timeout(
        WAIT,
        watch.wait_for(|current| current.as_ref().is_some_and(|g| g.control.is_held_by("rec"))),
    )
    .await
    .expect("released control was not claimed")
    .unwrap();

    let grants = rig.wire.sent(MessageType::ControlGrant);
    assert_eq!(grants.len(), 1);
    assert_eq!(grants[0].field(KEY_GRANTEE).unwrap(), "rec");
    assert_eq!(rig.handle.game().unwrap().version, game.version + 1);
}

/// Free game on `local`; `local` grants itself control while the peer does the same.
/// Returns the holder `local` ends up with.
async fn concurrent_self_grants(local: &str, peer: &str) -> Option<String> {
    let mut rig = rig(local, peer).await;
    rig.connect().await;

    let mut free = rig.peer_game();
    free.release_control(peer).unwrap();
    rig.deliver_game(MessageType::GameStateUpdate, &free);
    rig.settle().await;

    assert_eq!(
        rig.handle.request_control().await.unwrap(),
        ClaimOutcome::Granted
    );
    let mut theirs = free.clone();
    assert_eq!(
        theirs.claim_control(peer, rig.clock.now()).unwrap(),
        ClaimOutcome::Granted
    );
    assert_eq!(theirs.version, rig.handle.game().unwrap().version);

    let mut payload = encode_snapshot(&theirs);
    payload.insert(KEY_GRANTEE.to_string(), peer.to_string());
    rig.deliver(MessageType::ControlGrant, payload);
    rig.settle().await;

    rig.handle
        .game()
        .and_then(|game| game.control.holder().map(str::to_string))
}

#[tokio::test(start_paused = true)]
async fn concurrent_grant_goes_to_the_lower_device_id() {
    assert_eq!(concurrent_self_grants("rec", "ctl").await.as_deref(), Some("ctl"));
    assert_eq!(concurrent_self_grants("ctl", "rec").await.as_deref(), Some("ctl"));
}
