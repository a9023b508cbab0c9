//! LAN transport: sessions over TCP, presence over UDP broadcast beacons.
//!
//! Every TCP frame is a big-endian `u32` length followed by that many bytes.
//! The first frame on a fresh connection is a JSON [`Handshake::Hello`] from
//! the dialer; the listener answers `Accept` or `Reject` once the node decided.
//! Frames after that are encoded game messages handed to the node untouched.

use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{
        TcpListener, TcpStream, UdpSocket,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior, interval, timeout},
};
use tracing::{debug, info, warn};

use crate::{
    config::LanSettings,
    services::{
        discovery::{Discovery, DiscoveryEvent},
        transport::{NetworkLink, Transport, TransportError, TransportEvent},
    },
    state::identity::{DeviceIdentity, Role},
};

/// Upper bound on a single frame; anything larger is treated as a broken stream.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_BEACON_LEN: usize = 2048;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Handshake {
    Hello { identity: DeviceIdentity },
    Accept,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Beacon {
    identity: DeviceIdentity,
    role: Role,
    tcp_port: u16,
}

/// Write one length-prefixed frame.
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(frame.len())
        .ok()
        .filter(|len| (*len as usize) <= MAX_FRAME_LEN)
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "frame too large"))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(frame).await?;
    writer.flush().await
}

/// Read one length-prefixed frame.
pub async fn read_frame<R>(reader: &mut R) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds the limit"),
        ));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn write_handshake<W>(writer: &mut W, handshake: &Handshake) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = serde_json::to_vec(handshake)?;
    write_frame(writer, &bytes).await
}

async fn read_handshake<R>(reader: &mut R) -> std::io::Result<Handshake>
where
    R: AsyncRead + Unpin,
{
    let bytes = timeout(HANDSHAKE_TIMEOUT, read_frame(reader))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "handshake timed out"))??;
    Ok(serde_json::from_slice(&bytes)?)
}

struct SeenPeer {
    identity: DeviceIdentity,
    role: Role,
    session_addr: SocketAddr,
    last_seen: Instant,
    reported: bool,
}

struct Session {
    peer: DeviceIdentity,
    writer: mpsc::UnboundedSender<Vec<u8>>,
    reader: JoinHandle<()>,
    generation: u64,
}

#[derive(Default)]
struct Slot {
    attempt: Option<(String, JoinHandle<()>)>,
    session: Option<Session>,
    generation: u64,
}

struct Shared {
    identity: DeviceIdentity,
    settings: LanSettings,
    transport_tx: mpsc::UnboundedSender<TransportEvent>,
    discovery_tx: mpsc::UnboundedSender<DiscoveryEvent>,
    peers: DashMap<String, SeenPeer>,
    inbound: DashMap<String, TcpStream>,
    browsing: AtomicBool,
    advertised: watch::Sender<Option<(DeviceIdentity, Role)>>,
    slot: Mutex<Slot>,
}

/// Transport and discovery over the local network.
#[derive(Clone)]
pub struct LanNetwork {
    shared: Arc<Shared>,
}

impl LanNetwork {
    /// Bind the session listener and the beacon socket, then start the background tasks.
    pub async fn start(identity: DeviceIdentity, settings: LanSettings) -> std::io::Result<NetworkLink> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, settings.tcp_port)).await?;
        let beacons = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, settings.beacon_port)).await?;
        beacons.set_broadcast(true)?;
        info!(
            tcp = settings.tcp_port,
            beacon = settings.beacon_port,
            "LAN transport listening"
        );

        let (transport_tx, transport_events) = mpsc::unbounded_channel();
        let (discovery_tx, discovery_events) = mpsc::unbounded_channel();
        let (advertised, advertised_rx) = watch::channel(None);
        let network = LanNetwork {
            shared: Arc::new(Shared {
                identity,
                settings,
                transport_tx,
                discovery_tx,
                peers: DashMap::new(),
                inbound: DashMap::new(),
                browsing: AtomicBool::new(false),
                advertised,
                slot: Mutex::new(Slot::default()),
            }),
        };

        let beacons = Arc::new(beacons);
        tokio::spawn(accept_loop(network.shared.clone(), listener));
        tokio::spawn(beacon_sender(
            network.shared.clone(),
            beacons.clone(),
            advertised_rx,
        ));
        tokio::spawn(beacon_listener(network.shared.clone(), beacons));
        tokio::spawn(expiry_sweeper(network.shared.clone()));

        Ok(NetworkLink {
            transport: Arc::new(network.clone()),
            discovery: Arc::new(network),
            transport_events,
            discovery_events,
        })
    }
}

impl Shared {
    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.transport_tx.send(event);
    }

    /// Install `stream` as the live session, replacing any previous one.
    fn establish(self: &Arc<Self>, peer: DeviceIdentity, stream: TcpStream) {
        let (read, write) = stream.into_split();
        let (writer, frames) = mpsc::unbounded_channel();

        let mut slot = self.slot();
        slot.generation += 1;
        let generation = slot.generation;
        if let Some(previous) = slot.session.take() {
            previous.reader.abort();
        }
        slot.attempt = None;
        let reader = tokio::spawn(read_loop(self.clone(), peer.clone(), read, generation));
        tokio::spawn(write_loop(write, frames));
        slot.session = Some(Session {
            peer: peer.clone(),
            writer,
            reader,
            generation,
        });
        drop(slot);

        info!(peer = %peer, "LAN session established");
        self.emit(TransportEvent::Connected(peer));
    }

    fn session_ended(&self, generation: u64, reason: &str) {
        let ended = {
            let mut slot = self.slot();
            match slot.session.as_ref() {
                Some(session) if session.generation == generation => slot.session.take(),
                _ => None,
            }
        };
        if let Some(session) = ended {
            warn!(peer = %session.peer, reason, "LAN session ended");
            self.emit(TransportEvent::Disconnected(session.peer));
        }
    }
}

async fn accept_loop(shared: Arc<Shared>, listener: TcpListener) {
    loop {
        let (mut stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(error = %err, "failed to accept LAN connection");
                continue;
            }
        };
        let shared = shared.clone();
        tokio::spawn(async move {
            match read_handshake(&mut stream).await {
                Ok(Handshake::Hello { identity }) if identity.id != shared.identity.id => {
                    debug!(peer = %identity, %addr, "invitation received");
                    shared.inbound.insert(identity.id.clone(), stream);
                    shared.emit(TransportEvent::Invited(identity));
                }
                Ok(other) => debug!(%addr, handshake = ?other, "unexpected opening frame"),
                Err(err) => debug!(%addr, error = %err, "handshake failed"),
            }
        });
    }
}

async fn dial(shared: Arc<Shared>, peer: DeviceIdentity, addr: SocketAddr) {
    let outcome = async {
        let mut stream = TcpStream::connect(addr).await?;
        write_handshake(
            &mut stream,
            &Handshake::Hello {
                identity: shared.identity.clone(),
            },
        )
        .await?;
        let answer = read_handshake(&mut stream).await?;
        Ok::<_, std::io::Error>((stream, answer))
    }
    .await;

    match outcome {
        Ok((stream, Handshake::Accept)) => shared.establish(peer, stream),
        Ok((_, answer)) => {
            debug!(peer = %peer, answer = ?answer, "invitation declined");
            shared.slot().attempt = None;
            shared.emit(TransportEvent::ConnectFailed {
                peer,
                reason: "invitation declined".into(),
            });
        }
        Err(err) => {
            shared.slot().attempt = None;
            shared.emit(TransportEvent::ConnectFailed {
                peer,
                reason: err.to_string(),
            });
        }
    }
}

async fn read_loop(shared: Arc<Shared>, peer: DeviceIdentity, mut read: OwnedReadHalf, generation: u64) {
    loop {
        match read_frame(&mut read).await {
            Ok(frame) => shared.emit(TransportEvent::Received(frame)),
            Err(err) => {
                debug!(peer = %peer, error = %err, "LAN read loop finished");
                shared.session_ended(generation, "stream closed");
                return;
            }
        }
    }
}

async fn write_loop(mut write: OwnedWriteHalf, mut frames: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(frame) = frames.recv().await {
        if let Err(err) = write_frame(&mut write, &frame).await {
            debug!(error = %err, "LAN write failed");
            break;
        }
    }
    let _ = write.shutdown().await;
}

impl Transport for LanNetwork {
    fn connect(&self, peer: &DeviceIdentity) -> Result<(), TransportError> {
        let addr = self
            .shared
            .peers
            .get(&peer.id)
            .map(|seen| seen.session_addr)
            .ok_or_else(|| TransportError::Unreachable(peer.id.clone()))?;

        let task = tokio::spawn(dial(self.shared.clone(), peer.clone(), addr));
        if let Some((_, previous)) = self.shared.slot().attempt.replace((peer.id.clone(), task)) {
            previous.abort();
        }
        debug!(peer = %peer, %addr, "dialing peer");
        Ok(())
    }

    fn accept(&self, peer: &DeviceIdentity) -> Result<(), TransportError> {
        let Some((_, mut stream)) = self.shared.inbound.remove(&peer.id) else {
            if self
                .shared
                .slot()
                .session
                .as_ref()
                .is_some_and(|session| session.peer.id == peer.id)
            {
                return Ok(());
            }
            return Err(TransportError::Unreachable(format!(
                "no pending invitation from {}",
                peer.id
            )));
        };

        // Crossing dials: the lower id keeps the inbound stream, the higher id keeps its own attempt.
        {
            let mut slot = self.shared.slot();
            let crossing = slot
                .attempt
                .as_ref()
                .is_some_and(|(target, _)| target == &peer.id);
            if crossing {
                if self.shared.identity.id > peer.id {
                    debug!(peer = %peer, "crossing dial; keeping our own attempt");
                    return Ok(());
                }
                if let Some((_, attempt)) = slot.attempt.take() {
                    attempt.abort();
                }
            }
        }

        let shared = self.shared.clone();
        let peer = peer.clone();
        tokio::spawn(async move {
            match write_handshake(&mut stream, &Handshake::Accept).await {
                Ok(()) => shared.establish(peer, stream),
                Err(err) => shared.emit(TransportEvent::ConnectFailed {
                    peer,
                    reason: err.to_string(),
                }),
            }
        });
        Ok(())
    }

    fn reject(&self, peer: &DeviceIdentity) {
        if let Some((_, mut stream)) = self.shared.inbound.remove(&peer.id) {
            tokio::spawn(async move {
                let _ = write_handshake(&mut stream, &Handshake::Reject).await;
            });
        }
    }

    fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        let slot = self.shared.slot();
        let session = slot.session.as_ref().ok_or(TransportError::NotConnected)?;
        session
            .writer
            .send(frame)
            .map_err(|_| TransportError::Closed(format!("writer for {} is gone", session.peer)))
    }

    fn disconnect(&self) {
        let mut slot = self.shared.slot();
        if let Some((_, attempt)) = slot.attempt.take() {
            attempt.abort();
        }
        if let Some(session) = slot.session.take() {
            debug!(peer = %session.peer, "closing LAN session");
            session.reader.abort();
        }
    }
}

async fn beacon_sender(
    shared: Arc<Shared>,
    socket: Arc<UdpSocket>,
    mut advertised: watch::Receiver<Option<(DeviceIdentity, Role)>>,
) {
    let target = SocketAddr::from((Ipv4Addr::BROADCAST, shared.settings.beacon_port));
    let mut ticker = interval(Duration::from_millis(shared.settings.beacon_interval_ms.max(100)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = advertised.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
        let Some((identity, role)) = advertised.borrow().clone() else {
            continue;
        };
        let beacon = Beacon {
            identity,
            role,
            tcp_port: shared.settings.tcp_port,
        };
        match serde_json::to_vec(&beacon) {
            Ok(bytes) => {
                if let Err(err) = socket.send_to(&bytes, target).await {
                    debug!(error = %err, "failed to send beacon");
                }
            }
            Err(err) => warn!(error = %err, "failed to encode beacon"),
        }
    }
}

async fn beacon_listener(shared: Arc<Shared>, socket: Arc<UdpSocket>) {
    let mut buf = vec![0u8; MAX_BEACON_LEN];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(err) => {
                debug!(error = %err, "beacon receive failed");
                continue;
            }
        };
        let beacon = match serde_json::from_slice::<Beacon>(&buf[..len]) {
            Ok(beacon) => beacon,
            Err(err) => {
                debug!(%from, error = %err, "ignoring malformed beacon");
                continue;
            }
        };
        if beacon.identity.id == shared.identity.id {
            continue;
        }

        let session_addr = SocketAddr::new(from.ip(), beacon.tcp_port);
        let browsing = shared.browsing.load(Ordering::SeqCst);
        let mut entry = shared
            .peers
            .entry(beacon.identity.id.clone())
            .or_insert_with(|| SeenPeer {
                identity: beacon.identity.clone(),
                role: beacon.role,
                session_addr,
                last_seen: Instant::now(),
                reported: false,
            });
        entry.identity = beacon.identity;
        entry.role = beacon.role;
        entry.session_addr = session_addr;
        entry.last_seen = Instant::now();
        let report = browsing && !entry.reported;
        if report {
            entry.reported = true;
        }
        let found = DiscoveryEvent::PeerFound {
            identity: entry.identity.clone(),
            role: entry.role,
        };
        drop(entry);

        if report {
            let _ = shared.discovery_tx.send(found);
        }
    }
}

async fn expiry_sweeper(shared: Arc<Shared>) {
    let expiry = Duration::from_millis(shared.settings.peer_expiry_ms);
    let mut ticker = interval(Duration::from_millis(shared.settings.beacon_interval_ms.max(100)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let now = Instant::now();
        let expired = shared
            .peers
            .iter()
            .filter(|seen| now.duration_since(seen.last_seen) > expiry)
            .map(|seen| seen.key().clone())
            .collect::<Vec<_>>();
        for id in expired {
            if let Some((_, seen)) = shared.peers.remove(&id) {
                debug!(peer = %seen.identity, "peer beacon expired");
                if seen.reported && shared.browsing.load(Ordering::SeqCst) {
                    let _ = shared
                        .discovery_tx
                        .send(DiscoveryEvent::PeerLost(seen.identity));
                }
            }
        }
    }
}

impl Discovery for LanNetwork {
    fn advertise(&self, identity: &DeviceIdentity, role: Role) {
        self.shared
            .advertised
            .send_replace(Some((identity.clone(), role)));
    }

    fn stop_advertise(&self) {
        self.shared.advertised.send_replace(None);
    }

    fn browse(&self) {
        self.shared.browsing.store(true, Ordering::SeqCst);
        let visible = self
            .shared
            .peers
            .iter_mut()
            .map(|mut seen| {
                seen.reported = true;
                DiscoveryEvent::PeerFound {
                    identity: seen.identity.clone(),
                    role: seen.role,
                }
            })
            .collect::<Vec<_>>();
        for event in visible {
            let _ = self.shared.discovery_tx.send(event);
        }
    }

    fn stop_browse(&self) {
        self.shared.browsing.store(false, Ordering::SeqCst);
        for mut seen in self.shared.peers.iter_mut() {
            seen.reported = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_survive_a_duplex_stream() {
        let (mut client, mut server) = tokio::io::duplex(64);
        write_frame(&mut client, b"first").await.unwrap();
        write_frame(&mut client, &[]).await.unwrap();

        assert_eq!(read_frame(&mut server).await.unwrap(), b"first");
        assert!(read_frame(&mut server).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(&((MAX_FRAME_LEN as u32) + 1).to_be_bytes())
            .await
            .unwrap();
        let err = read_frame(&mut server).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn handshake_is_tagged_json() {
        let (mut client, mut server) = tokio::io::duplex(256);
        let hello = Handshake::Hello {
            identity: DeviceIdentity::new("a", "Bench"),
        };
        write_handshake(&mut client, &hello).await.unwrap();
        assert_eq!(read_handshake(&mut server).await.unwrap(), hello);

        let raw: serde_json::Value = serde_json::to_value(&Handshake::Accept).unwrap();
        assert_eq!(raw["type"], "accept");
    }
}
