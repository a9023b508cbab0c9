//! In-process network connecting any number of nodes.
//!
//! Every joined device gets a [`NetworkLink`] whose transport and discovery
//! talk to the other devices through shared maps. Used by the test-suite and
//! by single-host demos.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{
    services::{
        discovery::{Discovery, DiscoveryEvent},
        transport::{NetworkLink, Transport, TransportError, TransportEvent},
    },
    state::identity::{DeviceIdentity, Role},
};

struct Endpoint {
    identity: DeviceIdentity,
    transport_tx: mpsc::UnboundedSender<TransportEvent>,
    discovery_tx: mpsc::UnboundedSender<DiscoveryEvent>,
    advertising: Option<Role>,
    browsing: bool,
    /// Device we sent an invitation to and that has not answered yet.
    inviting: Option<String>,
}

#[derive(Default)]
struct Inner {
    endpoints: DashMap<String, Endpoint>,
    /// Both directions of every open session.
    sessions: DashMap<String, String>,
}

/// Shared medium all joined devices talk through.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    inner: Arc<Inner>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a device. Joining again with the same id replaces the previous endpoint.
    pub fn join(&self, identity: DeviceIdentity) -> NetworkLink {
        let (transport_tx, transport_events) = mpsc::unbounded_channel();
        let (discovery_tx, discovery_events) = mpsc::unbounded_channel();
        let id = identity.id.clone();
        self.inner.endpoints.insert(
            id.clone(),
            Endpoint {
                identity,
                transport_tx,
                discovery_tx,
                advertising: None,
                browsing: false,
                inviting: None,
            },
        );

        let port = LocalPort {
            inner: self.inner.clone(),
            id,
        };
        NetworkLink {
            transport: Arc::new(port.clone()),
            discovery: Arc::new(port),
            transport_events,
            discovery_events,
        }
    }

    /// Peer currently in session with `id`.
    pub fn session_of(&self, id: &str) -> Option<String> {
        self.inner
            .sessions
            .get(id)
            .map(|peer| peer.value().clone())
    }

    /// Drop the session between `a` and `b` as if the radio link vanished.
    /// Both sides are told.
    pub fn sever(&self, a: &str, b: &str) {
        let linked = self
            .inner
            .sessions
            .remove_if(a, |_, peer| peer == b)
            .is_some();
        self.inner.sessions.remove_if(b, |_, peer| peer == a);
        if !linked {
            return;
        }
        debug!(a, b, "severing local session");
        let (Some(a), Some(b)) = (self.inner.identity(a), self.inner.identity(b)) else {
            return;
        };
        self.inner
            .notify(&a.id, TransportEvent::Disconnected(b.clone()));
        self.inner.notify(&b.id, TransportEvent::Disconnected(a));
    }
}

impl Inner {
    fn identity(&self, id: &str) -> Option<DeviceIdentity> {
        self.endpoints
            .get(id)
            .map(|endpoint| endpoint.identity.clone())
    }

    fn notify(&self, id: &str, event: TransportEvent) {
        let tx = self
            .endpoints
            .get(id)
            .map(|endpoint| endpoint.transport_tx.clone());
        if let Some(tx) = tx {
            let _ = tx.send(event);
        }
    }
}

#[derive(Clone)]
struct LocalPort {
    inner: Arc<Inner>,
    id: String,
}

impl LocalPort {
    fn me(&self) -> Result<DeviceIdentity, TransportError> {
        self.inner
            .identity(&self.id)
            .ok_or_else(|| TransportError::Closed("endpoint left the network".into()))
    }

    fn set_inviting(&self, target: Option<String>) {
        if let Some(mut endpoint) = self.inner.endpoints.get_mut(&self.id) {
            endpoint.inviting = target;
        }
    }
}

impl Transport for LocalPort {
    fn connect(&self, peer: &DeviceIdentity) -> Result<(), TransportError> {
        let me = self.me()?;
        if !self.inner.endpoints.contains_key(&peer.id) {
            return Err(TransportError::Unreachable(peer.id.clone()));
        }
        self.set_inviting(Some(peer.id.clone()));
        self.inner.notify(&peer.id, TransportEvent::Invited(me));
        Ok(())
    }

    fn accept(&self, peer: &DeviceIdentity) -> Result<(), TransportError> {
        if self
            .inner
            .sessions
            .get(&self.id)
            .is_some_and(|current| current.value() == &peer.id)
        {
            return Ok(());
        }
        let invited_us = self
            .inner
            .endpoints
            .get(&peer.id)
            .is_some_and(|endpoint| endpoint.inviting.as_deref() == Some(self.id.as_str()));
        if !invited_us {
            return Err(TransportError::Unreachable(format!(
                "no pending invitation from {}",
                peer.id
            )));
        }

        let me = self.me()?;
        for id in [&self.id, &peer.id] {
            if let Some(mut endpoint) = self.inner.endpoints.get_mut(id) {
                endpoint.inviting = None;
            }
        }
        self.inner.sessions.insert(self.id.clone(), peer.id.clone());
        self.inner.sessions.insert(peer.id.clone(), self.id.clone());
        debug!(a = %self.id, b = %peer.id, "local session established");

        self.inner
            .notify(&self.id, TransportEvent::Connected(peer.clone()));
        self.inner.notify(&peer.id, TransportEvent::Connected(me));
        Ok(())
    }

    fn reject(&self, peer: &DeviceIdentity) {
        let Ok(me) = self.me() else {
            return;
        };
        let was_invited = match self.inner.endpoints.get_mut(&peer.id) {
            Some(mut endpoint) if endpoint.inviting.as_deref() == Some(self.id.as_str()) => {
                endpoint.inviting = None;
                true
            }
            _ => false,
        };
        if was_invited {
            self.inner.notify(
                &peer.id,
                TransportEvent::ConnectFailed {
                    peer: me,
                    reason: "invitation declined".into(),
                },
            );
        }
    }

    fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        let peer = self
            .inner
            .sessions
            .get(&self.id)
            .map(|peer| peer.value().clone())
            .ok_or(TransportError::NotConnected)?;
        let tx = self
            .inner
            .endpoints
            .get(&peer)
            .map(|endpoint| endpoint.transport_tx.clone())
            .ok_or_else(|| TransportError::Closed(format!("{peer} left the network")))?;
        tx.send(TransportEvent::Received(frame))
            .map_err(|_| TransportError::Closed(format!("{peer} stopped listening")))
    }

    fn disconnect(&self) {
        self.set_inviting(None);
        let Some((_, peer)) = self.inner.sessions.remove(&self.id) else {
            return;
        };
        self.inner.sessions.remove_if(&peer, |_, other| other == &self.id);
        if let Ok(me) = self.me() {
            self.inner.notify(&peer, TransportEvent::Disconnected(me));
        }
    }
}

impl Discovery for LocalPort {
    fn advertise(&self, identity: &DeviceIdentity, role: Role) {
        if let Some(mut endpoint) = self.inner.endpoints.get_mut(&self.id) {
            endpoint.advertising = Some(role);
        }
        let browsers = self
            .inner
            .endpoints
            .iter()
            .filter(|endpoint| endpoint.key() != &self.id && endpoint.browsing)
            .map(|endpoint| endpoint.discovery_tx.clone())
            .collect::<Vec<_>>();
        for tx in browsers {
            let _ = tx.send(DiscoveryEvent::PeerFound {
                identity: identity.clone(),
                role,
            });
        }
    }

    fn stop_advertise(&self) {
        let identity = match self.inner.endpoints.get_mut(&self.id) {
            Some(mut endpoint) if endpoint.advertising.is_some() => {
                endpoint.advertising = None;
                endpoint.identity.clone()
            }
            _ => return,
        };
        let browsers = self
            .inner
            .endpoints
            .iter()
            .filter(|endpoint| endpoint.key() != &self.id && endpoint.browsing)
            .map(|endpoint| endpoint.discovery_tx.clone())
            .collect::<Vec<_>>();
        for tx in browsers {
            let _ = tx.send(DiscoveryEvent::PeerLost(identity.clone()));
        }
    }

    fn browse(&self) {
        let tx = match self.inner.endpoints.get_mut(&self.id) {
            Some(mut endpoint) => {
                endpoint.browsing = true;
                endpoint.discovery_tx.clone()
            }
            None => return,
        };
        let visible = self
            .inner
            .endpoints
            .iter()
            .filter(|endpoint| endpoint.key() != &self.id)
            .filter_map(|endpoint| {
                endpoint
                    .advertising
                    .map(|role| (endpoint.identity.clone(), role))
            })
            .collect::<Vec<_>>();
        for (identity, role) in visible {
            let _ = tx.send(DiscoveryEvent::PeerFound { identity, role });
        }
    }

    fn stop_browse(&self) {
        if let Some(mut endpoint) = self.inner.endpoints.get_mut(&self.id) {
            endpoint.browsing = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(id: &str) -> DeviceIdentity {
        DeviceIdentity::new(id, id.to_uppercase())
    }

    #[tokio::test]
    async fn browsing_sees_existing_and_future_advertisers() {
        let network = LocalNetwork::new();
        let a = device("a");
        let b = device("b");
        let c = device("c");
        let link_a = network.join(a.clone());
        let mut link_b = network.join(b.clone());
        let link_c = network.join(c.clone());

        link_a.discovery.advertise(&a, Role::Controller);
        link_b.discovery.browse();
        link_c.discovery.advertise(&c, Role::Recorder);
        link_a.discovery.stop_advertise();

        assert_eq!(
            link_b.discovery_events.recv().await,
            Some(DiscoveryEvent::PeerFound {
                identity: a.clone(),
                role: Role::Controller
            })
        );
        assert_eq!(
            link_b.discovery_events.recv().await,
            Some(DiscoveryEvent::PeerFound {
                identity: c,
                role: Role::Recorder
            })
        );
        assert_eq!(link_b.discovery_events.recv().await, Some(DiscoveryEvent::PeerLost(a)));
    }

    #[tokio::test]
    async fn accepted_invitation_connects_both_sides_once() {
        let network = LocalNetwork::new();
        let a = device("a");
        let b = device("b");
        let mut link_a = network.join(a.clone());
        let mut link_b = network.join(b.clone());

        link_a.transport.connect(&b).unwrap();
        assert_eq!(
            link_b.transport_events.recv().await,
            Some(TransportEvent::Invited(a.clone()))
        );
        link_b.transport.accept(&a).unwrap();
        link_b.transport.accept(&a).unwrap();

        assert_eq!(
            link_a.transport_events.recv().await,
            Some(TransportEvent::Connected(b.clone()))
        );
        assert_eq!(
            link_b.transport_events.recv().await,
            Some(TransportEvent::Connected(a.clone()))
        );
        assert!(link_b.transport_events.try_recv().is_err());

        link_a.transport.send(b"hello".to_vec()).unwrap();
        assert_eq!(
            link_b.transport_events.recv().await,
            Some(TransportEvent::Received(b"hello".to_vec()))
        );

        network.sever("a", "b");
        assert_eq!(
            link_a.transport_events.recv().await,
            Some(TransportEvent::Disconnected(b))
        );
        assert_eq!(
            link_b.transport_events.recv().await,
            Some(TransportEvent::Disconnected(a))
        );
        assert!(matches!(
            link_a.transport.send(Vec::new()),
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn rejected_and_unsolicited_invitations_fail() {
        let network = LocalNetwork::new();
        let a = device("a");
        let b = device("b");
        let mut link_a = network.join(a.clone());
        let link_b = network.join(b.clone());

        assert!(link_b.transport.accept(&a).is_err());
        assert!(matches!(
            link_a.transport.connect(&device("ghost")),
            Err(TransportError::Unreachable(_))
        ));

        link_a.transport.connect(&b).unwrap();
        link_b.transport.reject(&a);
        assert!(matches!(
            link_a.transport_events.recv().await,
            Some(TransportEvent::ConnectFailed { peer, .. }) if peer == b
        ));
        assert_eq!(network.session_of("a"), None);
    }
}
