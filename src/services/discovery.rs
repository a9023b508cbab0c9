use crate::state::{
    identity::{DeviceIdentity, Role},
    registry::DiscoveryMode,
};

/// Change in the set of peers visible on the local network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// A peer advertising `role` became visible.
    PeerFound { identity: DeviceIdentity, role: Role },
    /// A previously found peer stopped advertising or timed out.
    PeerLost(DeviceIdentity),
}

/// Local network presence. Advertising and browsing run independently.
pub trait Discovery: Send + Sync {
    /// Announce `identity` as offering `role` until [`Discovery::stop_advertise`].
    fn advertise(&self, identity: &DeviceIdentity, role: Role);
    fn stop_advertise(&self);
    /// Report advertising peers until [`Discovery::stop_browse`].
    fn browse(&self);
    fn stop_browse(&self);
}

/// Sub-roles currently running on a [`Discovery`], so they can be stopped symmetrically.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ActiveDiscovery {
    browsing: bool,
    advertising: bool,
}

impl ActiveDiscovery {
    /// Start whatever `mode` asks for, stopping what is already running first.
    pub fn start(&mut self, discovery: &dyn Discovery, identity: &DeviceIdentity, mode: DiscoveryMode) {
        self.stop(discovery);
        if mode.browse {
            discovery.browse();
            self.browsing = true;
        }
        if let Some(role) = mode.advertise {
            discovery.advertise(identity, role);
            self.advertising = true;
        }
    }

    /// Stop every running sub-role.
    pub fn stop(&mut self, discovery: &dyn Discovery) {
        if self.browsing {
            discovery.stop_browse();
            self.browsing = false;
        }
        if self.advertising {
            discovery.stop_advertise();
            self.advertising = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl Discovery for Recorder {
        fn advertise(&self, _identity: &DeviceIdentity, role: Role) {
            self.0.lock().unwrap().push(format!("advertise:{role}"));
        }
        fn stop_advertise(&self) {
            self.0.lock().unwrap().push("stop_advertise".into());
        }
        fn browse(&self) {
            self.0.lock().unwrap().push("browse".into());
        }
        fn stop_browse(&self) {
            self.0.lock().unwrap().push("stop_browse".into());
        }
    }

    #[test]
    fn restart_stops_previous_sub_roles() {
        let discovery = Recorder::default();
        let me = DeviceIdentity::new("a", "A");
        let mut active = ActiveDiscovery::default();

        active.start(
            &discovery,
            &me,
            DiscoveryMode {
                browse: true,
                advertise: Some(Role::Controller),
            },
        );
        active.start(
            &discovery,
            &me,
            DiscoveryMode {
                browse: true,
                advertise: None,
            },
        );
        active.stop(&discovery);
        active.stop(&discovery);

        assert_eq!(
            *discovery.0.lock().unwrap(),
            vec![
                "browse",
                "advertise:controller",
                "stop_browse",
                "stop_advertise",
                "browse",
                "stop_browse",
            ]
        );
    }
}
