use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::challenge::Challenge;
use crate::container::ContainerPort;
use crate::error::{Error, Result};
use crate::netlink::NetlinkPort;

/// Top-level registry of challenges; routes RPC calls to the right
/// Challenge → User. Owns the gateway handles for the process lifetime.
pub struct Manager {
    challenges: Mutex<HashMap<String, Arc<Challenge>>>,
    netlink: Arc<dyn NetlinkPort>,
    containers: Arc<dyn ContainerPort>,
}

impl Manager {
    pub fn new(netlink: Arc<dyn NetlinkPort>, containers: Arc<dyn ContainerPort>) -> Self {
        Manager {
            challenges: Mutex::new(HashMap::new()),
            netlink,
            containers,
        }
    }

    /// Idempotent no-op on a duplicate name (logged as a warning), per
    /// spec.md §4.6 — not an error, since a startup script re-running
    /// `register_challenge` must not crash the challenge's own bring-up.
    pub fn register_challenge(
        &self,
        name: &str,
        host_veth: &str,
        compose_files: Vec<PathBuf>,
    ) -> Result<()> {
        let mut challenges = self.challenges.lock();
        if challenges.contains_key(name) {
            tracing::warn!(challenge = name, "challenge already registered");
            return Ok(());
        }

        tracing::info!(challenge = name, host_veth, "registering challenge");
        let iface = self
            .netlink
            .interface(host_veth)?
            .ok_or_else(|| Error::Netlink(crate::error::NetlinkError::new(anyhow::anyhow!(
                "host veth {host_veth:?} does not exist"
            ))))?;
        let challenge = Challenge::new(
            name.to_string(),
            iface,
            compose_files,
            self.netlink.clone(),
            self.containers.clone(),
        )?;
        challenges.insert(name.to_string(), Arc::new(challenge));
        Ok(())
    }

    fn challenge(&self, name: &str) -> Result<Arc<Challenge>> {
        self.challenges
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownChallenge(name.to_string()))
    }

    pub fn connect_user(&self, challenge: &str, cn: &str, ip: &str, port: u16) -> Result<u16> {
        self.challenge(challenge)?.connect_user(cn, ip, port)
    }

    pub fn disconnect_user(&self, challenge: &str, cn: &str, ip: &str, port: u16) -> Result<()> {
        self.challenge(challenge)?.disconnect_user(cn, ip, port)
    }

    /// For every challenge, tears down every User's cluster, then releases
    /// the gateway handles. Invoked once, at process shutdown.
    pub fn stop(&self) {
        let challenges: Vec<_> = self.challenges.lock().values().cloned().collect();
        for challenge in challenges {
            challenge.disconnect_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::fake::FakeGateway as FakeContainers;
    use crate::netlink::fake::FakeGateway as FakeNetlink;

    fn manager() -> (Manager, Arc<FakeNetlink>, Arc<FakeContainers>) {
        let netlink = Arc::new(FakeNetlink::new());
        let containers = Arc::new(FakeContainers::new());
        netlink.seed_interface("host0");
        let manager = Manager::new(netlink.clone(), containers.clone());
        (manager, netlink, containers)
    }

    #[test]
    fn duplicate_registration_is_a_no_op() {
        let (manager, _netlink, _containers) = manager();
        manager
            .register_challenge("example", "host0", vec![PathBuf::from("ex.yml")])
            .unwrap();
        manager
            .register_challenge("example", "host0", vec![PathBuf::from("ex.yml")])
            .unwrap();
        assert_eq!(manager.challenges.lock().len(), 1);
    }

    #[test]
    fn unknown_challenge_is_an_error() {
        let (manager, _netlink, _containers) = manager();
        let err = manager
            .connect_user("nope", "MFRGG", "10.8.0.2", 49152)
            .unwrap_err();
        assert!(matches!(err, Error::UnknownChallenge(ref name) if name == "nope"));
    }

    #[test]
    fn full_scenario_register_connect_disconnect() {
        let (manager, netlink, containers) = manager();
        manager
            .register_challenge("example", "host0", vec![PathBuf::from("ex.yml")])
            .unwrap();
        containers.seed_network("mfrgg_example", "abcdef012345");
        netlink.seed_interface("br-abcdef012345");

        let vlan = manager
            .connect_user("example", "MFRGG", "10.8.0.2", 49152)
            .unwrap();
        assert!((10..=4000).contains(&vlan));

        manager
            .connect_user("example", "MFRGG", "10.8.0.2", 49153)
            .unwrap();
        assert_eq!(containers.up_calls(), 1);

        manager
            .disconnect_user("example", "MFRGG", "10.8.0.2", 49153)
            .unwrap();
        manager
            .disconnect_user("example", "MFRGG", "10.8.0.2", 49152)
            .unwrap();
        assert_eq!(containers.down_calls(), 1);
    }
}
