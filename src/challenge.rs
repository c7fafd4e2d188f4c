use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::netlink::{Interface, NetlinkPort};
use crate::user::{ChallengeContext, User};
use crate::vlan::Allocator;

struct Registry {
    users: HashMap<String, Arc<User>>,
    allocator: Allocator,
}

/// A registered challenge: its shared host VETH, ordered compose files, and
/// the set of Users currently wired into it.
pub struct Challenge {
    pub name: String,
    pub host_veth: Interface,
    pub compose_files: Vec<PathBuf>,
    registry: Mutex<Registry>,
    netlink: Arc<dyn NetlinkPort>,
    containers: Arc<dyn crate::container::ContainerPort>,
}

impl Challenge {
    pub fn new(
        name: String,
        host_veth: Interface,
        compose_files: Vec<PathBuf>,
        netlink: Arc<dyn NetlinkPort>,
        containers: Arc<dyn crate::container::ContainerPort>,
    ) -> Result<Self> {
        netlink.ensure_up(&host_veth)?;
        Ok(Challenge {
            name,
            host_veth,
            compose_files,
            registry: Mutex::new(Registry {
                users: HashMap::new(),
                allocator: Allocator::new(),
            }),
            netlink,
            containers,
        })
    }

    fn context(&self) -> ChallengeContext {
        ChallengeContext {
            name: &self.name,
            host_veth: &self.host_veth,
            compose_files: &self.compose_files,
            netlink: self.netlink.as_ref(),
            containers: self.containers.as_ref(),
        }
    }

    /// Returns the existing User for `cn`, or allocates a VLAN and creates
    /// one. The whole check-then-insert sequence runs under a single
    /// critical section (spec.md §9's guidance for languages without a free
    /// lunch on double-checked-locking visibility) rather than the
    /// original's separate "check, then lock and check again" phases.
    fn ensure_user_exists(&self, cn: &str) -> Result<Arc<User>> {
        let mut registry = self.registry.lock();
        if let Some(user) = registry.users.get(cn) {
            return Ok(user.clone());
        }
        let vlan = registry.allocator.allocate(&self.name)?;
        let user = User::new(cn.to_string(), vlan, &self.name);
        registry.users.insert(cn.to_string(), user.clone());
        Ok(user)
    }

    pub fn connect_user(&self, cn: &str, ip: &str, port: u16) -> Result<u16> {
        let user = self.ensure_user_exists(cn)?;
        let ctx = self.context();
        user.add_connection(&ctx, ip, port)?;
        Ok(user.vlan)
    }

    pub fn disconnect_user(&self, cn: &str, ip: &str, port: u16) -> Result<()> {
        let user = self.ensure_user_exists(cn)?;
        let ctx = self.context();
        user.remove_connection(&ctx, ip, port)
    }

    pub fn disconnect_all(&self) {
        let ctx = self.context();
        let users: Vec<_> = self.registry.lock().users.values().cloned().collect();
        for user in users {
            if let Err(err) = user.stop(&ctx) {
                tracing::error!(
                    challenge = %self.name,
                    user = %user.display_name,
                    error = %err,
                    "failed to stop cluster during shutdown"
                );
            }
        }
    }

    #[cfg(test)]
    pub fn vlans_in_use(&self) -> std::collections::HashSet<u16> {
        self.registry.lock().allocator.in_use().clone()
    }

    #[cfg(test)]
    pub fn user_vlans(&self) -> std::collections::HashSet<u16> {
        self.registry.lock().users.values().map(|u| u.vlan).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::fake::FakeGateway as FakeContainers;
    use crate::netlink::fake::FakeGateway as FakeNetlink;

    fn challenge() -> (Challenge, Arc<FakeNetlink>, Arc<FakeContainers>) {
        let netlink = Arc::new(FakeNetlink::new());
        let containers = Arc::new(FakeContainers::new());
        let host_veth = netlink.seed_interface("host0");
        let challenge = Challenge::new(
            "example".to_string(),
            host_veth,
            vec![PathBuf::from("ex.yml")],
            netlink.clone(),
            containers.clone(),
        )
        .unwrap();
        (challenge, netlink, containers)
    }

    #[test]
    fn connect_allocates_vlan_and_returns_it_on_reconnect() {
        let (challenge, netlink, containers) = challenge();
        containers.seed_network("mfrgg_example", "abcdef012345");
        netlink.seed_interface("br-abcdef012345");

        let vlan1 = challenge.connect_user("MFRGG", "10.8.0.2", 49152).unwrap();
        let vlan2 = challenge.connect_user("MFRGG", "10.8.0.2", 49153).unwrap();
        assert_eq!(vlan1, vlan2);
        assert_eq!(challenge.vlans_in_use(), challenge.user_vlans());
    }

    #[test]
    fn disconnect_unknown_user_is_a_no_op() {
        let (challenge, _netlink, _containers) = challenge();
        challenge
            .disconnect_user("ZZZZ", "1.2.3.4", 9)
            .expect("unknown cn disconnect must not fail");
    }

    #[test]
    fn vlans_remain_allocated_after_full_drain() {
        let (challenge, netlink, containers) = challenge();
        containers.seed_network("mfrgg_example", "abcdef012345");
        netlink.seed_interface("br-abcdef012345");

        let vlan = challenge.connect_user("MFRGG", "10.8.0.2", 49152).unwrap();
        challenge
            .disconnect_user("MFRGG", "10.8.0.2", 49152)
            .unwrap();

        // per spec.md §9's open question, vlans are never released back to
        // the allocator while the user's process-lifetime object exists.
        assert!(challenge.vlans_in_use().contains(&vlan));
    }
}
