use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::cn;
use crate::container::ContainerPort;
use crate::error::{Error, Result};
use crate::netlink::{Interface, NetlinkPort};

/// Context a `User` needs from its owning `Challenge` but does not own.
/// Modelled as borrowed references passed into each call rather than a
/// back-pointer, per spec.md §9: the Challenge owns the User, so the User
/// never holds anything that would keep the Challenge alive or create a
/// reference cycle.
pub struct ChallengeContext<'a> {
    pub name: &'a str,
    pub host_veth: &'a Interface,
    pub compose_files: &'a [PathBuf],
    pub netlink: &'a dyn NetlinkPort,
    pub containers: &'a dyn ContainerPort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Live,
}

struct Inner {
    connections: HashSet<String>,
    state: State,
}

/// Per `(challenge, common-name)` lifecycle owner: cluster boot/teardown,
/// VLAN wiring, and the live connection set. All mutating operations
/// serialise under `lock`.
///
/// The lock is a plain `parking_lot::Mutex`, not a reentrant one (spec.md
/// §4.4 calls for a reentrant guard; §9's design note is exactly how this
/// crate squares that with a non-reentrant mutex type): public methods take
/// the lock once and dispatch to private `*_locked` helpers, and those
/// helpers — including the ones invoked nested, like `ensure_vlan_bridged`
/// from inside `add_connection` — call each other directly rather than
/// re-entering through the public API.
pub struct User {
    pub cn: String,
    pub display_name: String,
    pub vlan: u16,
    pub project_id: String,
    inner: Mutex<Inner>,
}

impl User {
    pub fn new(cn: String, vlan: u16, challenge_name: &str) -> Arc<Self> {
        let display_name = cn::display_name(&cn);
        let project_id = format!("{}_{}", cn.to_lowercase(), challenge_name);
        Arc::new(User {
            cn,
            display_name,
            vlan,
            project_id,
            inner: Mutex::new(Inner {
                connections: HashSet::new(),
                state: State::Idle,
            }),
        })
    }

    pub fn state(&self) -> State {
        self.inner.lock().state
    }

    pub fn connection_count(&self) -> usize {
        self.inner.lock().connections.len()
    }

    pub fn add_connection(&self, ctx: &ChallengeContext, ip: &str, port: u16) -> Result<()> {
        let mut guard = self.inner.lock();
        let addr = format!("{ip}:{port}");

        if guard.connections.is_empty() {
            tracing::info!(
                user = %self.display_name,
                challenge = ctx.name,
                "first connection, booting cluster"
            );

            if ctx.containers.compose_is_running(&self.project_id, ctx.compose_files)? {
                tracing::warn!(
                    user = %self.display_name,
                    challenge = ctx.name,
                    "cluster already running, stopping stale instance"
                );
                self.stop_compose_locked(ctx, Duration::from_secs(3))?;
            }

            ctx.containers.compose_up(&self.project_id, ctx.compose_files)?;
            tracing::debug!(project_id = %self.project_id, "cluster up");

            self.ensure_vlan_bridged_locked(ctx)?;
            guard.state = State::Live;
        }

        tracing::info!(user = %self.display_name, %addr, challenge = ctx.name, "connected");
        guard.connections.insert(addr);
        Ok(())
    }

    pub fn remove_connection(&self, ctx: &ChallengeContext, ip: &str, port: u16) -> Result<()> {
        let mut guard = self.inner.lock();
        let addr = format!("{ip}:{port}");

        if !guard.connections.remove(&addr) {
            tracing::warn!(
                user = %self.display_name,
                challenge = ctx.name,
                %addr,
                "removing non-existent connection"
            );
            return Ok(());
        }

        tracing::info!(user = %self.display_name, %addr, challenge = ctx.name, "disconnected");

        if guard.connections.is_empty() {
            if !ctx.containers.compose_is_running(&self.project_id, ctx.compose_files)? {
                tracing::warn!(
                    user = %self.display_name,
                    challenge = ctx.name,
                    "last connection removed but cluster isn't running"
                );
                guard.state = State::Idle;
                return Ok(());
            }

            tracing::info!(
                user = %self.display_name,
                challenge = ctx.name,
                "no connections remain, shutting cluster down"
            );
            let down = self.stop_compose_locked(ctx, Duration::from_secs(10));
            // ensure_vlan_gone runs even if compose_down failed (spec.md §7:
            // "compose_down failure after drain: log; still attempt
            // ensure_vlan_gone").
            if let Err(err) = &down {
                tracing::error!(error = %err, "compose down failed during drain");
            }
            self.ensure_vlan_gone_locked(ctx)?;
            guard.state = State::Idle;
            down?;
        }
        Ok(())
    }

    /// Invoked at Manager shutdown.
    pub fn stop(&self, ctx: &ChallengeContext) -> Result<()> {
        let _guard = self.inner.lock();
        self.stop_compose_locked(ctx, Duration::from_secs(2))
    }

    fn stop_compose_locked(&self, ctx: &ChallengeContext, timeout: Duration) -> Result<()> {
        ctx.containers
            .compose_down(&self.project_id, ctx.compose_files, timeout)?;
        tracing::debug!(project_id = %self.project_id, "cluster down");
        Ok(())
    }

    fn vlan_ifname(&self, host_veth: &Interface) -> String {
        let suffix = format!(".{}", self.vlan);
        let keep = 15usize.saturating_sub(suffix.len());
        let truncated: String = host_veth.name.chars().take(keep).collect();
        format!("{truncated}{suffix}")
    }

    fn ensure_vlan_bridged_locked(&self, ctx: &ChallengeContext) -> Result<()> {
        let ifname = self.vlan_ifname(ctx.host_veth);
        let vlan_iface = ctx
            .netlink
            .create_vlan(&ifname, ctx.host_veth, self.vlan)?;
        ctx.netlink.ensure_up(&vlan_iface)?;

        let network_name = format!("{}_default", self.project_id);
        let network = ctx
            .containers
            .find_network(&network_name)?
            .ok_or_else(|| Error::Topology {
                project_id: self.project_id.clone(),
            })?;

        let bridge_name = format!("br-{}", &network.id[..network.id.len().min(12)]);
        let bridge = ctx
            .netlink
            .interface(&bridge_name)?
            .ok_or_else(|| Error::Topology {
                project_id: self.project_id.clone(),
            })?;

        if ctx.netlink.master_of(&vlan_iface)? != Some(bridge.index) {
            let addresses = ctx.netlink.list_addresses(&bridge)?;
            for (addr, prefix_len) in &addresses {
                // strip all host IP addresses from the bridge: the bridge
                // must carry no host-visible L3 on the challenge segment.
                ctx.netlink.remove_address(&bridge, *addr, *prefix_len)?;
            }
            ctx.netlink.add_port(&bridge, &vlan_iface)?;
            tracing::info!(vlan = self.vlan, bridge = %bridge_name, "bridged vlan into cluster network");
        }
        Ok(())
    }

    fn ensure_vlan_gone_locked(&self, ctx: &ChallengeContext) -> Result<()> {
        let ifname = self.vlan_ifname(ctx.host_veth);
        if let Some(iface) = ctx.netlink.interface(&ifname)? {
            ctx.netlink.remove_interface(&iface)?;
            tracing::info!(vlan = self.vlan, ifname = %ifname, "removed vlan sub-interface");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::fake::FakeGateway as FakeContainers;
    use crate::netlink::fake::FakeGateway as FakeNetlink;

    fn ctx<'a>(
        name: &'a str,
        host_veth: &'a Interface,
        compose_files: &'a [PathBuf],
        netlink: &'a FakeNetlink,
        containers: &'a FakeContainers,
    ) -> ChallengeContext<'a> {
        ChallengeContext {
            name,
            host_veth,
            compose_files,
            netlink,
            containers,
        }
    }

    #[test]
    fn vlan_ifname_respects_kernel_limit() {
        let user = User::new("MFRGG".into(), 42, "example");
        let long = Interface {
            name: "a-very-long-host-veth-name".into(),
            index: 1,
        };
        let ifname = user.vlan_ifname(&long);
        assert!(ifname.len() <= 15, "{ifname:?} exceeds 15 bytes");
        assert!(ifname.ends_with(".42"));
    }

    #[test]
    fn first_connect_boots_cluster_and_bridges_vlan() {
        let netlink = FakeNetlink::new();
        let containers = FakeContainers::new();
        let host_veth = netlink.seed_interface("host0");
        let files = vec![PathBuf::from("ex.yml")];
        let user = User::new("MFRGG".into(), 42, "example");

        containers.seed_network(&user.project_id, "abcdef012345");
        netlink.seed_interface("br-abcdef012345");
        let c = ctx("example", &host_veth, &files, &netlink, &containers);

        user.add_connection(&c, "10.8.0.2", 49152).unwrap();

        assert_eq!(user.connection_count(), 1);
        assert!(matches!(user.state(), State::Live));
        assert_eq!(containers.up_calls(), 1);
        let vlan_ifname = user.vlan_ifname(&host_veth);
        assert!(netlink.is_up(&vlan_ifname));
        assert_eq!(netlink.master_of(&vlan_ifname), Some("br-abcdef012345".into()));
    }

    #[test]
    fn second_connect_does_not_reboot_cluster() {
        let netlink = FakeNetlink::new();
        let containers = FakeContainers::new();
        let host_veth = netlink.seed_interface("host0");
        let files = vec![PathBuf::from("ex.yml")];
        let user = User::new("MFRGG".into(), 42, "example");
        containers.seed_network(&user.project_id, "abcdef012345");
        netlink.seed_interface("br-abcdef012345");
        let c = ctx("example", &host_veth, &files, &netlink, &containers);

        user.add_connection(&c, "10.8.0.2", 49152).unwrap();
        user.add_connection(&c, "10.8.0.2", 49153).unwrap();

        assert_eq!(user.connection_count(), 2);
        assert_eq!(containers.up_calls(), 1);
    }

    #[test]
    fn full_drain_tears_down_cluster_and_vlan() {
        let netlink = FakeNetlink::new();
        let containers = FakeContainers::new();
        let host_veth = netlink.seed_interface("host0");
        let files = vec![PathBuf::from("ex.yml")];
        let user = User::new("MFRGG".into(), 42, "example");
        containers.seed_network(&user.project_id, "abcdef012345");
        netlink.seed_interface("br-abcdef012345");
        let c = ctx("example", &host_veth, &files, &netlink, &containers);

        user.add_connection(&c, "10.8.0.2", 49152).unwrap();
        user.add_connection(&c, "10.8.0.2", 49153).unwrap();
        user.remove_connection(&c, "10.8.0.2", 49153).unwrap();
        assert!(matches!(user.state(), State::Live));

        user.remove_connection(&c, "10.8.0.2", 49152).unwrap();
        assert!(matches!(user.state(), State::Idle));
        assert_eq!(containers.down_calls(), 1);
        let vlan_ifname = user.vlan_ifname(&host_veth);
        assert!(netlink.interface(&vlan_ifname).unwrap().is_none());
    }

    #[test]
    fn disconnecting_unknown_address_is_a_warned_no_op() {
        let netlink = FakeNetlink::new();
        let containers = FakeContainers::new();
        let host_veth = netlink.seed_interface("host0");
        let files = vec![PathBuf::from("ex.yml")];
        let user = User::new("ZZZZ".into(), 7, "example");
        let c = ctx("example", &host_veth, &files, &netlink, &containers);

        user.remove_connection(&c, "1.2.3.4", 9).unwrap();
        assert_eq!(user.connection_count(), 0);
    }

    #[test]
    fn missing_default_network_surfaces_topology_error() {
        let netlink = FakeNetlink::new();
        let containers = FakeContainers::new();
        let host_veth = netlink.seed_interface("host0");
        let files = vec![PathBuf::from("ex.yml")];
        let user = User::new("MFRGG".into(), 42, "example");
        let c = ctx("example", &host_veth, &files, &netlink, &containers);

        let err = user.add_connection(&c, "10.8.0.2", 49152).unwrap_err();
        assert!(matches!(err, Error::Topology { .. }));
        // connection must not be recorded on failure
        assert_eq!(user.connection_count(), 0);
    }
}
