use std::future::Future;
use std::net::IpAddr;

use futures::TryStreamExt;
use netlink_packet_route::address::AddressAttribute;
use netlink_packet_route::link::{InfoData, InfoKind, InfoVlan, LinkAttribute, LinkInfo};
use rtnetlink::{Handle, LinkMessageBuilder, LinkUnspec};

use crate::error::{Error, NetlinkError, Result};

/// A host network interface, reduced to what the rest of the system needs.
/// No `netlink_packet_route` type escapes this module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub name: String,
    pub index: u32,
}

/// The seam between `User`/`Challenge` and the host network namespace.
///
/// A trait rather than a concrete struct so tests can substitute a fake that
/// records calls instead of mutating the host (spec.md §9: side effects here
/// are not transactional and there is deliberately no compensating rollback,
/// which makes exercising the real path in unit tests both dangerous and
/// unnecessary).
pub trait NetlinkPort: Send + Sync {
    fn interface(&self, name: &str) -> Result<Option<Interface>>;
    fn ensure_up(&self, iface: &Interface) -> Result<()>;
    fn create_vlan(&self, ifname: &str, parent: &Interface, vlan_id: u16) -> Result<Interface>;
    fn remove_interface(&self, iface: &Interface) -> Result<()>;
    fn list_addresses(&self, iface: &Interface) -> Result<Vec<(IpAddr, u8)>>;
    fn remove_address(&self, iface: &Interface, addr: IpAddr, prefix_len: u8) -> Result<()>;
    fn add_port(&self, bridge: &Interface, member: &Interface) -> Result<()>;
    /// Index of `iface`'s current bridge master, if any.
    fn master_of(&self, iface: &Interface) -> Result<Option<u32>>;
}

/// Production implementation, backed by `rtnetlink`'s async `Handle`.
///
/// `NetlinkPort` is a synchronous trait (callers already run gateway calls
/// from inside `tokio::task::spawn_blocking`, per SPEC_FULL.md's concurrency
/// section, so nothing here is ever invoked from a thread already driving an
/// async task); `Gateway` owns a dedicated current-thread runtime and drives
/// each call to completion with `block_on`, the same sync-facade-over-async
/// shape `reqwest::blocking` uses elsewhere in this workspace.
pub struct Gateway {
    runtime: tokio::runtime::Runtime,
    handle: Handle,
}

impl Gateway {
    pub fn open() -> anyhow::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        // opening the socket here fails fast if the process lacks
        // CAP_NET_ADMIN or the host netns can't be reached, matching the
        // "cannot open host netns" fatal-init-failure case in spec.md §6.
        let (connection, handle, _) = rtnetlink::new_connection()?;
        runtime.spawn(connection);
        Ok(Gateway { runtime, handle })
    }

    fn block_on<F: Future>(&self, fut: F) -> F::Output {
        self.runtime.block_on(fut)
    }
}

impl NetlinkPort for Gateway {
    fn interface(&self, name: &str) -> Result<Option<Interface>> {
        self.block_on(get_interface(&self.handle, name))
    }

    fn ensure_up(&self, iface: &Interface) -> Result<()> {
        self.block_on(set_link_up(&self.handle, iface))
    }

    fn create_vlan(&self, ifname: &str, parent: &Interface, vlan_id: u16) -> Result<Interface> {
        self.block_on(ensure_vlan(&self.handle, ifname, parent, vlan_id))
    }

    fn remove_interface(&self, iface: &Interface) -> Result<()> {
        self.block_on(delete_link(&self.handle, iface))
    }

    fn list_addresses(&self, iface: &Interface) -> Result<Vec<(IpAddr, u8)>> {
        self.block_on(fetch_addresses(&self.handle, iface))
    }

    fn remove_address(&self, iface: &Interface, addr: IpAddr, prefix_len: u8) -> Result<()> {
        self.block_on(delete_address(&self.handle, iface, addr, prefix_len))
    }

    fn add_port(&self, bridge: &Interface, member: &Interface) -> Result<()> {
        self.block_on(enslave(&self.handle, bridge, member))
    }

    fn master_of(&self, iface: &Interface) -> Result<Option<u32>> {
        self.block_on(current_master(&self.handle, iface))
    }
}

fn netlink_err(err: rtnetlink::Error) -> Error {
    Error::Netlink(NetlinkError::new(anyhow::Error::new(err)))
}

fn interface_already_gone(err: &rtnetlink::Error) -> bool {
    let msg = err.to_string();
    msg.contains("ENODEV") || msg.contains("No such device")
}

async fn get_interface(handle: &Handle, name: &str) -> Result<Option<Interface>> {
    let mut links = handle.link().get().match_name(name.to_string()).execute();
    match links.try_next().await {
        Ok(Some(msg)) => Ok(Some(Interface {
            name: name.to_string(),
            index: msg.header.index,
        })),
        _ => Ok(None),
    }
}

async fn set_link_up(handle: &Handle, iface: &Interface) -> Result<()> {
    let msg = LinkMessageBuilder::<LinkUnspec>::new()
        .index(iface.index)
        .up()
        .build();
    handle.link().set(msg).execute().await.map_err(netlink_err)
}

async fn ensure_vlan(
    handle: &Handle,
    ifname: &str,
    parent: &Interface,
    vlan_id: u16,
) -> Result<Interface> {
    if let Some(existing) = get_interface(handle, ifname).await? {
        let mut links = handle
            .link()
            .get()
            .match_index(existing.index)
            .execute();
        let link = links
            .try_next()
            .await
            .map_err(netlink_err)?
            .ok_or_else(|| {
                Error::Netlink(NetlinkError::new(anyhow::anyhow!(
                    "interface {ifname:?} disappeared while checking for reuse"
                )))
            })?;

        // idempotent re-create, but only if it's the same sub-interface
        // we'd have created ourselves (spec.md §4.1: "fails if ifname
        // already exists with a different parent or vlan").
        let matches_parent = link
            .attributes
            .iter()
            .any(|attr| matches!(attr, LinkAttribute::Link(idx) if *idx == parent.index));
        let matches_vlan = link.attributes.iter().any(|attr| {
            matches!(attr, LinkAttribute::LinkInfo(infos) if infos.iter().any(|info| {
                matches!(info, LinkInfo::Data(InfoData::Vlan(ids)) if ids.contains(&InfoVlan::Id(vlan_id)))
            }))
        });
        if matches_parent && matches_vlan {
            return Ok(existing);
        }
        return Err(Error::Netlink(NetlinkError::new(anyhow::anyhow!(
            "interface {ifname:?} already exists with a different parent or vlan"
        ))));
    }

    let msg = LinkMessageBuilder::<LinkUnspec>::new_with_info_kind(InfoKind::Vlan)
        .name(ifname.to_string())
        .set_info_data(InfoData::Vlan(vec![InfoVlan::Id(vlan_id)]))
        .link(parent.index)
        .build();
    handle
        .link()
        .add(msg)
        .execute()
        .await
        .map_err(netlink_err)?;

    get_interface(handle, ifname).await?.ok_or_else(|| {
        Error::Netlink(NetlinkError::new(anyhow::anyhow!(
            "interface {ifname:?} missing immediately after creation"
        )))
    })
}

async fn delete_link(handle: &Handle, iface: &Interface) -> Result<()> {
    match handle.link().del(iface.index).execute().await {
        Ok(()) => Ok(()),
        Err(err) if interface_already_gone(&err) => Ok(()),
        Err(err) => Err(netlink_err(err)),
    }
}

async fn fetch_addresses(handle: &Handle, iface: &Interface) -> Result<Vec<(IpAddr, u8)>> {
    let addrs: Vec<_> = handle
        .address()
        .get()
        .execute()
        .try_collect()
        .await
        .map_err(netlink_err)?;

    Ok(addrs
        .into_iter()
        .filter(|msg| msg.header.index == iface.index)
        .filter_map(|msg| {
            let ip = msg.attributes.iter().find_map(|attr| match attr {
                AddressAttribute::Address(ip) => Some(*ip),
                _ => None,
            })?;
            Some((ip, msg.header.prefix_len))
        })
        .collect())
}

async fn delete_address(
    handle: &Handle,
    iface: &Interface,
    addr: IpAddr,
    prefix_len: u8,
) -> Result<()> {
    let addrs: Vec<_> = handle
        .address()
        .get()
        .execute()
        .try_collect()
        .await
        .map_err(netlink_err)?;

    let Some(msg) = addrs.into_iter().find(|msg| {
        msg.header.index == iface.index
            && msg.header.prefix_len == prefix_len
            && msg
                .attributes
                .iter()
                .any(|attr| matches!(attr, AddressAttribute::Address(ip) if *ip == addr))
    }) else {
        return Ok(());
    };

    handle
        .address()
        .del(msg)
        .execute()
        .await
        .map_err(netlink_err)
}

async fn current_master(handle: &Handle, iface: &Interface) -> Result<Option<u32>> {
    let mut links = handle.link().get().match_index(iface.index).execute();
    let link = match links.try_next().await {
        Ok(Some(msg)) => msg,
        _ => return Ok(None),
    };
    Ok(link.attributes.iter().find_map(|attr| match attr {
        LinkAttribute::Controller(idx) => Some(*idx),
        _ => None,
    }))
}

async fn enslave(handle: &Handle, bridge: &Interface, member: &Interface) -> Result<()> {
    if current_master(handle, member).await? == Some(bridge.index) {
        return Ok(());
    }
    let msg = LinkMessageBuilder::<LinkUnspec>::new()
        .index(member.index)
        .controller(bridge.index)
        .build();
    handle.link().set(msg).execute().await.map_err(netlink_err)
}

#[cfg(any(test, feature = "testing"))]
pub mod fake {
    use std::collections::HashMap;
    use std::net::IpAddr;
    use std::sync::Mutex;

    use super::{Interface, NetlinkPort};
    use crate::error::Result;

    /// In-memory stand-in for the host netns, used by `user`/`challenge`
    /// unit tests so they can assert on the sequence of netlink operations
    /// without root or a live kernel network stack.
    #[derive(Default)]
    pub struct FakeGateway {
        inner: Mutex<State>,
    }

    #[derive(Default)]
    struct State {
        interfaces: HashMap<String, Interface>,
        next_index: u32,
        addresses: HashMap<String, Vec<(IpAddr, u8)>>,
        masters: HashMap<String, String>,
        up: std::collections::HashSet<String>,
    }

    impl FakeGateway {
        pub fn new() -> Self {
            FakeGateway {
                inner: Mutex::new(State {
                    next_index: 100,
                    ..Default::default()
                }),
            }
        }

        pub fn seed_interface(&self, name: &str) -> Interface {
            let mut state = self.inner.lock().unwrap();
            let index = state.next_index;
            state.next_index += 1;
            let iface = Interface {
                name: name.to_string(),
                index,
            };
            state.interfaces.insert(name.to_string(), iface.clone());
            iface
        }

        pub fn seed_addresses(&self, name: &str, addrs: Vec<(IpAddr, u8)>) {
            self.inner
                .lock()
                .unwrap()
                .addresses
                .insert(name.to_string(), addrs);
        }

        pub fn is_up(&self, name: &str) -> bool {
            self.inner.lock().unwrap().up.contains(name)
        }

        pub fn master_of(&self, name: &str) -> Option<String> {
            self.inner.lock().unwrap().masters.get(name).cloned()
        }
    }

    impl NetlinkPort for FakeGateway {
        fn interface(&self, name: &str) -> Result<Option<Interface>> {
            Ok(self.inner.lock().unwrap().interfaces.get(name).cloned())
        }

        fn ensure_up(&self, iface: &Interface) -> Result<()> {
            self.inner.lock().unwrap().up.insert(iface.name.clone());
            Ok(())
        }

        fn create_vlan(
            &self,
            ifname: &str,
            _parent: &Interface,
            _vlan_id: u16,
        ) -> Result<Interface> {
            let mut state = self.inner.lock().unwrap();
            if let Some(existing) = state.interfaces.get(ifname) {
                return Ok(existing.clone());
            }
            let index = state.next_index;
            state.next_index += 1;
            let iface = Interface {
                name: ifname.to_string(),
                index,
            };
            state.interfaces.insert(ifname.to_string(), iface.clone());
            Ok(iface)
        }

        fn remove_interface(&self, iface: &Interface) -> Result<()> {
            let mut state = self.inner.lock().unwrap();
            state.interfaces.remove(&iface.name);
            state.masters.remove(&iface.name);
            state.up.remove(&iface.name);
            Ok(())
        }

        fn list_addresses(&self, iface: &Interface) -> Result<Vec<(IpAddr, u8)>> {
            Ok(self
                .inner
                .lock()
                .unwrap()
                .addresses
                .get(&iface.name)
                .cloned()
                .unwrap_or_default())
        }

        fn remove_address(&self, iface: &Interface, addr: IpAddr, prefix_len: u8) -> Result<()> {
            let mut state = self.inner.lock().unwrap();
            if let Some(addrs) = state.addresses.get_mut(&iface.name) {
                addrs.retain(|(a, p)| !(*a == addr && *p == prefix_len));
            }
            Ok(())
        }

        fn add_port(&self, bridge: &Interface, member: &Interface) -> Result<()> {
            self.inner
                .lock()
                .unwrap()
                .masters
                .insert(member.name.clone(), bridge.name.clone());
            Ok(())
        }

        fn master_of(&self, iface: &Interface) -> Result<Option<u32>> {
            let state = self.inner.lock().unwrap();
            Ok(state
                .masters
                .get(&iface.name)
                .and_then(|master_name| state.interfaces.get(master_name))
                .map(|master| master.index))
        }
    }
}
