use std::path::PathBuf;
use std::sync::Arc;

use naumachia::container::fake::FakeGateway as FakeContainers;
use naumachia::netlink::fake::FakeGateway as FakeNetlink;
use naumachia::{Error, Manager};

fn setup() -> (Manager, Arc<FakeNetlink>, Arc<FakeContainers>) {
    let netlink = Arc::new(FakeNetlink::new());
    let containers = Arc::new(FakeContainers::new());
    netlink.seed_interface("host0");
    let manager = Manager::new(netlink.clone(), containers.clone());
    (manager, netlink, containers)
}

/// Walks spec.md's scenario 1-3 end to end through the public Manager API:
/// register, connect twice (same vlan, cluster boots once), then drain.
#[test]
fn register_connect_reconnect_and_drain() {
    let (manager, netlink, containers) = setup();
    manager
        .register_challenge("example", "host0", vec![PathBuf::from("ex.yml")])
        .unwrap();
    containers.seed_network("mfrgg_example", "abcdef012345");
    netlink.seed_interface("br-abcdef012345");

    let vlan = manager
        .connect_user("example", "MFRGG", "10.8.0.2", 49152)
        .unwrap();
    assert!((10..=4000).contains(&vlan));

    let vlan_again = manager
        .connect_user("example", "MFRGG", "10.8.0.2", 49153)
        .unwrap();
    assert_eq!(vlan, vlan_again);
    assert_eq!(containers.up_calls(), 1, "cluster must boot only once");

    manager
        .disconnect_user("example", "MFRGG", "10.8.0.2", 49153)
        .unwrap();
    assert_eq!(containers.down_calls(), 0, "cluster stays up with one connection left");

    manager
        .disconnect_user("example", "MFRGG", "10.8.0.2", 49152)
        .unwrap();
    assert_eq!(containers.down_calls(), 1);
}

#[test]
fn connecting_through_an_unregistered_challenge_is_an_error() {
    let (manager, _netlink, _containers) = setup();
    let err = manager
        .connect_user("nope", "MFRGG", "10.8.0.2", 49152)
        .unwrap_err();
    assert!(matches!(err, Error::UnknownChallenge(name) if name == "nope"));
}

#[test]
fn manager_stop_drains_every_registered_challenge() {
    let (manager, netlink, containers) = setup();
    manager
        .register_challenge("example", "host0", vec![PathBuf::from("ex.yml")])
        .unwrap();
    containers.seed_network("mfrgg_example", "abcdef012345");
    netlink.seed_interface("br-abcdef012345");

    manager
        .connect_user("example", "MFRGG", "10.8.0.2", 49152)
        .unwrap();
    assert_eq!(containers.up_calls(), 1);

    manager.stop();
    assert_eq!(containers.down_calls(), 1, "shutdown must tear down live clusters");
}
