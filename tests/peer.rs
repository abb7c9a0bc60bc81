use std::cell::RefCell;
use std::net::{IpAddr, Ipv4Addr};
use std::rc::Rc;
use std::time::{Duration, Instant};

use pulse_io::net::multicast::{ipv4, UdpPeer};
use pulse_io::{Error, Reactor};

// Listing multicast group memberships: netstat -gsv

#[test]
fn addresses() {
    let reactor = Reactor::new().unwrap();

    // Missing port.
    assert!(UdpPeer::new(&reactor, "udp", "0.0.0.0").is_err());
    assert!(UdpPeer::new(&reactor, "udp4", "0.0.0.0").is_err());

    // Unknown network.
    assert!(UdpPeer::new(&reactor, "tcp", "").is_err());

    for network in ["udp", "udp4"] {
        for addr in ["", ":0"] {
            let peer = UdpPeer::new(&reactor, network, addr).unwrap();

            let local = peer.local_addr();
            assert_eq!(local.ip(), IpAddr::V4(Ipv4Addr::UNSPECIFIED));
            assert_ne!(local.port(), 0);
            assert!(peer.outbound().is_none());

            peer.close().unwrap();
        }

        for addr in ["127.0.0.1:0", "localhost:0"] {
            let peer = UdpPeer::new(&reactor, network, addr).unwrap();

            let local = peer.local_addr();
            assert_eq!(local.ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
            assert_ne!(local.port(), 0);
            assert!(peer.outbound().is_none());

            peer.close().unwrap();
        }
    }
}

#[test]
fn join_invalid_group() {
    let reactor = Reactor::new().unwrap();
    let peer = UdpPeer::new(&reactor, "udp", "").unwrap();

    let res = peer.join("0.0.0.0:4555");
    assert!(matches!(res, Err(Error::InvalidGroup(_))));

    // Peer state is untouched by the failed join.
    assert!(peer.memberships().is_empty());
    assert!(peer.outbound().is_none());
}

#[test]
fn join_uses_the_unspecified_interface_by_default() {
    let reactor = Reactor::new().unwrap();
    let peer = UdpPeer::new(&reactor, "udp", "").unwrap();

    peer.join("224.0.0.1").unwrap();

    let membership = &peer.memberships()[0];
    assert_eq!(membership.group, "224.0.0.1".parse::<IpAddr>().unwrap());
    assert!(membership.interface.is_none());

    let addr = ipv4::multicast_interface(peer.next_layer()).unwrap();
    assert!(addr.is_unspecified());
}

#[test]
fn join_is_idempotent_leave_is_not() {
    let reactor = Reactor::new().unwrap();
    let peer = UdpPeer::new(&reactor, "udp", "").unwrap();

    peer.join("224.0.0.1").unwrap();
    peer.join("224.0.0.1").unwrap();
    assert_eq!(peer.memberships().len(), 1);

    peer.leave("224.0.0.1").unwrap();
    assert!(peer.memberships().is_empty());

    let res = peer.leave("224.0.0.1");
    assert!(matches!(res, Err(Error::NotJoined(_))));
}

#[test]
fn loopback_defaults_off_and_follows_set_loop() {
    let reactor = Reactor::new().unwrap();
    let peer = UdpPeer::new(&reactor, "udp", "localhost:0").unwrap();

    // Forced off at construction, deviating from the BSD default.
    assert!(!peer.multicast_loop());
    assert!(!ipv4::multicast_loop(peer.next_layer()).unwrap());

    peer.set_loop(false).unwrap();
    assert!(!peer.multicast_loop());

    peer.set_loop(true).unwrap();
    assert!(peer.multicast_loop());
    assert!(ipv4::multicast_loop(peer.next_layer()).unwrap());

    peer.set_loop(false).unwrap();
    assert!(!peer.multicast_loop());
    assert!(!ipv4::multicast_loop(peer.next_layer()).unwrap());
}

#[test]
fn ttl_defaults_to_one() {
    let reactor = Reactor::new().unwrap();
    let peer = UdpPeer::new(&reactor, "udp", "").unwrap();

    assert_eq!(peer.ttl(), 1);
    assert_eq!(ipv4::multicast_ttl(peer.next_layer()).unwrap(), peer.ttl());

    peer.set_ttl(32).unwrap();
    assert_eq!(peer.ttl(), 32);
    assert_eq!(ipv4::multicast_ttl(peer.next_layer()).unwrap(), 32);
}

#[cfg(target_os = "linux")]
#[test]
fn outbound_interface_readback() {
    let reactor = Reactor::new().unwrap();
    let peer = UdpPeer::new(&reactor, "udp", "").unwrap();

    // Unset: all three readbacks report the kernel default.
    let addr = ipv4::multicast_interface(peer.next_layer()).unwrap();
    assert!(addr.is_unspecified());

    peer.set_outbound_ipv4("lo").unwrap();

    let (name, ip) = peer.outbound().unwrap();
    assert_eq!(name, "lo");
    assert_eq!(ip, Ipv4Addr::LOCALHOST);

    let addr = ipv4::multicast_interface(peer.next_layer()).unwrap();
    assert_eq!(addr, Ipv4Addr::LOCALHOST);

    let (iface_addr, _group, index) =
        ipv4::multicast_interface_mreqn(peer.next_layer()).unwrap();
    let by_index = ipv4::multicast_interface_index(peer.next_layer()).unwrap();
    assert_eq!(index, by_index);

    // Kernels answer through one encoding or the other.
    assert!(iface_addr == Ipv4Addr::LOCALHOST || index > 0);
}

#[test]
fn unknown_interface_is_rejected() {
    let reactor = Reactor::new().unwrap();
    let peer = UdpPeer::new(&reactor, "udp", "").unwrap();

    assert!(peer.set_outbound_ipv4("no-such-interface0").is_err());
    assert!(peer.outbound().is_none());
}

#[test]
fn close_drops_memberships_and_refuses_work() {
    let reactor = Reactor::new().unwrap();
    let peer = UdpPeer::new(&reactor, "udp", "").unwrap();

    peer.join("224.0.0.1").unwrap();
    peer.join("224.0.0.2").unwrap();

    peer.close().unwrap();

    assert!(peer.memberships().is_empty());
    assert!(matches!(peer.close(), Err(Error::Closed)));
    assert!(matches!(peer.join("224.0.0.1"), Err(Error::Closed)));
    assert!(matches!(peer.set_ttl(2), Err(Error::Closed)));
}

#[test]
fn datagrams_flow_between_peers() {
    let reactor = Reactor::new().unwrap();

    let a = UdpPeer::new(&reactor, "udp", "127.0.0.1:0").unwrap();
    let b = UdpPeer::new(&reactor, "udp", "127.0.0.1:0").unwrap();

    let got = Rc::new(RefCell::new(None));
    let tx = Rc::clone(&got);
    b.async_recv_from(vec![0u8; 64], move |res, buf| {
        let (n, from) = res.unwrap();
        *tx.borrow_mut() = Some((buf[..n].to_vec(), from));
    });

    let n = a.send_to(b"ping", &b.local_addr()).unwrap();
    assert_eq!(n, 4);

    let deadline = Instant::now() + Duration::from_secs(5);
    while got.borrow().is_none() {
        assert!(Instant::now() < deadline, "no datagram within 5s");
        match reactor.run_one_for(Duration::from_millis(100)) {
            Ok(()) | Err(Error::Timeout) => {}
            Err(err) => panic!("reactor error: {}", err),
        }
    }

    let (payload, from) = got.borrow_mut().take().unwrap();
    assert_eq!(payload, b"ping");
    assert_eq!(from, a.local_addr());
    assert_eq!(reactor.pending(), 0);
}
