use std::cell::{Cell, RefCell};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;

use indexmap::IndexSet;
use libc::{self, c_int};
use log::debug;

use crate::error::{Error, Result};
use crate::reactor::{PollData, Reactor};
use crate::stream::{arm_or_deliver, Dir};
use crate::sys::socket::{self, Socket};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Net {
    Any,
    V4,
    V6,
}

/// One multicast group membership: the group, an optional source filter
/// (source-specific multicast) and an optional interface name. `None`
/// interface means the kernel default for the group's scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Membership {
    pub group: IpAddr,
    pub source: Option<IpAddr>,
    pub interface: Option<String>,
}

enum Op {
    Join,
    Leave,
}

/// A multicast-capable UDP endpoint bound to a reactor.
///
/// Group membership, the outbound interface and TTL are mirrored between
/// this object and the kernel socket options: an operation that fails in the
/// kernel leaves the in-memory state untouched.
///
/// Multicast loopback is forced **off** at construction. This deviates from
/// the BSD socket default (on) so a process never receives its own feed
/// packets unless it asks for them with [`UdpPeer::set_loop`].
pub struct UdpPeer {
    inner: Rc<PeerInner>,
}

struct PeerInner {
    reactor: Reactor,
    socket: Socket,
    pd: Rc<PollData>,
    local_addr: SocketAddr,
    ipv4: bool,
    outbound: RefCell<Option<(String, Ipv4Addr)>>,
    ttl: Cell<u8>,
    mcast_loop: Cell<bool>,
    memberships: RefCell<IndexSet<Membership>>,
    closed: Cell<bool>,
}

impl UdpPeer {
    /// Opens a datagram socket on `network` (`"udp"`, `"udp4"` or `"udp6"`)
    /// bound to `addr`. `addr` may be empty (IPv4 wildcard, ephemeral port),
    /// `":port"`, `"ip:port"` or `"host:port"`.
    pub fn new(reactor: &Reactor, network: &str, addr: &str) -> Result<UdpPeer> {
        let net = parse_network(network)?;
        let bind_addr = resolve(net, addr)?;

        let fam = match bind_addr {
            SocketAddr::V4(..) => libc::AF_INET,
            SocketAddr::V6(..) => libc::AF_INET6,
        };

        let sock = Socket::datagram(fam)?;
        sock.set_reuse_addr(true)?;
        sock.bind(&bind_addr)?;

        let local_addr = sock.local_addr()?;
        let ipv4 = local_addr.is_ipv4();
        let fd = sock.as_raw_fd();

        // Forced defaults: no loopback, link-local TTL.
        if ipv4 {
            set_byte_opt(fd, libc::IPPROTO_IP, libc::IP_MULTICAST_LOOP, 0)?;
            set_byte_opt(fd, libc::IPPROTO_IP, libc::IP_MULTICAST_TTL, 1)?;
        } else {
            socket::setsockopt(fd, libc::IPPROTO_IPV6, libc::IPV6_MULTICAST_LOOP, 0 as c_int)?;
            socket::setsockopt(fd, libc::IPPROTO_IPV6, libc::IPV6_MULTICAST_HOPS, 1 as c_int)?;
        }

        debug!("udp peer bound to {}", local_addr);

        Ok(UdpPeer {
            inner: Rc::new(PeerInner {
                reactor: reactor.clone(),
                pd: Rc::new(PollData::new(fd)),
                socket: sock,
                local_addr,
                ipv4,
                outbound: RefCell::new(None),
                ttl: Cell::new(1),
                mcast_loop: Cell::new(false),
                memberships: RefCell::new(IndexSet::new()),
                closed: Cell::new(false),
            }),
        })
    }

    /// The bound address: a concrete IP and a non-zero port.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Joins `group` (`"ip"` or `"ip:port"`, the port is ignored) on the
    /// kernel's default interface for the group's scope. Idempotent per
    /// (group, source, interface) triple.
    pub fn join(&self, group: &str) -> Result<()> {
        self.update(Op::Join, group, None, None)
    }

    /// Joins `group` filtered to datagrams sent by `source` (SSM).
    pub fn join_source(&self, group: &str, source: &str) -> Result<()> {
        self.update(Op::Join, group, Some(source), None)
    }

    /// Joins `group` on the named interface.
    pub fn join_on(&self, group: &str, interface: &str) -> Result<()> {
        self.update(Op::Join, group, None, Some(interface))
    }

    pub fn join_source_on(&self, group: &str, source: &str, interface: &str) -> Result<()> {
        self.update(Op::Join, group, Some(source), Some(interface))
    }

    /// Leaves a previously joined group; `NotJoined` when no membership
    /// matches the triple.
    pub fn leave(&self, group: &str) -> Result<()> {
        self.update(Op::Leave, group, None, None)
    }

    pub fn leave_source(&self, group: &str, source: &str) -> Result<()> {
        self.update(Op::Leave, group, Some(source), None)
    }

    pub fn leave_on(&self, group: &str, interface: &str) -> Result<()> {
        self.update(Op::Leave, group, None, Some(interface))
    }

    pub fn leave_source_on(&self, group: &str, source: &str, interface: &str) -> Result<()> {
        self.update(Op::Leave, group, Some(source), Some(interface))
    }

    fn update(
        &self,
        op: Op,
        group: &str,
        source: Option<&str>,
        interface: Option<&str>,
    ) -> Result<()> {
        self.ensure_open()?;

        let group_ip = parse_group(group)?;
        if !group_ip.is_multicast() {
            return Err(Error::InvalidGroup(group_ip));
        }

        let source_ip = match source {
            Some(s) => Some(
                s.parse::<IpAddr>()
                    .map_err(|_| Error::Addr(format!("invalid source address {:?}", s)))?,
            ),
            None => None,
        };

        let membership = Membership {
            group: group_ip,
            source: source_ip,
            interface: interface.map(str::to_string),
        };

        match op {
            Op::Join => {
                if self.inner.memberships.borrow().contains(&membership) {
                    return Ok(());
                }

                self.kernel_membership(true, &membership)?;
                debug!("joined {:?}", membership);
                self.inner.memberships.borrow_mut().insert(membership);
            }
            Op::Leave => {
                if !self.inner.memberships.borrow().contains(&membership) {
                    return Err(Error::NotJoined(group_ip));
                }

                self.kernel_membership(false, &membership)?;
                debug!("left {:?}", membership);
                self.inner.memberships.borrow_mut().shift_remove(&membership);
            }
        }

        Ok(())
    }

    /// Mirrors one membership change into the kernel. The in-memory set is
    /// only touched after this succeeds.
    fn kernel_membership(&self, join: bool, m: &Membership) -> Result<()> {
        let fd = self.inner.socket.as_raw_fd();

        match (m.group, m.source) {
            (IpAddr::V4(group), None) => {
                let iface = match &m.interface {
                    Some(name) => interface_ipv4(name)?,
                    None => Ipv4Addr::UNSPECIFIED,
                };
                let mreq = libc::ip_mreq {
                    imr_multiaddr: socket::in_addr(group),
                    imr_interface: socket::in_addr(iface),
                };
                let opt = if join {
                    libc::IP_ADD_MEMBERSHIP
                } else {
                    libc::IP_DROP_MEMBERSHIP
                };
                socket::setsockopt(fd, libc::IPPROTO_IP, opt, mreq)?;
            }
            (IpAddr::V4(group), Some(IpAddr::V4(source))) => {
                self.kernel_source_membership(join, group, source, m.interface.as_deref())?;
            }
            (IpAddr::V6(group), None) => {
                let index = match &m.interface {
                    Some(name) => if_index(name)?,
                    None => 0,
                };
                let mreq = libc::ipv6_mreq {
                    ipv6mr_multiaddr: libc::in6_addr {
                        s6_addr: group.octets(),
                    },
                    ipv6mr_interface: index as _,
                };
                let opt = if join { IPV6_JOIN } else { IPV6_LEAVE };
                socket::setsockopt(fd, libc::IPPROTO_IPV6, opt, mreq)?;
            }
            _ => {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "source-specific multicast requires an IPv4 group and source",
                )))
            }
        }

        Ok(())
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn kernel_source_membership(
        &self,
        join: bool,
        group: Ipv4Addr,
        source: Ipv4Addr,
        interface: Option<&str>,
    ) -> Result<()> {
        let iface = match interface {
            Some(name) => interface_ipv4(name)?,
            None => Ipv4Addr::UNSPECIFIED,
        };
        let mreq = libc::ip_mreq_source {
            imr_multiaddr: socket::in_addr(group),
            imr_interface: socket::in_addr(iface),
            imr_sourceaddr: socket::in_addr(source),
        };
        let opt = if join {
            libc::IP_ADD_SOURCE_MEMBERSHIP
        } else {
            libc::IP_DROP_SOURCE_MEMBERSHIP
        };
        socket::setsockopt(self.inner.socket.as_raw_fd(), libc::IPPROTO_IP, opt, mreq)?;
        Ok(())
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn kernel_source_membership(
        &self,
        _join: bool,
        _group: Ipv4Addr,
        _source: Ipv4Addr,
        _interface: Option<&str>,
    ) -> Result<()> {
        Err(Error::Io(io::Error::new(
            io::ErrorKind::Unsupported,
            "source-specific multicast is not supported on this platform",
        )))
    }

    /// Selects the interface used for outgoing IPv4 multicast.
    ///
    /// Both `IP_MULTICAST_IF` encodings are written (`in_addr` and
    /// `ip_mreqn`) because kernels differ in which one they expose to
    /// readback; see the helpers in [`ipv4`].
    pub fn set_outbound_ipv4(&self, interface: &str) -> Result<()> {
        self.ensure_open()?;

        let addr = interface_ipv4(interface)?;
        let fd = self.inner.socket.as_raw_fd();

        socket::setsockopt(
            fd,
            libc::IPPROTO_IP,
            libc::IP_MULTICAST_IF,
            socket::in_addr(addr),
        )?;

        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            let index = if_index(interface)?;
            let mreqn = libc::ip_mreqn {
                imr_multiaddr: socket::in_addr(Ipv4Addr::UNSPECIFIED),
                imr_address: socket::in_addr(addr),
                imr_ifindex: index as c_int,
            };
            socket::setsockopt(fd, libc::IPPROTO_IP, libc::IP_MULTICAST_IF, mreqn)?;
        }

        debug!("outbound interface set to {} ({})", interface, addr);
        *self.inner.outbound.borrow_mut() = Some((interface.to_string(), addr));
        Ok(())
    }

    /// The explicitly configured outbound interface, if any.
    pub fn outbound(&self) -> Option<(String, Ipv4Addr)> {
        self.inner.outbound.borrow().clone()
    }

    /// Multicast TTL (hop limit on IPv6 sockets). Defaults to 1.
    pub fn set_ttl(&self, ttl: u8) -> Result<()> {
        self.ensure_open()?;

        let fd = self.inner.socket.as_raw_fd();
        if self.inner.ipv4 {
            set_byte_opt(fd, libc::IPPROTO_IP, libc::IP_MULTICAST_TTL, ttl)?;
        } else {
            socket::setsockopt(
                fd,
                libc::IPPROTO_IPV6,
                libc::IPV6_MULTICAST_HOPS,
                ttl as c_int,
            )?;
        }

        self.inner.ttl.set(ttl);
        Ok(())
    }

    pub fn ttl(&self) -> u8 {
        self.inner.ttl.get()
    }

    /// Whether the host loops sent multicast back to local receivers.
    pub fn set_loop(&self, enabled: bool) -> Result<()> {
        self.ensure_open()?;

        let fd = self.inner.socket.as_raw_fd();
        if self.inner.ipv4 {
            set_byte_opt(fd, libc::IPPROTO_IP, libc::IP_MULTICAST_LOOP, enabled as u8)?;
        } else {
            socket::setsockopt(
                fd,
                libc::IPPROTO_IPV6,
                libc::IPV6_MULTICAST_LOOP,
                enabled as c_int,
            )?;
        }

        self.inner.mcast_loop.set(enabled);
        Ok(())
    }

    pub fn multicast_loop(&self) -> bool {
        self.inner.mcast_loop.get()
    }

    /// Current memberships, in join order.
    pub fn memberships(&self) -> Vec<Membership> {
        self.inner.memberships.borrow().iter().cloned().collect()
    }

    pub fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        self.ensure_open()?;
        self.inner.socket.recv_from(buf).map_err(Error::from_io)
    }

    pub fn send_to(&self, buf: &[u8], addr: &SocketAddr) -> Result<usize> {
        self.ensure_open()?;
        self.inner.socket.send_to(buf, addr).map_err(Error::from_io)
    }

    /// Receives one datagram when the socket is ready; the buffer travels
    /// through the callback, which runs on the reactor thread.
    pub fn async_recv_from(
        &self,
        mut buf: Vec<u8>,
        cb: impl FnOnce(Result<(usize, SocketAddr)>, Vec<u8>) + 'static,
    ) {
        match self.recv_from(&mut buf) {
            Err(Error::WouldBlock) => {
                let peer = self.clone();
                arm_or_deliver(
                    &self.inner.reactor,
                    &self.inner.pd,
                    Dir::Read,
                    Box::new(move |res| match res {
                        Ok(()) => peer.async_recv_from(buf, cb),
                        Err(err) => cb(Err(err), buf),
                    }),
                );
            }
            res => cb(res, buf),
        }
    }

    /// Sends one datagram when the socket is ready.
    pub fn async_send_to(
        &self,
        buf: Vec<u8>,
        addr: SocketAddr,
        cb: impl FnOnce(Result<usize>, Vec<u8>) + 'static,
    ) {
        match self.send_to(&buf, &addr) {
            Err(Error::WouldBlock) => {
                let peer = self.clone();
                arm_or_deliver(
                    &self.inner.reactor,
                    &self.inner.pd,
                    Dir::Write,
                    Box::new(move |res| match res {
                        Ok(()) => peer.async_send_to(buf, addr, cb),
                        Err(err) => cb(Err(err), buf),
                    }),
                );
            }
            res => cb(res, buf),
        }
    }

    /// The raw socket, for library-level introspection.
    pub fn next_layer(&self) -> &Socket {
        &self.inner.socket
    }

    /// Leaves every group in join order, cancels armed operations and closes
    /// the endpoint. Later calls fail with `Closed`.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.replace(true) {
            return Err(Error::Closed);
        }

        let memberships: Vec<Membership> =
            self.inner.memberships.borrow_mut().drain(..).collect();
        for m in &memberships {
            let _ = self.kernel_membership(false, m);
        }

        self.inner.reactor.deregister(&self.inner.pd);
        debug!("udp peer {} closed", self.inner.local_addr);
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.get() {
            return Err(Error::Closed);
        }
        Ok(())
    }
}

impl Clone for UdpPeer {
    fn clone(&self) -> UdpPeer {
        UdpPeer {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl AsRawFd for UdpPeer {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.socket.as_raw_fd()
    }
}

impl Drop for PeerInner {
    fn drop(&mut self) {
        if !self.closed.get() {
            self.reactor.deregister(&self.pd);
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
const IPV6_JOIN: c_int = libc::IPV6_ADD_MEMBERSHIP;
#[cfg(any(target_os = "linux", target_os = "android"))]
const IPV6_LEAVE: c_int = libc::IPV6_DROP_MEMBERSHIP;

#[cfg(not(any(target_os = "linux", target_os = "android")))]
const IPV6_JOIN: c_int = libc::IPV6_JOIN_GROUP;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const IPV6_LEAVE: c_int = libc::IPV6_LEAVE_GROUP;

/// IP_MULTICAST_TTL and IP_MULTICAST_LOOP take an int on Linux and a byte on
/// the BSDs.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn set_byte_opt(fd: RawFd, level: c_int, opt: c_int, val: u8) -> io::Result<()> {
    socket::setsockopt(fd, level, opt, val as c_int)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn set_byte_opt(fd: RawFd, level: c_int, opt: c_int, val: u8) -> io::Result<()> {
    socket::setsockopt(fd, level, opt, val)
}

fn parse_network(network: &str) -> Result<Net> {
    match network {
        "udp" => Ok(Net::Any),
        "udp4" => Ok(Net::V4),
        "udp6" => Ok(Net::V6),
        other => Err(Error::Addr(format!("unknown network {:?}", other))),
    }
}

fn resolve(net: Net, addr: &str) -> Result<SocketAddr> {
    if addr.is_empty() {
        return Ok(match net {
            Net::V6 => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
            _ => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        });
    }

    let with_host;
    let spec = if addr.starts_with(':') {
        with_host = match net {
            Net::V6 => format!("[::]{}", addr),
            _ => format!("0.0.0.0{}", addr),
        };
        with_host.as_str()
    } else {
        addr
    };

    let candidates: Vec<SocketAddr> = spec
        .to_socket_addrs()
        .map_err(|err| Error::Addr(format!("{}: {}", addr, err)))?
        .collect();

    let picked = match net {
        Net::V4 => candidates.iter().find(|a| a.is_ipv4()),
        Net::V6 => candidates.iter().find(|a| a.is_ipv6()),
        Net::Any => candidates
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| candidates.first()),
    };

    picked
        .copied()
        .ok_or_else(|| Error::Addr(format!("no matching address family for {:?}", addr)))
}

/// Accepts `"ip"` or `"ip:port"`; the port, when present, is ignored.
fn parse_group(group: &str) -> Result<IpAddr> {
    if let Ok(ip) = group.parse::<IpAddr>() {
        return Ok(ip);
    }
    if let Ok(sa) = group.parse::<SocketAddr>() {
        return Ok(sa.ip());
    }
    Err(Error::Addr(format!("invalid group address {:?}", group)))
}

/// The first IPv4 address assigned to the named interface.
pub(crate) fn interface_ipv4(name: &str) -> Result<Ipv4Addr> {
    use std::ffi::CStr;
    use std::ptr;

    let mut addrs: *mut libc::ifaddrs = ptr::null_mut();
    syscall!(getifaddrs(&mut addrs))?;

    let mut found = None;
    let mut cur = addrs;
    while !cur.is_null() {
        unsafe {
            let ifa = &*cur;
            if !ifa.ifa_name.is_null() && !ifa.ifa_addr.is_null() {
                let ifname = CStr::from_ptr(ifa.ifa_name);
                if ifname.to_bytes() == name.as_bytes()
                    && (*ifa.ifa_addr).sa_family as c_int == libc::AF_INET
                {
                    let sin = &*(ifa.ifa_addr as *const libc::sockaddr_in);
                    found = Some(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)));
                }
            }
            cur = ifa.ifa_next;
        }

        if found.is_some() {
            break;
        }
    }

    unsafe { libc::freeifaddrs(addrs) };

    found.ok_or_else(|| Error::Addr(format!("no IPv4 address on interface {:?}", name)))
}

pub(crate) fn if_index(name: &str) -> Result<u32> {
    use std::ffi::CString;

    let cname = CString::new(name).map_err(|_| Error::Addr(format!("bad interface name {:?}", name)))?;
    let index = unsafe { libc::if_nametoindex(cname.as_ptr()) };
    if index == 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    Ok(index)
}

/// Readback helpers for the IPv4 multicast socket options.
///
/// `IP_MULTICAST_IF` has two wire encodings and kernels differ in which one
/// they report, so the outbound interface is readable three ways: as a bare
/// `in_addr`, as the full `ip_mreqn`, and as an interface index.
pub mod ipv4 {
    use super::*;

    /// The configured outbound interface as an address; unspecified
    /// (`0.0.0.0`) when the kernel default is in effect.
    pub fn multicast_interface(socket: &Socket) -> io::Result<Ipv4Addr> {
        let raw: libc::in_addr = socket::getsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_IP,
            libc::IP_MULTICAST_IF,
        )?;
        Ok(Ipv4Addr::from(u32::from_be(raw.s_addr)))
    }

    /// The `ip_mreqn` form: (interface address, group address, interface
    /// index). On kernels that only expose the `in_addr` form, the address
    /// is reported and the index is 0.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    pub fn multicast_interface_mreqn(socket: &Socket) -> io::Result<(Ipv4Addr, Ipv4Addr, i32)> {
        let (mreqn, len): (libc::ip_mreqn, usize) = socket::getsockopt_len(
            socket.as_raw_fd(),
            libc::IPPROTO_IP,
            libc::IP_MULTICAST_IF,
        )?;

        if len < std::mem::size_of::<libc::ip_mreqn>() {
            // Only an in_addr came back; it lands in the first field.
            let addr = Ipv4Addr::from(u32::from_be(mreqn.imr_multiaddr.s_addr));
            return Ok((addr, Ipv4Addr::UNSPECIFIED, 0));
        }

        Ok((
            Ipv4Addr::from(u32::from_be(mreqn.imr_address.s_addr)),
            Ipv4Addr::from(u32::from_be(mreqn.imr_multiaddr.s_addr)),
            mreqn.imr_ifindex,
        ))
    }

    /// The outbound interface index, 0 when the kernel reports the address
    /// form only.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    pub fn multicast_interface_index(socket: &Socket) -> io::Result<i32> {
        multicast_interface_mreqn(socket).map(|(_, _, index)| index)
    }

    pub fn multicast_ttl(socket: &Socket) -> io::Result<u8> {
        get_byte_opt(socket.as_raw_fd(), libc::IPPROTO_IP, libc::IP_MULTICAST_TTL)
    }

    pub fn multicast_loop(socket: &Socket) -> io::Result<bool> {
        get_byte_opt(
            socket.as_raw_fd(),
            libc::IPPROTO_IP,
            libc::IP_MULTICAST_LOOP,
        )
        .map(|v| v != 0)
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn get_byte_opt(fd: RawFd, level: c_int, opt: c_int) -> io::Result<u8> {
        let raw: c_int = socket::getsockopt(fd, level, opt)?;
        Ok(raw as u8)
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn get_byte_opt(fd: RawFd, level: c_int, opt: c_int) -> io::Result<u8> {
        socket::getsockopt(fd, level, opt)
    }
}
