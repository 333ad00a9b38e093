//! The network seen by a [`Host`](crate::Host): a datagram transport and
//! the state of one interface.
//!
//! [MulticastSocket] and [SystemNetIf] implement them on top of the OS.

#[cfg(feature = "logging")]
use crate::log::{debug, trace};
use crate::{
    dns_parser::MAX_MSG_ABSOLUTE,
    error::{e_fmt, Error, Result},
};
use if_addrs::{IfAddr, Interface};
use mio::{net::UdpSocket as MioUdpSocket, Events, Interest, Poll, Token};
use socket2::Socket;
use std::{
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, UdpSocket},
    time::Duration,
};

/// The mDNS port.
pub const MDNS_PORT: u16 = 5353;
pub const GROUP_ADDR_V4: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
pub const GROUP_ADDR_V6: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0xfb);

const TOKEN_V4: Token = Token(0);
const TOKEN_V6: Token = Token(1);

/// Sends and receives finished DNS datagrams.
pub trait Transport {
    /// Sends `packet` to the mDNS multicast group.
    fn send_multicast(&mut self, packet: &[u8]) -> Result<()>;

    /// Sends `packet` to a single address.
    fn send_unicast(&mut self, packet: &[u8], addr: SocketAddr) -> Result<()>;

    /// Reads the next pending datagram into `buf`.
    ///
    /// Returns `Ok(None)` if nothing is pending.
    fn recv(&mut self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>>;
}

/// A snapshot of a network interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NetIfState {
    pub up: bool,
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
}

/// Reports the state of the interface a host is attached to.
pub trait NetIf {
    fn state(&mut self) -> NetIfState;
}

/// Returns valid network interfaces in the host system.
/// Loopback interfaces are excluded.
pub fn my_ip_interfaces() -> Vec<Interface> {
    if_addrs::get_if_addrs()
        .unwrap_or_default()
        .into_iter()
        .filter(|i| !i.is_loopback())
        .collect()
}

/// [NetIf] backed by the interface list of the OS.
#[derive(Debug, Clone)]
pub struct SystemNetIf {
    name: String,
}

impl SystemNetIf {
    /// Watches the interface `name`, e.g. "eth0".
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }

    /// Picks the first non-loopback interface with an IPv4 address.
    pub fn first() -> Result<Self> {
        my_ip_interfaces()
            .into_iter()
            .find(|i| matches!(i.addr, IfAddr::V4(_)))
            .map(|i| Self::new(&i.name))
            .ok_or_else(|| e_fmt!("no IPv4 interface found"))
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl NetIf for SystemNetIf {
    fn state(&mut self) -> NetIfState {
        let mut state = NetIfState::default();
        for intf in my_ip_interfaces().iter().filter(|i| i.name == self.name) {
            state.up = true;
            match intf.ip() {
                IpAddr::V4(ip) if state.ipv4.is_none() => state.ipv4 = Some(ip),
                IpAddr::V6(ip) if state.ipv6.is_none() => state.ipv6 = Some(ip),
                _ => {}
            }
        }
        state
    }
}

/// Non-blocking multicast UDP sockets of one interface, IPv4 and optionally IPv6.
pub struct MulticastSocket {
    v4: MioUdpSocket,
    v6: Option<MioUdpSocket>,
    intf_index: u32,
    poll: Poll,
    events: Events,
}

impl MulticastSocket {
    /// Opens the sockets for the interface `name`.
    ///
    /// IPv6 is used only if the interface has an IPv6 address and the socket can be set up.
    pub fn new(name: &str) -> Result<Self> {
        let intfs: Vec<Interface> = my_ip_interfaces()
            .into_iter()
            .filter(|i| i.name == name)
            .collect();

        let ipv4 = intfs
            .iter()
            .find_map(|i| match i.ip() {
                IpAddr::V4(ip) => Some(ip),
                IpAddr::V6(_) => None,
            })
            .ok_or_else(|| e_fmt!("interface {} has no IPv4 address", name))?;
        let intf_index = intfs.iter().find_map(|i| i.index).unwrap_or(0);

        let mut v4 = new_socket_v4(ipv4)?;
        let mut v6 = if intfs.iter().any(|i| i.ip().is_ipv6()) {
            match new_socket_v6(intf_index) {
                Ok(sock) => Some(sock),
                Err(e) => {
                    debug!("IPv6 disabled on {}: {}", name, e);
                    None
                }
            }
        } else {
            None
        };

        let poll = Poll::new().map_err(|e| e_fmt!("create Poll: {}", e))?;
        poll.registry()
            .register(&mut v4, TOKEN_V4, Interest::READABLE)
            .map_err(|e| e_fmt!("register socket: {}", e))?;
        if let Some(sock) = v6.as_mut() {
            poll.registry()
                .register(sock, TOKEN_V6, Interest::READABLE)
                .map_err(|e| e_fmt!("register socket: {}", e))?;
        }

        Ok(Self {
            v4,
            v6,
            intf_index,
            poll,
            events: Events::with_capacity(16),
        })
    }

    /// Blocks until a datagram is pending or `timeout` passed.
    ///
    /// Pass the time until the next deadline of the host, see
    /// [`Host::next_deadline`](crate::Host::next_deadline).
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.events.clear();
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(()),
            Err(e) => Err(e_fmt!("poll failed: {}", e)),
        }
    }
}

impl Transport for MulticastSocket {
    fn send_multicast(&mut self, packet: &[u8]) -> Result<()> {
        let addr = SocketAddrV4::new(GROUP_ADDR_V4, MDNS_PORT).into();
        send_packet(&self.v4, packet, addr)?;

        if let Some(sock) = &self.v6 {
            let mut addr = SocketAddrV6::new(GROUP_ADDR_V6, MDNS_PORT, 0, 0);
            addr.set_scope_id(self.intf_index); // Choose iface for multicast
            send_packet(sock, packet, addr.into())?;
        }
        Ok(())
    }

    fn send_unicast(&mut self, packet: &[u8], addr: SocketAddr) -> Result<()> {
        match (addr, &self.v6) {
            (SocketAddr::V6(_), Some(sock)) => send_packet(sock, packet, addr),
            (SocketAddr::V6(_), None) => Err(e_fmt!("no IPv6 socket to send to {}", addr)),
            (SocketAddr::V4(_), _) => send_packet(&self.v4, packet, addr),
        }
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>> {
        if let Some(received) = recv_packet(&self.v4, buf)? {
            return Ok(Some(received));
        }
        match &self.v6 {
            Some(sock) => recv_packet(sock, buf),
            None => Ok(None),
        }
    }
}

fn send_packet(sock: &MioUdpSocket, packet: &[u8], addr: SocketAddr) -> Result<()> {
    if packet.len() > MAX_MSG_ABSOLUTE {
        return Err(e_fmt!("Drop over-sized packet ({})", packet.len()));
    }
    match sock.send_to(packet, addr) {
        Ok(sz) => {
            trace!("sent out {} bytes to {}", sz, addr);
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(Error::Again),
        Err(e) => Err(e_fmt!("Failed to send to {}: {}", addr, e)),
    }
}

fn recv_packet(sock: &MioUdpSocket, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>> {
    match sock.recv_from(buf) {
        Ok((sz, src)) => Ok(Some((sz, src))),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
        Err(e) => Err(e_fmt!("recv_from failed: {}", e)),
    }
}

/// Creates the IPv4 socket that joins the mDNS group on the interface of `ip`.
fn new_socket_v4(ip: Ipv4Addr) -> Result<MioUdpSocket> {
    // Use the same socket for receiving and sending multicast packets.
    // Such socket has to bind to INADDR_ANY.
    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, MDNS_PORT);
    let sock = new_socket(addr.into())?;

    // Join mDNS group to receive packets.
    sock.join_multicast_v4(&GROUP_ADDR_V4, &ip)
        .map_err(|e| e_fmt!("join multicast group on addr {}: {}", ip, e))?;

    // Set IP_MULTICAST_IF to send packets.
    sock.set_multicast_if_v4(&ip)
        .map_err(|e| e_fmt!("set multicast_if on addr {}: {}", ip, e))?;

    // RFC 6762 section 11: multicast packets carry an IP TTL of 255.
    sock.set_multicast_ttl_v4(255)
        .map_err(|e| e_fmt!("set multicast ttl on addr {}: {}", ip, e))?;

    Ok(MioUdpSocket::from_std(UdpSocket::from(sock)))
}

fn new_socket_v6(intf_index: u32) -> Result<MioUdpSocket> {
    let addr = SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, MDNS_PORT, 0, 0);
    let sock = new_socket(addr.into())?;

    // Join mDNS group to receive packets.
    sock.join_multicast_v6(&GROUP_ADDR_V6, intf_index)
        .map_err(|e| e_fmt!("join multicast group on intf {}: {}", intf_index, e))?;

    // Set IPV6_MULTICAST_IF to send packets.
    sock.set_multicast_if_v6(intf_index)
        .map_err(|e| e_fmt!("set multicast_if on intf {}: {}", intf_index, e))?;

    Ok(MioUdpSocket::from_std(UdpSocket::from(sock)))
}

/// Creates a new non-blocking UDP socket to bind to `addr` with REUSEPORT option.
fn new_socket(addr: SocketAddr) -> Result<Socket> {
    let domain = match addr {
        SocketAddr::V4(_) => socket2::Domain::IPV4,
        SocketAddr::V6(_) => socket2::Domain::IPV6,
    };

    let fd = Socket::new(domain, socket2::Type::DGRAM, None)
        .map_err(|e| e_fmt!("create socket failed: {}", e))?;

    fd.set_reuse_address(true)
        .map_err(|e| e_fmt!("set ReuseAddr failed: {}", e))?;
    #[cfg(unix)] // this is currently restricted to Unix's in socket2
    fd.set_reuse_port(true)
        .map_err(|e| e_fmt!("set ReusePort failed: {}", e))?;

    fd.set_nonblocking(true)
        .map_err(|e| e_fmt!("set O_NONBLOCK: {}", e))?;

    fd.bind(&addr.into())
        .map_err(|e| e_fmt!("socket bind to {} failed: {}", &addr, e))?;

    trace!("new socket bind to {}", &addr);
    Ok(fd)
}
