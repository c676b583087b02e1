//! UDP discovery on the LAN broadcast address.
//!
//! Workers announce their TLS listener every few seconds and answer master
//! probes; the master turns announcements into connection candidates.
//! Datagrams are unauthenticated JSON (`DiscoveryPacket`).

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

pub mod announce;
pub mod listener;

/// Destination for broadcasts on `port`.
pub fn broadcast_addr(port: u16) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, port))
}

/// A broadcast-capable UDP socket bound to `port` (0 = ephemeral).
///
/// Address and port reuse let a master and workers on the same host share
/// the discovery port.
pub fn make_socket(port: u16) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).context("socket()")?;

    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    socket.set_reuse_port(true).context("SO_REUSEPORT")?;
    socket.set_broadcast(true).context("SO_BROADCAST")?;
    socket.set_nonblocking(true).context("set_nonblocking")?;

    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket.bind(&bind_addr.into()).context("bind()")?;

    UdpSocket::from_std(socket.into()).context("failed to convert to tokio UdpSocket")
}
