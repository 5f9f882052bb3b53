//! Multicast endpoint: one UDP socket bound to and joined on a group.
//!
//! Built on `socket2` for the setsockopt-level tuning, then handed to
//! tokio via `UdpSocket::from_std` so the dataplane pumps in
//! `relay.rs` can await readiness instead of spinning.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use crate::error::BridgeError;

const SEND_RECV_BUFFER_BYTES: usize = 1024 * 1024;
const MULTICAST_TTL: u32 = 10;

pub struct MulticastEndpoint {
    socket: UdpSocket,
    group: Ipv4Addr,
    port: u16,
}

fn build_joined_socket(group: Ipv4Addr, port: u16) -> Result<Socket, BridgeError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(|source| {
        BridgeError::MulticastJoin {
            group,
            port,
            source,
        }
    })?;

    socket
        .set_reuse_address(true)
        .map_err(|source| BridgeError::MulticastJoin {
            group,
            port,
            source,
        })?;
    socket
        .set_send_buffer_size(SEND_RECV_BUFFER_BYTES)
        .map_err(|source| BridgeError::MulticastJoin {
            group,
            port,
            source,
        })?;
    socket
        .set_recv_buffer_size(SEND_RECV_BUFFER_BYTES)
        .map_err(|source| BridgeError::MulticastJoin {
            group,
            port,
            source,
        })?;

    let bind_addr: SocketAddr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into();
    socket
        .bind(&bind_addr.into())
        .map_err(|source| BridgeError::MulticastJoin {
            group,
            port,
            source,
        })?;

    socket
        .join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)
        .map_err(|source| BridgeError::MulticastJoin {
            group,
            port,
            source,
        })?;

    socket
        .set_multicast_ttl_v4(MULTICAST_TTL)
        .map_err(|source| BridgeError::MulticastJoin {
            group,
            port,
            source,
        })?;

    socket
        .set_nonblocking(true)
        .map_err(|source| BridgeError::MulticastJoin {
            group,
            port,
            source,
        })?;

    Ok(socket)
}

impl MulticastEndpoint {
    pub fn create(group: Ipv4Addr, port: u16) -> Result<MulticastEndpoint, BridgeError> {
        let socket = build_joined_socket(group, port)?;
        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket).map_err(|source| BridgeError::MulticastJoin {
            group,
            port,
            source,
        })?;

        tracing::info!(%group, port, "multicast endpoint joined");
        Ok(MulticastEndpoint {
            socket,
            group,
            port,
        })
    }

    pub async fn send(&self, bytes: &[u8]) -> std::io::Result<usize> {
        self.socket.send_to(bytes, (self.group, self.port)).await
    }

    pub async fn recv(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }

    /// Non-blocking attempt, used by the relay's inner batch-drain loop
    /// which must stop on `WouldBlock` rather than suspend.
    pub fn try_recv(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        self.socket.try_recv_from(buf)
    }

    pub fn group(&self) -> Ipv4Addr {
        self.group
    }
}

impl Drop for MulticastEndpoint {
    fn drop(&mut self) {
        if let Err(e) = self.socket.leave_multicast_v4(&self.group, &Ipv4Addr::UNSPECIFIED) {
            tracing::warn!(group = %self.group, port = self.port, error = %e, "failed to drop multicast membership on close");
        }
        tracing::info!(group = %self.group, port = self.port, "multicast endpoint closing");
    }
}

/// Learn the address the kernel would pick as our outbound source IP
/// by connecting a throwaway UDP socket to a public address: the
/// standard technique for self-loop filtering.
pub fn local_outbound_ip() -> std::io::Result<Ipv4Addr> {
    let probe = std::net::UdpSocket::bind("0.0.0.0:0")?;
    probe.connect("1.1.1.1:80")?;
    match probe.local_addr()?.ip() {
        std::net::IpAddr::V4(v4) => Ok(v4),
        std::net::IpAddr::V6(_) => Ok(Ipv4Addr::UNSPECIFIED),
    }
}
