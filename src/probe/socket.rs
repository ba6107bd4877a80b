//! TCP connect and UDP send probes.
//!
//! Sockets are created through socket2 so the TTL can be set before the
//! connection attempt, then handed to tokio for the async connect/send.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Instant;

use chrono::{DateTime, Utc};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpSocket, UdpSocket};

use super::{resolve_target, ProbeError, ProbeTarget, Reply, ReplyDetail};

/// Connect, write the payload once if non-empty, then close.
pub(crate) async fn run_tcp_probe(target: &ProbeTarget, sent_at: DateTime<Utc>) -> Result<Reply, ProbeError> {
    let addr = resolve_target(target).await?;

    let start = Instant::now();
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    set_ttl(&socket, addr, target.ttl)?;
    socket.set_nonblocking(true)?;
    let socket = TcpSocket::from_std_stream(socket.into());

    let mut stream = socket.connect(addr).await?;
    if !target.payload.is_empty() {
        stream.write_all(&target.payload).await?;
    }
    // The peer may already have closed; a failed shutdown does not undo the connect.
    let _ = stream.shutdown().await;
    drop(stream);
    let elapsed = start.elapsed();

    Ok(Reply::success(
        addr,
        sent_at,
        elapsed,
        ReplyDetail::Socket { bytes_sent: target.payload.len(), ttl: target.ttl },
    ))
}

/// Send the payload as one datagram. Success only means the local send completed.
pub(crate) async fn run_udp_probe(target: &ProbeTarget, sent_at: DateTime<Utc>) -> Result<Reply, ProbeError> {
    let addr = resolve_target(target).await?;

    let start = Instant::now();
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    set_ttl(&socket, addr, target.ttl)?;
    socket.set_nonblocking(true)?;
    socket.bind(&unspecified(addr).into())?;
    let socket = UdpSocket::from_std(socket.into())?;

    socket.connect(addr).await?;
    if !target.payload.is_empty() {
        socket.send(&target.payload).await?;
    }
    drop(socket);
    let elapsed = start.elapsed();

    Ok(Reply::success(
        addr,
        sent_at,
        elapsed,
        ReplyDetail::Socket { bytes_sent: target.payload.len(), ttl: target.ttl },
    ))
}

fn set_ttl(socket: &Socket, addr: SocketAddr, ttl: u8) -> std::io::Result<()> {
    match addr {
        SocketAddr::V4(_) => socket.set_ttl(u32::from(ttl)),
        SocketAddr::V6(_) => socket.set_unicast_hops_v6(u32::from(ttl)),
    }
}

fn unspecified(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    }
}
