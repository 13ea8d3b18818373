use std::io;
use std::net::SocketAddr;

use socket2::{Domain, Socket, Type};

/// Bind a non-blocking UDP socket with `SO_REUSEADDR` set.
pub fn bind_reusable(addr: SocketAddr) -> io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(socket2::Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// [`bind_reusable`] registered with the current tokio runtime.
pub fn bind_udp(addr: SocketAddr) -> io::Result<tokio::net::UdpSocket> {
    tokio::net::UdpSocket::from_std(bind_reusable(addr)?)
}
