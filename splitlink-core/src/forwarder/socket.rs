//! Protected, uplink-bound sockets.

use crate::error::ForwardError;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use splitlink_netstack::{NetworkHandle, SocketProtector};
use std::io;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use tokio::net::{TcpStream, UdpSocket};

/// Non-blocking socket for `dst`, exempted from capture and bound to `network`.
/// Protection happens before anything is sent.
pub(crate) fn protected_socket(
    protector: &dyn SocketProtector,
    network: &NetworkHandle,
    dst: SocketAddr,
    ty: Type,
    protocol: Protocol,
) -> Result<Socket, ForwardError> {
    let socket = Socket::new(Domain::for_address(dst), ty, Some(protocol))?;
    let fd = socket.as_raw_fd();

    protector.protect(fd).map_err(ForwardError::ProtectFailed)?;
    protector
        .bind_to_network(fd, network)
        .map_err(ForwardError::BindFailed)?;

    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Connected datagram socket for one UDP flow
pub(crate) fn connected_udp(
    protector: &dyn SocketProtector,
    network: &NetworkHandle,
    dst: SocketAddr,
) -> Result<UdpSocket, ForwardError> {
    let socket = protected_socket(protector, network, dst, Type::DGRAM, Protocol::UDP)?;
    socket.connect(&SockAddr::from(dst))?;
    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}

/// Finish a non-blocking connect on an already protected stream socket
pub(crate) async fn connect_stream(socket: Socket, dst: SocketAddr) -> io::Result<TcpStream> {
    match socket.connect(&SockAddr::from(dst)) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(e),
    }

    let std_stream: std::net::TcpStream = socket.into();
    let stream = TcpStream::from_std(std_stream)?;

    stream.writable().await?;
    if let Some(e) = stream.take_error()? {
        return Err(e);
    }
    Ok(stream)
}
