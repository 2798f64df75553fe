//! Socket binding with `SO_REUSEADDR` and IPv6-only set for IPv6 addresses,
//! so an IPv4 and an IPv6 listener can share a port.

use std::io;
use std::net::{SocketAddr, TcpListener, UdpSocket};
use std::os::fd::OwnedFd;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd};

use nix::sys::socket::{
    self, sockopt, AddressFamily, Backlog, SockFlag, SockProtocol, SockType, SockaddrIn,
    SockaddrIn6,
};

fn bind_socket(addr: SocketAddr, ty: SockType, protocol: SockProtocol) -> io::Result<OwnedFd> {
    let domain = match addr {
        SocketAddr::V4(_) => AddressFamily::Inet,
        SocketAddr::V6(_) => AddressFamily::Inet6,
    };
    let fd = socket::socket(domain, ty, SockFlag::SOCK_CLOEXEC, protocol)?;

    socket::setsockopt(&fd, sockopt::ReuseAddr, &true)?;

    match addr {
        SocketAddr::V4(v4) => {
            socket::bind(fd.as_raw_fd(), &SockaddrIn::from(v4))?;
        }
        SocketAddr::V6(v6) => {
            socket::setsockopt(&fd, sockopt::Ipv6V6Only, &true)?;
            socket::bind(fd.as_raw_fd(), &SockaddrIn6::from(v6))?;
        }
    }
    Ok(fd)
}

/// Bind a non-blocking TCP listener, ready for `tokio::net::TcpListener::from_std`
pub fn bind_tcp_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let fd = bind_socket(addr, SockType::Stream, SockProtocol::Tcp)?;
    socket::listen(&fd, Backlog::MAXCONN)?;

    let listener = unsafe { TcpListener::from_raw_fd(fd.into_raw_fd()) };
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// Bind a non-blocking UDP socket, ready for `tokio::net::UdpSocket::from_std`
pub fn bind_udp_socket(addr: SocketAddr) -> io::Result<UdpSocket> {
    let fd = bind_socket(addr, SockType::Datagram, SockProtocol::Udp)?;

    let socket = unsafe { UdpSocket::from_raw_fd(fd.into_raw_fd()) };
    socket.set_nonblocking(true)?;
    Ok(socket)
}
