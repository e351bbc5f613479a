//! Non-blocking UDP for the datagram transport.
//!
//! Several clients on one host listen for beacons on the same port, so the
//! discovery socket is bound with `SO_REUSEADDR` through rustix before mio
//! takes it over.

use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};

use mio::net::UdpSocket as MioUdpSocket;
use rustix::net::{AddressFamily, SocketType, sockopt};

/// Blocking std socket bound to `addr` with `SO_REUSEADDR` set before the
/// bind.
///
/// # Errors
///
/// Returns an error if the socket cannot be created or bound.
pub fn bind_shared_blocking(addr: SocketAddr) -> io::Result<std::net::UdpSocket> {
    let family = if addr.is_ipv4() {
        AddressFamily::INET
    } else {
        AddressFamily::INET6
    };
    let fd = rustix::net::socket(family, SocketType::DGRAM, None)?;
    sockopt::set_socket_reuseaddr(&fd, true)?;
    rustix::net::bind(&fd, &addr)?;
    Ok(std::net::UdpSocket::from(fd))
}

/// A non-blocking UDP socket.
pub struct UdpSocket {
    inner: MioUdpSocket,
}

impl UdpSocket {
    /// Exclusive bind, used when the port is picked by the OS.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is taken.
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let inner = MioUdpSocket::bind(addr)?;
        Ok(Self { inner })
    }

    /// Binds to `addr` with `SO_REUSEADDR` set before the bind, so other
    /// processes on the host can share the port.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be created or bound.
    pub fn bind_shared(addr: SocketAddr) -> io::Result<Self> {
        let socket = bind_shared_blocking(addr)?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            inner: MioUdpSocket::from_std(socket),
        })
    }

    /// # Errors
    ///
    /// Returns an error if the local address cannot be retrieved.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Allows sends to broadcast addresses.
    ///
    /// # Errors
    ///
    /// Returns an error if the option cannot be set.
    pub fn set_broadcast(&self, on: bool) -> io::Result<()> {
        self.inner.set_broadcast(on)
    }

    /// # Errors
    ///
    /// Any send failure, `WouldBlock` included. Datagrams are never queued.
    pub fn send_to(&self, buf: &[u8], dest: SocketAddr) -> io::Result<usize> {
        self.inner.send_to(buf, dest)
    }

    /// # Errors
    ///
    /// Any receive failure, `WouldBlock` included.
    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.inner.recv_from(buf)
    }

    /// Like [`recv_from`](Self::recv_from) with `WouldBlock` mapped to
    /// `Ok(None)`, for drain loops.
    pub fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.recv_from(buf) {
            Ok(received) => Ok(Some(received)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

}

impl AsRawFd for UdpSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}
