//! Outbound TCP connection setup.

use std::io;
use std::net::{SocketAddr, TcpStream};
use std::thread;
use std::time::Duration;

use rustix::net::sockopt;

use crate::trace::debug;

/// Connects to `addr`, trying up to `attempts` times `retry_delay` apart.
///
/// The returned stream is non-blocking with `TCP_NODELAY` and keep-alive
/// enabled.
///
/// # Errors
///
/// The error of the last attempt, or of configuring the connected socket.
pub fn connect(
    addr: SocketAddr,
    attempts: u32,
    retry_delay: Duration,
    timeout: Duration,
) -> io::Result<mio::net::TcpStream> {
    let attempts = attempts.max(1);
    let mut last = None;

    for attempt in 1..=attempts {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return configure(stream),
            Err(e) => {
                debug!(remote = %addr, attempt, error = %e, "connect attempt failed");
                last = Some(e);
                if attempt < attempts {
                    thread::sleep(retry_delay);
                }
            }
        }
    }

    Err(last.unwrap_or_else(|| io::Error::from(io::ErrorKind::NotConnected)))
}

/// Applies the stream options and hands the socket to mio.
///
/// # Errors
///
/// Returns an error if an option cannot be set.
pub fn configure(stream: TcpStream) -> io::Result<mio::net::TcpStream> {
    stream.set_nodelay(true)?;
    sockopt::set_socket_keepalive(&stream, true)?;
    stream.set_nonblocking(true)?;
    Ok(mio::net::TcpStream::from_std(stream))
}
