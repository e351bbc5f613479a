//! Discovery relay.
//!
//! Only one process per host can own the beacon port exclusively, so a small
//! relay binds it and forwards every datagram to the clients on the host
//! that registered with it:
//!
//! ```text
//!   server beacons ──► :5065 Repeater ──┬──► client A (ephemeral port)
//!                          ▲            ├──► client B
//!   REPEATER_REGISTER ─────┘            └──► ...
//!        ◄── REPEATER_CONFIRM
//! ```
//!
//! Registration is accepted from local addresses only. Each client gets a
//! connected socket so that a client which went away shows up as a send
//! error; such clients are verified by trying to bind their port and pruned
//! when the bind succeeds.

use std::io::{self, ErrorKind};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;

use crate::protocol::{HEADER_SIZE, Header, MAX_UDP_RECV, MINOR_REVISION, Message, command};
use crate::trace::{debug, error, info, trace};

/// How often the receive loop looks at the shutdown flag.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Offset of `parameter2` in a standard header.
const ADDRESS_OFFSET: usize = 12;

/// Relay failures.
#[derive(Debug, Error)]
pub enum RepeaterError {
    #[error("failed to bind repeater port {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("failed to spawn repeater thread: {0}")]
    Spawn(#[source] io::Error),
    #[error("repeater socket error: {0}")]
    Io(#[from] io::Error),
}

struct Client {
    address: SocketAddr,
    socket: UdpSocket,
}

impl Client {
    fn connect(address: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))?;
        socket.connect(address)?;
        Ok(Self { address, socket })
    }

    fn send(&self, bytes: &[u8]) -> bool {
        match self.socket.send(bytes) {
            Ok(_) => true,
            Err(e) => {
                trace!(client = %self.address, error = %e, "relay send failed");
                false
            }
        }
    }

    /// A live client holds its port, so binding it must fail.
    fn is_alive(&self) -> bool {
        UdpSocket::bind(self.address).is_err()
    }
}

/// The relay loop and its client list.
pub struct Repeater {
    socket: UdpSocket,
    local: SocketAddr,
    clients: Vec<Client>,
}

impl Repeater {
    /// Binds `addr` exclusively.
    ///
    /// # Errors
    ///
    /// [`RepeaterError::Bind`] if the port is taken, typically by another
    /// relay.
    pub fn bind(addr: SocketAddr) -> Result<Self, RepeaterError> {
        let socket = UdpSocket::bind(addr).map_err(|source| RepeaterError::Bind { addr, source })?;
        socket.set_read_timeout(Some(POLL_INTERVAL))?;
        let local = socket.local_addr()?;
        debug!(%local, "repeater bound");
        Ok(Self {
            socket,
            local,
            clients: Vec::new(),
        })
    }

    /// Whether something already holds the relay port on this host.
    #[must_use]
    pub fn is_running(port: u16) -> bool {
        UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)).is_err()
    }

    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Registered client addresses.
    #[must_use]
    pub fn clients(&self) -> Vec<SocketAddr> {
        self.clients.iter().map(|c| c.address).collect()
    }

    /// Relays until `shutdown` is set.
    ///
    /// # Errors
    ///
    /// [`RepeaterError::Io`] on an unexpected receive error.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<(), RepeaterError> {
        info!(local = %self.local, "repeater running");
        let mut buffer = vec![0u8; MAX_UDP_RECV];
        while !shutdown.load(Ordering::Acquire) {
            match self.socket.recv_from(&mut buffer) {
                Ok((n, from)) => self.process(&mut buffer[..n], from),
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::WouldBlock
                            | ErrorKind::TimedOut
                            | ErrorKind::Interrupted
                            | ErrorKind::ConnectionReset
                            | ErrorKind::ConnectionRefused
                    ) => {}
                Err(e) => {
                    error!(error = %e, "repeater receive failed");
                    return Err(e.into());
                }
            }
        }
        info!(local = %self.local, "repeater stopped");
        Ok(())
    }

    /// Runs the relay on its own thread.
    ///
    /// # Errors
    ///
    /// [`RepeaterError::Spawn`] if the thread cannot be created.
    pub fn spawn(mut self) -> Result<RepeaterHandle, RepeaterError> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let local = self.local;
        let thread = thread::Builder::new()
            .name("chanwire-repeater".into())
            .spawn(move || self.run(&flag))
            .map_err(RepeaterError::Spawn)?;
        Ok(RepeaterHandle {
            local,
            shutdown,
            thread: Some(thread),
        })
    }

    /// Handles one datagram received from `from`.
    fn process(&mut self, datagram: &mut [u8], from: SocketAddr) {
        if datagram.is_empty() {
            self.register(from);
            return;
        }
        if datagram.len() >= HEADER_SIZE {
            let id = u16::from_be_bytes([datagram[0], datagram[1]]);
            if id == command::REPEATER_REGISTER {
                self.register(from);
                if datagram.len() > HEADER_SIZE {
                    self.fan_out(&datagram[HEADER_SIZE..], from);
                }
                return;
            }
            if id == command::BEACON {
                fill_beacon_address(datagram, from);
            }
        }
        self.fan_out(datagram, from);
    }

    fn register(&mut self, from: SocketAddr) {
        let SocketAddr::V4(v4) = from else {
            debug!(%from, "IPv6 registration ignored");
            return;
        };
        if !is_local(from.ip()) {
            debug!(%from, "registration from remote host rejected");
            return;
        }

        // Same port from another local interface is the same client.
        let existing = self.clients.iter().position(|c| c.address.port() == from.port());
        let index = match existing {
            Some(index) => index,
            None => match Client::connect(from) {
                Ok(client) => {
                    self.clients.push(client);
                    self.clients.len() - 1
                }
                Err(e) => {
                    debug!(%from, error = %e, "cannot reach registering client");
                    return;
                }
            },
        };

        let confirm = Message::repeater_confirm(*v4.ip());
        let confirmed = confirm
            .to_bytes(MINOR_REVISION)
            .is_ok_and(|bytes| self.clients[index].send(&bytes));
        if !confirmed {
            self.clients.remove(index);
            return;
        }
        debug!(client = %from, clients = self.clients.len(), "client registered");

        // Keeps idle clients' sockets exercised so dead ones get noticed.
        if let Ok(noop) = Message::new(Header::new(command::VERSION)).to_bytes(MINOR_REVISION) {
            self.fan_out(&noop, from);
        }
        if existing.is_none() {
            self.clients.retain(Client::is_alive);
        }
    }

    fn fan_out(&mut self, bytes: &[u8], from: SocketAddr) {
        self.clients.retain(|client| {
            if client.address == from || client.send(bytes) {
                return true;
            }
            let alive = client.is_alive();
            if !alive {
                debug!(client = %client.address, "dead client pruned");
            }
            alive
        });
    }
}

/// Running relay thread.
pub struct RepeaterHandle {
    local: SocketAddr,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<Result<(), RepeaterError>>>,
}

impl RepeaterHandle {
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Stops the relay and waits for its thread.
    ///
    /// # Errors
    ///
    /// The error that ended the loop, if any.
    pub fn shutdown(mut self) -> Result<(), RepeaterError> {
        self.stop()
    }

    fn stop(&mut self) -> Result<(), RepeaterError> {
        self.shutdown.store(true, Ordering::Release);
        match self.thread.take().map(JoinHandle::join) {
            Some(Ok(result)) => result,
            Some(Err(_)) => {
                error!("repeater thread panicked");
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Drop for RepeaterHandle {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Beacons relayed for servers that did not fill in their address get the
/// datagram source.
fn fill_beacon_address(datagram: &mut [u8], from: SocketAddr) {
    let field = &mut datagram[ADDRESS_OFFSET..ADDRESS_OFFSET + 4];
    if field.iter().all(|&b| b == 0) {
        if let IpAddr::V4(ip) = from.ip() {
            field.copy_from_slice(&ip.octets());
        }
    }
}

/// Loopback, or an address of one of this host's interfaces.
fn is_local(ip: IpAddr) -> bool {
    ip.is_loopback() || UdpSocket::bind(SocketAddr::new(ip, 0)).is_ok()
}
