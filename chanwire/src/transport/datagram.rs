//! UDP transport for discovery traffic.
//!
//! One socket serves searches, beacons and relay registration. Outgoing
//! messages are either addressed explicitly with [`DatagramTransport::send_to`]
//! or broadcast to the configured address list through
//! [`Transport::submit`]. Every received datagram may hold several packed
//! messages; datagrams from ignored hosts are dropped before decoding.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::{Mutex, RwLock};

use super::{Protocol, SendPriority, Transport, TransportError};
use crate::dispatch::ResponseHandler;
use crate::net::UdpSocket;
use crate::protocol::{self, MAX_UDP_RECV, MAX_UDP_SEND, MINOR_REVISION, Message};
use crate::runtime::{Key, LeaderFollowers, Ops, Reactor, ReactorHandler};
use crate::trace::{debug, trace, warn};

struct Attachment {
    key: Key,
    reactor: Weak<Reactor>,
}

/// Connectionless transport over a shared UDP socket.
pub struct DatagramTransport {
    socket: UdpSocket,
    local: SocketAddr,
    handler: Arc<dyn ResponseHandler>,
    broadcast: RwLock<Vec<SocketAddr>>,
    ignored: RwLock<Vec<IpAddr>>,
    receive: Mutex<Vec<u8>>,
    attachment: OnceLock<Attachment>,
    closed: AtomicBool,
}

impl DatagramTransport {
    /// Binds `addr` (shared with other processes when `shared`) and enables
    /// broadcast sends.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound or configured.
    pub fn bind(
        addr: SocketAddr,
        shared: bool,
        handler: Arc<dyn ResponseHandler>,
    ) -> io::Result<Arc<Self>> {
        let socket = if shared {
            UdpSocket::bind_shared(addr)?
        } else {
            UdpSocket::bind(addr)?
        };
        socket.set_broadcast(true)?;
        let local = socket.local_addr()?;
        debug!(%local, shared, "datagram transport bound");

        Ok(Arc::new(Self {
            socket,
            local,
            handler,
            broadcast: RwLock::new(Vec::new()),
            ignored: RwLock::new(Vec::new()),
            receive: Mutex::new(vec![0; MAX_UDP_RECV]),
            attachment: OnceLock::new(),
            closed: AtomicBool::new(false),
        }))
    }

    /// Registers the socket with the pool's reactor for reading.
    ///
    /// # Errors
    ///
    /// [`TransportError::Reactor`] if the registration fails.
    pub fn attach(self: &Arc<Self>, pool: &LeaderFollowers) -> Result<Key, TransportError> {
        let handler: Arc<dyn ReactorHandler> = Arc::clone(self) as Arc<dyn ReactorHandler>;
        let key = pool.register(&self.socket, Ops::READ, handler)?;
        let _ = self.attachment.set(Attachment {
            key,
            reactor: Arc::downgrade(pool.reactor()),
        });
        Ok(key)
    }

    #[must_use]
    pub const fn local_address(&self) -> SocketAddr {
        self.local
    }

    pub fn set_broadcast_addresses(&self, addresses: Vec<SocketAddr>) {
        *self.broadcast.write() = addresses;
    }

    #[must_use]
    pub fn broadcast_addresses(&self) -> Vec<SocketAddr> {
        self.broadcast.read().clone()
    }

    /// Hosts whose datagrams are dropped on receipt.
    pub fn set_ignored_addresses(&self, addresses: Vec<IpAddr>) {
        *self.ignored.write() = addresses;
    }

    /// Sends `message` to `dest`.
    ///
    /// # Errors
    ///
    /// [`TransportError::Protocol`] if the message cannot be encoded,
    /// [`TransportError::Io`] if the send fails.
    pub fn send_to(&self, message: &Message, dest: SocketAddr) -> Result<(), TransportError> {
        let bytes = self.encode(message)?;
        self.send_bytes(&bytes, dest)
    }

    /// Sends already encoded bytes to `dest`.
    ///
    /// # Errors
    ///
    /// [`TransportError::Closed`] after close, [`TransportError::Io`] if the
    /// send fails or would block.
    pub fn send_bytes(&self, bytes: &[u8], dest: SocketAddr) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed(self.local));
        }
        match self.socket.send_to(bytes, dest) {
            Ok(_) => Ok(()),
            Err(source) => Err(TransportError::Io {
                remote: dest,
                source,
            }),
        }
    }

    fn encode(&self, message: &Message) -> Result<Vec<u8>, TransportError> {
        let bytes = message.to_bytes(MINOR_REVISION)?;
        if bytes.len() > MAX_UDP_SEND {
            return Err(protocol::ProtocolError::PayloadTooLarge {
                size: bytes.len(),
                max: MAX_UDP_SEND,
            }
            .into());
        }
        Ok(bytes)
    }

    fn is_ignored(&self, ip: IpAddr) -> bool {
        self.ignored.read().contains(&ip)
    }

    fn receive_ready(&self) {
        let mut buffer = self.receive.lock();
        let mut errors = ReceiveErrors::default();
        loop {
            if self.is_closed() {
                return;
            }
            match self.socket.try_recv_from(&mut buffer) {
                Ok(Some((n, from))) => {
                    errors.reset();
                    if self.is_ignored(from.ip()) {
                        trace!(%from, "datagram from ignored host dropped");
                        continue;
                    }
                    protocol::for_each_message(&buffer[..n], |header, payload| {
                        self.handler.handle_response(from, self, header, payload);
                    });
                }
                Ok(None) => return,
                Err(e) => {
                    if !errors.keep_draining(&e) {
                        debug!(local = %self.local, error = %e, "datagram receive keeps failing");
                        return;
                    }
                    trace!(local = %self.local, error = %e, "datagram receive failed");
                }
            }
        }
    }
}

/// Consecutive receive failures tolerated in one drain.
const MAX_RECEIVE_ERRORS: u32 = 16;

/// Decides whether a receive error ends the drain. ICMP errors surface as
/// per-datagram failures on some platforms while the socket stays usable.
#[derive(Debug, Default)]
struct ReceiveErrors {
    consecutive: u32,
}

impl ReceiveErrors {
    fn keep_draining(&mut self, error: &io::Error) -> bool {
        if error.kind() == io::ErrorKind::Interrupted {
            return true;
        }
        self.consecutive += 1;
        self.consecutive < MAX_RECEIVE_ERRORS
    }

    fn reset(&mut self) {
        self.consecutive = 0;
    }
}

impl Transport for DatagramTransport {
    /// Broadcasts `message` to every configured address. Fails only if the
    /// message cannot be encoded or no destination accepted it.
    fn submit(&self, message: &Message, _priority: SendPriority) -> Result<(), TransportError> {
        let bytes = self.encode(message)?;
        let destinations = self.broadcast.read().clone();

        let mut last_error = None;
        let mut delivered = 0;
        for dest in destinations {
            match self.send_bytes(&bytes, dest) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    debug!(%dest, error = %e, "broadcast send failed");
                    last_error = Some(e);
                }
            }
        }
        match last_error {
            Some(e) if delivered == 0 => Err(e),
            _ => Ok(()),
        }
    }

    fn flush(&self) -> bool {
        true
    }

    fn remote_address(&self) -> SocketAddr {
        self.broadcast
            .read()
            .first()
            .copied()
            .unwrap_or(self.local)
    }

    fn minor_revision(&self) -> u16 {
        MINOR_REVISION
    }

    fn priority(&self) -> u16 {
        0
    }

    fn protocol(&self) -> Protocol {
        Protocol::Datagram
    }

    fn close(&self, _forced: bool) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(attachment) = self.attachment.get() {
            if let Some(reactor) = attachment.reactor.upgrade() {
                reactor.deregister(attachment.key);
            }
        }
        debug!(local = %self.local, "datagram transport closed");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl ReactorHandler for DatagramTransport {
    fn handle_event(&self, _key: Key, ready: Ops) {
        if ready.contains(Ops::READ) {
            self.receive_ready();
        }
    }

    fn deregistered(&self, key: Key) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            warn!(local = %self.local, %key, "datagram transport dropped by reactor");
        }
    }
}
