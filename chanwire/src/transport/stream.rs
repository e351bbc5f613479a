//! TCP transport to one server at one priority.
//!
//! # Sending
//!
//! ```text
//!   submit(Normal) ───► outbound queue ──(≥ threshold or flush())──► socket
//!   submit(Immediate) ─────────────── write lock (≤ 100 ms) ───────► socket
//! ```
//!
//! A write that would block leaves the unwritten remainder at the head of
//! the queue and asks the reactor for write readiness; the write event
//! resumes the flush. Write interest is one-shot, so it is requested again
//! whenever a flush stops short.
//!
//! # Receiving
//!
//! The reactor dispatches read readiness to [`StreamTransport`] on a pool
//! thread. The socket is drained until it would block; bytes go through the
//! [`FrameAssembler`] and complete messages to the response handler. Four
//! consecutive reads that fill the receive buffer switch the server's
//! subscription updates off until the backlog clears.

use std::collections::VecDeque;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use mio::net::TcpStream;
use parking_lot::Mutex;

use super::framing::FrameAssembler;
use super::liveness::{EchoAction, Liveness, TimeoutAction};
use super::registry::TransportRegistry;
use super::{Protocol, SEND_THRESHOLD, SendPriority, Transport, TransportClient, TransportError};
use crate::dispatch::ResponseHandler;
use crate::protocol::{
    DEFAULT_PRIORITY, ECHO_MIN_REVISION, ECHO_TIMEOUT, MAX_TCP_RECV, MINOR_REVISION, Message,
};
use crate::runtime::{Key, LeaderFollowers, Ops, Reactor, ReactorHandler, Timer, TimerHandle};
use crate::trace::{debug, info, trace, warn};

/// Bounded wait for the write lock before an immediate send is queued.
const IMMEDIATE_WRITE_WAIT: Duration = Duration::from_millis(100);

/// Full reads in a row before subscription updates are switched off.
const FLOW_CONTROL_THRESHOLD: u32 = 4;

/// Largest payload accepted from a server unless configured otherwise.
pub const DEFAULT_MAX_PAYLOAD: usize = 4 * 1024 * 1024;

/// Per-connection tunables.
#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub priority: u16,
    /// Revision assumed until the peer's version message arrives.
    pub minor_revision: u16,
    pub max_payload: usize,
    pub receive_buffer: usize,
    pub send_threshold: usize,
    pub connection_timeout: Duration,
    pub echo_timeout: Duration,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            priority: DEFAULT_PRIORITY,
            minor_revision: MINOR_REVISION,
            max_payload: DEFAULT_MAX_PAYLOAD,
            receive_buffer: MAX_TCP_RECV,
            send_threshold: SEND_THRESHOLD,
            connection_timeout: Duration::from_secs(30),
            echo_timeout: ECHO_TIMEOUT,
        }
    }
}

#[derive(Default)]
struct Outbound {
    queue: VecDeque<Vec<u8>>,
    /// Bytes of the head buffer already on the wire.
    head_offset: usize,
    queued: usize,
}

struct Inbound {
    buffer: Vec<u8>,
    assembler: FrameAssembler,
    flow: FlowControl,
}

/// Receive-side throttling of subscription updates.
#[derive(Debug, Default)]
struct FlowControl {
    full_reads: u32,
    active: bool,
}

impl FlowControl {
    /// Returns the message to send when the throttle changes state.
    fn on_read(&mut self, filled: bool) -> Option<Message> {
        if filled {
            if self.full_reads >= FLOW_CONTROL_THRESHOLD {
                if !self.active {
                    self.active = true;
                    return Some(Message::events_off());
                }
            } else {
                self.full_reads += 1;
            }
            None
        } else {
            self.full_reads = 0;
            if self.active {
                self.active = false;
                Some(Message::events_on())
            } else {
                None
            }
        }
    }
}

struct Attachment {
    key: Key,
    reactor: Weak<Reactor>,
}

/// Stream transport over a connected, non-blocking TCP socket.
pub struct StreamTransport {
    this: Weak<StreamTransport>,
    stream: TcpStream,
    remote: SocketAddr,
    options: StreamOptions,
    revision: AtomicU16,
    handler: Arc<dyn ResponseHandler>,
    timer: Arc<Timer>,
    registry: Weak<TransportRegistry<StreamTransport>>,
    attachment: OnceLock<Attachment>,
    write_lock: Mutex<()>,
    outbound: Mutex<Outbound>,
    inbound: Mutex<Inbound>,
    clients: Mutex<Vec<Arc<dyn TransportClient>>>,
    liveness: Mutex<Liveness>,
    watchdog: Mutex<Option<TimerHandle>>,
    closed: AtomicBool,
}

impl StreamTransport {
    /// Wraps a connected socket. Nothing is read until [`attach`].
    ///
    /// [`attach`]: StreamTransport::attach
    #[must_use]
    pub fn new(
        stream: TcpStream,
        remote: SocketAddr,
        options: StreamOptions,
        handler: Arc<dyn ResponseHandler>,
        timer: Arc<Timer>,
        registry: Weak<TransportRegistry<StreamTransport>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            stream,
            remote,
            revision: AtomicU16::new(options.minor_revision),
            inbound: Mutex::new(Inbound {
                buffer: vec![0; options.receive_buffer.max(1)],
                assembler: FrameAssembler::new(options.max_payload),
                flow: FlowControl::default(),
            }),
            options,
            handler,
            timer,
            registry,
            attachment: OnceLock::new(),
            write_lock: Mutex::new(()),
            outbound: Mutex::new(Outbound::default()),
            clients: Mutex::new(Vec::new()),
            liveness: Mutex::new(Liveness::new()),
            watchdog: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// Registers the socket with the pool's reactor for reading and arms the
    /// liveness watchdog.
    ///
    /// # Errors
    ///
    /// [`TransportError::Closed`] if the transport was already closed,
    /// [`TransportError::Reactor`] if the registration fails; the transport
    /// is closed in that case.
    pub fn attach(self: &Arc<Self>, pool: &LeaderFollowers) -> Result<Key, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed(self.remote));
        }
        let handler: Arc<dyn ReactorHandler> = Arc::clone(self) as Arc<dyn ReactorHandler>;
        let key = match pool.register(&self.stream, Ops::READ, handler) {
            Ok(key) => key,
            Err(e) => {
                self.close_with(true, false);
                return Err(e.into());
            }
        };
        let _ = self.attachment.set(Attachment {
            key,
            reactor: Arc::downgrade(pool.reactor()),
        });
        self.rearm(self.options.connection_timeout);
        debug!(remote = %self.remote, %key, "stream transport attached");
        Ok(key)
    }

    /// Adds a client. Returns `false` once the transport is closed.
    pub fn acquire(&self, client: Arc<dyn TransportClient>) -> bool {
        if self.is_closed() {
            return false;
        }
        let mut clients = self.clients.lock();
        if !clients.iter().any(|c| Arc::ptr_eq(c, &client)) {
            clients.push(client);
        }
        true
    }

    /// Removes a client; the last release closes the transport.
    pub fn release(&self, client: &Arc<dyn TransportClient>) {
        let now_unused = {
            let mut clients = self.clients.lock();
            let before = clients.len();
            clients.retain(|c| !Arc::ptr_eq(c, client));
            before != clients.len() && clients.is_empty()
        };
        if now_unused {
            debug!(remote = %self.remote, "last client released");
            self.close(false);
        }
    }

    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    #[must_use]
    pub fn is_unresponsive(&self) -> bool {
        self.liveness.lock().is_unresponsive()
    }

    /// Unwritten bytes, including a partially written head.
    #[must_use]
    pub fn queued_bytes(&self) -> usize {
        self.outbound.lock().queued
    }

    fn close_with(&self, forced: bool, deregister: bool) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(registry) = self.registry.upgrade() {
            registry.remove_transport(self);
        }
        if let Some(handle) = self.watchdog.lock().take() {
            handle.cancel();
        }

        if !forced {
            let _guard = self.write_lock.lock();
            match self.drain_queue() {
                Ok(true) => {}
                Ok(false) => {
                    debug!(remote = %self.remote, "unsent bytes dropped on close");
                }
                Err(e) => {
                    debug!(remote = %self.remote, error = %e, "final flush failed");
                }
            }
        }

        if deregister {
            if let Some(attachment) = self.attachment.get() {
                if let Some(reactor) = attachment.reactor.upgrade() {
                    reactor.deregister(attachment.key);
                }
            }
        }
        let _ = self.stream.shutdown(Shutdown::Both);
        info!(remote = %self.remote, priority = self.options.priority, forced, "stream transport closed");

        let clients = std::mem::take(&mut *self.clients.lock());
        for client in clients {
            client.transport_closed(self);
        }
    }

    /// Writes as much of `bytes` as the socket takes without blocking.
    fn write_some(&self, bytes: &[u8]) -> io::Result<usize> {
        let mut written = 0;
        while written < bytes.len() {
            match (&self.stream).write(&bytes[written..]) {
                Ok(0) => return Err(io::Error::from(ErrorKind::WriteZero)),
                Ok(n) => written += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    }

    /// Writes queued buffers; `Ok(false)` when the socket would block.
    /// Caller holds the write lock.
    fn drain_queue(&self) -> io::Result<bool> {
        let mut out = self.outbound.lock();
        loop {
            let offset = out.head_offset;
            let Some(head) = out.queue.front() else {
                return Ok(true);
            };
            let len = head.len();
            let written = self.write_some(&head[offset..])?;
            out.queued -= written;
            if offset + written < len {
                out.head_offset = offset + written;
                return Ok(false);
            }
            out.queue.pop_front();
            out.head_offset = 0;
        }
    }

    fn enqueue(&self, message: &Message) -> Result<bool, TransportError> {
        let revision = self.minor_revision();
        let mut out = self.outbound.lock();
        let tail_free = out.queue.len() > 1 || out.head_offset == 0;
        let threshold = self.options.send_threshold;
        let added = match out.queue.back_mut() {
            Some(tail) if tail_free && tail.len() < threshold => {
                message.encode_into(tail, revision)?
            }
            _ => {
                let bytes = message.to_bytes(revision)?;
                let len = bytes.len();
                out.queue.push_back(bytes);
                len
            }
        };
        out.queued += added;
        Ok(out.queued >= threshold)
    }

    fn send_immediate(&self, message: &Message) -> Result<(), TransportError> {
        let bytes = message.to_bytes(self.minor_revision())?;

        let Some(guard) = self.write_lock.try_lock_for(IMMEDIATE_WRITE_WAIT) else {
            trace!(remote = %self.remote, "write lock busy, queueing immediate message");
            {
                let mut out = self.outbound.lock();
                out.queued += bytes.len();
                out.queue.push_back(bytes);
            }
            // The lock holder drains what it finds; anything left is written
            // on the next write readiness.
            self.want_write();
            return Ok(());
        };

        {
            let mut out = self.outbound.lock();
            if out.head_offset > 0 {
                // The partially written head has to finish first.
                out.queued += bytes.len();
                out.queue.insert(1, bytes);
                drop(out);
                drop(guard);
                self.flush();
                return Ok(());
            }
        }

        match self.write_some(&bytes) {
            Ok(written) if written == bytes.len() => Ok(()),
            Ok(written) => {
                {
                    let mut out = self.outbound.lock();
                    out.queued += bytes.len() - written;
                    out.queue.push_front(bytes);
                    out.head_offset = written;
                }
                drop(guard);
                self.want_write();
                Ok(())
            }
            Err(source) => {
                drop(guard);
                warn!(remote = %self.remote, error = %source, "immediate send failed");
                self.close(true);
                Err(TransportError::Io {
                    remote: self.remote,
                    source,
                })
            }
        }
    }

    fn want_write(&self) {
        let Some(attachment) = self.attachment.get() else {
            return;
        };
        if let Some(reactor) = attachment.reactor.upgrade() {
            if let Err(e) = reactor.set_interest_ops(attachment.key, Ops::READ | Ops::WRITE) {
                debug!(remote = %self.remote, error = %e, "cannot request write readiness");
            }
        }
    }

    fn read_ready(&self) {
        let mut guard = self.inbound.lock();
        let inbound = &mut *guard;

        loop {
            if self.is_closed() {
                return;
            }
            match (&self.stream).read(&mut inbound.buffer) {
                Ok(0) => {
                    drop(guard);
                    debug!(remote = %self.remote, "peer closed the connection");
                    self.close(true);
                    return;
                }
                Ok(n) => {
                    let throttle = inbound.flow.on_read(n == inbound.buffer.len());
                    let framed = inbound.assembler.push(&inbound.buffer[..n], |header, payload| {
                        self.handler
                            .handle_response(self.remote, self, header, payload);
                    });
                    if let Some(message) = throttle {
                        self.send_flow_control(&message);
                    }
                    if let Err(e) = framed {
                        drop(guard);
                        warn!(remote = %self.remote, error = %e, "framing error, closing");
                        self.close(true);
                        return;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if let Some(message) = inbound.flow.on_read(false) {
                        self.send_flow_control(&message);
                    }
                    return;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    drop(guard);
                    debug!(remote = %self.remote, error = %e, "read failed, closing");
                    self.close(true);
                    return;
                }
            }
        }
    }

    fn send_flow_control(&self, message: &Message) {
        debug!(remote = %self.remote, command = message.command(), "flow control toggled");
        if let Err(e) = self.submit(message, SendPriority::Immediate) {
            debug!(remote = %self.remote, error = %e, "flow control message not sent");
        }
    }

    fn rearm(&self, delay: Duration) {
        let mut slot = self.watchdog.lock();
        if let Some(old) = slot.take() {
            old.cancel();
        }
        if self.is_closed() {
            return;
        }
        let this = self.this.clone();
        let scheduled = self.timer.schedule_after(delay, move |_| {
            if let Some(transport) = this.upgrade() {
                transport.watchdog_fired();
            }
        });
        match scheduled {
            Ok(handle) => *slot = Some(handle),
            Err(e) => {
                debug!(remote = %self.remote, error = %e, "watchdog not armed");
            }
        }
    }

    fn watchdog_fired(&self) {
        let action = self.liveness.lock().on_timeout();
        match action {
            TimeoutAction::SendProbe => self.send_probe(),
            TimeoutAction::BecameUnresponsive => {
                warn!(remote = %self.remote, "transport unresponsive");
                self.notify(|client, transport| client.transport_unresponsive(transport));
            }
            TimeoutAction::Nothing => {}
        }
    }

    fn send_probe(&self) {
        let expects_reply = self.minor_revision() >= ECHO_MIN_REVISION;
        self.liveness.lock().on_probe_sent(expects_reply);

        let probe = if expects_reply {
            Message::echo()
        } else {
            Message::version(self.options.priority)
        };
        if let Err(e) = self.submit(&probe, SendPriority::Immediate) {
            debug!(remote = %self.remote, error = %e, "echo probe not sent");
            self.liveness.lock().on_probe_failed();
        }
        self.rearm(self.options.echo_timeout);
    }

    fn notify<F>(&self, f: F)
    where
        F: Fn(&dyn TransportClient, &dyn Transport),
    {
        let clients = self.clients.lock().clone();
        for client in &clients {
            f(client.as_ref(), self);
        }
    }
}

impl Transport for StreamTransport {
    fn submit(&self, message: &Message, priority: SendPriority) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed(self.remote));
        }
        match priority {
            SendPriority::Immediate => self.send_immediate(message),
            SendPriority::Normal => {
                if self.enqueue(message)? {
                    self.flush();
                }
                Ok(())
            }
        }
    }

    fn flush(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        let drained = {
            let _guard = self.write_lock.lock();
            self.drain_queue()
        };
        match drained {
            Ok(true) => true,
            Ok(false) => {
                self.want_write();
                false
            }
            Err(e) => {
                warn!(remote = %self.remote, error = %e, "flush failed, closing");
                self.close(true);
                false
            }
        }
    }

    fn remote_address(&self) -> SocketAddr {
        self.remote
    }

    fn minor_revision(&self) -> u16 {
        self.revision.load(Ordering::Acquire)
    }

    fn set_minor_revision(&self, revision: u16) {
        self.revision.store(revision, Ordering::Release);
    }

    fn priority(&self) -> u16 {
        self.options.priority
    }

    fn protocol(&self) -> Protocol {
        Protocol::Stream
    }

    fn close(&self, forced: bool) {
        self.close_with(forced, true);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn beacon_arrival(&self) {
        if self.liveness.lock().rearm_on_beacon() {
            self.rearm(self.options.connection_timeout);
        }
    }

    fn beacon_anomaly(&self) {
        self.notify(|client, transport| client.transport_changed(transport));
    }

    fn echo_received(&self) {
        let action = self.liveness.lock().on_echo();
        match action {
            EchoAction::Ignore => {}
            EchoAction::Reprobe => self.send_probe(),
            EchoAction::Rearm { recovered } => {
                if recovered {
                    info!(remote = %self.remote, "transport responsive again");
                    self.notify(|client, transport| client.transport_responsive(transport));
                }
                self.rearm(self.options.connection_timeout);
            }
        }
    }
}

impl ReactorHandler for StreamTransport {
    fn handle_event(&self, _key: Key, ready: Ops) {
        if ready.contains(Ops::WRITE) {
            self.flush();
        }
        if ready.contains(Ops::READ) {
            self.read_ready();
        }
    }

    fn deregistered(&self, _key: Key) {
        self.close_with(true, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_control_engages_after_four_full_reads() {
        let mut flow = FlowControl::default();
        for _ in 0..FLOW_CONTROL_THRESHOLD {
            assert!(flow.on_read(true).is_none());
        }
        let off = flow.on_read(true).unwrap();
        assert_eq!(off.command(), crate::protocol::command::EVENTS_OFF);
        assert!(flow.on_read(true).is_none());

        let on = flow.on_read(false).unwrap();
        assert_eq!(on.command(), crate::protocol::command::EVENTS_ON);
        assert!(flow.on_read(false).is_none());
    }

    #[test]
    fn partial_read_resets_the_count() {
        let mut flow = FlowControl::default();
        for _ in 0..3 {
            flow.on_read(true);
        }
        assert!(flow.on_read(false).is_none());
        for _ in 0..FLOW_CONTROL_THRESHOLD {
            assert!(flow.on_read(true).is_none());
        }
        assert!(flow.on_read(true).is_some());
    }

    #[test]
    fn immediate_send_queues_while_the_writer_is_busy() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();
        let stream =
            crate::net::tcp::configure(std::net::TcpStream::connect(address).unwrap()).unwrap();
        let transport = StreamTransport::new(
            stream,
            address,
            StreamOptions::default(),
            Arc::new(crate::dispatch::DispatchTable::new()),
            Arc::new(Timer::new("stream-test").unwrap()),
            Weak::new(),
        );

        let held = transport.write_lock.lock();
        transport
            .submit(&Message::echo(), SendPriority::Immediate)
            .unwrap();
        assert!(transport.queued_bytes() > 0);
        drop(held);

        assert!(transport.flush());
        assert_eq!(transport.queued_bytes(), 0);
    }
}
