//! Routing of inbound messages by command id.
//!
//! The [`DispatchTable`] is a fixed array indexed by command. Each slot holds
//! a [`ResponseHandler`]; ids outside the table or without a handler go to a
//! handler that logs the message and drops it.
//!
//! | Command          | Default handling                                  |
//! |------------------|---------------------------------------------------|
//! | `VERSION`        | records the peer's minor revision                 |
//! | `ECHO`           | feeds the transport's liveness watchdog           |
//! | `BEACON`         | [`BeaconMonitor`]                                 |
//! | `ERROR`          | exception path of the [`ResponseRegistry`]        |
//! | `EVENT_ADD`, `READ_NOTIFY`, `WRITE_NOTIFY` | [`ResponseRegistry::deliver`] by `parameter2` |
//! | `NOT_FOUND`      | ignored                                           |

use std::net::SocketAddr;
use std::sync::Arc;

use crate::beacon::BeaconMonitor;
use crate::protocol::command::{self, TABLE_SIZE};
use crate::protocol::message::ErrorReport;
use crate::protocol::{Header, Status};
use crate::response::{Ioid, ResponseRegistry};
use crate::trace::{debug, trace, warn};
use crate::transport::{Protocol, Transport};

/// Consumer of one inbound message.
pub trait ResponseHandler: Send + Sync {
    /// `from` is the sender: the remote peer for streams, the datagram
    /// source for UDP.
    fn handle_response(
        &self,
        from: SocketAddr,
        transport: &dyn Transport,
        header: &Header,
        payload: &[u8],
    );
}

/// Command-indexed handler table.
pub struct DispatchTable {
    handlers: [Arc<dyn ResponseHandler>; TABLE_SIZE],
    bad: Arc<dyn ResponseHandler>,
}

impl DispatchTable {
    /// Table whose every slot is the bad-response handler, except
    /// `NOT_FOUND` which is ignored.
    #[must_use]
    pub fn new() -> Self {
        let bad: Arc<dyn ResponseHandler> = Arc::new(BadResponse);
        let mut table = Self {
            handlers: std::array::from_fn(|_| Arc::clone(&bad)),
            bad,
        };
        table.set(command::NOT_FOUND, Arc::new(Ignore));
        table
    }

    /// Table with the engine's own handlers installed.
    #[must_use]
    pub fn with_defaults(responses: Arc<ResponseRegistry>, beacons: Arc<BeaconMonitor>) -> Self {
        let mut table = Self::new();
        table.set(command::VERSION, Arc::new(VersionResponse));
        table.set(command::ECHO, Arc::new(EchoResponse));
        table.set(command::BEACON, beacons);
        table.set(
            command::ERROR,
            Arc::new(ErrorResponse {
                responses: Arc::clone(&responses),
            }),
        );
        let notify: Arc<dyn ResponseHandler> = Arc::new(NotifyResponse { responses });
        for id in [command::EVENT_ADD, command::READ_NOTIFY, command::WRITE_NOTIFY] {
            table.set(id, Arc::clone(&notify));
        }
        table
    }

    /// Installs `handler` for `command`, returning `false` if the id is
    /// outside the table.
    pub fn set(&mut self, command: u16, handler: Arc<dyn ResponseHandler>) -> bool {
        match self.handlers.get_mut(usize::from(command)) {
            Some(slot) => {
                *slot = handler;
                true
            }
            None => false,
        }
    }

    /// Handler for `command`, the bad-response handler if none.
    #[must_use]
    pub fn handler(&self, command: u16) -> &Arc<dyn ResponseHandler> {
        self.handlers
            .get(usize::from(command))
            .unwrap_or(&self.bad)
    }
}

impl Default for DispatchTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseHandler for DispatchTable {
    fn handle_response(
        &self,
        from: SocketAddr,
        transport: &dyn Transport,
        header: &Header,
        payload: &[u8],
    ) {
        trace!(%from, command = command::name(header.command), size = payload.len(), "dispatch");
        self.handler(header.command)
            .handle_response(from, transport, header, payload);
    }
}

struct BadResponse;

impl ResponseHandler for BadResponse {
    fn handle_response(&self, from: SocketAddr, _: &dyn Transport, header: &Header, payload: &[u8]) {
        warn!(
            %from,
            command = header.command,
            name = command::name(header.command),
            size = payload.len(),
            "unexpected message dropped"
        );
    }
}

struct Ignore;

impl ResponseHandler for Ignore {
    fn handle_response(&self, _: SocketAddr, _: &dyn Transport, _: &Header, _: &[u8]) {}
}

/// Peer announces its minor revision in `data_count`.
struct VersionResponse;

impl ResponseHandler for VersionResponse {
    fn handle_response(&self, from: SocketAddr, transport: &dyn Transport, header: &Header, _: &[u8]) {
        if transport.protocol() != Protocol::Stream {
            return;
        }
        let Ok(revision) = u16::try_from(header.data_count) else {
            warn!(%from, data_count = header.data_count, "version out of range");
            return;
        };
        if revision != 0 {
            debug!(%from, revision, "peer minor revision");
            transport.set_minor_revision(revision);
        }
    }
}

struct EchoResponse;

impl ResponseHandler for EchoResponse {
    fn handle_response(&self, _: SocketAddr, transport: &dyn Transport, _: &Header, _: &[u8]) {
        transport.echo_received();
    }
}

/// Remote failure of an earlier request.
struct ErrorResponse {
    responses: Arc<ResponseRegistry>,
}

impl ResponseHandler for ErrorResponse {
    fn handle_response(&self, from: SocketAddr, _: &dyn Transport, header: &Header, payload: &[u8]) {
        let report = match ErrorReport::parse(header, payload) {
            Ok(report) => report,
            Err(e) => {
                warn!(%from, error = %e, "malformed error message");
                return;
            }
        };
        let status = report.status.unwrap_or(Status::Internal);
        let message = (!report.text.is_empty()).then_some(report.text.as_str());

        match report.ioid() {
            Some(ioid) => {
                self.responses.exception(Ioid(ioid), status, message);
            }
            None => {
                warn!(
                    %from,
                    %status,
                    request = command::name(report.original.command),
                    text = %report.text,
                    "server reported an error"
                );
            }
        }
    }
}

/// Answers correlated by `parameter2`.
struct NotifyResponse {
    responses: Arc<ResponseRegistry>,
}

impl ResponseHandler for NotifyResponse {
    fn handle_response(&self, _: SocketAddr, _: &dyn Transport, header: &Header, payload: &[u8]) {
        self.responses.deliver(Ioid(header.parameter2), header, payload);
    }
}
