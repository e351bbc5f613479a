//! One-shot request completed by a single answer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use super::{Completion, Ioid, ResponseRequest};
use crate::protocol::{Header, Status};
use crate::runtime::TimerHandle;

/// Outcome of a one-shot request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Data {
        data_type: u16,
        count: u32,
        payload: Vec<u8>,
    },
    Failed {
        status: Status,
        message: Option<String>,
    },
    Cancelled,
}

/// Request whose answer is picked up with [`ReplyWaiter::wait`].
///
/// Used for read and write notifications: the caller registers the waiter,
/// sends the request with the returned id and blocks for the reply.
pub struct ReplyWaiter {
    tx: Sender<Reply>,
    rx: Receiver<Reply>,
    done: AtomicBool,
    deadline: Mutex<Option<TimerHandle>>,
}

impl ReplyWaiter {
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::bounded(1);
        Self {
            tx,
            rx,
            done: AtomicBool::new(false),
            deadline: Mutex::new(None),
        }
    }

    /// Keeps the timer armed for this request; it is cancelled with the
    /// first outcome.
    pub fn set_deadline(&self, handle: TimerHandle) {
        let mut slot = self.deadline.lock();
        if self.is_done() {
            handle.cancel();
        } else {
            *slot = Some(handle);
        }
    }

    /// The armed timeout, until the first outcome.
    #[must_use]
    pub fn deadline(&self) -> Option<TimerHandle> {
        self.deadline.lock().clone()
    }

    /// Whether an outcome has been recorded.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Blocks up to `timeout` for the reply.
    #[must_use]
    pub fn wait(&self, timeout: Duration) -> Option<Reply> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Marks the request finished. Returns `false` if it already was.
    fn finish(&self) -> bool {
        if self.done.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(handle) = self.deadline.lock().take() {
            handle.cancel();
        }
        true
    }

    fn complete(&self, reply: Reply) {
        if self.finish() {
            let _ = self.tx.try_send(reply);
        }
    }
}

impl Default for ReplyWaiter {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseRequest for ReplyWaiter {
    fn response(&self, _ioid: Ioid, header: &Header, payload: &[u8]) -> Completion {
        // parameter1 carries the server's status for the operation.
        match Status::from_status_code(header.parameter1) {
            Some(status) if !status.is_successful() => self.complete(Reply::Failed {
                status,
                message: None,
            }),
            _ => self.complete(Reply::Data {
                data_type: header.data_type,
                count: header.data_count,
                payload: payload.to_vec(),
            }),
        }
        Completion::Done
    }

    fn exception(&self, _ioid: Ioid, status: Status, message: Option<&str>) -> Completion {
        self.complete(Reply::Failed {
            status,
            message: message.map(str::to_owned),
        });
        Completion::Done
    }

    fn cancel(&self, _ioid: Ioid) {
        self.complete(Reply::Cancelled);
    }

    fn timeout(&self, _ioid: Ioid) {
        // Same teardown as a cancel, but the waiter learns it timed out.
        if self.finish() {
            let _ = self.tx.try_send(Reply::Failed {
                status: Status::Timeout,
                message: None,
            });
        }
    }
}
