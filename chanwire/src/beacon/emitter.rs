//! Server side beacon broadcast.
//!
//! The period starts at [`MIN_BEACON_PERIOD`] and doubles after each beacon
//! until it reaches the configured ceiling, so clients learn about a new
//! server quickly and the steady-state traffic stays low.

use std::net::Ipv4Addr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::protocol::Message;
use crate::runtime::{Timer, TimerError, TimerHandle};
use crate::trace::{debug, warn};
use crate::transport::{SendPriority, Transport};

pub const MIN_BEACON_PERIOD: Duration = Duration::from_millis(1);

pub const DEFAULT_BEACON_PERIOD: Duration = Duration::from_secs(15);

struct State {
    sequence: u32,
    period: Duration,
    handle: Option<TimerHandle>,
    destroyed: bool,
}

/// Periodic `BEACON` sender.
pub struct BeaconEmitter {
    transport: Arc<dyn Transport>,
    timer: Arc<Timer>,
    server_port: u16,
    address: Ipv4Addr,
    max_period: Duration,
    state: Mutex<State>,
    this: Weak<Self>,
}

impl BeaconEmitter {
    /// Emitter announcing `address:server_port` over `transport`. An
    /// unspecified `address` lets receivers use the datagram source.
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        timer: Arc<Timer>,
        server_port: u16,
        address: Ipv4Addr,
        max_period: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            transport,
            timer,
            server_port,
            address,
            max_period: max_period.max(MIN_BEACON_PERIOD),
            state: Mutex::new(State {
                sequence: 0,
                period: MIN_BEACON_PERIOD,
                handle: None,
                destroyed: false,
            }),
            this: Weak::clone(this),
        })
    }

    /// Schedules the first beacon.
    ///
    /// # Errors
    ///
    /// [`TimerError::Shutdown`] if the timer is stopped.
    pub fn start(&self) -> Result<(), TimerError> {
        let mut state = self.state.lock();
        if state.destroyed || state.handle.is_some() {
            return Ok(());
        }
        let delay = state.period;
        state.handle = Some(self.schedule(delay)?);
        debug!(port = self.server_port, max_period = ?self.max_period, "beacon emitter started");
        Ok(())
    }

    /// Cancels the pending beacon. Idempotent.
    pub fn destroy(&self) {
        let mut state = self.state.lock();
        state.destroyed = true;
        if let Some(handle) = state.handle.take() {
            handle.cancel();
        }
    }

    /// Sequence id of the next beacon.
    #[must_use]
    pub fn sequence(&self) -> u32 {
        self.state.lock().sequence
    }

    /// Delay before the beacon after the next one.
    #[must_use]
    pub fn period(&self) -> Duration {
        self.state.lock().period
    }

    fn schedule(&self, delay: Duration) -> Result<TimerHandle, TimerError> {
        let this = Weak::clone(&self.this);
        self.timer.schedule_after(delay, move |_| {
            if let Some(emitter) = this.upgrade() {
                emitter.fire();
            }
        })
    }

    fn fire(&self) {
        let mut state = self.state.lock();
        if state.destroyed {
            return;
        }

        let beacon = Message::beacon(state.sequence, self.server_port, self.address);
        if let Err(e) = self.transport.submit(&beacon, SendPriority::Immediate) {
            warn!(error = %e, sequence = state.sequence, "failed to send beacon");
        }

        state.sequence = state.sequence.wrapping_add(1);
        if state.period < self.max_period {
            state.period = (state.period * 2).min(self.max_period);
        }

        let delay = state.period;
        match self.schedule(delay) {
            Ok(handle) => state.handle = Some(handle),
            Err(e) => {
                debug!(error = %e, "beacon emitter stopped");
                state.handle = None;
            }
        }
    }
}
