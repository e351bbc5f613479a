//! Connection liveness state.
//!
//! The stream transport arms a watchdog on the timer. When it fires without
//! a probe outstanding, an echo is sent; when it fires with the probe still
//! unanswered, the connection is declared unresponsive. Echo replies and
//! server beacons push the next check out again.
//!
//! ```text
//!            timeout                     timeout
//!   Idle ───────────────► Probing ───────────────► Probing + Unresponsive
//!    ▲                       │                              │
//!    └──────── echo ─────────┘ ◄────── echo (re-probe) ─────┘
//! ```
//!
//! This module only holds the state; the transport acts on what it returns.

/// What the transport should do after the watchdog fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutAction {
    /// Send a probe and re-arm with the echo timeout.
    SendProbe,
    /// The probe went unanswered; notify clients.
    BecameUnresponsive,
    /// Still unresponsive, nothing new to report.
    Nothing,
}

/// What the transport should do after an echo arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoAction {
    /// No probe was outstanding.
    Ignore,
    /// The echo answers a probe that already timed out; probe again to
    /// confirm the link is back.
    Reprobe,
    /// Re-arm with the connection timeout. `recovered` is set when the
    /// transport was unresponsive before.
    Rearm { recovered: bool },
}

/// Probe bookkeeping for one connection.
#[derive(Debug, Default)]
pub struct Liveness {
    probe_pending: bool,
    probe_timed_out: bool,
    unresponsive: bool,
}

impl Liveness {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_timeout(&mut self) -> TimeoutAction {
        if !self.probe_pending {
            return TimeoutAction::SendProbe;
        }
        self.probe_timed_out = true;
        if self.unresponsive {
            TimeoutAction::Nothing
        } else {
            self.unresponsive = true;
            TimeoutAction::BecameUnresponsive
        }
    }

    /// A probe was handed to the transport. Peers that cannot echo get a
    /// version message instead and are never waited for.
    pub fn on_probe_sent(&mut self, expects_reply: bool) {
        self.probe_timed_out = false;
        self.probe_pending = expects_reply;
    }

    pub fn on_probe_failed(&mut self) {
        self.probe_pending = false;
    }

    pub fn on_echo(&mut self) -> EchoAction {
        if !self.probe_pending {
            return EchoAction::Ignore;
        }
        if self.probe_timed_out {
            return EchoAction::Reprobe;
        }
        self.probe_pending = false;
        let recovered = std::mem::take(&mut self.unresponsive);
        EchoAction::Rearm { recovered }
    }

    /// Whether a beacon from the peer should push the watchdog out.
    #[must_use]
    pub const fn rearm_on_beacon(&self) -> bool {
        !self.probe_pending
    }

    #[must_use]
    pub const fn is_unresponsive(&self) -> bool {
        self.unresponsive
    }

    #[must_use]
    pub const fn is_probe_pending(&self) -> bool {
        self.probe_pending
    }
}
