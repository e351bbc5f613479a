//! Per-server beacon timing classifier.
//!
//! Servers broadcast beacons at a period that settles at a steady value.
//! Deviations from the learned period say something about the server or the
//! network between us:
//!
//! ```text
//!   current / average     meaning                          event
//!   ─────────────────     ───────────────────────────────  ──────────────────────────
//!   first beacon          server appeared                  Anomaly (no reset)
//!   second beacon         average seeded                   Arrival
//!   ≥ 3.25                beacons lost: restart/partition  Anomaly, reset average
//!   [1.25, 3.25)          still settling (not stabilized)  Arrival, average := current
//!                         or suspicious (stabilized)       Anomaly (no reset)
//!   ≤ 0.8                 server restarted (fast beacons)  Anomaly, reset average
//!   (0.8, 1.25)           steady                           Arrival, stabilized
//! ```
//!
//! Except after a reset, the average follows `0.125 × current + 0.875 ×
//! average`. Peers at minor revision 10 or later number their beacons;
//! duplicates from redundant routes and short forward jumps from overrun
//! input queues are discarded before any timing is looked at.

use std::time::Duration;

use crate::protocol::BEACON_SEQUENCE_MIN_REVISION;

/// Advances this close to 2^32 are late duplicates, not progress.
const LATE_WINDOW: u32 = 256;

const RESET_RATIO: f64 = 3.25;
const SLOW_RATIO: f64 = 1.25;
const FAST_RATIO: f64 = 0.8;
const NEW_WEIGHT: f64 = 0.125;
const OLD_WEIGHT: f64 = 0.875;

/// Classification of one beacon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeaconEvent {
    /// Normal arrival; the server is alive.
    Arrival,
    /// Unexpected timing. With `reset` the server most likely restarted or
    /// the network changed and connections should be revalidated.
    Anomaly { reset: bool },
    /// Duplicate or out-of-order beacon; no state was touched except the
    /// remembered sequence id.
    Discarded,
}

/// Beacon statistics for one server address.
#[derive(Debug, Default)]
pub struct BeaconHandler {
    last_timestamp: Option<Duration>,
    last_sequence: u32,
    average: Option<Duration>,
    stabilized: bool,
}

impl BeaconHandler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Classifies a beacon that arrived at `timestamp` (any monotonic
    /// origin) from a peer speaking `revision`.
    pub fn notify(&mut self, revision: u16, timestamp: Duration, sequence: u32) -> BeaconEvent {
        let sequenced = revision >= BEACON_SEQUENCE_MIN_REVISION;

        let Some(last_timestamp) = self.last_timestamp else {
            if sequenced {
                self.last_sequence = sequence;
            }
            self.last_timestamp = Some(timestamp);
            return BeaconEvent::Anomaly { reset: false };
        };

        if sequenced {
            let advance = sequence.wrapping_sub(self.last_sequence);
            self.last_sequence = sequence;
            if advance == 0 || advance > u32::MAX - LATE_WINDOW || (2..=3).contains(&advance) {
                return BeaconEvent::Discarded;
            }
        }

        let current = timestamp.saturating_sub(last_timestamp);
        self.last_timestamp = Some(timestamp);

        let Some(average) = self.average else {
            self.average = Some(current);
            return BeaconEvent::Arrival;
        };

        let (event, reset) = if current >= average.mul_f64(SLOW_RATIO) {
            if current >= average.mul_f64(RESET_RATIO) {
                (BeaconEvent::Anomaly { reset: true }, true)
            } else if !self.stabilized {
                self.average = Some(current);
                (BeaconEvent::Arrival, false)
            } else {
                (BeaconEvent::Anomaly { reset: false }, false)
            }
        } else if current <= average.mul_f64(FAST_RATIO) {
            (BeaconEvent::Anomaly { reset: true }, true)
        } else {
            self.stabilized = true;
            (BeaconEvent::Arrival, false)
        };

        if reset {
            self.stabilized = false;
            self.average = None;
        } else if let Some(average) = self.average {
            self.average = Some(current.mul_f64(NEW_WEIGHT) + average.mul_f64(OLD_WEIGHT));
        }
        event
    }

    /// Whether any beacon has been seen yet.
    #[must_use]
    pub const fn has_heard(&self) -> bool {
        self.last_timestamp.is_some()
    }

    /// Learned inter-beacon period, if one has been seeded.
    #[must_use]
    pub const fn average_period(&self) -> Option<Duration> {
        self.average
    }

    #[must_use]
    pub const fn is_stabilized(&self) -> bool {
        self.stabilized
    }
}
