//! Bounded per-subscription event queue.
//!
//! Subscription updates arrive on the network thread and are consumed by
//! the application at its own pace. The queue never blocks the producer:
//! once [`MAX_QUEUE_SIZE`] events are waiting, [`OverflowPolicy::DropOldest`]
//! discards the oldest one to admit the newest, and
//! [`OverflowPolicy::Replace`] keeps only the latest event at all times.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

/// Upper bound on queued events per subscription.
pub const MAX_QUEUE_SIZE: usize = 100;

/// How a subscription sheds events under load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Keep the most recent [`MAX_QUEUE_SIZE`] events, in arrival order.
    #[default]
    DropOldest,
    /// Keep only the single most recent event.
    Replace,
}

/// Outcome of [`MonitorQueue::post`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Posted {
    Queued,
    /// The event was queued and this many older events were discarded.
    Dropped(usize),
}

/// Bounded FIFO of subscription events.
pub struct MonitorQueue<T> {
    policy: OverflowPolicy,
    capacity: usize,
    events: Mutex<VecDeque<T>>,
    available: Condvar,
}

impl<T> MonitorQueue<T> {
    #[must_use]
    pub fn new(policy: OverflowPolicy) -> Self {
        Self::with_capacity(policy, MAX_QUEUE_SIZE)
    }

    /// Queue with a custom bound. A zero capacity is treated as one.
    #[must_use]
    pub fn with_capacity(policy: OverflowPolicy, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let initial = match policy {
            OverflowPolicy::DropOldest => capacity,
            OverflowPolicy::Replace => 1,
        };
        Self {
            policy,
            capacity,
            events: Mutex::new(VecDeque::with_capacity(initial)),
            available: Condvar::new(),
        }
    }

    #[must_use]
    pub const fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Adds an event, shedding older ones according to the policy.
    pub fn post(&self, event: T) -> Posted {
        let mut events = self.events.lock();
        let dropped = match self.policy {
            OverflowPolicy::Replace => {
                let n = events.len();
                events.clear();
                n
            }
            OverflowPolicy::DropOldest => {
                let mut n = 0;
                while events.len() >= self.capacity {
                    events.pop_front();
                    n += 1;
                }
                n
            }
        };
        events.push_back(event);
        drop(events);
        self.available.notify_one();

        if dropped == 0 {
            Posted::Queued
        } else {
            Posted::Dropped(dropped)
        }
    }

    /// Removes the oldest event without waiting.
    pub fn try_take(&self) -> Option<T> {
        self.events.lock().pop_front()
    }

    /// Removes the oldest event, waiting up to `timeout` for one to arrive.
    pub fn take_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut events = self.events.lock();
        loop {
            if let Some(event) = events.pop_front() {
                return Some(event);
            }
            if self.available.wait_until(&mut events, deadline).timed_out() {
                return events.pop_front();
            }
        }
    }

    /// Removes and returns every queued event, oldest first.
    pub fn drain(&self) -> Vec<T> {
        self.events.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}
