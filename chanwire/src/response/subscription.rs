//! Long-lived monitor request feeding a bounded event queue.

use std::time::Duration;

use parking_lot::Mutex;

use super::{Completion, Ioid, ResponseRequest};
use crate::protocol::{Disposition, Header, Status};
use crate::sync::{MonitorQueue, OverflowPolicy, Posted};
use crate::trace::trace;

/// What a subscriber sees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    Update {
        data_type: u16,
        count: u32,
        payload: Vec<u8>,
    },
    /// The server reported a failure; the subscription is over.
    Error(Status),
    /// The connection went away; the subscription stays registered so it
    /// can be re-issued.
    Disconnected,
    Cancelled,
}

/// Monitor request. Stays registered across updates until cancelled or
/// failed.
///
/// Exactly one terminal event is posted; anything arriving after it is
/// dropped.
pub struct Subscription {
    events: MonitorQueue<MonitorEvent>,
    closed: Mutex<bool>,
}

impl Subscription {
    #[must_use]
    pub fn new(policy: OverflowPolicy) -> Self {
        Self {
            events: MonitorQueue::new(policy),
            closed: Mutex::new(false),
        }
    }

    /// Whether a terminal event has been posted.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }

    #[must_use]
    pub const fn events(&self) -> &MonitorQueue<MonitorEvent> {
        &self.events
    }

    #[must_use]
    pub fn take_timeout(&self, timeout: Duration) -> Option<MonitorEvent> {
        self.events.take_timeout(timeout)
    }

    fn post(&self, ioid: Ioid, event: MonitorEvent) {
        if let Posted::Dropped(dropped) = self.events.post(event) {
            trace!(%ioid, dropped, "slow subscriber, events dropped");
        }
    }

    /// Posts `events` unless the subscription is already closed; `last`
    /// closes it.
    fn post_all(&self, ioid: Ioid, events: &[MonitorEvent], last: bool) -> bool {
        let mut closed = self.closed.lock();
        if *closed {
            trace!(%ioid, "subscription closed, event dropped");
            return false;
        }
        for event in events {
            self.post(ioid, event.clone());
        }
        *closed = last;
        true
    }

    fn end(&self, ioid: Ioid, event: MonitorEvent) {
        self.post_all(ioid, &[event], true);
    }
}

impl ResponseRequest for Subscription {
    fn response(&self, ioid: Ioid, header: &Header, payload: &[u8]) -> Completion {
        // An empty update confirms the server dropped the subscription.
        if header.payload_size == 0 {
            self.end(ioid, MonitorEvent::Cancelled);
            return Completion::Done;
        }
        let event = match Status::from_status_code(header.parameter1) {
            Some(status) if !status.is_successful() => MonitorEvent::Error(status),
            _ => MonitorEvent::Update {
                data_type: header.data_type,
                count: header.data_count,
                payload: payload.to_vec(),
            },
        };
        if self.post_all(ioid, &[event], false) {
            Completion::Pending
        } else {
            Completion::Done
        }
    }

    fn exception(&self, ioid: Ioid, status: Status, _message: Option<&str>) -> Completion {
        match status.disposition() {
            Disposition::Cancel => {
                self.end(ioid, MonitorEvent::Cancelled);
                Completion::Done
            }
            Disposition::Resubscribe => {
                if self.post_all(ioid, &[MonitorEvent::Disconnected], false) {
                    Completion::Pending
                } else {
                    Completion::Done
                }
            }
            Disposition::Timeout | Disposition::Fail => {
                self.end(ioid, MonitorEvent::Error(status));
                Completion::Done
            }
        }
    }

    fn cancel(&self, ioid: Ioid) {
        self.end(ioid, MonitorEvent::Cancelled);
    }

    fn timeout(&self, ioid: Ioid) {
        // The cancel teardown, followed by the timeout status.
        self.post_all(
            ioid,
            &[MonitorEvent::Cancelled, MonitorEvent::Error(Status::Timeout)],
            true,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Message, command};
    use crate::sync::MAX_QUEUE_SIZE;

    fn update(value: u8) -> Message {
        Message::with_payload(
            Header {
                data_type: 5,
                data_count: 1,
                parameter1: Status::Normal.status_code(),
                ..Header::new(command::EVENT_ADD)
            },
            vec![value],
        )
    }

    fn deliver(subscription: &Subscription, message: &Message) -> Completion {
        subscription.response(Ioid(9), message.header(), message.payload())
    }

    #[test]
    fn updates_keep_the_subscription_alive() {
        let subscription = Subscription::new(OverflowPolicy::DropOldest);
        assert_eq!(deliver(&subscription, &update(1)), Completion::Pending);
        assert_eq!(deliver(&subscription, &update(2)), Completion::Pending);

        let values: Vec<u8> = subscription
            .events()
            .drain()
            .into_iter()
            .map(|event| match event {
                MonitorEvent::Update { payload, .. } => payload[0],
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(values, [1, 2]);
    }

    #[test]
    fn replace_policy_keeps_latest_only() {
        let subscription = Subscription::new(OverflowPolicy::Replace);
        for value in 0..10 {
            deliver(&subscription, &update(value));
        }
        assert_eq!(subscription.events().len(), 1);
        assert!(matches!(
            subscription.take_timeout(Duration::ZERO),
            Some(MonitorEvent::Update { payload, .. }) if payload[0] == 9
        ));
    }

    #[test]
    fn slow_consumer_is_bounded() {
        let subscription = Subscription::new(OverflowPolicy::DropOldest);
        for value in 0..=255u8 {
            deliver(&subscription, &update(value));
        }
        assert_eq!(subscription.events().len(), MAX_QUEUE_SIZE);
    }

    #[test]
    fn empty_update_ends_the_subscription() {
        let subscription = Subscription::new(OverflowPolicy::DropOldest);
        let confirm = Message::new(Header::new(command::EVENT_ADD));
        assert_eq!(deliver(&subscription, &confirm), Completion::Done);
        assert_eq!(
            subscription.take_timeout(Duration::ZERO),
            Some(MonitorEvent::Cancelled)
        );
    }

    #[test]
    fn disconnect_keeps_the_subscription_for_reissue() {
        let subscription = Subscription::new(OverflowPolicy::DropOldest);
        assert_eq!(
            subscription.exception(Ioid(9), Status::Disconnected, None),
            Completion::Pending
        );
        assert_eq!(
            subscription.exception(Ioid(9), Status::ChannelDestroyed, None),
            Completion::Done
        );
        assert_eq!(
            subscription.exception(Ioid(9), Status::BadType, None),
            Completion::Done
        );
        let events = subscription.events().drain();
        assert_eq!(
            events,
            [
                MonitorEvent::Disconnected,
                MonitorEvent::Cancelled,
                MonitorEvent::Error(Status::BadType)
            ]
        );
    }

    #[test]
    fn timeout_tears_down_like_a_cancel() {
        let subscription = Subscription::new(OverflowPolicy::DropOldest);
        deliver(&subscription, &update(1));
        subscription.timeout(Ioid(9));
        assert!(subscription.is_closed());

        let events = subscription.events().drain();
        assert_eq!(events.len(), 3);
        assert_eq!(
            events[1..],
            [MonitorEvent::Cancelled, MonitorEvent::Error(Status::Timeout)]
        );
    }

    #[test]
    fn nothing_follows_the_terminal_event() {
        let subscription = Subscription::new(OverflowPolicy::DropOldest);
        subscription.timeout(Ioid(9));
        subscription.events().drain();

        assert_eq!(deliver(&subscription, &update(1)), Completion::Done);
        assert_eq!(
            subscription.exception(Ioid(9), Status::Disconnected, None),
            Completion::Done
        );
        subscription.exception(Ioid(9), Status::BadType, None);
        subscription.cancel(Ioid(9));
        assert!(subscription.events().is_empty());
    }
}
