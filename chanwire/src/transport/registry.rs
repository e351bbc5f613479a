//! Live transports keyed by remote address and priority.
//!
//! At most one transport exists per `(address, priority)`. Lookups are safe
//! from any thread.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;

use super::Transport;

/// Registry of live transports.
pub struct TransportRegistry<T: Transport + ?Sized = dyn Transport> {
    by_address: Mutex<HashMap<SocketAddr, HashMap<u16, Arc<T>>>>,
}

impl<T: Transport + ?Sized> TransportRegistry<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            by_address: Mutex::new(HashMap::new()),
        }
    }

    /// Stores `transport` under its address and priority, returning the
    /// transport it replaced.
    pub fn put(&self, transport: Arc<T>) -> Option<Arc<T>> {
        let address = transport.remote_address();
        let priority = transport.priority();
        self.by_address
            .lock()
            .entry(address)
            .or_default()
            .insert(priority, transport)
    }

    #[must_use]
    pub fn get(&self, address: SocketAddr, priority: u16) -> Option<Arc<T>> {
        self.by_address
            .lock()
            .get(&address)
            .and_then(|priorities| priorities.get(&priority))
            .cloned()
    }

    /// Every transport to `address`, whatever its priority.
    #[must_use]
    pub fn get_all(&self, address: SocketAddr) -> Vec<Arc<T>> {
        self.by_address
            .lock()
            .get(&address)
            .map(|priorities| priorities.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn remove(&self, address: SocketAddr, priority: u16) -> Option<Arc<T>> {
        let mut by_address = self.by_address.lock();
        let priorities = by_address.get_mut(&address)?;
        let removed = priorities.remove(&priority);
        if priorities.is_empty() {
            by_address.remove(&address);
        }
        removed
    }

    /// Removes `transport` only if it is the one registered under its key.
    ///
    /// A closing transport uses this so it cannot evict a replacement that
    /// was registered meanwhile.
    pub fn remove_transport(&self, transport: &T) -> bool {
        let address = transport.remote_address();
        let priority = transport.priority();

        let mut by_address = self.by_address.lock();
        let Some(priorities) = by_address.get_mut(&address) else {
            return false;
        };
        let this: *const T = transport;
        let registered = priorities
            .get(&priority)
            .is_some_and(|current| std::ptr::addr_eq(Arc::as_ptr(current), this));
        if registered {
            priorities.remove(&priority);
            if priorities.is_empty() {
                by_address.remove(&address);
            }
        }
        registered
    }

    #[must_use]
    pub fn all(&self) -> Vec<Arc<T>> {
        self.by_address
            .lock()
            .values()
            .flat_map(|priorities| priorities.values().cloned())
            .collect()
    }

    /// Empties the registry, handing back what it held.
    pub fn clear(&self) -> Vec<Arc<T>> {
        std::mem::take(&mut *self.by_address.lock())
            .into_values()
            .flat_map(HashMap::into_values)
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_address.lock().values().map(HashMap::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_address.lock().is_empty()
    }
}

impl<T: Transport + ?Sized> Default for TransportRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::protocol::{MINOR_REVISION, Message};
    use crate::transport::{Protocol, SendPriority, TransportError};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Transport double recording what it is told.
    #[derive(Default)]
    pub(crate) struct Recording {
        pub(crate) address: Option<SocketAddr>,
        pub(crate) priority: u16,
        pub(crate) sent: parking_lot::Mutex<Vec<Message>>,
        pub(crate) beacons: AtomicUsize,
        pub(crate) anomalies: AtomicUsize,
        pub(crate) echoes: AtomicUsize,
        pub(crate) revision: std::sync::atomic::AtomicU16,
        pub(crate) closed: AtomicBool,
    }

    impl Recording {
        pub(crate) fn to(address: &str, priority: u16) -> Arc<Self> {
            Arc::new(Self {
                address: Some(address.parse().unwrap()),
                priority,
                revision: std::sync::atomic::AtomicU16::new(MINOR_REVISION),
                ..Self::default()
            })
        }
    }

    impl Transport for Recording {
        fn submit(&self, message: &Message, _: SendPriority) -> Result<(), TransportError> {
            self.sent.lock().push(message.clone());
            Ok(())
        }

        fn flush(&self) -> bool {
            true
        }

        fn remote_address(&self) -> SocketAddr {
            self.address.unwrap_or_else(|| "0.0.0.0:0".parse().unwrap())
        }

        fn minor_revision(&self) -> u16 {
            self.revision.load(Ordering::SeqCst)
        }

        fn set_minor_revision(&self, revision: u16) {
            self.revision.store(revision, Ordering::SeqCst);
        }

        fn priority(&self) -> u16 {
            self.priority
        }

        fn protocol(&self) -> Protocol {
            Protocol::Stream
        }

        fn close(&self, _forced: bool) {
            self.closed.store(true, Ordering::SeqCst);
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        fn beacon_arrival(&self) {
            self.beacons.fetch_add(1, Ordering::SeqCst);
        }

        fn beacon_anomaly(&self) {
            self.anomalies.fetch_add(1, Ordering::SeqCst);
        }

        fn echo_received(&self) {
            self.echoes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn one_transport_per_address_and_priority() {
        let registry: TransportRegistry<Recording> = TransportRegistry::new();
        let first = Recording::to("10.0.0.1:5064", 0);
        let second = Recording::to("10.0.0.1:5064", 0);

        assert!(registry.put(Arc::clone(&first)).is_none());
        let replaced = registry.put(Arc::clone(&second)).unwrap();
        assert!(Arc::ptr_eq(&replaced, &first));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn lookup_by_address_spans_priorities() {
        let registry: TransportRegistry<Recording> = TransportRegistry::new();
        registry.put(Recording::to("10.0.0.1:5064", 0));
        registry.put(Recording::to("10.0.0.1:5064", 99));
        registry.put(Recording::to("10.0.0.2:5064", 0));

        let address = "10.0.0.1:5064".parse().unwrap();
        assert_eq!(registry.get_all(address).len(), 2);
        assert!(registry.get(address, 99).is_some());
        assert!(registry.get(address, 1).is_none());
        assert_eq!(registry.all().len(), 3);

        assert!(registry.remove(address, 0).is_some());
        assert!(registry.remove(address, 0).is_none());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn stale_transport_cannot_evict_replacement() {
        let registry: TransportRegistry<Recording> = TransportRegistry::new();
        let stale = Recording::to("10.0.0.1:5064", 0);
        let fresh = Recording::to("10.0.0.1:5064", 0);
        registry.put(Arc::clone(&stale));
        registry.put(Arc::clone(&fresh));

        assert!(!registry.remove_transport(&stale));
        assert!(registry.remove_transport(&fresh));
        assert!(registry.is_empty());
    }

    #[test]
    fn clear_returns_everything() {
        let registry: TransportRegistry = TransportRegistry::new();
        registry.put(Recording::to("10.0.0.1:5064", 0) as Arc<dyn Transport>);
        registry.put(Recording::to("10.0.0.3:5064", 2) as Arc<dyn Transport>);

        assert_eq!(registry.clear().len(), 2);
        assert!(registry.is_empty());
    }
}
