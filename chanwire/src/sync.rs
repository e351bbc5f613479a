//! Synchronization primitives shared by connection setup and subscriptions.
//!
//! - [`NamedLock`]: reference-counted, bounded-wait mutexes keyed by identity,
//!   used to serialize connect/disconnect sequences per remote address.
//! - [`MonitorQueue`]: bounded per-subscription event queue that sheds load
//!   by dropping history instead of blocking the network thread.

pub mod monitor_queue;
pub mod named_lock;

pub use monitor_queue::{MAX_QUEUE_SIZE, MonitorQueue, OverflowPolicy, Posted};
pub use named_lock::{NamedLock, NamedLockGuard};
