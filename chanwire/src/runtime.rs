//! Threads that drive the engine: the reactor, its leader/followers pool and
//! the timer.
//!
//! # Architecture
//!
//! ```text
//!            ┌────────────────────── LeaderFollowers pool ─────────────────────┐
//!            │  leader ──► Reactor::process() ──► one ready key               │
//!            │                 │                                              │
//!            │                 └─► disable key ─► promote follower ─► handler │
//!            │                                                   └─► enable   │
//!            └─────────────────────────────────────────────────────────────────┘
//!  Timer thread: beacon emission, connection watchdogs, request timeouts
//! ```
//!
//! Only the reactor touches the OS multiplexer. Every other thread talks to
//! it through queued requests that are drained between waits.

pub mod leader_followers;
pub mod reactor;
pub mod timer;

pub use leader_followers::{LeaderFollowers, PoolError};
pub use reactor::{Key, Ops, Reactor, ReactorError, ReactorHandler};
pub use timer::{Timer, TimerError, TimerHandle};
