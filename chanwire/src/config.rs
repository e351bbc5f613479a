//! Context configuration.
//!
//! Every tunable of a [`Context`](crate::context::Context) lives in
//! [`ContextConfig`]. It derives serde so callers can load it from whatever
//! format they use; missing fields take their defaults.
//!
//! ```json
//! {
//!   "broadcast_addresses": ["10.0.0.255:5064"],
//!   "auto_broadcast": false,
//!   "beacon_period": { "secs": 30, "nanos": 0 },
//!   "monitor_policy": "replace"
//! }
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::beacon::emitter::DEFAULT_BEACON_PERIOD;
use crate::protocol::{DEFAULT_REPEATER_PORT, DEFAULT_SERVER_PORT, ECHO_TIMEOUT, MAX_TCP_RECV};
use crate::runtime::leader_followers::DEFAULT_POOL_SIZE;
use crate::sync::OverflowPolicy;
use crate::transport::SEND_THRESHOLD;
use crate::transport::connector::{CONNECT_ATTEMPTS, CONNECT_RETRY_DELAY, ConnectorOptions};
use crate::transport::stream::{DEFAULT_MAX_PAYLOAD, StreamOptions};

/// Invalid address list entry.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid address `{0}`")]
    Address(String),
}

/// Tunables for one protocol engine instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Port servers listen on; also the default for beacons without one.
    pub server_port: u16,
    pub repeater_port: u16,
    /// Register with the local discovery relay on startup.
    pub repeater_registration: bool,
    /// Local address of the datagram socket. Port 0 picks any.
    pub bind_address: SocketAddr,
    /// Explicit discovery destinations.
    pub broadcast_addresses: Vec<SocketAddr>,
    /// Add the limited broadcast address on the server port.
    pub auto_broadcast: bool,
    /// Hosts whose datagrams are dropped.
    pub ignore_addresses: Vec<IpAddr>,
    /// Beacon period ceiling.
    pub beacon_period: Duration,
    /// Idle time before a connection is probed.
    pub connection_timeout: Duration,
    /// Wait for the probe reply.
    pub echo_timeout: Duration,
    pub connect_timeout: Duration,
    /// Leader/followers threads, at least two.
    pub pool_size: usize,
    /// Bound on waiting for another thread's connect to the same server.
    pub lock_timeout: Duration,
    /// Largest payload accepted on a stream.
    pub max_payload: usize,
    /// Per-read buffer for stream transports.
    pub receive_buffer: usize,
    pub send_threshold: usize,
    /// Overflow behaviour of new subscriptions.
    pub monitor_policy: OverflowPolicy,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            server_port: DEFAULT_SERVER_PORT,
            repeater_port: DEFAULT_REPEATER_PORT,
            repeater_registration: true,
            bind_address: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            broadcast_addresses: Vec::new(),
            auto_broadcast: true,
            ignore_addresses: Vec::new(),
            beacon_period: DEFAULT_BEACON_PERIOD,
            connection_timeout: Duration::from_secs(30),
            echo_timeout: ECHO_TIMEOUT,
            connect_timeout: Duration::from_secs(5),
            pool_size: DEFAULT_POOL_SIZE,
            lock_timeout: Duration::from_secs(60),
            max_payload: DEFAULT_MAX_PAYLOAD,
            receive_buffer: MAX_TCP_RECV,
            send_threshold: SEND_THRESHOLD,
            monitor_policy: OverflowPolicy::default(),
        }
    }
}

impl ContextConfig {
    /// Explicit addresses plus, with `auto_broadcast`, the limited broadcast
    /// address. Duplicates are removed.
    #[must_use]
    pub fn broadcast_targets(&self) -> Vec<SocketAddr> {
        let mut targets = self.broadcast_addresses.clone();
        if self.auto_broadcast {
            targets.push(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::BROADCAST),
                self.server_port,
            ));
        }
        let mut seen = Vec::with_capacity(targets.len());
        targets.retain(|addr| {
            if seen.contains(addr) {
                false
            } else {
                seen.push(*addr);
                true
            }
        });
        targets
    }

    /// Per-connection settings derived from this config.
    #[must_use]
    pub fn stream_options(&self) -> StreamOptions {
        StreamOptions {
            max_payload: self.max_payload,
            receive_buffer: self.receive_buffer,
            send_threshold: self.send_threshold,
            connection_timeout: self.connection_timeout,
            echo_timeout: self.echo_timeout,
            ..StreamOptions::default()
        }
    }

    #[must_use]
    pub fn connector_options(&self) -> ConnectorOptions {
        ConnectorOptions {
            lock_timeout: self.lock_timeout,
            connect_timeout: self.connect_timeout,
            attempts: CONNECT_ATTEMPTS,
            retry_delay: CONNECT_RETRY_DELAY,
            stream: self.stream_options(),
        }
    }

    /// Appends the entries of a whitespace separated `host[:port]` list to
    /// the broadcast addresses. Entries without a port use `server_port`.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Address`] for the first entry that does not resolve;
    /// nothing is added in that case.
    pub fn add_broadcast_list(&mut self, list: &str) -> Result<(), ConfigError> {
        let parsed = parse_address_list(list, self.server_port)?;
        self.broadcast_addresses.extend(parsed);
        Ok(())
    }
}

/// Parses a whitespace separated `host[:port]` list.
///
/// # Errors
///
/// [`ConfigError::Address`] naming the first entry that does not resolve to
/// an IPv4 address.
pub fn parse_address_list(list: &str, default_port: u16) -> Result<Vec<SocketAddr>, ConfigError> {
    list.split_whitespace()
        .map(|entry| parse_address(entry, default_port))
        .collect()
}

fn parse_address(entry: &str, default_port: u16) -> Result<SocketAddr, ConfigError> {
    let invalid = || ConfigError::Address(entry.to_owned());
    let (host, port) = match entry.rsplit_once(':') {
        Some((host, port)) => (host, port.parse::<u16>().map_err(|_| invalid())?),
        None => (entry, default_port),
    };
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Ok(SocketAddr::new(IpAddr::V4(ip), port));
    }
    (host, port)
        .to_socket_addrs()
        .map_err(|_| invalid())?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(invalid)
}
