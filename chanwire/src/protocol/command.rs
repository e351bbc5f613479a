//! Wire command identifiers.
//!
//! Ids index the receive-side [`DispatchTable`](crate::dispatch::DispatchTable);
//! anything at or above [`TABLE_SIZE`] is unknown.

pub const VERSION: u16 = 0;
pub const EVENT_ADD: u16 = 1;
pub const EVENT_CANCEL: u16 = 2;
pub const READ: u16 = 3;
pub const WRITE: u16 = 4;
pub const SNAPSHOT: u16 = 5;
pub const SEARCH: u16 = 6;
pub const BUILD: u16 = 7;
pub const EVENTS_OFF: u16 = 8;
pub const EVENTS_ON: u16 = 9;
pub const READ_SYNC: u16 = 10;
pub const ERROR: u16 = 11;
pub const CLEAR_CHANNEL: u16 = 12;
pub const BEACON: u16 = 13;
pub const NOT_FOUND: u16 = 14;
pub const READ_NOTIFY: u16 = 15;
pub const READ_BUILD: u16 = 16;
pub const REPEATER_CONFIRM: u16 = 17;
pub const CREATE_CHANNEL: u16 = 18;
pub const WRITE_NOTIFY: u16 = 19;
pub const CLIENT_NAME: u16 = 20;
pub const HOST_NAME: u16 = 21;
pub const ACCESS_RIGHTS: u16 = 22;
pub const ECHO: u16 = 23;
pub const REPEATER_REGISTER: u16 = 24;
pub const SIGNAL: u16 = 25;
pub const CREATE_CHANNEL_FAILED: u16 = 26;
pub const CHANNEL_DISCONNECTED: u16 = 27;

/// Number of slots in a dispatch table.
pub const TABLE_SIZE: usize = 28;

/// Human-readable name for log output.
#[must_use]
pub const fn name(command: u16) -> &'static str {
    match command {
        VERSION => "VERSION",
        EVENT_ADD => "EVENT_ADD",
        EVENT_CANCEL => "EVENT_CANCEL",
        READ => "READ",
        WRITE => "WRITE",
        SNAPSHOT => "SNAPSHOT",
        SEARCH => "SEARCH",
        BUILD => "BUILD",
        EVENTS_OFF => "EVENTS_OFF",
        EVENTS_ON => "EVENTS_ON",
        READ_SYNC => "READ_SYNC",
        ERROR => "ERROR",
        CLEAR_CHANNEL => "CLEAR_CHANNEL",
        BEACON => "BEACON",
        NOT_FOUND => "NOT_FOUND",
        READ_NOTIFY => "READ_NOTIFY",
        READ_BUILD => "READ_BUILD",
        REPEATER_CONFIRM => "REPEATER_CONFIRM",
        CREATE_CHANNEL => "CREATE_CHANNEL",
        WRITE_NOTIFY => "WRITE_NOTIFY",
        CLIENT_NAME => "CLIENT_NAME",
        HOST_NAME => "HOST_NAME",
        ACCESS_RIGHTS => "ACCESS_RIGHTS",
        ECHO => "ECHO",
        REPEATER_REGISTER => "REPEATER_REGISTER",
        SIGNAL => "SIGNAL",
        CREATE_CHANNEL_FAILED => "CREATE_CHANNEL_FAILED",
        CHANNEL_DISCONNECTED => "CHANNEL_DISCONNECTED",
        _ => "UNKNOWN",
    }
}
