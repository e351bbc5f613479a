//! Protocol status codes carried in error messages.
//!
//! On the wire a status is packed as `(code << 3) | severity`; see
//! [`Status::status_code`].

use std::fmt;

/// Severity class of a [`Status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Severity {
    Warning = 0,
    Success = 1,
    Error = 2,
    Info = 3,
    Severe = 4,
    Fatal = 6,
}

impl Severity {
    /// Whether the severity reports a successful outcome.
    #[must_use]
    pub const fn is_successful(self) -> bool {
        matches!(self, Self::Success | Self::Info)
    }
}

/// What the owner of a pending request should do with a remote error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The remote resource is gone for good; cancel the request.
    Cancel,
    /// The circuit dropped; keep the request and re-issue it on reconnect.
    Resubscribe,
    /// The remote side gave up waiting.
    Timeout,
    /// Any other failure; complete the request with the error.
    Fail,
}

macro_rules! statuses {
    ($($variant:ident = $code:literal, $severity:ident, $msg:literal;)*) => {
        /// Protocol status.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Status {
            $($variant,)*
        }

        impl Status {
            /// Numeric status code (without severity bits).
            #[must_use]
            pub const fn code(self) -> u16 {
                match self {
                    $(Self::$variant => $code,)*
                }
            }

            #[must_use]
            pub const fn severity(self) -> Severity {
                match self {
                    $(Self::$variant => Severity::$severity,)*
                }
            }

            /// Short description suitable for log output.
            #[must_use]
            pub const fn message(self) -> &'static str {
                match self {
                    $(Self::$variant => $msg,)*
                }
            }

            /// Looks a status up by its numeric code.
            #[must_use]
            pub const fn from_code(code: u16) -> Option<Self> {
                match code {
                    $($code => Some(Self::$variant),)*
                    _ => None,
                }
            }
        }
    };
}

statuses! {
    Normal = 0, Success, "normal successful completion";
    MaxIoc = 1, Error, "maximum simultaneous IOC connections exceeded";
    UnknownHost = 2, Error, "unknown internet host";
    UnknownService = 3, Error, "unknown internet service";
    Socket = 4, Error, "unable to allocate a new socket";
    Connect = 5, Warning, "unable to connect to internet host or service";
    AllocMemory = 6, Warning, "unable to allocate additional dynamic memory";
    UnknownChannel = 7, Warning, "unknown IO channel";
    UnknownField = 8, Warning, "record field inappropriate for channel";
    TooLarge = 9, Warning, "requested transfer is greater than available memory";
    Timeout = 10, Warning, "user specified timeout on IO operation expired";
    NoSupport = 11, Warning, "feature is not supported";
    StringTooBig = 12, Warning, "supplied string is unusually large";
    DisconnectedChannel = 13, Error, "request ignored because the channel is disconnected";
    BadType = 14, Error, "data type specified is invalid";
    ChannelNotFound = 15, Info, "remote channel not found";
    ChannelRetry = 16, Info, "unable to locate all user specified channels";
    Internal = 17, Fatal, "internal failure";
    DbLocalFail = 18, Warning, "local DB operation failed";
    GetFail = 19, Warning, "could not perform a database value get";
    PutFail = 20, Warning, "could not perform a database value put";
    AddFail = 21, Warning, "could not perform a database monitor add";
    BadCount = 22, Warning, "count requested inappropriate for that channel";
    BadString = 23, Error, "supplied string has improper format";
    Disconnected = 24, Warning, "virtual circuit disconnect";
    DoubleChannel = 25, Warning, "identical process variable name on multiple servers";
    EventDisallowed = 26, Error, "routine is inappropriate inside an event handler";
    BuildGet = 27, Warning, "database value get failed during channel search";
    NeedsFp = 28, Warning, "unable to initialize without floating point task option";
    OverflowEventFail = 29, Warning, "event queue overflow prevented first pass event";
    BadMonitorId = 30, Error, "bad monitor subscription identifier";
    NewAddress = 31, Warning, "remote channel has new network address";
    NewConnection = 32, Info, "new or resumed network connection";
    NoContext = 33, Warning, "task is not a member of a context";
    Defunct = 34, Fatal, "attempt to use defunct feature failed";
    EmptyString = 35, Warning, "supplied string is empty";
    NoRepeater = 36, Warning, "unable to spawn the repeater, auto reconnect will fail";
    NoChannelMessage = 37, Warning, "no channel id match for search reply";
    DeadlockReset = 38, Warning, "resetting dead connection, will try to reconnect";
    ServerBehind = 39, Warning, "server has fallen behind or is not responding";
    NoBroadcast = 40, Warning, "no internet interface with broadcast available";
    BadMask = 41, Error, "monitor selection mask is empty or inappropriate";
    IoDone = 42, Info, "IO operations have completed";
    IoInProgress = 43, Info, "IO operations are in progress";
    BadSyncGroup = 44, Error, "invalid synchronous group identifier";
    PutCallbackInProgress = 45, Error, "put callback timed out";
    NoReadAccess = 46, Warning, "read access denied";
    NoWriteAccess = 47, Warning, "write access denied";
    Anachronism = 48, Error, "anachronistic feature is no longer supported";
    NoSearchAddress = 49, Warning, "search/beacon address list was empty";
    NoConvert = 50, Warning, "data conversion between client and server types failed";
    BadChannelId = 51, Error, "invalid channel identifier";
    BadFunctionPointer = 52, Error, "invalid function pointer";
    IsAttached = 53, Warning, "thread is already attached to a client context";
    UnavailableInService = 54, Warning, "no support in service";
    ChannelDestroyed = 55, Warning, "user destroyed channel";
    BadPriority = 56, Error, "priority out of range";
    NotThreaded = 57, Error, "preemptive callback not enabled";
    Array16kClient = 58, Warning, "client revision does not support transfers over 16k";
    ConnectSequenceTimeout = 59, Warning, "virtual circuit connection sequence aborted";
    Unresponsive = 60, Warning, "virtual circuit connection unresponsive";
}

impl Status {
    /// Packs code and severity the way error messages carry them.
    #[must_use]
    pub const fn status_code(self) -> u32 {
        (((self.code() as u32) << 3) & 0xFFF8) | (self.severity() as u32 & 0x07)
    }

    /// Unpacks a wire status code, ignoring the severity bits.
    #[must_use]
    pub const fn from_status_code(value: u32) -> Option<Self> {
        Self::from_code(((value & 0xFFF8) >> 3) as u16)
    }

    /// Classifies a remote-reported status for the owning request.
    #[must_use]
    pub const fn disposition(self) -> Disposition {
        match self {
            Self::ChannelDestroyed | Self::BadChannelId => Disposition::Cancel,
            Self::Disconnected
            | Self::DisconnectedChannel
            | Self::Unresponsive
            | Self::DeadlockReset => Disposition::Resubscribe,
            Self::Timeout | Self::PutCallbackInProgress => Disposition::Timeout,
            _ => Disposition::Fail,
        }
    }

    #[must_use]
    pub const fn is_successful(self) -> bool {
        self.severity().is_successful()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message(), self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_code_packs_severity() {
        assert_eq!(Status::Normal.status_code(), 1);
        assert_eq!(Status::Timeout.status_code(), 10 << 3);
        assert_eq!(Status::Internal.status_code(), (17 << 3) | 6);
        assert_eq!(Status::from_status_code((55 << 3) | 7), Some(Status::ChannelDestroyed));
        assert_eq!(Status::from_status_code(61 << 3), None);
    }

    #[test]
    fn every_code_maps_back() {
        for code in 0..=60u16 {
            let status = Status::from_code(code).unwrap();
            assert_eq!(status.code(), code);
            assert_eq!(Status::from_status_code(status.status_code()), Some(status));
        }
    }

    #[test]
    fn remote_errors_are_classified() {
        assert_eq!(Status::ChannelDestroyed.disposition(), Disposition::Cancel);
        assert_eq!(Status::Disconnected.disposition(), Disposition::Resubscribe);
        assert_eq!(Status::Unresponsive.disposition(), Disposition::Resubscribe);
        assert_eq!(Status::Timeout.disposition(), Disposition::Timeout);
        assert_eq!(Status::GetFail.disposition(), Disposition::Fail);
        assert!(Status::ChannelNotFound.is_successful());
        assert!(!Status::BadType.is_successful());
    }
}
