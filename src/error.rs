//! Opaque error surface.
//!
//! Internally every fallible operation uses a `snafu`-derived enum per
//! module so we keep `?`-propagation and `source()` chaining. Externally,
//! callers only ever need a stable code plus a human string, which is what
//! [`ErrorCode`] and [`CoreError::message`] give them -- nothing in this
//! crate exposes a multi-layer context-wrapping facility, matching the
//! "opaque error value with a code and a message" contract external callers
//! are expected to use.
use std::fmt;

/// Coarse classification of a failure, stable across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Failed to create a kernel object (socket, pipe, poller).
    Creation,
    /// A syscall failed in a way that is not retryable.
    Io,
    /// The peer closed a stream connection.
    ConnectionClosed,
    /// A hostname or address literal could not be resolved.
    Resolve,
    /// Caller passed a value that violates an explicit invariant.
    InvalidArgument,
    /// The reactor or pool has already shut down.
    ShuttingDown,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::Creation => "creation",
            ErrorCode::Io => "io",
            ErrorCode::ConnectionClosed => "connection_closed",
            ErrorCode::Resolve => "resolve",
            ErrorCode::InvalidArgument => "invalid_argument",
            ErrorCode::ShuttingDown => "shutting_down",
        };
        f.write_str(s)
    }
}

/// Minimal trait every module's `snafu` error implements so callers can
/// treat errors from different subsystems uniformly.
pub trait CoreError: std::error::Error {
    /// Stable classification for programmatic handling.
    fn code(&self) -> ErrorCode;

    /// Human-readable description; identical to `Display` but named
    /// explicitly so it reads as part of the opaque `{code, message}`
    /// contract rather than an incidental trait impl.
    fn message(&self) -> String {
        self.to_string()
    }
}
