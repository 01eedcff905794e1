//! Stable error taxonomy shared by every transport.
//!
//! `ErrorKind` is the tagged variant; `ChannelError` aggregates it with a
//! human-readable message and an optional session id.

use std::fmt;
use std::io;

/// Stable, matchable error categories surfaced to `on_error` callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum ErrorKind {
    #[error("invalid configuration")]
    InvalidConfiguration,
    #[error("failed to resolve host")]
    ResolveFailed,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("connection reset by peer")]
    ConnectionReset,
    #[error("connection aborted")]
    ConnectionAborted,
    #[error("operation timed out")]
    TimedOut,
    #[error("not connected")]
    NotConnected,
    #[error("port already in use")]
    PortInUse,
    #[error("access denied")]
    AccessDenied,
    #[error("I/O error")]
    IoError,
    #[error("backpressure threshold exceeded")]
    BackpressureExceeded,
    #[error("failed to start")]
    StartFailed,
    #[error("channel stopped")]
    Stopped,
    #[error("unknown error")]
    Unknown,
}

impl ErrorKind {
    /// Maps a raw `std::io::ErrorKind` to the closest `ErrorKind`; anything
    /// unrecognized maps to `IoError`.
    pub fn from_io(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::ConnectionRefused => ErrorKind::ConnectionRefused,
            io::ErrorKind::ConnectionReset => ErrorKind::ConnectionReset,
            io::ErrorKind::ConnectionAborted => ErrorKind::ConnectionAborted,
            io::ErrorKind::TimedOut => ErrorKind::TimedOut,
            io::ErrorKind::NotConnected => ErrorKind::NotConnected,
            io::ErrorKind::PermissionDenied => ErrorKind::AccessDenied,
            io::ErrorKind::AddrInUse => ErrorKind::PortInUse,
            _ => ErrorKind::IoError,
        }
    }
}

/// Aggregates `{ kind, message, client_id }` surfaced to error callbacks.
#[derive(Debug, Clone)]
pub struct ChannelError {
    kind: ErrorKind,
    message: String,
    client_id: Option<u64>,
}

impl ChannelError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), client_id: None }
    }

    pub fn with_client_id(mut self, client_id: u64) -> Self {
        self.client_id = Some(client_id);
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn client_id(&self) -> Option<u64> {
        self.client_id
    }

    /// True for the cancellation-shaped I/O errors that `stop()` must
    /// suppress rather than surface.
    pub fn is_cancellation(&self) -> bool {
        matches!(self.kind, ErrorKind::Stopped)
    }
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.client_id {
            Some(id) => write!(f, "[client {id}] {}: {}", self.kind, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for ChannelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

impl From<io::Error> for ChannelError {
    fn from(err: io::Error) -> Self {
        let kind = ErrorKind::from_io(err.kind());
        ChannelError::new(kind, err.to_string())
    }
}

/// Raised synchronously by a builder when configuration validation fails;
/// a validation failure never constructs a channel.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid value for `{field}`: {reason}")]
pub struct ValidationError {
    pub field: &'static str,
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self { field, reason: reason.into() }
    }
}
