//! Callback context records passed to user callbacks.

use crate::error::ErrorKind;
use bytes::Bytes;

/// `client_id` is fixed at `0` for client/serial channels where it is not
/// meaningful.
pub const SINGLE_CHANNEL_CLIENT_ID: u64 = 0;

#[derive(Debug, Clone)]
pub struct MessageContext {
    pub client_id: u64,
    pub data: Bytes,
    pub remote_address: String,
}

#[derive(Debug, Clone)]
pub struct ConnectionContext {
    pub client_id: u64,
    pub client_info: String,
}

#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub code: ErrorKind,
    pub message: String,
    pub client_id: Option<u64>,
}
