//! Translates `std::io::Error` into the shared `ChannelError` taxonomy.

use chanio_core::{ChannelError, ErrorKind};
use std::io;

pub fn io_to_channel_error(err: io::Error) -> ChannelError {
    let kind = ErrorKind::from_io(err.kind());
    ChannelError::new(kind, err.to_string())
}
