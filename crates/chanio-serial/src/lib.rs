//! Serial port transport built on Tokio and `tokio-serial`, wired on top
//! of the runtime-agnostic primitives in `chanio-core`.

pub mod channel;

pub use channel::{SerialChannel, SerialChannelBuilder, SerialConfig};
