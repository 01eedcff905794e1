//! # chanio-core
//!
//! Runtime-agnostic pieces shared by every `chanio` transport: the
//! `LinkState` machine and stop contract, the per-connection write
//! pipeline and backpressure policy, the reconnection policy trait, the
//! callback context types, and configuration validation.
//!
//! This crate issues no I/O of its own — it is the contract layer a
//! Tokio-backed transport crate (`chanio-tcp`, `chanio-serial`) builds on
//! without owning a socket type itself.

pub mod backpressure;
pub mod callbacks;
pub mod context;
pub mod error;
pub mod framer;
pub mod reconnect;
pub mod runtime;
pub mod state;
pub mod stop;
pub mod validate;

pub use backpressure::{EnqueueOutcome, WriteQueue};
pub use callbacks::Callbacks;
pub use context::{ConnectionContext, ErrorContext, MessageContext, SINGLE_CHANNEL_CLIENT_ID};
pub use error::{ChannelError, ErrorKind, ValidationError};
pub use framer::{Framer, RawPassthrough};
pub use reconnect::{AttemptCounter, CustomPolicy, ExponentialBackoff, FixedInterval, ReconnectPolicy, RetryDecision};
pub use runtime::{Clock, StateDebouncer, SystemClock};
pub use state::{AtomicLinkState, LinkState};
pub use stop::StopFlag;

/// Client-limit policy a server builder can select.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientLimit {
    Single,
    Capped(u32),
    Unlimited,
}

impl ClientLimit {
    /// `0` means unlimited, `1` single-client, `N>1` capped.
    pub fn from_max_connections(max_connections: u32) -> Self {
        match max_connections {
            0 => ClientLimit::Unlimited,
            1 => ClientLimit::Single,
            n => ClientLimit::Capped(n),
        }
    }

    pub fn limit(&self) -> Option<u32> {
        match self {
            ClientLimit::Single => Some(1),
            ClientLimit::Capped(n) => Some(*n),
            ClientLimit::Unlimited => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_limit_from_max_connections() {
        assert_eq!(ClientLimit::from_max_connections(0), ClientLimit::Unlimited);
        assert_eq!(ClientLimit::from_max_connections(1), ClientLimit::Single);
        assert_eq!(ClientLimit::from_max_connections(5), ClientLimit::Capped(5));
        assert_eq!(ClientLimit::Capped(5).limit(), Some(5));
        assert_eq!(ClientLimit::Unlimited.limit(), None);
    }
}
