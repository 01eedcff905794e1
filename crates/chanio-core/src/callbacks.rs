//! Callback slots shared by every transport: replaceable, never invoked
//! concurrently with themselves, and gated by the stop flag.
//!
//! Invoking a callback must never happen while the channel's *state* lock
//! is held — only the slot's own lock is taken, and only for the duration
//! of the call itself.

use crate::context::{ConnectionContext, ErrorContext, MessageContext};
use crate::state::LinkState;
use crate::stop::StopFlag;
use parking_lot::Mutex;

type BytesCb = Box<dyn FnMut(MessageContext) + Send>;
type StateCb = Box<dyn FnMut(LinkState) + Send>;
type BackpressureCb = Box<dyn FnMut(usize) + Send>;
type ConnectCb = Box<dyn FnMut(ConnectionContext) + Send>;
type DisconnectCb = Box<dyn FnMut(ConnectionContext) + Send>;
type ErrorCb = Box<dyn FnMut(ErrorContext) + Send>;

/// The callback surface a single channel exposes: data, state transitions,
/// errors, and typed connect/disconnect events.
#[derive(Default)]
pub struct Callbacks {
    on_bytes: Mutex<Option<BytesCb>>,
    on_state: Mutex<Option<StateCb>>,
    on_backpressure: Mutex<Option<BackpressureCb>>,
    on_connect: Mutex<Option<ConnectCb>>,
    on_disconnect: Mutex<Option<DisconnectCb>>,
    on_error: Mutex<Option<ErrorCb>>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_on_bytes(&self, cb: impl FnMut(MessageContext) + Send + 'static) {
        *self.on_bytes.lock() = Some(Box::new(cb));
    }

    pub fn set_on_state(&self, cb: impl FnMut(LinkState) + Send + 'static) {
        *self.on_state.lock() = Some(Box::new(cb));
    }

    pub fn set_on_backpressure(&self, cb: impl FnMut(usize) + Send + 'static) {
        *self.on_backpressure.lock() = Some(Box::new(cb));
    }

    pub fn set_on_connect(&self, cb: impl FnMut(ConnectionContext) + Send + 'static) {
        *self.on_connect.lock() = Some(Box::new(cb));
    }

    pub fn set_on_disconnect(&self, cb: impl FnMut(ConnectionContext) + Send + 'static) {
        *self.on_disconnect.lock() = Some(Box::new(cb));
    }

    pub fn set_on_error(&self, cb: impl FnMut(ErrorContext) + Send + 'static) {
        *self.on_error.lock() = Some(Box::new(cb));
    }

    pub fn emit_bytes(&self, stop: &StopFlag, ctx: MessageContext) {
        if stop.is_set() {
            return;
        }
        if let Some(cb) = self.on_bytes.lock().as_mut() {
            cb(ctx);
        }
    }

    pub fn emit_state(&self, stop: &StopFlag, state: LinkState) {
        if stop.is_set() {
            return;
        }
        if let Some(cb) = self.on_state.lock().as_mut() {
            cb(state);
        }
    }

    pub fn emit_backpressure(&self, stop: &StopFlag, queued_bytes: usize) {
        if stop.is_set() {
            return;
        }
        if let Some(cb) = self.on_backpressure.lock().as_mut() {
            cb(queued_bytes);
        }
    }

    pub fn emit_connect(&self, stop: &StopFlag, ctx: ConnectionContext) {
        if stop.is_set() {
            return;
        }
        if let Some(cb) = self.on_connect.lock().as_mut() {
            cb(ctx);
        }
    }

    pub fn emit_disconnect(&self, stop: &StopFlag, ctx: ConnectionContext) {
        if stop.is_set() {
            return;
        }
        if let Some(cb) = self.on_disconnect.lock().as_mut() {
            cb(ctx);
        }
    }

    pub fn emit_error(&self, stop: &StopFlag, ctx: ErrorContext) {
        if stop.is_set() {
            return;
        }
        if let Some(cb) = self.on_error.lock().as_mut() {
            cb(ctx);
        }
    }

    /// Delivers the single terminal state notification a `stop()` call
    /// emits as its last step, bypassing the stop-flag gate. By the time
    /// `stop()` reaches this point the flag is already set (that's how it
    /// stays idempotent), so the normal `emit_state` would wrongly
    /// swallow the very notification `stop()` is supposed to guarantee.
    /// Callers are responsible for only invoking this once per channel.
    pub fn notify_terminal_state(&self, state: LinkState) {
        if let Some(cb) = self.on_state.lock().as_mut() {
            cb(state);
        }
    }

    /// Delivers a session's final disconnect notification unconditionally.
    /// Used for server-initiated shutdown, where every still-open session
    /// must still observe its own disconnect even though the server's
    /// shared stop flag is already set (see `notify_terminal_state`).
    pub fn notify_terminal_disconnect(&self, ctx: ConnectionContext) {
        if let Some(cb) = self.on_disconnect.lock().as_mut() {
            cb(ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn no_callback_fires_after_stop() {
        let callbacks = Callbacks::new();
        let stop = StopFlag::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        callbacks.set_on_state(move |_| {
            hits2.fetch_add(1, Ordering::SeqCst);
        });

        callbacks.emit_state(&stop, LinkState::Connecting);
        stop.set();
        callbacks.emit_state(&stop, LinkState::Closed);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
