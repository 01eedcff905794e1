//! Exercises the composed stop contract using a
//! minimal in-process fake channel built only from `chanio_core` pieces —
//! no real transport involved. The TCP and serial crates re-exercise the
//! same properties end-to-end over real sockets/ports.

use chanio_core::{AtomicLinkState, Callbacks, EnqueueOutcome, ErrorContext, ErrorKind, LinkState, StopFlag, WriteQueue};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct FakeChannel {
    state: AtomicLinkState,
    stop: StopFlag,
    callbacks: Callbacks,
    queue: WriteQueue,
    terminal_notifications: Arc<AtomicUsize>,
}

impl FakeChannel {
    fn new(backpressure_threshold: usize) -> Self {
        let terminal_notifications = Arc::new(AtomicUsize::new(0));
        let callbacks = Callbacks::new();
        let counter = terminal_notifications.clone();
        callbacks.set_on_state(move |state| {
            if state.is_terminal() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        Self {
            state: AtomicLinkState::new(LinkState::Idle),
            stop: StopFlag::new(),
            callbacks,
            queue: WriteQueue::new(backpressure_threshold),
            terminal_notifications,
        }
    }

    fn enqueue(&mut self, payload: &[u8]) {
        match self.queue.enqueue(bytes::Bytes::copy_from_slice(payload)) {
            EnqueueOutcome::Accepted { .. } => {}
            EnqueueOutcome::Rejected => {
                self.fail_fast(ErrorKind::BackpressureExceeded, "queue full");
            }
        }
    }

    fn fail_fast(&mut self, kind: ErrorKind, message: &str) {
        let previous = self.state.swap(LinkState::Error);
        if !previous.is_terminal() {
            self.callbacks.emit_error(
                &self.stop,
                ErrorContext { code: kind, message: message.to_string(), client_id: None },
            );
            self.callbacks.emit_state(&self.stop, LinkState::Error);
        }
        self.stop();
    }

    fn stop(&mut self) {
        if !self.stop.set() {
            return;
        }
        self.queue.drain();
        let previous = self.state.load();
        self.state.store(LinkState::Closed);
        if !previous.is_terminal() {
            // The stop flag is already set by this point (that's what keeps
            // `stop()` idempotent), so the notification must bypass the
            // normal gate or it would never reach the callback.
            self.callbacks.notify_terminal_state(LinkState::Closed);
        }
    }
}

#[test]
fn backpressure_breach_yields_exactly_one_terminal_notification_and_empty_queue() {
    let mut chan = FakeChannel::new(8);
    chan.enqueue(b"abcd");
    chan.enqueue(b"abcde"); // 4 + 5 = 9 > 8, rejected fail-fast.

    assert_eq!(chan.state.load(), LinkState::Closed);
    assert_eq!(chan.queue.queued_bytes(), 0);
    assert_eq!(chan.terminal_notifications.load(Ordering::SeqCst), 1);
}

#[test]
fn stop_is_idempotent_and_notifies_once() {
    let mut chan = FakeChannel::new(1024);
    chan.stop();
    chan.stop();
    chan.stop();
    assert_eq!(chan.terminal_notifications.load(Ordering::SeqCst), 1);
    assert!(chan.stop.is_set());
}

#[test]
fn no_callback_fires_after_stop_returns() {
    let mut chan = FakeChannel::new(1024);
    chan.stop();
    // A post-stop attempt to notify must be suppressed by the stop flag,
    // even though nothing in this fake prevents the call site from trying.
    chan.callbacks.emit_state(&chan.stop, LinkState::Error);
    assert_eq!(chan.terminal_notifications.load(Ordering::SeqCst), 1);
}
