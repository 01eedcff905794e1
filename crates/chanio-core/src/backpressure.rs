//! The per-connection write pipeline: a single-writer queue with byte
//! accounting and fail-fast backpressure.
//!
//! This module owns bookkeeping only; issuing the actual non-blocking
//! write against a socket or serial port is the transport's job (it calls
//! [`WriteQueue::front`] for the next payload and reports progress through
//! [`WriteQueue::advance`]), keeping this bookkeeping free of any concrete
//! transport and the Tokio-wired types built on top of it in the transport
//! crate.

use bytes::Bytes;
use std::collections::VecDeque;

/// Result of [`WriteQueue::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Accepted; `crossed_threshold` is set the first time `queued_bytes`
    /// reaches the configured ceiling after this enqueue (edge-triggered,
    /// the caller's backpressure callback).
    Accepted { crossed_threshold: bool },
    /// `new_total > backpressure_threshold`; the payload was **not**
    /// appended and the caller must fail the channel fast with
    /// `BackpressureExceeded`.
    Rejected,
}

/// Ordered sequence of pending payloads plus byte accounting. Payloads are
/// always `Bytes`: a transport's copy / move / shared enqueue methods only
/// differ in *how* the caller's data becomes a `Bytes` before reaching this
/// queue, not in how the queue itself stores or accounts for them —
/// `Bytes` is reference-counted, so a "shared" enqueue is simply a cheap
/// clone of one payload pushed onto N queues.
#[derive(Debug)]
pub struct WriteQueue {
    items: VecDeque<Bytes>,
    queued_bytes: usize,
    writing: bool,
    threshold: usize,
    armed: bool,
}

impl WriteQueue {
    pub fn new(backpressure_threshold: usize) -> Self {
        Self {
            items: VecDeque::new(),
            queued_bytes: 0,
            writing: false,
            threshold: backpressure_threshold,
            armed: false,
        }
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_writing(&self) -> bool {
        self.writing
    }

    /// At most one write may be in flight at a time: callers use this to
    /// decide whether to kick off a new write
    /// loop iteration; it is the only place `writing` is set.
    pub fn begin_write(&mut self) -> bool {
        if self.writing || self.items.is_empty() {
            return false;
        }
        self.writing = true;
        true
    }

    pub fn end_write(&mut self) {
        self.writing = false;
    }

    /// Accounts for a payload already entering the queue. `payload` has already
    /// been turned into an owned copy, a moved-in buffer, or a shared
    /// clone by the caller (the three enqueue forms); this only performs
    /// the byte-accounting and threshold check common to all three.
    pub fn enqueue(&mut self, payload: Bytes) -> EnqueueOutcome {
        let new_total = self.queued_bytes + payload.len();
        if new_total > self.threshold {
            return EnqueueOutcome::Rejected;
        }
        self.items.push_back(payload);
        self.queued_bytes = new_total;

        let crossed = !self.armed && self.queued_bytes >= self.threshold;
        if crossed {
            self.armed = true;
        }
        EnqueueOutcome::Accepted { crossed_threshold: crossed }
    }

    /// The item currently at the front of the queue, i.e. the next (or
    /// in-progress) write; items always leave in the order they arrived.
    pub fn front(&self) -> Option<&Bytes> {
        self.items.front()
    }

    /// Reports that `n` bytes of the front item were transmitted.
    /// `queued_bytes` is decremented atomically with the pop.
    ///
    /// Returns `true` if the front item was fully consumed and popped.
    pub fn advance(&mut self, n: usize) -> bool {
        debug_assert!(n <= self.queued_bytes);
        self.queued_bytes = self.queued_bytes.saturating_sub(n);
        if self.queued_bytes < self.threshold {
            self.armed = false;
        }
        let Some(front) = self.items.front_mut() else {
            return false;
        };
        if n >= front.len() {
            self.items.pop_front();
            true
        } else {
            *front = front.slice(n..);
            false
        }
    }

    /// Discards every queued item as part of a stop, without counting any
    /// of them as transmitted.
    pub fn drain(&mut self) {
        self.items.clear();
        self.queued_bytes = 0;
        self.writing = false;
        self.armed = false;
    }
}
