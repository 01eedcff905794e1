//! Thin reactor/clock abstraction.
//!
//! This crate does not ship an executor: transports run on whatever Tokio
//! runtime the caller's process already has; this crate stays
//! runtime-agnostic and the Tokio wiring lives entirely in the transport
//! crates built on top of it. What *is* shared here is a `Clock` trait so
//! tests can inject a fake clock for deterministic debounce/backoff
//! assertions instead of sleeping real wall-clock time.

use std::time::{Duration, Instant};

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// De-duplicates repeated notifications of the *same* state within a
/// small window (some platforms redeliver e.g. `Connecting` redundantly
/// during a retry burst; collapsing repeats within ~10ms of the previous
/// one keeps observed transition counts deterministic for tests).
#[derive(Debug)]
pub struct StateDebouncer<C: Clock> {
    clock: C,
    window: Duration,
    last: Option<(crate::state::LinkState, Instant)>,
}

impl<C: Clock> StateDebouncer<C> {
    pub fn new(clock: C, window: Duration) -> Self {
        Self { clock, window, last: None }
    }

    /// Returns `true` if this transition should be observable (i.e. is
    /// not a duplicate within `window` of the previous same-state
    /// notification).
    pub fn should_emit(&mut self, state: crate::state::LinkState) -> bool {
        let now = self.clock.now();
        if let Some((last_state, last_at)) = self.last {
            if last_state == state && now.saturating_duration_since(last_at) <= self.window {
                self.last = Some((state, now));
                return false;
            }
        }
        self.last = Some((state, now));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::LinkState;
    use std::cell::Cell;

    struct FakeClock(Cell<Instant>);

    impl Clock for &FakeClock {
        fn now(&self) -> Instant {
            self.0.get()
        }
    }

    #[test]
    fn duplicate_same_state_within_window_is_suppressed() {
        let start = Instant::now();
        let fake = FakeClock(Cell::new(start));
        let mut debouncer = StateDebouncer::new(&fake, Duration::from_millis(10));

        assert!(debouncer.should_emit(LinkState::Connecting));
        fake.0.set(start + Duration::from_millis(3));
        assert!(!debouncer.should_emit(LinkState::Connecting));

        fake.0.set(start + Duration::from_millis(20));
        assert!(debouncer.should_emit(LinkState::Connecting));
    }

    #[test]
    fn different_state_always_emits() {
        let start = Instant::now();
        let fake = FakeClock(Cell::new(start));
        let mut debouncer = StateDebouncer::new(&fake, Duration::from_millis(10));
        assert!(debouncer.should_emit(LinkState::Connecting));
        assert!(debouncer.should_emit(LinkState::Connected));
    }
}
