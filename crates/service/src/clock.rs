//! A manually-ticked clock: nothing here reads the wall clock. The
//! endpoint's cleanup thread advances
//! it once a second and every table that tracks an expiry reads its current
//! value off this type. Kept in whole seconds since every lifetime in
//! `Behavior` is decided to single-digit-second precision anyway.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Clock(AtomicU64);

impl Clock {
    pub fn now(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn tick(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Round a millisecond duration up to whole seconds for use as a clock
/// offset.
pub fn ms_to_secs_ceil(ms: f64) -> u64 {
    (ms / 1000.0).ceil() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_advance_monotonically() {
        let clock = Clock::default();
        assert_eq!(clock.now(), 0);
        assert_eq!(clock.tick(), 1);
        assert_eq!(clock.tick(), 2);
        assert_eq!(clock.now(), 2);
    }

    #[test]
    fn ms_rounds_up() {
        assert_eq!(ms_to_secs_ceil(2000.0), 2);
        assert_eq!(ms_to_secs_ceil(2001.0), 3);
        assert_eq!(ms_to_secs_ceil(999.0), 1);
    }
}
