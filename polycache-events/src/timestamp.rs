//! Monotonic event timestamps (§4.7 "Timestamp monotonicity", §9 "Global
//! state").
//!
//! The source keeps a process-wide last-timestamp counter; here it is a
//! value passed into the bus at construction instead of module state, so
//! tests can reset it and run concurrently without interference.

use chrono::{DateTime, Utc};
use std::sync::Mutex;

/// Hands out strictly increasing timestamps. If the wall clock has not
/// advanced since the last call, the clock is nudged forward by one
/// microsecond instead of repeating it.
pub struct EventClock {
    last: Mutex<DateTime<Utc>>,
}

impl EventClock {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(Utc::now()),
        }
    }

    pub fn with_start(start: DateTime<Utc>) -> Self {
        Self {
            last: Mutex::new(start),
        }
    }

    pub fn next(&self) -> DateTime<Utc> {
        let mut last = self.last.lock().expect("event clock mutex poisoned");
        let now = Utc::now();
        let next = if now > *last {
            now
        } else {
            *last + chrono::Duration::microseconds(1)
        };
        *last = next;
        next
    }
}

impl Default for EventClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn successive_timestamps_are_strictly_increasing() {
        let clock = EventClock::new();
        let mut prev = clock.next();
        for _ in 0..1000 {
            let next = clock.next();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn a_clock_that_does_not_advance_is_nudged_forward() {
        let fixed = DateTime::parse_from_rfc3339("2020-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let clock = EventClock::with_start(fixed + chrono::Duration::days(1));
        // `start` is ahead of the real wall clock, so every `next()` call
        // must fall back to the nudge-forward path.
        let a = clock.next();
        let b = clock.next();
        assert!(b > a);
    }
}
