// Retry timing for joiners that lost their host unintentionally.
//
// The joiner phase machine (`state.rs`) decides *whether* to retry; this
// module decides *when*. `Backoff` turns an attempt number into a delay
// (exponential, capped), and `RetryTimer` holds the one pending retry a
// joiner may have at a time.
//
// A retry is never scheduled after an intentional departure (`hostLeft`,
// `kicked`); the phase machine routes those to a terminal state before a
// timer is ever armed.

use std::time::{Duration, Instant};

use crate::config::ReconnectConfig;

/// Exponential backoff with a ceiling.
#[derive(Clone, Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    pub max_attempts: u32,
}

impl Backoff {
    pub fn new(config: &ReconnectConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.initial_delay_ms),
            max: Duration::from_millis(config.max_delay_ms.max(config.initial_delay_ms)),
            multiplier: config.multiplier.max(1.0),
            max_attempts: config.max_attempts,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let factor = self.multiplier.powi(exp as i32);
        let millis = (self.initial.as_millis() as f64 * factor).min(self.max.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }
}

/// The single pending retry of a joiner.
#[derive(Clone, Debug, Default)]
pub struct RetryTimer {
    due: Option<(u32, Instant)>,
}

impl RetryTimer {
    /// Arm the timer for `attempt`, replacing any earlier schedule.
    pub fn arm(&mut self, backoff: &Backoff, attempt: u32, now: Instant) -> Duration {
        let delay = backoff.delay(attempt);
        self.due = Some((attempt, now + delay));
        delay
    }

    /// Reschedule `attempt` to run at `now`.
    pub fn fire_now(&mut self, attempt: u32, now: Instant) {
        self.due = Some((attempt, now));
    }

    /// If a retry is due at `now`, disarm and return its attempt number.
    pub fn take_due(&mut self, now: Instant) -> Option<u32> {
        match self.due {
            Some((attempt, at)) if now >= at => {
                self.due = None;
                Some(attempt)
            }
            _ => None,
        }
    }

    pub fn cancel(&mut self) {
        self.due = None;
    }

    pub fn is_armed(&self) -> bool {
        self.due.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff() -> Backoff {
        Backoff::new(&ReconnectConfig {
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            multiplier: 2.0,
            max_attempts: 5,
        })
    }

    #[test]
    fn delays_grow_then_cap() {
        let b = backoff();
        assert_eq!(b.delay(1), Duration::from_millis(100));
        assert_eq!(b.delay(2), Duration::from_millis(200));
        assert_eq!(b.delay(4), Duration::from_millis(800));
        assert_eq!(b.delay(5), Duration::from_millis(1_000));
        assert_eq!(b.delay(40), Duration::from_millis(1_000));
    }

    #[test]
    fn timer_fires_once() {
        let b = backoff();
        let start = Instant::now();
        let mut timer = RetryTimer::default();
        timer.arm(&b, 2, start);

        assert_eq!(timer.take_due(start + Duration::from_millis(199)), None);
        assert_eq!(timer.take_due(start + Duration::from_millis(200)), Some(2));
        assert_eq!(timer.take_due(start + Duration::from_secs(10)), None);
        assert!(!timer.is_armed());
    }
}
