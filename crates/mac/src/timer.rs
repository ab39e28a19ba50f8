//! Cancellable one-shot timers. The MAC never sleeps: arming a timer hands out
//! a token, the owner asks the clock to deliver it later, and a delivery whose
//! token no longer matches is ignored.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerToken(u64);

#[derive(Debug, Default, Clone)]
pub struct Timer {
    generation: u64,
    armed: bool,
}

impl Timer {
    pub fn arm(&mut self) -> TimerToken {
        self.generation += 1;
        self.armed = true;
        TimerToken(self.generation)
    }

    pub fn cancel(&mut self) {
        self.armed = false;
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Consumes a delivery. Returns false, touching nothing, for cancelled or superseded tokens.
    pub fn fire(&mut self, token: TimerToken) -> bool {
        if !self.armed || token.0 != self.generation {
            return false;
        }
        self.armed = false;
        true
    }
}

/// A request for the external clock to deliver `event` after `delay`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerRequest<E> {
    pub delay: Duration,
    pub event: E,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fire_once() {
        let mut timer = Timer::default();
        let token = timer.arm();
        assert!(timer.fire(token));
        assert!(!timer.fire(token));
    }

    #[test]
    fn test_cancelled_and_stale_tokens_are_ignored() {
        let mut timer = Timer::default();
        let first = timer.arm();
        timer.cancel();
        timer.cancel();
        assert!(!timer.fire(first));

        let second = timer.arm();
        assert!(!timer.fire(first));
        assert!(timer.is_armed());
        assert!(timer.fire(second));
    }
}
