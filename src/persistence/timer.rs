//! Exponential backoff timer of a persist request.

use std::time::Duration;
use tokio::time::Instant;

/// Outcome of [`ExponentialTimer::tick`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerTick {
    /// Not time to try yet.
    NotReady,
    /// Try now; the next attempt is one interval away.
    Ready,
    /// The total wait is exhausted; give up.
    Expired,
}

/// Backoff schedule for repeated attempts.
///
/// The first attempt is allowed `initial_wait` after creation. Every `Ready`
/// tick schedules the next attempt one interval later and doubles the
/// interval up to `max_interval`. Once `max_total_wait` has passed since
/// creation every tick is `Expired`, whether or not an attempt was made.
#[derive(Debug, Clone)]
pub struct ExponentialTimer {
    max_interval: Duration,
    interval: Duration,
    next_attempt: Instant,
    deadline: Instant,
    attempts: u32,
}

impl ExponentialTimer {
    pub fn new(initial_interval: Duration, max_interval: Duration, initial_wait: Duration, max_total_wait: Duration) -> Self {
        Self::starting_at(Instant::now(), initial_interval, max_interval, initial_wait, max_total_wait)
    }

    pub fn starting_at(
        start: Instant,
        initial_interval: Duration,
        max_interval: Duration,
        initial_wait: Duration,
        max_total_wait: Duration,
    ) -> Self {
        Self {
            max_interval,
            interval: initial_interval.min(max_interval),
            next_attempt: start + initial_wait,
            deadline: start + max_total_wait,
            attempts: 0,
        }
    }

    pub fn tick(&mut self) -> TimerTick {
        self.tick_at(Instant::now())
    }

    pub fn tick_at(&mut self, now: Instant) -> TimerTick {
        if now >= self.deadline {
            return TimerTick::Expired;
        }
        if now < self.next_attempt {
            return TimerTick::NotReady;
        }
        self.attempts += 1;
        self.next_attempt = now + self.interval;
        self.interval = (self.interval * 2).min(self.max_interval);
        TimerTick::Ready
    }

    /// Interval that the next `Ready` tick will wait.
    pub fn current_interval(&self) -> Duration {
        self.interval
    }

    /// Number of `Ready` ticks so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
