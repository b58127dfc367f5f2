//! Backoff and attempt limits for requeued messages.
use std::time::Duration;

/// What to do with a message the handler asked to requeue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueStep {
    /// Wait `delay`, then publish it again with the attempt counter set to `attempt`.
    Retry { delay: Duration, attempt: u32 },
    /// Give up on the source topic and park it on the dead-letter topic.
    DeadLetter,
}

#[derive(Clone, Debug)]
pub struct RequeuePolicy {
    /// Multiplier applied to the interval for every past attempt.
    pub backoff_coefficient: u32,
    /// Delay before the first requeue.
    pub initial_interval: Duration,
    /// Upper bound on any single delay.
    pub maximum_interval: Option<Duration>,
    /// Deliveries allowed before dead-lettering. Only enforced when a
    /// dead-letter topic exists, otherwise a message is retried forever.
    pub max_attempts: u32,
}

impl Default for RequeuePolicy {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: Duration::from_millis(500),
            maximum_interval: Some(Duration::from_secs(30)),
            max_attempts: 10,
        }
    }
}

impl RequeuePolicy {
    pub fn new(backoff_coefficient: u32, initial_interval: Duration) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            ..Self::default()
        }
    }

    pub fn maximum_interval(mut self, interval: Duration) -> Self {
        self.maximum_interval = Some(interval);
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Delay before requeueing a message that has been delivered `attempt` times.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let candidate = self
            .backoff_coefficient
            .checked_pow(attempt.saturating_sub(1))
            .and_then(|factor| self.initial_interval.checked_mul(factor));

        match (candidate, self.maximum_interval) {
            (Some(interval), Some(max)) => interval.min(max),
            (Some(interval), None) => interval,
            (None, Some(max)) => max,
            (None, None) => Duration::MAX,
        }
    }

    /// `attempt` is the number of times the message has been delivered so far.
    pub fn next_step(&self, attempt: u32, has_dead_letter: bool) -> RequeueStep {
        if has_dead_letter && attempt >= self.max_attempts {
            return RequeueStep::DeadLetter;
        }

        RequeueStep::Retry {
            delay: self.backoff(attempt),
            attempt: attempt.saturating_add(1),
        }
    }
}
