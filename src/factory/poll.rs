//! Readiness polling policy.
//!
//! The decision of whether to keep polling a platform is a pure function of
//! what the last poll observed and how long we have been waiting, so the
//! schedule can be tested without sleeping.

use std::time::Duration;

/// Fixed-interval polling with a hard wall-clock ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub ceiling: Duration,
}

impl PollPolicy {
    pub fn new(interval: Duration, ceiling: Duration) -> Self {
        Self { interval, ceiling }
    }

    /// 5s interval, 5 minute ceiling.
    pub fn provisioning() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(300))
    }

    /// 5s interval, 10 minute ceiling.
    pub fn deploy() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(600))
    }

    /// Time left before the ceiling. A single poll request must not outlive it.
    pub fn remaining(&self, elapsed: Duration) -> Duration {
        self.ceiling.saturating_sub(elapsed)
    }
}

/// What a single poll saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollObservation {
    Ready,
    Pending,
    /// The poll itself failed (network, 5xx). Absorbed until the ceiling.
    TransientError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollDecision {
    KeepPolling { wait: Duration },
    Succeeded,
    TimedOut,
}

/// Decide the next step after a poll.
///
/// The wait is clamped to the time left before the ceiling, so a resource
/// that never becomes ready times out at the ceiling rather than up to one
/// interval past it.
pub fn decide(observation: PollObservation, elapsed: Duration, policy: &PollPolicy) -> PollDecision {
    if observation == PollObservation::Ready {
        return PollDecision::Succeeded;
    }
    if elapsed >= policy.ceiling {
        return PollDecision::TimedOut;
    }
    let remaining = policy.ceiling - elapsed;
    PollDecision::KeepPolling {
        wait: policy.interval.min(remaining),
    }
}

/// 20ms interval for tests that must not sleep for seconds.
#[cfg(test)]
pub(crate) fn fast_poll(ceiling_ms: u64) -> PollPolicy {
    PollPolicy::new(Duration::from_millis(20), Duration::from_millis(ceiling_ms))
}
