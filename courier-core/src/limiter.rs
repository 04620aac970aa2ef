//! Per-host adaptive concurrency limiting.
//!
//! Additive-increase, multiplicative-decrease: every success raises the
//! ceiling by `1 / limit` (one full unit per limit-many successes), every
//! drop multiplies it by 0.9. The ceiling is a real number; admission
//! compares the in-flight count against its floor.

use std::sync::Arc;

use courier_metrics::Meter;
use http::StatusCode;
use parking_lot::Mutex;

use crate::error::ClientError;

/// Outcome classes fed to the limiter when a permit is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// The upstream handled the request; grow the ceiling.
    Success,
    /// The upstream shed load; shrink the ceiling.
    Drop,
    /// No signal about upstream capacity; leave the ceiling alone.
    Ignore,
}

/// What a limiter instance protects. The two behaviors differ only in how
/// they classify outcomes: a 308 says something about a host's load but
/// nothing about a single endpoint's capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Behavior {
    Host,
    Endpoint,
}

const INITIAL_LIMIT: f64 = 20.0;
const MIN_LIMIT: f64 = 1.0;
const MAX_LIMIT: f64 = 1000.0;
const BACKOFF_RATIO: f64 = 0.9;

impl Behavior {
    pub(crate) fn classify_status(self, status: StatusCode) -> Outcome {
        match status.as_u16() {
            429 | 503 => Outcome::Drop,
            308 => match self {
                Behavior::Host => Outcome::Drop,
                Behavior::Endpoint => Outcome::Ignore,
            },
            500..=599 => Outcome::Ignore,
            // Informational, success, and client errors all mean the host
            // had capacity to answer.
            _ => Outcome::Success,
        }
    }

    pub(crate) fn classify_error(self, error: &ClientError) -> Outcome {
        match error {
            ClientError::Io(_) | ClientError::Timeout => Outcome::Drop,
            ClientError::QueueFull { .. } | ClientError::Cancelled | ClientError::Closed => {
                Outcome::Ignore
            }
        }
    }
}

#[derive(Debug)]
struct LimitState {
    limit: f64,
    inflight: u32,
}

/// AIMD permit accounting for a single host. `acquire` never blocks; the
/// `{limit, inflight}` pair only mutates under the state lock, so the
/// sequence of acquires and releases observed per host is totally ordered.
#[derive(Debug)]
pub(crate) struct AimdLimiter {
    behavior: Behavior,
    state: Mutex<LimitState>,
    leak_meter: Option<Meter>,
}

impl AimdLimiter {
    pub(crate) fn new(behavior: Behavior) -> Self {
        Self {
            behavior,
            state: Mutex::new(LimitState { limit: INITIAL_LIMIT, inflight: 0 }),
            leak_meter: None,
        }
    }

    pub(crate) fn with_leak_meter(mut self, meter: Meter) -> Self {
        self.leak_meter = Some(meter);
        self
    }

    pub(crate) fn behavior(&self) -> Behavior {
        self.behavior
    }

    /// Admits one more request if the in-flight count is below the floor
    /// of the current ceiling. The returned permit must be released with
    /// an outcome exactly once; dropping it unreleased counts as a leak.
    pub(crate) fn acquire(self: &Arc<Self>) -> Option<Permit> {
        let mut state = self.state.lock();
        if (state.inflight as f64) < state.limit.floor() {
            state.inflight += 1;
            Some(Permit { limiter: Some(Arc::clone(self)) })
        } else {
            None
        }
    }

    pub(crate) fn limit(&self) -> f64 {
        self.state.lock().limit
    }

    pub(crate) fn inflight(&self) -> u32 {
        self.state.lock().inflight
    }

    fn release(&self, outcome: Outcome) {
        let mut state = self.state.lock();
        state.inflight = state.inflight.saturating_sub(1);
        match outcome {
            Outcome::Success => state.limit = (state.limit + 1.0 / state.limit).min(MAX_LIMIT),
            Outcome::Drop => state.limit = (state.limit * BACKOFF_RATIO).max(MIN_LIMIT),
            Outcome::Ignore => {}
        }
    }
}

/// One outstanding request against one host. Releasing consumes the
/// permit, so a second user-visible release cannot be expressed; dropping
/// an unreleased permit releases with [`Outcome::Ignore`] and marks the
/// leak meter.
#[derive(Debug)]
pub(crate) struct Permit {
    limiter: Option<Arc<AimdLimiter>>,
}

impl Permit {
    pub(crate) fn release(mut self, outcome: Outcome) {
        if let Some(limiter) = self.limiter.take() {
            limiter.release(outcome);
        }
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if let Some(limiter) = self.limiter.take() {
            limiter.release(Outcome::Ignore);
            if let Some(meter) = &limiter.leak_meter {
                meter.mark();
            }
        }
    }
}
