//! Pacing between state-changing calls to the same wiki.
//!
//! Requests are issued strictly one after another; parallel requests against one wiki trip the
//! farm's upstream rate limiter, so every state-changing call is followed by a pause.

use std::thread::sleep;
use std::time::Duration;

use tracing::debug;

use crate::wiki::WikiId;

pub trait RateLimiter: Send + Sync {
    /// Block until the next call against `wiki` is allowed.
    fn pause(&self, wiki: &WikiId);
}

/// Sleeps a constant delay after every call.
#[derive(Debug, Clone, Copy)]
pub struct FixedDelay {
    delay: Duration,
}

impl FixedDelay {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl RateLimiter for FixedDelay {
    fn pause(&self, wiki: &WikiId) {
        if self.delay.is_zero() {
            return;
        }
        debug!(wiki = %wiki, delay_ms = self.delay.as_millis() as u64, "rate limit pause");
        sleep(self.delay);
    }
}

/// Never waits.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDelay;

impl RateLimiter for NoDelay {
    fn pause(&self, _wiki: &WikiId) {}
}
