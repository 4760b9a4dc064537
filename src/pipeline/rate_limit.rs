//! Token-bucket gate per source credential, wrapped around governor.
//!
//! Every outbound collector request acquires a token first; waits are
//! bounded by the cycle deadline so a throttled source can never wedge a
//! cycle.

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Rate limiter for one source credential.
pub struct SourceRateLimiter {
    limiter: DefaultDirectRateLimiter,
    /// Configured burst size
    tokens: u32,
    /// Seconds to refill the full bucket
    refill_s: f64,
}

impl SourceRateLimiter {
    /// Build a bucket holding `tokens` permits refilled over `refill_s`
    /// seconds.
    pub fn new(tokens: u32, refill_s: f64) -> Self {
        let burst = NonZeroU32::new(tokens).unwrap_or(NonZeroU32::new(1).unwrap());
        // One token every refill_s / tokens seconds.
        let period = Duration::from_secs_f64((refill_s / tokens.max(1) as f64).max(0.001));
        let quota = Quota::with_period(period)
            .unwrap_or_else(|| Quota::per_second(burst))
            .allow_burst(burst);
        Self {
            limiter: RateLimiter::direct(quota),
            tokens,
            refill_s,
        }
    }

    /// Try to take a token without waiting.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }

    /// Wait for a token, giving up at `deadline`. Returns false when the
    /// deadline won instead.
    pub async fn acquire_until(&self, deadline: Instant) -> bool {
        if self.try_acquire() {
            return true;
        }
        debug!(
            "rate limit reached ({} tokens / {:.0}s), suspending",
            self.tokens, self.refill_s
        );
        tokio::time::timeout_at(deadline, self.limiter.until_ready())
            .await
            .is_ok()
    }
}
