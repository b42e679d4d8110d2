//! Reconnect backoff and timeout utilities.
//!
//! The helpers in this module are transport-agnostic. The realtime channel
//! uses them to pace reconnect attempts and to bound websocket handshakes.

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Policy controlling reconnect attempts and linear backoff.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Maximum number of reconnect attempts per connect cycle.
    pub max_attempts: u32,
    /// Delay unit; attempt `n` waits `base_delay * n`.
    pub base_delay: Duration,
    /// Maximum random jitter added to each reconnect delay.
    pub jitter: Duration,
}

impl ReconnectPolicy {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
    pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(3000);

    /// Computes the delay to apply before the given reconnect attempt.
    ///
    /// `attempt` is 1-based. Attempt 0 yields no delay.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(attempt)
            .saturating_add(jitter_duration(self.jitter, attempt))
    }

    /// Returns true once `attempts` has used up the budget.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            base_delay: Self::DEFAULT_BASE_DELAY,
            jitter: Duration::ZERO,
        }
    }
}

/// Applies a timeout to an async computation.
pub async fn with_timeout<T, Fut>(
    timeout: Duration,
    future: Fut,
) -> Result<T, tokio::time::error::Elapsed>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, future).await
}

fn jitter_duration(max_jitter: Duration, attempt: u32) -> Duration {
    if max_jitter.is_zero() {
        return Duration::ZERO;
    }

    let limit_nanos = max_jitter.as_nanos().min(u64::MAX as u128) as u64;
    if limit_nanos == 0 {
        return Duration::ZERO;
    }

    let now_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    let mixed = now_nanos ^ (u64::from(attempt).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    Duration::from_nanos(mixed % (limit_nanos + 1))
}
