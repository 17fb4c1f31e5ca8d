//! Retry backoff policy.

use std::time::Duration;

/// Exponential backoff: `base * 2^retry_count`, capped. Deliberately
/// jitter-free so successive delays are strictly increasing until the cap.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl RetryPolicy {
    pub fn new(base_seconds: u64, cap_seconds: u64) -> Self {
        Self {
            base: Duration::from_secs(base_seconds),
            cap: Duration::from_secs(cap_seconds),
        }
    }

    /// Delay before the attempt that follows the given (already
    /// incremented) retry count.
    pub fn delay(&self, retry_count: u32) -> Duration {
        let factor = 1u64.checked_shl(retry_count).unwrap_or(u64::MAX);
        self.base
            .checked_mul(factor.min(u32::MAX as u64) as u32)
            .map(|d| d.min(self.cap))
            .unwrap_or(self.cap)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(1, 300)
    }
}
