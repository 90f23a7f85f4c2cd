//! Resilience utilities: retry backoff, fetch throttling, concurrency bounds.
//!
//! - [`RetryConfig`]: doubling backoff for concurrent-update retries
//! - [`RateLimiter`]: token bucket on source page fetches
//! - [`Bulkhead`]: counting semaphore bounding tables copied at once
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> catalog_replication::Result<()> {
//! use catalog_replication::resilience::{Bulkhead, RateLimiter};
//! use std::num::NonZeroU32;
//!
//! // At most 20 page fetches per second across every table.
//! let limiter = RateLimiter::per_second(NonZeroU32::new(20).unwrap());
//! limiter.acquire().await;
//!
//! // At most 5 tables in flight; the slot frees when the permit drops.
//! let tables = Bulkhead::new(5);
//! let _slot = tables.acquire().await?;
//! # Ok(())
//! # }
//! ```

use crate::error::{CloneError, Result};
use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

// ═══════════════════════════════════════════════════════════════════════════════
// Retry backoff
// ═══════════════════════════════════════════════════════════════════════════════

/// How often, and how patiently, a stale configuration write is retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Attempts per node, including the first.
    pub max_attempts: usize,

    /// Wait after the first failed attempt. Doubles on every further one.
    pub base_delay: Duration,

    /// Upper bound on any single wait.
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::doubling(5, Duration::from_millis(200))
    }
}

impl RetryConfig {
    /// `max_attempts` tries starting at `base_delay`, capped at sixteen times the base.
    pub fn doubling(max_attempts: usize, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay: base_delay.saturating_mul(16),
        }
    }

    /// Millisecond waits for tests.
    pub fn testing() -> Self {
        Self::doubling(3, Duration::from_millis(1))
    }

    /// Wait before retry number `attempt` (the first retry is 1).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let doublings = attempt.saturating_sub(1).min(31) as u32;
        self.base_delay
            .saturating_mul(1u32 << doublings)
            .min(self.max_delay)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Fetch throttling
// ═══════════════════════════════════════════════════════════════════════════════

/// Token bucket on page fetches.
///
/// One limiter is shared by every producer reading from the same source, so
/// the fetch rate is bounded no matter how many tables run at once.
pub struct RateLimiter {
    limiter: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
    pages_per_sec: NonZeroU32,
}

impl RateLimiter {
    /// Refills `pages_per_sec` tokens per second and bursts up to the same amount.
    pub fn per_second(pages_per_sec: NonZeroU32) -> Self {
        Self {
            limiter: GovLimiter::direct(Quota::per_second(pages_per_sec)),
            pages_per_sec,
        }
    }

    /// Wait for a token. Cancel-safe.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    pub fn pages_per_sec(&self) -> u32 {
        self.pages_per_sec.get()
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("pages_per_sec", &self.pages_per_sec)
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Table fan-out bound
// ═══════════════════════════════════════════════════════════════════════════════

/// Counting semaphore over table pipelines.
///
/// A permit is held for one table's whole copy and released on drop.
#[derive(Debug, Clone)]
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
    slots: usize,
}

impl Bulkhead {
    pub fn new(slots: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(slots)),
            slots,
        }
    }

    /// Wait for a free slot.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| CloneError::Internal(format!("table bulkhead ({} slots) closed", self.slots)))
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Slots currently held by running tables.
    pub fn in_use(&self) -> usize {
        self.slots - self.available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_then_caps() {
        let retry = RetryConfig::doubling(10, Duration::from_millis(100));

        assert_eq!(retry.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(retry.delay_for_attempt(4), Duration::from_millis(800));
        assert_eq!(retry.delay_for_attempt(5), Duration::from_millis(1600));
        assert_eq!(retry.delay_for_attempt(6), Duration::from_millis(1600));
        assert_eq!(retry.delay_for_attempt(usize::MAX), Duration::from_millis(1600));
    }

    #[test]
    fn test_delay_attempt_zero_is_base() {
        let retry = RetryConfig::default();
        assert_eq!(retry.delay_for_attempt(0), retry.base_delay);
        assert_eq!(retry.max_attempts, 5);
    }

    #[test]
    fn test_testing_preset_is_fast() {
        let retry = RetryConfig::testing();
        assert_eq!(retry.max_attempts, 3);
        assert!(retry.max_delay <= Duration::from_millis(16));
    }

    // =========================================================================
    // Rate Limiter Tests
    // =========================================================================

    #[tokio::test]
    async fn test_rate_limiter_allows_burst() {
        let limiter = RateLimiter::per_second(NonZeroU32::new(1000).unwrap());

        let start = std::time::Instant::now();
        for _ in 0..10 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(200));
        assert_eq!(limiter.pages_per_sec(), 1000);
    }

    #[tokio::test]
    async fn test_rate_limiter_throttles_past_burst() {
        let limiter = RateLimiter::per_second(NonZeroU32::new(20).unwrap());
        for _ in 0..20 {
            limiter.acquire().await;
        }

        let start = std::time::Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(20), "bucket should be empty");
        assert!(format!("{limiter:?}").contains("pages_per_sec"));
    }

    // =========================================================================
    // Bulkhead Tests
    // =========================================================================

    #[tokio::test]
    async fn test_bulkhead_counts_slots() {
        let tables = Bulkhead::new(2);

        let a = tables.acquire().await.unwrap();
        let _b = tables.acquire().await.unwrap();
        assert_eq!(tables.in_use(), 2);
        assert_eq!(tables.available(), 0);

        drop(a);
        assert_eq!(tables.in_use(), 1);
    }

    #[tokio::test]
    async fn test_bulkhead_waits_for_release() {
        let tables = Bulkhead::new(1);
        let waiter = tables.clone();

        let held = tables.acquire().await.unwrap();
        let handle = tokio::spawn(async move {
            let start = std::time::Instant::now();
            let _slot = waiter.acquire().await.unwrap();
            start.elapsed()
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(held);

        let waited = handle.await.unwrap();
        assert!(waited >= Duration::from_millis(40), "second table should have queued");
    }
}
