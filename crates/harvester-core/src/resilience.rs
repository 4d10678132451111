//! Resilience patterns for network operations.
//!
//! [`ExponentialBackoff`] times individual retries; [`CircuitBreaker`] gates
//! whole sources so one upstream's outage never degrades harvesting from the
//! others. The breaker is keyed by source name and shared across all
//! concurrent tasks touching that source.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Pure retry-timing policy: exponential growth, symmetric jitter, cap.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_retries: 3,
        }
    }
}

impl ExponentialBackoff {
    pub fn new(base_delay: Duration, max_delay: Duration, max_retries: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_retries,
        }
    }

    /// True iff another attempt is within the retry budget.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// Delay before retrying `attempt`: `min(base * 2^attempt, max)`,
    /// perturbed by ±25% jitter so concurrent tasks don't retry in lockstep.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let delay_ms = base_ms.saturating_mul(factor).min(max_ms);

        let quarter = delay_ms / 4;
        if quarter == 0 {
            return Duration::from_millis(delay_ms);
        }
        // Uniform offset in [0, 2*quarter] recenters to delay ± 25%.
        let offset = rand_jitter_ms(2 * quarter + 1);
        Duration::from_millis(delay_ms - quarter + offset)
    }
}

#[derive(Debug, Default)]
struct CircuitBreakerInner {
    failures: HashMap<String, u32>,
    opened_at: HashMap<String, Instant>,
}

/// Configuration for per-source failure gating.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit for a source opens.
    pub failure_threshold: u32,
    /// How long an open circuit suppresses requests before self-healing.
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 10,
            timeout: Duration::from_secs(300),
        }
    }
}

/// Thread-safe circuit breaker keyed by source name.
///
/// A source is open (requests suppressed) iff it has been opened and the
/// timeout has not yet elapsed; once elapsed, the next [`is_open`] check
/// resets the source to closed with a zero counter. This lazy,
/// read-triggered reset avoids a background timer.
///
/// [`is_open`]: CircuitBreaker::is_open
#[derive(Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<CircuitBreakerInner>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Arc::new(Mutex::new(CircuitBreakerInner::default())),
        }
    }

    /// Acquires the inner mutex lock, recovering from poison if necessary.
    fn lock_inner(&self) -> std::sync::MutexGuard<'_, CircuitBreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned circuit breaker mutex");
            poisoned.into_inner()
        })
    }

    /// Record a failure for a source; opens the circuit at the threshold.
    ///
    /// Re-opening is idempotent: further failures while open do not reset
    /// the opened-at timer.
    pub fn record_failure(&self, source: &str) {
        let mut inner = self.lock_inner();
        let count = inner.failures.entry(source.to_string()).or_insert(0);
        *count += 1;
        let count = *count;

        if count >= self.config.failure_threshold
            && !inner.opened_at.contains_key(source)
        {
            inner.opened_at.insert(source.to_string(), Instant::now());
            tracing::warn!(source = %source, failures = count, "Circuit breaker OPEN");
        }
    }

    /// Record a success: full recovery, counter reset, circuit closed.
    pub fn record_success(&self, source: &str) {
        let mut inner = self.lock_inner();
        inner.failures.insert(source.to_string(), 0);
        if inner.opened_at.remove(source).is_some() {
            tracing::info!(source = %source, "Circuit breaker CLOSED");
        }
    }

    /// Whether requests to a source are currently suppressed.
    ///
    /// Self-heals: once the timeout has elapsed since opening, the check
    /// itself clears the open state and zeroes the failure counter.
    pub fn is_open(&self, source: &str) -> bool {
        let mut inner = self.lock_inner();
        let Some(opened) = inner.opened_at.get(source) else {
            return false;
        };

        if opened.elapsed() > self.config.timeout {
            inner.opened_at.remove(source);
            inner.failures.insert(source.to_string(), 0);
            tracing::info!(source = %source, "Circuit breaker reset (timeout passed)");
            return false;
        }

        true
    }

    /// Current consecutive-failure count for a source.
    pub fn failure_count(&self, source: &str) -> u32 {
        let inner = self.lock_inner();
        inner.failures.get(source).copied().unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Deterministic jitter based on std — avoids pulling in the `rand` crate.
// Uses a simple xorshift seeded from the current time.
// ---------------------------------------------------------------------------

fn rand_jitter_ms(max_ms: u64) -> u64 {
    if max_ms == 0 {
        return 0;
    }
    // Seed from high-resolution clock — good enough for jitter, not crypto.
    let mut x = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    // xorshift64
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    x % max_ms
}
