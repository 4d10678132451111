//! Run-wide harvest statistics.
//!
//! One owned instance per run, passed by handle into every concurrent task.
//! Counters are updated under short, non-overlapping critical sections.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Per-source success/failure tally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceTally {
    pub success: u64,
    pub fail: u64,
}

impl SourceTally {
    pub fn total(&self) -> u64 {
        self.success + self.fail
    }

    pub fn success_rate(&self) -> f64 {
        if self.total() == 0 {
            0.0
        } else {
            self.success as f64 / self.total() as f64 * 100.0
        }
    }
}

#[derive(Debug)]
struct StatsInner {
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    bytes_downloaded: u64,
    tasks_skipped: u64,
    started_at: Instant,
    sources: BTreeMap<String, SourceTally>,
}

/// Point-in-time copy of the counters, for final reporting.
#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub bytes_downloaded: u64,
    pub tasks_skipped: u64,
    pub elapsed: Duration,
    pub sources: BTreeMap<String, SourceTally>,
}

/// Shared counters for requests, bytes, and per-source outcomes.
#[derive(Clone)]
pub struct HarvestStats {
    inner: Arc<Mutex<StatsInner>>,
}

impl Default for HarvestStats {
    fn default() -> Self {
        Self::new()
    }
}

impl HarvestStats {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(StatsInner {
                total_requests: 0,
                successful_requests: 0,
                failed_requests: 0,
                bytes_downloaded: 0,
                tasks_skipped: 0,
                started_at: Instant::now(),
                sources: BTreeMap::new(),
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StatsInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// An outbound request is being attempted (counted per attempt).
    pub fn record_attempt(&self) {
        self.lock().total_requests += 1;
    }

    /// A 200 response arrived for `source`.
    pub fn record_success(&self, source: &str, bytes: u64) {
        let mut inner = self.lock();
        inner.successful_requests += 1;
        inner.bytes_downloaded += bytes;
        inner.sources.entry(source.to_string()).or_default().success += 1;
    }

    /// A non-200 response arrived for `source`.
    pub fn record_http_failure(&self, source: &str) {
        self.lock().sources.entry(source.to_string()).or_default().fail += 1;
    }

    /// A request for `source` failed at the transport level or gave up.
    pub fn record_failure(&self, source: &str) {
        let mut inner = self.lock();
        inner.failed_requests += 1;
        inner.sources.entry(source.to_string()).or_default().fail += 1;
    }

    /// A request gave up after its last response was already tallied for the
    /// source; counts the overall failure without bumping the source again.
    pub fn record_exhausted(&self) {
        self.lock().failed_requests += 1;
    }

    /// A task was skipped because a resumed checkpoint marked it completed.
    pub fn record_skipped_task(&self) {
        self.lock().tasks_skipped += 1;
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let inner = self.lock();
        StatsSnapshot {
            total_requests: inner.total_requests,
            successful_requests: inner.successful_requests,
            failed_requests: inner.failed_requests,
            bytes_downloaded: inner.bytes_downloaded,
            tasks_skipped: inner.tasks_skipped,
            elapsed: inner.started_at.elapsed(),
            sources: inner.sources.clone(),
        }
    }

    /// Human-readable one-line summary.
    pub fn summary(&self) -> String {
        let snap = self.snapshot();
        let elapsed = snap.elapsed.as_secs_f64();
        let rate = if elapsed > 0.0 {
            snap.successful_requests as f64 / elapsed
        } else {
            0.0
        };
        let mb = snap.bytes_downloaded as f64 / (1024.0 * 1024.0);
        format!(
            "Requests: {}/{} | Rate: {:.1} req/s | Downloaded: {:.2} MB | Elapsed: {:.0}s",
            snap.successful_requests, snap.total_requests, rate, mb, elapsed
        )
    }
}
