//! Salt replay defence.
//!
//! Every AEAD connection starts with a random salt; a salt seen twice is a
//! replayed recording and must not be decrypted. The filter is process-wide
//! and shared by every listener the runtime owns.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use bloomfilter::Bloom;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How many salts the default filter is dimensioned for.
const EXPECTED_SALTS: usize = 10_000_000;
/// Acceptable false-positive rate. A false positive costs one dropped
/// legitimate connection, so this is kept very low.
const FALSE_POSITIVE_RATE: f64 = 1e-6;

/// Interval at which `clean` is invoked on the shared filter.
pub const CLEAN_PERIOD: Duration = Duration::from_secs(30 * 60);

pub trait ReplayFilter: Send + Sync {
    fn contains(&self, salt: &[u8]) -> bool;
    fn add(&self, salt: &[u8]);
    /// Periodic maintenance hook; a no-op for filters that do not evict.
    fn clean(&self);
}

/// Filter that never matches. For tests and setups that accept replays.
pub struct NoopReplayFilter;

impl ReplayFilter for NoopReplayFilter {
    fn contains(&self, _salt: &[u8]) -> bool {
        false
    }

    fn add(&self, _salt: &[u8]) {}

    fn clean(&self) {}
}

/// Bloom-filter-backed salt set.
///
/// A plain Bloom filter saturates as salts accumulate, so `clean` resets
/// the bitmap; the periodic reset bounds the false-positive rate at the
/// cost of forgetting salts older than one clean period.
pub struct BloomReplayFilter {
    bloom: Mutex<Bloom<[u8]>>,
}

impl BloomReplayFilter {
    pub fn new() -> Self {
        Self::with_rate(EXPECTED_SALTS, FALSE_POSITIVE_RATE)
    }

    pub fn with_rate(expected_items: usize, fp_rate: f64) -> Self {
        Self {
            bloom: Mutex::new(Bloom::new_for_fp_rate(expected_items, fp_rate)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Bloom<[u8]>> {
        self.bloom.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for BloomReplayFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplayFilter for BloomReplayFilter {
    fn contains(&self, salt: &[u8]) -> bool {
        self.lock().check(salt)
    }

    fn add(&self, salt: &[u8]) {
        self.lock().set(salt);
    }

    fn clean(&self) {
        debug!("resetting salt replay filter");
        self.lock().clear();
    }
}

/// Drives `clean` on a timer until `cancel` fires.
pub fn spawn_clean_task(
    filter: Arc<dyn ReplayFilter>,
    period: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => filter.clean(),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_never_matches() {
        let f = NoopReplayFilter;
        f.add(b"salt");
        assert!(!f.contains(b"salt"));
    }

    #[test]
    fn bloom_detects_duplicates() {
        let f = BloomReplayFilter::with_rate(1000, 1e-6);
        let salt = [7u8; 32];
        assert!(!f.contains(&salt));
        f.add(&salt);
        assert!(f.contains(&salt));
    }

    #[test]
    fn bloom_clean_forgets() {
        let f = BloomReplayFilter::with_rate(1000, 1e-6);
        f.add(b"old salt");
        f.clean();
        assert!(!f.contains(b"old salt"));
    }

    #[test]
    fn distinct_salts_pass() {
        let f = BloomReplayFilter::with_rate(10_000, 1e-6);
        for i in 0u32..100 {
            let salt = i.to_le_bytes();
            assert!(!f.contains(&salt));
            f.add(&salt);
        }
    }

    #[tokio::test]
    async fn clean_task_stops_on_cancel() {
        let filter: Arc<dyn ReplayFilter> = Arc::new(NoopReplayFilter);
        let cancel = CancellationToken::new();
        let handle = spawn_clean_task(filter, Duration::from_millis(10), cancel.clone());
        cancel.cancel();
        handle.await.unwrap();
    }
}
