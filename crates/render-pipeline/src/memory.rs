//! Decode concurrency tracking and the soft memory high-water mark
//!
//! This is a hint, not admission control: crossing the mark never rejects or
//! delays a request. It only asks the artifact store to shed cached bytes.

use preview_cache::ArtifactStore;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

type Sampler = Box<dyn Fn() -> Option<u64> + Send + Sync>;

/// Fraction of the store's memory budget kept after a hint
const TRIM_TO: f64 = 0.5;

pub struct MemoryMonitor {
    high_water_bytes: Option<u64>,
    active: Arc<AtomicUsize>,
    hints: AtomicU64,
    sampler: Sampler,
}

/// Counts one in-flight decode until dropped
pub struct DecodeTicket {
    active: Arc<AtomicUsize>,
}

impl Drop for DecodeTicket {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryMonitor {
    /// `None` disables the high-water check; decodes are still counted
    pub fn new(high_water_bytes: Option<u64>) -> Self {
        Self::with_sampler(high_water_bytes, process_rss_bytes)
    }

    pub fn with_sampler<F>(high_water_bytes: Option<u64>, sampler: F) -> Self
    where
        F: Fn() -> Option<u64> + Send + Sync + 'static,
    {
        Self {
            high_water_bytes,
            active: Arc::new(AtomicUsize::new(0)),
            hints: AtomicU64::new(0),
            sampler: Box::new(sampler),
        }
    }

    pub fn begin_decode(&self) -> DecodeTicket {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(active_decodes = now, "decode started");
        DecodeTicket {
            active: Arc::clone(&self.active),
        }
    }

    /// Sample memory and, above the mark, trim the store's memory tier.
    /// Returns true if a hint was issued.
    pub fn relieve_pressure(&self, store: &dyn ArtifactStore) -> bool {
        let Some(limit) = self.high_water_bytes else {
            return false;
        };
        let Some(rss) = (self.sampler)() else {
            return false;
        };
        if rss <= limit {
            return false;
        }

        let dropped = store.trim_memory(TRIM_TO);
        self.hints.fetch_add(1, Ordering::Relaxed);
        warn!(
            rss_bytes = rss,
            high_water_bytes = limit,
            active_decodes = self.active(),
            dropped_entries = dropped,
            "memory above high-water mark, trimming preview memory"
        );
        true
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn hints_issued(&self) -> u64 {
        self.hints.load(Ordering::Relaxed)
    }
}

/// Resident set size of this process (Linux only)
pub fn process_rss_bytes() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
        // Second field is RSS in pages
        let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        Some(pages * 4096)
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use preview_cache::{MemoryArtifactStore, PreviewKey};
    use std::sync::atomic::AtomicBool;

    struct TrimRecorder {
        trimmed: AtomicBool,
    }

    impl ArtifactStore for TrimRecorder {
        fn get(&self, _key: &PreviewKey) -> Option<Vec<u8>> {
            None
        }
        fn put(&self, _key: &PreviewKey, _data: &[u8]) -> anyhow::Result<()> {
            Ok(())
        }
        fn exists(&self, _key: &PreviewKey) -> bool {
            false
        }
        fn trim_memory(&self, fraction: f64) -> usize {
            assert_eq!(fraction, TRIM_TO);
            self.trimmed.store(true, Ordering::SeqCst);
            3
        }
    }

    #[test]
    fn test_tickets_track_active_decodes() {
        let monitor = MemoryMonitor::new(None);
        let a = monitor.begin_decode();
        let b = monitor.begin_decode();
        assert_eq!(monitor.active(), 2);
        drop(a);
        assert_eq!(monitor.active(), 1);
        drop(b);
        assert_eq!(monitor.active(), 0);
    }

    #[test]
    fn test_hint_above_high_water() {
        let store = TrimRecorder {
            trimmed: AtomicBool::new(false),
        };
        let monitor = MemoryMonitor::with_sampler(Some(1000), || Some(5000));
        assert!(monitor.relieve_pressure(&store));
        assert!(store.trimmed.load(Ordering::SeqCst));
        assert_eq!(monitor.hints_issued(), 1);
    }

    #[test]
    fn test_no_hint_below_mark_or_unknown() {
        let store = MemoryArtifactStore::new();

        let below = MemoryMonitor::with_sampler(Some(1000), || Some(10));
        assert!(!below.relieve_pressure(&store));

        let unknown = MemoryMonitor::with_sampler(Some(1000), || None);
        assert!(!unknown.relieve_pressure(&store));

        let disabled = MemoryMonitor::with_sampler(None, || Some(u64::MAX));
        assert!(!disabled.relieve_pressure(&store));
        assert_eq!(disabled.hints_issued(), 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_process_rss_is_readable() {
        assert!(process_rss_bytes().unwrap_or(0) > 0);
    }
}
