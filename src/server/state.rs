//! Process-wide counters shared by every stream and the admin API.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

/// Live server counters. Updated lock-free from stream tasks.
#[derive(Debug)]
pub struct ServerStats {
    start_time: Instant,
    active_streams: AtomicUsize,
    total_streams: AtomicU64,
    live_sessions: AtomicUsize,
    fragments: AtomicU64,
    inferences: AtomicU64,
    errors: AtomicU64,
    evictions: AtomicU64,
}

impl Default for ServerStats {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerStats {
    /// Fresh counters, uptime starts now
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            active_streams: AtomicUsize::new(0),
            total_streams: AtomicU64::new(0),
            live_sessions: AtomicUsize::new(0),
            fragments: AtomicU64::new(0),
            inferences: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Get server uptime
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Count a stream as open until the guard drops.
    pub fn open_stream(self: &Arc<Self>) -> StreamGuard {
        self.active_streams.fetch_add(1, Ordering::Relaxed);
        self.total_streams.fetch_add(1, Ordering::Relaxed);
        StreamGuard {
            stats: Arc::clone(self),
        }
    }

    /// A session was created
    pub fn session_opened(&self) {
        self.live_sessions.fetch_add(1, Ordering::Relaxed);
    }

    /// `count` sessions went away (END, eviction, stream close)
    pub fn sessions_closed(&self, count: usize) {
        // Saturate at zero; counters are advisory
        let _ = self
            .live_sessions
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(count))
            });
    }

    /// A fragment was applied
    pub fn record_fragment(&self) {
        self.fragments.fetch_add(1, Ordering::Relaxed);
    }

    /// An inference response was produced
    pub fn record_inference(&self) {
        self.inferences.fetch_add(1, Ordering::Relaxed);
    }

    /// A per-fragment error was reported
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// `count` idle sessions were evicted
    pub fn record_evictions(&self, count: usize) {
        self.evictions.fetch_add(count as u64, Ordering::Relaxed);
        self.sessions_closed(count);
    }

    /// Currently served streams
    pub fn active_streams(&self) -> usize {
        self.active_streams.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            uptime_secs: self.uptime().as_secs(),
            active_streams: self.active_streams.load(Ordering::Relaxed),
            total_streams: self.total_streams.load(Ordering::Relaxed),
            live_sessions: self.live_sessions.load(Ordering::Relaxed),
            fragments_processed: self.fragments.load(Ordering::Relaxed),
            inferences: self.inferences.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

/// Decrements the active stream count on drop.
#[derive(Debug)]
pub struct StreamGuard {
    stats: Arc<ServerStats>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.stats.active_streams.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Serializable counters for `/status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Seconds since start
    pub uptime_secs: u64,
    /// Streams being served
    pub active_streams: usize,
    /// Streams served since start
    pub total_streams: u64,
    /// Sessions held across all streams
    pub live_sessions: usize,
    /// Fragments applied
    pub fragments_processed: u64,
    /// Inference responses sent
    pub inferences: u64,
    /// Per-fragment errors reported
    pub errors: u64,
    /// Idle sessions evicted
    pub evictions: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_guard() {
        let stats = Arc::new(ServerStats::new());
        let guard = stats.open_stream();
        let second = stats.open_stream();
        assert_eq!(stats.active_streams(), 2);
        drop(guard);
        drop(second);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.active_streams, 0);
        assert_eq!(snapshot.total_streams, 2);
    }

    #[test]
    fn test_session_counters() {
        let stats = ServerStats::new();
        stats.session_opened();
        stats.session_opened();
        stats.session_opened();
        stats.record_evictions(1);
        stats.sessions_closed(5);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.live_sessions, 0);
        assert_eq!(snapshot.evictions, 1);
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = ServerStats::new();
        stats.record_fragment();
        stats.record_inference();
        stats.record_error();
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["fragments_processed"], 1);
        assert_eq!(json["inferences"], 1);
        assert_eq!(json["errors"], 1);
    }
}
