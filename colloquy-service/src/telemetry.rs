//! In-process telemetry sink.
//!
//! Counters, gauges, and latency histograms collected in memory. The core
//! only ever writes; readers take point-in-time snapshots for the metrics
//! endpoint. Metric names are flat and namespaced by component.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// A counter metric (increment-only).
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_by(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A gauge metric (can go up or down).
#[derive(Debug, Default)]
pub struct Gauge(AtomicU64);

impl Gauge {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn set(&self, val: u64) {
        self.0.store(val, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        // Saturating: a decrement below zero indicates double-release and
        // must not wrap the gauge to u64::MAX.
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }
}

/// Histogram for latency tracking.
#[derive(Debug)]
pub struct Histogram {
    /// Buckets: 1ms, 5ms, 10ms, 25ms, 50ms, 100ms, 250ms, 500ms, 1s, 5s, 10s
    buckets: [AtomicU64; 11],
    sum: AtomicU64,
    count: AtomicU64,
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

impl Histogram {
    const BUCKET_BOUNDS: [u64; 11] = [1, 5, 10, 25, 50, 100, 250, 500, 1000, 5000, 10000];

    pub fn new() -> Self {
        Self {
            buckets: Default::default(),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Records a value in milliseconds.
    pub fn observe(&self, ms: u64) {
        self.sum.fetch_add(ms, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        for (i, &bound) in Self::BUCKET_BOUNDS.iter().enumerate() {
            if ms <= bound {
                self.buckets[i].fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        self.buckets[10].fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }

    pub fn mean(&self) -> f64 {
        let count = self.count();
        if count == 0 {
            0.0
        } else {
            self.sum() as f64 / count as f64
        }
    }
}

/// Collected metrics for the session layer.
///
/// Constructed once at startup and handed to collaborators as `Arc<Metrics>`;
/// there is no global registry.
#[derive(Debug, Default)]
pub struct Metrics {
    // WebSocket session metrics
    pub ws_connections_opened: Counter,
    pub ws_connections_closed: Counter,
    pub ws_connections_rejected: Counter,
    pub ws_messages_received: Counter,
    pub ws_messages_sent: Counter,
    pub ws_malformed_frames: Counter,
    pub ws_broadcast_dropped: Counter,

    // Rate limiter metrics
    pub rl_messages_denied: Counter,
    pub rl_connections_denied: Counter,
    pub rl_system_bypass: Counter,

    // KV adapter metrics
    pub kv_unavailable: Counter,

    // LLM bridge metrics
    pub llm_requests: Counter,
    pub llm_upstream_errors: Counter,
    pub llm_cancelled: Counter,
    pub llm_cache_hits: Counter,
    pub llm_cache_misses: Counter,

    // Latency histograms
    pub llm_first_chunk_ms: Histogram,
    pub llm_stream_ms: Histogram,

    // Gauges
    pub ws_active_connections: Gauge,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }
}

/// A snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub ws_connections_opened: u64,
    pub ws_connections_closed: u64,
    pub ws_connections_rejected: u64,
    pub ws_messages_received: u64,
    pub ws_messages_sent: u64,
    pub ws_malformed_frames: u64,
    pub ws_broadcast_dropped: u64,
    pub rl_messages_denied: u64,
    pub rl_connections_denied: u64,
    pub rl_system_bypass: u64,
    pub kv_unavailable: u64,
    pub llm_requests: u64,
    pub llm_upstream_errors: u64,
    pub llm_cancelled: u64,
    pub llm_cache_hits: u64,
    pub llm_cache_misses: u64,
    pub llm_first_chunk_mean_ms: f64,
    pub llm_stream_mean_ms: f64,
    pub ws_active_connections: u64,
}

impl Metrics {
    /// Takes a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp: Utc::now(),
            ws_connections_opened: self.ws_connections_opened.get(),
            ws_connections_closed: self.ws_connections_closed.get(),
            ws_connections_rejected: self.ws_connections_rejected.get(),
            ws_messages_received: self.ws_messages_received.get(),
            ws_messages_sent: self.ws_messages_sent.get(),
            ws_malformed_frames: self.ws_malformed_frames.get(),
            ws_broadcast_dropped: self.ws_broadcast_dropped.get(),
            rl_messages_denied: self.rl_messages_denied.get(),
            rl_connections_denied: self.rl_connections_denied.get(),
            rl_system_bypass: self.rl_system_bypass.get(),
            kv_unavailable: self.kv_unavailable.get(),
            llm_requests: self.llm_requests.get(),
            llm_upstream_errors: self.llm_upstream_errors.get(),
            llm_cancelled: self.llm_cancelled.get(),
            llm_cache_hits: self.llm_cache_hits.get(),
            llm_cache_misses: self.llm_cache_misses.get(),
            llm_first_chunk_mean_ms: self.llm_first_chunk_ms.mean(),
            llm_stream_mean_ms: self.llm_stream_ms.mean(),
            ws_active_connections: self.ws_active_connections.get(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let c = Counter::new();
        c.inc();
        c.inc_by(4);
        assert_eq!(c.get(), 5);
    }

    #[test]
    fn test_gauge_saturating_dec() {
        let g = Gauge::new();
        g.inc();
        g.dec();
        g.dec();
        assert_eq!(g.get(), 0);
    }

    #[test]
    fn test_histogram_buckets_and_mean() {
        let h = Histogram::new();
        h.observe(3);
        h.observe(7);
        h.observe(20000);
        assert_eq!(h.count(), 3);
        assert_eq!(h.sum(), 20010);
        assert!((h.mean() - 6670.0).abs() < 1.0);
    }

    #[test]
    fn test_snapshot_reflects_counters() {
        let m = Metrics::new();
        m.ws_connections_opened.inc();
        m.kv_unavailable.inc();
        m.ws_active_connections.set(2);

        let snap = m.snapshot();
        assert_eq!(snap.ws_connections_opened, 1);
        assert_eq!(snap.kv_unavailable, 1);
        assert_eq!(snap.ws_active_connections, 2);
    }
}
