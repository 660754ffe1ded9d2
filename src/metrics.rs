use crate::session::ConnectionStatus;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Metrics for observability
///
/// Counters are shared by every shard; gauges are kept per shard id. Use
/// `snapshot()` to get a point-in-time view of all metrics, or use
/// individual getter methods for specific values.
///
/// # Example
/// ```ignore
/// let metrics = manager.metrics();
///
/// println!("Dispatches: {}", metrics.dispatches());
/// let snapshot = metrics.snapshot();
/// ```
#[derive(Debug, Default)]
pub struct Metrics {
    connections_total: AtomicU64,
    reconnections_total: AtomicU64,
    identifies_total: AtomicU64,
    resumes_total: AtomicU64,
    payloads_received_total: AtomicU64,
    payloads_sent_total: AtomicU64,
    dispatches_total: AtomicU64,
    heartbeats_sent_total: AtomicU64,
    heartbeats_acked_total: AtomicU64,
    heartbeats_missed_total: AtomicU64,
    errors_total: AtomicU64,
    fatal_closes_total: AtomicU64,

    /// Per-shard metrics keyed by shard id
    shard_metrics: RwLock<BTreeMap<u32, ShardMetrics>>,
}

/// Metrics for a single shard
#[derive(Debug, Clone)]
pub struct ShardMetrics {
    /// Shard identifier (0 when unsharded)
    pub shard_id: u32,
    /// Current session status
    pub status: ConnectionStatus,
    /// Round trip of the last acknowledged heartbeat
    pub latency: Option<Duration>,
    /// Last sequence number seen
    pub sequence: Option<u64>,
    /// Duration since the session last became ready (None if never)
    pub time_since_connected: Option<Duration>,
    /// Duration since the last payload was received (None if no payloads)
    pub time_since_last_payload: Option<Duration>,
    /// Total time spent connected, excluding the current session
    pub total_uptime: Duration,
    #[doc(hidden)]
    pub(crate) connected_at: Option<Instant>,
    #[doc(hidden)]
    pub(crate) last_payload_at: Option<Instant>,
}

impl ShardMetrics {
    fn new(shard_id: u32) -> Self {
        Self {
            shard_id,
            status: ConnectionStatus::Disconnected,
            latency: None,
            sequence: None,
            time_since_connected: None,
            time_since_last_payload: None,
            total_uptime: Duration::ZERO,
            connected_at: None,
            last_payload_at: None,
        }
    }

    fn snapshot(&self) -> ShardMetrics {
        ShardMetrics {
            time_since_connected: self.connected_at.map(|t| t.elapsed()),
            time_since_last_payload: self.last_payload_at.map(|t| t.elapsed()),
            ..self.clone()
        }
    }

    /// Move to `status`, folding the finished session into `total_uptime`.
    pub(crate) fn set_status(&mut self, status: ConnectionStatus) {
        match status {
            ConnectionStatus::Connected => {
                if self.connected_at.is_none() {
                    self.connected_at = Some(Instant::now());
                }
            }
            ConnectionStatus::Disconnected | ConnectionStatus::Connecting => {
                if let Some(since) = self.connected_at.take() {
                    self.total_uptime += since.elapsed();
                }
            }
            ConnectionStatus::Identifying | ConnectionStatus::Resuming => {}
        }
        self.status = status;
    }
}

impl Metrics {
    /// Create a new Metrics instance
    pub fn new() -> Self {
        Self::default()
    }

    // ========== Getters ==========

    /// Get total sockets opened
    pub fn connections(&self) -> u64 {
        self.connections_total.load(Ordering::Relaxed)
    }

    /// Get total reconnections
    pub fn reconnections(&self) -> u64 {
        self.reconnections_total.load(Ordering::Relaxed)
    }

    /// Get total Identify payloads sent
    pub fn identifies(&self) -> u64 {
        self.identifies_total.load(Ordering::Relaxed)
    }

    /// Get total Resume payloads sent
    pub fn resumes(&self) -> u64 {
        self.resumes_total.load(Ordering::Relaxed)
    }

    /// Get total payloads received
    pub fn payloads_received(&self) -> u64 {
        self.payloads_received_total.load(Ordering::Relaxed)
    }

    /// Get total payloads sent
    pub fn payloads_sent(&self) -> u64 {
        self.payloads_sent_total.load(Ordering::Relaxed)
    }

    /// Get total events delivered to the handler
    pub fn dispatches(&self) -> u64 {
        self.dispatches_total.load(Ordering::Relaxed)
    }

    pub fn heartbeats_sent(&self) -> u64 {
        self.heartbeats_sent_total.load(Ordering::Relaxed)
    }

    pub fn heartbeats_acked(&self) -> u64 {
        self.heartbeats_acked_total.load(Ordering::Relaxed)
    }

    /// Get total heartbeats that were never acknowledged
    pub fn heartbeats_missed(&self) -> u64 {
        self.heartbeats_missed_total.load(Ordering::Relaxed)
    }

    /// Get total errors
    pub fn errors(&self) -> u64 {
        self.errors_total.load(Ordering::Relaxed)
    }

    /// Get total closes that stopped a shard
    pub fn fatal_closes(&self) -> u64 {
        self.fatal_closes_total.load(Ordering::Relaxed)
    }

    // ========== Recording methods (called internally) ==========

    pub(crate) fn record_connection(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reconnection(&self) {
        self.reconnections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_identify(&self) {
        self.identifies_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_resume(&self) {
        self.resumes_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_payload_received(&self) {
        self.payloads_received_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_payload_sent(&self) {
        self.payloads_sent_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dispatch(&self) {
        self.dispatches_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_heartbeat_sent(&self) {
        self.heartbeats_sent_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_heartbeat_acked(&self) {
        self.heartbeats_acked_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_heartbeat_missed(&self) {
        self.heartbeats_missed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fatal_close(&self) {
        self.fatal_closes_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Update metrics for a specific shard, creating its entry on first use
    pub(crate) fn update_shard(&self, shard_id: u32, update_fn: impl FnOnce(&mut ShardMetrics)) {
        let mut shards = self.shard_metrics.write();
        let entry = shards
            .entry(shard_id)
            .or_insert_with(|| ShardMetrics::new(shard_id));
        update_fn(entry);
    }

    /// Forget every shard; counters are kept
    pub(crate) fn clear_shards(&self) {
        self.shard_metrics.write().clear();
    }

    /// Get a snapshot of one shard's metrics
    pub fn shard(&self, shard_id: u32) -> Option<ShardMetrics> {
        self.shard_metrics.read().get(&shard_id).map(|s| s.snapshot())
    }

    /// Get a snapshot of all shard metrics with computed durations
    pub fn shard_metrics(&self) -> Vec<ShardMetrics> {
        self.shard_metrics.read().values().map(|s| s.snapshot()).collect()
    }

    /// Get the number of shards whose session is ready
    pub fn connected_shards(&self) -> usize {
        self.shard_metrics
            .read()
            .values()
            .filter(|s| s.status == ConnectionStatus::Connected)
            .count()
    }

    /// Get a point-in-time snapshot of all metrics for export
    pub fn snapshot(&self) -> MetricsSnapshot {
        // Take the shard lock once to ensure consistency
        let shards = self.shard_metrics.read();
        let shard_snapshots: Vec<ShardMetrics> = shards.values().map(|s| s.snapshot()).collect();

        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Acquire),
            reconnections_total: self.reconnections_total.load(Ordering::Acquire),
            identifies_total: self.identifies_total.load(Ordering::Acquire),
            resumes_total: self.resumes_total.load(Ordering::Acquire),
            payloads_received_total: self.payloads_received_total.load(Ordering::Acquire),
            payloads_sent_total: self.payloads_sent_total.load(Ordering::Acquire),
            dispatches_total: self.dispatches_total.load(Ordering::Acquire),
            heartbeats_sent_total: self.heartbeats_sent_total.load(Ordering::Acquire),
            heartbeats_acked_total: self.heartbeats_acked_total.load(Ordering::Acquire),
            heartbeats_missed_total: self.heartbeats_missed_total.load(Ordering::Acquire),
            errors_total: self.errors_total.load(Ordering::Acquire),
            fatal_closes_total: self.fatal_closes_total.load(Ordering::Acquire),
            connected_shards: shard_snapshots
                .iter()
                .filter(|s| s.status == ConnectionStatus::Connected)
                .count(),
            shards: shard_snapshots,
        }
    }
}

/// A point-in-time snapshot of all metrics
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub reconnections_total: u64,
    pub identifies_total: u64,
    pub resumes_total: u64,
    pub payloads_received_total: u64,
    pub payloads_sent_total: u64,
    pub dispatches_total: u64,
    pub heartbeats_sent_total: u64,
    pub heartbeats_acked_total: u64,
    pub heartbeats_missed_total: u64,
    pub errors_total: u64,
    pub fatal_closes_total: u64,
    pub connected_shards: usize,
    pub shards: Vec<ShardMetrics>,
}
