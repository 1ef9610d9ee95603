//! Pipeline counters and Prometheus export
//!
//! `PipelineMetrics` holds the authoritative atomic counters. Every update is
//! mirrored to the `metrics` facade so the Prometheus exporter (when
//! installed) sees the same numbers.

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use strum::{AsRefStr, Display};
use tracing::{info, warn};

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Initialize Prometheus metrics
///
/// Call this once at startup. Subsequent calls are no-ops. If another
/// recorder is already installed the exporter stays disabled and
/// `render_metrics` returns an empty body.
pub fn init_metrics() {
    let _ = PROMETHEUS_HANDLE.get_or_try_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .inspect(|_| info!("Prometheus metrics initialized"))
            .inspect_err(|e| warn!(error = %e, "Failed to install Prometheus recorder"))
    });
}

/// Get the Prometheus handle for rendering metrics
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render metrics in Prometheus format
pub fn render_metrics() -> String {
    prometheus_handle()
        .map(|h| h.render())
        .unwrap_or_default()
}

/// Why a record was dropped without a publish attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum DropReason {
    /// Queue at capacity (after the block timeout, if any)
    QueueFull,
    /// Offered after the queue was closed
    Closed,
    /// Still queued when shutdown abandoned the queue
    Abandoned,
}

/// Lock-free pipeline counters
#[derive(Debug)]
pub struct PipelineMetrics {
    stream_name: String,
    received: AtomicU64,
    published: AtomicU64,
    dropped: AtomicU64,
    retried: AtomicU64,
    permanently_failed: AtomicU64,
    published_by_partition: Box<[AtomicU64]>,
}

impl PipelineMetrics {
    pub fn new(stream_name: impl Into<String>, shard_count: usize) -> Self {
        Self {
            stream_name: stream_name.into(),
            received: AtomicU64::new(0),
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            permanently_failed: AtomicU64::new(0),
            published_by_partition: (0..shard_count).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    pub fn shard_count(&self) -> usize {
        self.published_by_partition.len()
    }

    /// Record an offer reaching the queue
    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
        counter!(
            "stream_producer_records_received_total",
            "stream" => self.stream_name.clone()
        )
        .increment(1);
    }

    /// Record a successful write to `partition`
    pub fn record_published(&self, partition: usize) {
        if let Some(slot) = self.published_by_partition.get(partition) {
            slot.fetch_add(1, Ordering::Relaxed);
        }
        self.published.fetch_add(1, Ordering::Relaxed);
        counter!(
            "stream_producer_records_published_total",
            "stream" => self.stream_name.clone(),
            "partition" => partition.to_string()
        )
        .increment(1);
    }

    pub fn record_dropped(&self, reason: DropReason) {
        self.record_dropped_many(reason, 1);
    }

    pub fn record_dropped_many(&self, reason: DropReason, count: u64) {
        if count == 0 {
            return;
        }
        self.dropped.fetch_add(count, Ordering::Relaxed);
        counter!(
            "stream_producer_records_dropped_total",
            "stream" => self.stream_name.clone(),
            "reason" => reason.as_ref().to_string()
        )
        .increment(count);
    }

    /// Record a re-attempt of a failed write
    pub fn record_retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
        counter!(
            "stream_producer_write_retries_total",
            "stream" => self.stream_name.clone()
        )
        .increment(1);
    }

    pub fn record_permanently_failed(&self, category: &str) {
        self.permanently_failed.fetch_add(1, Ordering::Relaxed);
        counter!(
            "stream_producer_records_failed_total",
            "stream" => self.stream_name.clone(),
            "category" => category.to_string()
        )
        .increment(1);
    }

    /// Update queue depth gauge
    pub fn queue_depth(&self, depth: usize) {
        gauge!(
            "stream_producer_queue_depth",
            "stream" => self.stream_name.clone()
        )
        .set(depth as f64);
    }

    /// Point-in-time copy of every counter.
    ///
    /// Outcome counters are read before `received`, so a concurrent update can
    /// only make `in_flight` look larger, never negative.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let published_by_partition = self
            .published_by_partition
            .iter()
            .map(|c| c.load(Ordering::Acquire))
            .collect();
        let published = self.published.load(Ordering::Acquire);
        let dropped = self.dropped.load(Ordering::Acquire);
        let permanently_failed = self.permanently_failed.load(Ordering::Acquire);
        let retried = self.retried.load(Ordering::Acquire);
        let received = self.received.load(Ordering::Acquire);

        MetricsSnapshot {
            taken_at: Utc::now(),
            stream_name: self.stream_name.clone(),
            received,
            published,
            dropped,
            retried,
            permanently_failed,
            published_by_partition,
        }
    }
}

/// Immutable copy of the pipeline counters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub taken_at: DateTime<Utc>,
    pub stream_name: String,
    pub received: u64,
    pub published: u64,
    pub dropped: u64,
    pub retried: u64,
    pub permanently_failed: u64,
    pub published_by_partition: Vec<u64>,
}

impl MetricsSnapshot {
    /// Records accepted but not yet resolved to an outcome
    pub fn in_flight(&self) -> u64 {
        self.received
            .saturating_sub(self.published + self.dropped + self.permanently_failed)
    }

    pub fn total_published_by_partition(&self) -> u64 {
        self.published_by_partition.iter().sum()
    }

    /// Ratio of the busiest to the idlest partition.
    ///
    /// `None` until every partition has published at least once.
    pub fn skew(&self) -> Option<f64> {
        let max = *self.published_by_partition.iter().max()?;
        let min = *self.published_by_partition.iter().min()?;
        (min > 0).then(|| max as f64 / min as f64)
    }

    /// Per-second rates between `previous` and `self`.
    pub fn rates_since(&self, previous: &MetricsSnapshot) -> MetricsRates {
        let elapsed = (self.taken_at - previous.taken_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        let secs = elapsed.as_secs_f64();
        let rate = |now: u64, before: u64| {
            if secs > 0.0 {
                now.saturating_sub(before) as f64 / secs
            } else {
                0.0
            }
        };

        MetricsRates {
            elapsed,
            received_per_sec: rate(self.received, previous.received),
            published_per_sec: rate(self.published, previous.published),
            dropped_per_sec: rate(self.dropped, previous.dropped),
            failed_per_sec: rate(self.permanently_failed, previous.permanently_failed),
        }
    }
}

/// Throughput over one report interval
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricsRates {
    #[serde(with = "duration_secs")]
    pub elapsed: Duration,
    pub received_per_sec: f64,
    pub published_per_sec: f64,
    pub dropped_per_sec: f64,
    pub failed_per_sec: f64,
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }
}
