//! Periodic metrics reporting
//!
//! Every report interval the reporter takes a snapshot, derives per-interval
//! rates and hands the report to each configured [`MetricsSink`].

use crate::metrics::{MetricsRates, MetricsSnapshot, PipelineMetrics};
use crate::queue::BoundedQueue;
use async_trait::async_trait;
use metrics::gauge;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Partition skew above which the log sink warns
const SKEW_WARN_RATIO: f64 = 2.0;

/// One periodic report
#[derive(Debug, Clone, Serialize)]
pub struct MetricsReport {
    pub snapshot: MetricsSnapshot,
    pub rates: MetricsRates,
    pub queue_depth: usize,
    pub queue_capacity: usize,
}

/// Destination for periodic reports
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn report(&self, report: &MetricsReport);

    fn name(&self) -> &'static str;
}

/// Writes totals, rates and per-partition counts to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl MetricsSink for LogSink {
    async fn report(&self, report: &MetricsReport) {
        let snapshot = &report.snapshot;
        info!(
            stream = %snapshot.stream_name,
            received = snapshot.received,
            published = snapshot.published,
            dropped = snapshot.dropped,
            retried = snapshot.retried,
            permanently_failed = snapshot.permanently_failed,
            in_flight = snapshot.in_flight(),
            queue_depth = report.queue_depth,
            published_per_sec = report.rates.published_per_sec,
            received_per_sec = report.rates.received_per_sec,
            "Pipeline metrics"
        );

        for (partition, count) in snapshot.published_by_partition.iter().enumerate() {
            debug!(stream = %snapshot.stream_name, partition, published = count, "Partition metrics");
        }

        match snapshot.skew() {
            Some(skew) if skew > SKEW_WARN_RATIO => warn!(
                stream = %snapshot.stream_name,
                skew,
                "Partition load is uneven"
            ),
            _ => {}
        }

        if report.rates.dropped_per_sec > 0.0 {
            warn!(
                stream = %snapshot.stream_name,
                dropped_per_sec = report.rates.dropped_per_sec,
                queue_depth = report.queue_depth,
                queue_capacity = report.queue_capacity,
                "Records are being dropped"
            );
        }
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

/// Publishes report-level gauges (rates, in-flight, skew) to the metrics facade
#[derive(Debug, Default, Clone, Copy)]
pub struct PrometheusSink;

#[async_trait]
impl MetricsSink for PrometheusSink {
    async fn report(&self, report: &MetricsReport) {
        let stream = report.snapshot.stream_name.clone();
        gauge!("stream_producer_publish_rate", "stream" => stream.clone())
            .set(report.rates.published_per_sec);
        gauge!("stream_producer_receive_rate", "stream" => stream.clone())
            .set(report.rates.received_per_sec);
        gauge!("stream_producer_in_flight", "stream" => stream.clone())
            .set(report.snapshot.in_flight() as f64);
        gauge!("stream_producer_queue_depth", "stream" => stream.clone())
            .set(report.queue_depth as f64);
        if let Some(skew) = report.snapshot.skew() {
            gauge!("stream_producer_partition_skew", "stream" => stream).set(skew);
        }
    }

    fn name(&self) -> &'static str {
        "prometheus"
    }
}

/// Drives the sinks on a fixed interval
pub struct MetricsReporter {
    metrics: Arc<PipelineMetrics>,
    queue: Arc<BoundedQueue>,
    interval: Duration,
    sinks: Vec<Arc<dyn MetricsSink>>,
    last: MetricsSnapshot,
}

impl MetricsReporter {
    pub fn new(metrics: Arc<PipelineMetrics>, queue: Arc<BoundedQueue>, interval: Duration) -> Self {
        let last = metrics.snapshot();
        Self {
            metrics,
            queue,
            interval,
            sinks: Vec::new(),
            last,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Build a report for the interval since the previous one.
    pub fn collect(&mut self) -> MetricsReport {
        let snapshot = self.metrics.snapshot();
        let rates = snapshot.rates_since(&self.last);
        self.last = snapshot.clone();

        MetricsReport {
            snapshot,
            rates,
            queue_depth: self.queue.len(),
            queue_capacity: self.queue.capacity(),
        }
    }

    pub async fn report_once(&mut self) -> MetricsReport {
        let report = self.collect();
        for sink in &self.sinks {
            sink.report(&report).await;
        }
        report
    }

    /// Report every interval until `shutdown` flips to true, then emit a
    /// final report.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        info!(
            interval_secs = self.interval.as_secs_f64(),
            sinks = self.sinks.len(),
            "Metrics reporter started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.report_once().await;
                }
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => {
                    break;
                }
            }
        }

        self.report_once().await;
        debug!("Metrics reporter stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FullQueuePolicy;
    use crate::record::Record;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CollectingSink {
        reports: Mutex<Vec<MetricsReport>>,
    }

    #[async_trait]
    impl MetricsSink for CollectingSink {
        async fn report(&self, report: &MetricsReport) {
            self.reports.lock().unwrap().push(report.clone());
        }

        fn name(&self) -> &'static str {
            "collecting"
        }
    }

    fn fixture() -> (Arc<PipelineMetrics>, Arc<BoundedQueue>) {
        let metrics = Arc::new(PipelineMetrics::new("test", 2));
        let queue = Arc::new(BoundedQueue::new(8, FullQueuePolicy::Reject, metrics.clone()));
        (metrics, queue)
    }

    #[tokio::test]
    async fn test_collect_reports_queue_and_counters() {
        let (metrics, queue) = fixture();
        queue.offer(Record::from("a")).await;
        queue.offer(Record::from("b")).await;
        metrics.record_published(1);

        let mut reporter = MetricsReporter::new(metrics, queue, Duration::from_secs(60));
        let report = reporter.collect();

        assert_eq!(report.snapshot.received, 2);
        assert_eq!(report.snapshot.published_by_partition, vec![0, 1]);
        assert_eq!(report.queue_depth, 2);
        assert_eq!(report.queue_capacity, 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_reports_each_interval_and_on_shutdown() {
        let (metrics, queue) = fixture();
        let sink = Arc::new(CollectingSink::default());
        let reporter = MetricsReporter::new(metrics, queue, Duration::from_secs(10))
            .with_sink(sink.clone())
            .with_sink(Arc::new(LogSink));
        let (tx, rx) = watch::channel(false);

        let task = tokio::spawn(reporter.run(rx));
        tokio::time::sleep(Duration::from_secs(25)).await;
        tx.send(true).unwrap();
        task.await.unwrap();

        // Two interval reports plus the final one
        assert_eq!(sink.reports.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_prometheus_sink_without_recorder() {
        let (metrics, queue) = fixture();
        let mut reporter = MetricsReporter::new(metrics, queue, Duration::from_secs(1))
            .with_sink(Arc::new(PrometheusSink));
        let report = reporter.report_once().await;
        assert_eq!(report.snapshot.received, 0);
        assert_eq!(PrometheusSink.name(), "prometheus");
    }
}
