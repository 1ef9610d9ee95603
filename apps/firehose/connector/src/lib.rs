//! Firehose Connector Service
//!
//! Reads a newline-delimited activity firehose and publishes every record to
//! a partitioned Redis Streams log.
//!
//! ## Architecture
//!
//! ```text
//! Streaming HTTP endpoint (or stdin)
//!   ↓ (one line per record, keep-alives skipped)
//! FeedSource
//!   ↓ (offer, reject when full)
//! BoundedQueue
//!   ↓ (N publish workers, shared rate limit)
//! Partitioner → RedisStreamWriter
//!   ↓
//! Redis Streams ({stream}:shard-NNNN)
//! ```
//!
//! ## Features
//!
//! - Automatic reconnect with exponential backoff
//! - Replay windows for historical streams
//! - Retry of transient write failures
//! - Periodic throughput and partition skew reports
//! - Graceful drain on shutdown
//! - Health check endpoint for Kubernetes probes

pub mod config;
pub mod source;

use axum::Router;
use config::{ConnectorConfig, SourceConfig};
use core_config::{app_info, Environment, FromEnv};
use eyre::{Result, WrapErr};
use source::{FeedSource, HttpStreamSource, ReaderSource, SourceError, SourceStats};
use std::sync::Arc;
use std::time::Duration;
use stream_producer::{
    health_router, init_metrics, HealthState, LogSink, MetricsReporter, Pipeline,
    PrometheusSink, RedisStreamWriter, ShutdownReport,
};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// How long a source gets to notice shutdown before it is aborted
const SOURCE_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Start the health HTTP server
///
/// Provides endpoints for:
/// - Liveness probes: `/health`, `/healthz`
/// - Readiness probes: `/ready`, `/readyz`
/// - Prometheus metrics: `/metrics`
/// - Pipeline counters: `/stats`
async fn start_health_server(health_state: HealthState, port: u16) -> Result<()> {
    let app: Router = health_router(health_state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind health server to {}", addr))?;

    info!(port = %port, "Health server listening");

    axum::serve(listener, app)
        .await
        .wrap_err("Health server failed")?;

    Ok(())
}

/// Drain the pipeline, then let the reporter emit its final report so that
/// report covers everything the drain published.
async fn drain_then_report(
    pipeline: &mut Pipeline,
    reporter_stop: watch::Sender<bool>,
    reporter_task: JoinHandle<()>,
) -> ShutdownReport {
    info!("Draining publish workers...");
    let report = pipeline.shutdown().await;

    reporter_stop.send_replace(true);
    if let Err(e) = reporter_task.await {
        warn!(error = %e, "Metrics reporter task failed");
    }
    report
}

fn build_source(
    config: &SourceConfig,
    stats: Arc<SourceStats>,
) -> Result<Box<dyn FeedSource>, SourceError> {
    let source: Box<dyn FeedSource> = match config {
        SourceConfig::Http(http) => Box::new(HttpStreamSource::new(http.clone(), stats)?),
        SourceConfig::Stdin => Box::new(ReaderSource::stdin(stats)),
    };
    Ok(source)
}

/// Run the connector
///
/// This is the main entry point for the service. It:
/// 1. Sets up error reports, structured logging and Prometheus metrics
/// 2. Loads and logs the configuration
/// 3. Connects to Redis and starts the publish workers
/// 4. Streams the feed into the pipeline until SIGINT/SIGTERM or end of input
/// 5. Drains the pipeline and logs the final accounting
///
/// # Errors
///
/// Returns an error if:
/// - Configuration is missing or invalid
/// - Redis connection fails
/// - The feed rejects the credentials
pub async fn run() -> Result<()> {
    core_config::tracing::install_color_eyre();

    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    init_metrics();

    let app_info = app_info!();
    info!(name = %app_info.name, version = %app_info.version, "Starting firehose connector");
    info!("Environment: {:?}", environment);

    let config = ConnectorConfig::from_env().wrap_err("Failed to load connector configuration")?;
    config.log_properties();

    info!("Connecting to Redis...");
    let writer = RedisStreamWriter::connect(&config.redis, config.pipeline.stream_name.clone())
        .await
        .wrap_err("Failed to connect to Redis")?;
    let writer = Arc::new(writer);

    let report_interval = config.pipeline.report_interval;
    let mut pipeline =
        Pipeline::new(config.pipeline.clone(), writer).wrap_err("Invalid pipeline configuration")?;
    pipeline.start().wrap_err("Failed to start publish workers")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (reporter_stop, reporter_rx) = watch::channel(false);

    let health_state = HealthState::new(
        app_info.name,
        app_info.version,
        pipeline.metrics(),
        pipeline.queue(),
        pipeline.writer(),
    );
    let health_port = config.health_port;
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_state, health_port).await {
            error!(error = %e, "Health server failed");
        }
    });

    let reporter = MetricsReporter::new(pipeline.metrics(), pipeline.queue(), report_interval)
        .with_sink(Arc::new(LogSink))
        .with_sink(Arc::new(PrometheusSink));
    let reporter_task = tokio::spawn(reporter.run(reporter_rx));

    let source_stats = Arc::new(SourceStats::new());
    let mut source = build_source(&config.source, source_stats.clone())
        .wrap_err("Failed to build feed source")?;
    info!(source = source.name(), "Starting feed source");

    let handle = pipeline.handle();
    let mut source_task = tokio::spawn(async move { source.run(handle, shutdown_rx).await });

    let source_result = tokio::select! {
        signal = shutdown_signal() => {
            if let Err(e) = signal {
                error!(error = %e, "Error waiting for shutdown signal");
            }
            shutdown_tx.send_replace(true);
            match tokio::time::timeout(SOURCE_STOP_TIMEOUT, &mut source_task).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!("Feed source did not stop in time, aborting it");
                    source_task.abort();
                    Ok(Ok(()))
                }
            }
        }
        joined = &mut source_task => {
            info!("Feed source finished");
            shutdown_tx.send_replace(true);
            joined
        }
    };

    let report = drain_then_report(&mut pipeline, reporter_stop, reporter_task).await;
    info!(
        received = report.snapshot.received,
        published = report.snapshot.published,
        dropped = report.snapshot.dropped,
        permanently_failed = report.snapshot.permanently_failed,
        abandoned = report.abandoned,
        timed_out = report.timed_out,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "Final pipeline accounting"
    );
    info!(stats = ?source_stats.snapshot(), "Feed source stopped");

    source_result
        .wrap_err("Feed source task panicked")?
        .wrap_err("Feed source failed")?;

    info!("Firehose connector stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() -> Result<()> {
    let ctrl_c = async { signal::ctrl_c().await.wrap_err("Failed to install Ctrl+C handler") };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .wrap_err("Failed to install signal handler")?
            .recv()
            .await;
        Ok::<(), eyre::Report>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Result<()>>();

    tokio::select! {
        result = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
            result
        },
        result = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
            result
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use stream_producer::{MemoryLogWriter, MetricsReport, MetricsSink, PipelineConfig, ShardCount};

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

    #[tokio::test]
    async fn test_final_report_follows_drain() {
        let config = PipelineConfig::new("tweets", ShardCount::new(2).unwrap())
            .with_worker_count(2)
            .with_queue_capacity(32);
        let mut pipeline = Pipeline::new(config, Arc::new(MemoryLogWriter::new())).unwrap();
        let handle = pipeline.handle();
        for i in 0..20 {
            handle.offer_line(format!("{}", i)).await;
        }

        let sink = Arc::new(CollectingSink::default());
        let reporter =
            MetricsReporter::new(pipeline.metrics(), pipeline.queue(), Duration::from_secs(3600))
                .with_sink(sink.clone());
        let (reporter_stop, reporter_rx) = watch::channel(false);
        let reporter_task = tokio::spawn(reporter.run(reporter_rx));

        pipeline.start().unwrap();
        let report = drain_then_report(&mut pipeline, reporter_stop, reporter_task).await;

        assert_eq!(report.snapshot.published, 20);
        let reports = sink.reports.lock().unwrap();
        let last = reports.last().expect("final report");
        assert_eq!(last.snapshot.published, 20);
        assert_eq!(last.queue_depth, 0);
    }
}
