//! Stream Producer Pipeline
//!
//! Fans a continuous feed of records out to a partitioned, append-only log.
//!
//! ## Features
//!
//! - **Bounded queue**: fixed capacity, reject or bounded-block when full
//! - **Worker pool**: symmetric publish workers spawned by `Pipeline::start`
//! - **Partitioning**: round-robin by sequence number, or murmur2 of the payload
//! - **Rate limiting**: shared token bucket (governor) across all workers
//! - **Retries**: capped exponential backoff with jitter for transient failures
//! - **Metrics**: lock-free counters, per-partition counts, Prometheus export
//! - **Health endpoints**: K8s-ready liveness and readiness probes
//!
//! ## Example
//!
//! ```ignore
//! use stream_producer::{Pipeline, PipelineConfig, RedisStreamConfig, RedisStreamWriter};
//! use core_config::FromEnv;
//!
//! let config = PipelineConfig::from_env()?;
//! let writer = RedisStreamWriter::connect(&RedisStreamConfig::from_env()?, &config.stream_name).await?;
//!
//! let mut pipeline = Pipeline::new(config, Arc::new(writer))?;
//! pipeline.start()?;
//!
//! let handle = pipeline.handle();
//! handle.offer_line(line).await;
//!
//! let report = pipeline.shutdown().await;
//! ```

mod config;
mod error;
mod health;
pub mod metrics;
mod partitioner;
mod pipeline;
mod queue;
mod rate_limiter;
mod record;
mod reporter;
mod retry;
mod worker;
mod writer;

// Re-export main types
pub use config::{
    FullQueueMode, FullQueuePolicy, PartitionStrategy, PipelineConfig, RateLimit, ShardCount,
    ShutdownPolicy,
};
pub use error::{ErrorCategory, PipelineError, WriteError};
pub use health::{health_router, HealthState};
pub use metrics::{init_metrics, DropReason, MetricsRates, MetricsSnapshot, PipelineMetrics};
pub use partitioner::{
    build_partitioner, murmur2, KeyHashPartitioner, PartitionKey, Partitioner,
    RoundRobinPartitioner, SequenceCursor,
};
pub use pipeline::{Pipeline, PipelineHandle, ShutdownReport};
pub use queue::{BoundedQueue, Offer};
pub use rate_limiter::PublishLimiter;
pub use record::Record;
pub use reporter::{LogSink, MetricsReport, MetricsReporter, MetricsSink, PrometheusSink};
pub use retry::{GiveUpReason, RetryDecision, RetryPolicy, RetryState};
pub use worker::{PublishOutcome, PublishWorker, WorkerShared, WorkerStats};
pub use writer::{
    classify_redis_error, LogWriter, MemoryLogWriter, RedisStreamConfig, RedisStreamWriter,
};
