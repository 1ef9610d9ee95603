//! Pipeline supervisor
//!
//! `Pipeline` owns the queue, the worker pool and the shared publish state for
//! its whole lifetime. Producers only ever see a cloneable [`PipelineHandle`].
//!
//! # Example
//!
//! ```rust,ignore
//! use stream_producer::{MemoryLogWriter, Pipeline, PipelineConfig, ShardCount};
//!
//! let config = PipelineConfig::new("tweets", ShardCount::new(4)?);
//! let mut pipeline = Pipeline::new(config, Arc::new(MemoryLogWriter::new()))?;
//! pipeline.start()?;
//!
//! let handle = pipeline.handle();
//! handle.offer_line("{\"id\":1}").await;
//!
//! let report = pipeline.shutdown().await;
//! ```

use crate::config::{PipelineConfig, ShutdownPolicy};
use crate::error::PipelineError;
use crate::metrics::{MetricsSnapshot, PipelineMetrics};
use crate::partitioner::build_partitioner;
use crate::queue::{BoundedQueue, Offer};
use crate::rate_limiter::PublishLimiter;
use crate::record::Record;
use crate::worker::{PublishWorker, WorkerShared, WorkerStats};
use crate::writer::LogWriter;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Producer-side handle; cheap to clone
#[derive(Clone, Debug)]
pub struct PipelineHandle {
    queue: Arc<BoundedQueue>,
}

impl PipelineHandle {
    pub async fn offer(&self, record: Record) -> Offer {
        self.queue.offer(record).await
    }

    /// Offer a text line as a record stamped now
    pub async fn offer_line(&self, line: impl Into<String>) -> Offer {
        self.queue.offer(Record::from(line.into())).await
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }
}

enum State {
    Idle,
    Running(JoinSet<WorkerStats>),
    Stopped,
}

/// Result of [`Pipeline::shutdown`]
#[derive(Debug, Clone)]
pub struct ShutdownReport {
    /// Records still queued when the queue was abandoned
    pub abandoned: usize,
    /// The drain did not finish within the shutdown timeout
    pub timed_out: bool,
    pub worker_stats: Vec<WorkerStats>,
    pub snapshot: MetricsSnapshot,
    pub elapsed: Duration,
}

/// Bounded queue plus worker pool publishing to a partitioned log
pub struct Pipeline {
    config: PipelineConfig,
    shared: Arc<WorkerShared>,
    state: State,
}

impl Pipeline {
    /// Validate the config and build the pipeline. No tasks are spawned yet.
    pub fn new(config: PipelineConfig, writer: Arc<dyn LogWriter>) -> Result<Self, PipelineError> {
        config.validate()?;

        let metrics = Arc::new(PipelineMetrics::new(
            config.stream_name.clone(),
            config.shard_count.get(),
        ));
        let queue = Arc::new(BoundedQueue::new(
            config.queue_capacity,
            config.full_queue_policy,
            metrics.clone(),
        ));
        let shared = Arc::new(WorkerShared {
            queue,
            limiter: Arc::new(PublishLimiter::new(config.rate_limit)?),
            partitioner: build_partitioner(config.partition_strategy, config.shard_count),
            writer,
            metrics,
            retry: config.retry.clone(),
            write_timeout: config.write_timeout,
        });

        Ok(Self {
            config,
            shared,
            state: State::Idle,
        })
    }

    /// Spawn the worker pool.
    pub fn start(&mut self) -> Result<(), PipelineError> {
        match self.state {
            State::Idle => {}
            State::Running(_) => return Err(PipelineError::AlreadyStarted),
            State::Stopped => return Err(PipelineError::Stopped),
        }

        let mut workers = JoinSet::new();
        for id in 0..self.config.worker_count {
            workers.spawn(PublishWorker::new(id, self.shared.clone()).run());
        }

        info!(
            stream = %self.config.stream_name,
            workers = self.config.worker_count,
            queue_capacity = self.config.queue_capacity,
            shards = self.config.shard_count.get(),
            partitioner = self.shared.partitioner.name(),
            writer = self.shared.writer.name(),
            rate_limit = ?self.shared.limiter.limits(),
            "Pipeline started"
        );
        self.state = State::Running(workers);
        Ok(())
    }

    pub fn handle(&self) -> PipelineHandle {
        PipelineHandle {
            queue: self.shared.queue.clone(),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<PipelineMetrics> {
        self.shared.metrics.clone()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    pub fn queue(&self) -> Arc<BoundedQueue> {
        self.shared.queue.clone()
    }

    pub fn writer(&self) -> Arc<dyn LogWriter> {
        self.shared.writer.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, State::Running(_))
    }

    /// Stop accepting records and wind the workers down.
    ///
    /// Drain keeps publishing queued records until the queue is empty or the
    /// shutdown timeout expires; Discard drops them right away. Whatever is
    /// still queued at that point is counted dropped. Records already held by
    /// a worker are finished, never interrupted mid-write.
    pub async fn shutdown(&mut self) -> ShutdownReport {
        let started = Instant::now();
        let queue = &self.shared.queue;
        queue.close();

        let mut workers = match std::mem::replace(&mut self.state, State::Stopped) {
            State::Running(workers) => workers,
            State::Idle | State::Stopped => JoinSet::new(),
        };
        info!(
            policy = %self.config.shutdown_policy,
            queued = queue.len(),
            workers = workers.len(),
            "Shutting down pipeline"
        );

        let mut abandoned = 0;
        if self.config.shutdown_policy == ShutdownPolicy::Discard || workers.is_empty() {
            abandoned += queue.abandon().await;
        }

        let mut worker_stats = Vec::with_capacity(workers.len());
        let drained = tokio::time::timeout(
            self.config.shutdown_timeout,
            join_workers(&mut workers, &mut worker_stats),
        )
        .await
        .is_ok();

        if !drained {
            abandoned += queue.abandon().await;
            warn!(
                timeout_secs = self.config.shutdown_timeout.as_secs_f64(),
                abandoned, "Shutdown timeout reached, abandoned queued records"
            );
            join_workers(&mut workers, &mut worker_stats).await;
        }
        worker_stats.sort_by_key(|stats| stats.worker_id);

        let snapshot = self.shared.metrics.snapshot();
        self.shared.metrics.queue_depth(queue.len());
        let report = ShutdownReport {
            abandoned,
            timed_out: !drained,
            worker_stats,
            snapshot,
            elapsed: started.elapsed(),
        };
        info!(
            received = report.snapshot.received,
            published = report.snapshot.published,
            dropped = report.snapshot.dropped,
            permanently_failed = report.snapshot.permanently_failed,
            retried = report.snapshot.retried,
            abandoned = report.abandoned,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Pipeline stopped"
        );
        report
    }

    /// Start, run until `shutdown` flips to true (or its sender is dropped),
    /// then shut down.
    pub async fn run_until(
        mut self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<ShutdownReport, PipelineError> {
        if !self.is_running() {
            self.start()?;
        }
        let _ = shutdown.wait_for(|stop| *stop).await;
        Ok(self.shutdown().await)
    }
}

async fn join_workers(workers: &mut JoinSet<WorkerStats>, stats: &mut Vec<WorkerStats>) {
    while let Some(result) = workers.join_next().await {
        match result {
            Ok(worker) => stats.push(worker),
            Err(e) => error!(error = %e, "Worker task failed"),
        }
    }
}
