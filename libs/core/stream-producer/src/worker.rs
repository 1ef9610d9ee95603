//! Publish workers
//!
//! Every worker runs the same loop: take a sequenced record, wait for a rate
//! permit, pick its partition, then write it with retry until it reaches a terminal
//! outcome. A record a worker has taken is never handed to another worker and
//! never requeued.

use crate::error::WriteError;
use crate::metrics::PipelineMetrics;
use crate::partitioner::{PartitionKey, Partitioner};
use crate::queue::BoundedQueue;
use crate::rate_limiter::PublishLimiter;
use crate::record::Record;
use crate::retry::{GiveUpReason, RetryDecision, RetryPolicy, RetryState};
use crate::writer::LogWriter;
use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Everything the workers share
pub struct WorkerShared {
    pub queue: Arc<BoundedQueue>,
    pub limiter: Arc<PublishLimiter>,
    pub partitioner: Arc<dyn Partitioner>,
    pub writer: Arc<dyn LogWriter>,
    pub metrics: Arc<PipelineMetrics>,
    pub retry: RetryPolicy,
    pub write_timeout: Duration,
}

/// Terminal outcome of one record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Published { partition: usize, attempts: u32 },
    Failed { reason: GiveUpReason, attempts: u32 },
}

/// Loop-local counters, returned when a worker exits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub worker_id: usize,
    pub published: u64,
    pub failed: u64,
    pub retried: u64,
}

/// A single publish worker
pub struct PublishWorker {
    id: usize,
    shared: Arc<WorkerShared>,
}

impl PublishWorker {
    pub fn new(id: usize, shared: Arc<WorkerShared>) -> Self {
        Self { id, shared }
    }

    /// Run until the queue is closed and drained, or abandoned.
    pub async fn run(self) -> WorkerStats {
        debug!(worker_id = self.id, "Worker started");
        let mut stats = WorkerStats {
            worker_id: self.id,
            ..WorkerStats::default()
        };

        while let Some((sequence, record)) = self.shared.queue.take().await {
            self.shared.limiter.acquire().await;
            match self.publish(sequence, &record, &mut stats).await {
                PublishOutcome::Published { .. } => stats.published += 1,
                PublishOutcome::Failed { .. } => stats.failed += 1,
            }
        }

        info!(
            worker_id = self.id,
            published = stats.published,
            failed = stats.failed,
            retried = stats.retried,
            "Worker stopped"
        );
        stats
    }

    /// Publish one record with retry and account for its outcome.
    pub async fn publish(
        &self,
        sequence: u64,
        record: &Record,
        stats: &mut WorkerStats,
    ) -> PublishOutcome {
        let shared = &self.shared;
        let partition = shared.partitioner.assign(record, sequence);
        let key = shared.partitioner.partition_key(partition);
        let mut state = RetryState::new();

        loop {
            let attempt = state.begin_attempt();
            if attempt > 1 {
                shared.metrics.record_retried();
                stats.retried += 1;
            }

            let error = match self.write_once(&key, record.payload()).await {
                Ok(()) => {
                    shared.metrics.record_published(partition);
                    return PublishOutcome::Published {
                        partition,
                        attempts: attempt,
                    };
                }
                Err(error) => error,
            };

            match state.record_failure(&error, &shared.retry) {
                RetryDecision::Retry(delay) => {
                    debug!(
                        worker_id = self.id,
                        partition = %key,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Write failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::GiveUp(reason) => {
                    shared
                        .metrics
                        .record_permanently_failed(error.category().as_ref());
                    warn!(
                        worker_id = self.id,
                        partition = %key,
                        sequence,
                        attempts = attempt,
                        reason = ?reason,
                        error = %error,
                        "Dropping record after failed write"
                    );
                    return PublishOutcome::Failed {
                        reason,
                        attempts: attempt,
                    };
                }
            }
        }
    }

    /// One bounded write call; a timeout is transient, a panic is permanent.
    async fn write_once(&self, key: &PartitionKey, payload: &[u8]) -> Result<(), WriteError> {
        let write = AssertUnwindSafe(self.shared.writer.write(key, payload)).catch_unwind();

        match tokio::time::timeout(self.shared.write_timeout, write).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(WriteError::permanent(format!(
                "{} writer panicked: {}",
                self.shared.writer.name(),
                panic_message(panic.as_ref())
            ))),
            Err(_) => Err(WriteError::transient(format!(
                "write timed out after {:?}",
                self.shared.write_timeout
            ))),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FullQueuePolicy, RateLimit, ShardCount};
    use crate::partitioner::RoundRobinPartitioner;
    use crate::writer::MemoryLogWriter;
    use async_trait::async_trait;

    fn shared_with(writer: Arc<dyn LogWriter>, retry: RetryPolicy, shards: i64) -> Arc<WorkerShared> {
        let shards = ShardCount::new(shards).unwrap();
        let metrics = Arc::new(PipelineMetrics::new("test", shards.get()));
        Arc::new(WorkerShared {
            queue: Arc::new(BoundedQueue::new(16, FullQueuePolicy::Reject, metrics.clone())),
            limiter: Arc::new(PublishLimiter::new(RateLimit::Disabled).unwrap()),
            partitioner: Arc::new(RoundRobinPartitioner::new(shards)),
            writer,
            metrics,
            retry,
            write_timeout: Duration::from_millis(500),
        })
    }

    struct PanickingWriter;

    #[async_trait]
    impl LogWriter for PanickingWriter {
        async fn write(&self, _key: &PartitionKey, _payload: &[u8]) -> Result<(), WriteError> {
            panic!("writer exploded");
        }

        fn name(&self) -> &'static str {
            "panicking"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_then_success() {
        let writer = Arc::new(MemoryLogWriter::new());
        writer.fail_next([WriteError::transient("throttled"), WriteError::transient("throttled")]);
        let shared = shared_with(writer.clone(), RetryPolicy::new().with_max_attempts(5), 1);
        let worker = PublishWorker::new(0, shared.clone());
        let mut stats = WorkerStats::default();

        let outcome = worker.publish(0, &Record::from("r"), &mut stats).await;

        assert_eq!(
            outcome,
            PublishOutcome::Published {
                partition: 0,
                attempts: 3
            }
        );
        let snapshot = shared.metrics.snapshot();
        assert_eq!(snapshot.retried, 2);
        assert_eq!(snapshot.published, 1);
        assert_eq!(snapshot.permanently_failed, 0);
        assert_eq!(stats.retried, 2);
        assert_eq!(writer.attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_transient_exhausts_budget() {
        let writer = Arc::new(MemoryLogWriter::new());
        writer.always_fail(WriteError::transient("busy"));
        let shared = shared_with(writer.clone(), RetryPolicy::new().with_max_attempts(4), 1);
        let worker = PublishWorker::new(0, shared.clone());

        let outcome = worker
            .publish(0, &Record::from("r"), &mut WorkerStats::default())
            .await;

        assert_eq!(
            outcome,
            PublishOutcome::Failed {
                reason: GiveUpReason::Exhausted,
                attempts: 4
            }
        );
        let snapshot = shared.metrics.snapshot();
        assert_eq!(snapshot.retried, 3);
        assert_eq!(snapshot.permanently_failed, 1);
        assert_eq!(writer.attempts(), 4);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let writer = Arc::new(MemoryLogWriter::new());
        writer.always_fail(WriteError::permanent("malformed"));
        let shared = shared_with(writer.clone(), RetryPolicy::new(), 2);
        let worker = PublishWorker::new(0, shared.clone());

        let outcome = worker
            .publish(0, &Record::from("r"), &mut WorkerStats::default())
            .await;

        assert!(matches!(
            outcome,
            PublishOutcome::Failed {
                reason: GiveUpReason::Permanent,
                attempts: 1
            }
        ));
        assert_eq!(shared.metrics.snapshot().retried, 0);
        assert_eq!(writer.attempts(), 1);
    }

    #[tokio::test]
    async fn test_writer_panic_is_isolated() {
        let shared = shared_with(Arc::new(PanickingWriter), RetryPolicy::new(), 1);
        let worker = PublishWorker::new(0, shared.clone());

        let outcome = worker
            .publish(0, &Record::from("r"), &mut WorkerStats::default())
            .await;

        assert!(matches!(
            outcome,
            PublishOutcome::Failed {
                reason: GiveUpReason::Permanent,
                ..
            }
        ));
        assert_eq!(shared.metrics.snapshot().permanently_failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_write_times_out_as_transient() {
        let writer = Arc::new(MemoryLogWriter::new().with_latency(Duration::from_secs(3600)));
        let shared = shared_with(writer, RetryPolicy::new().with_max_attempts(2), 1);
        let worker = PublishWorker::new(0, shared.clone());

        let outcome = worker
            .publish(0, &Record::from("r"), &mut WorkerStats::default())
            .await;

        assert_eq!(
            outcome,
            PublishOutcome::Failed {
                reason: GiveUpReason::Exhausted,
                attempts: 2
            }
        );
        assert_eq!(shared.metrics.snapshot().retried, 1);
    }

    #[tokio::test]
    async fn test_run_drains_closed_queue() {
        let writer = Arc::new(MemoryLogWriter::new());
        let shared = shared_with(writer.clone(), RetryPolicy::new(), 3);
        for i in 0..9 {
            shared.queue.offer(Record::from(format!("r{}", i))).await;
        }
        shared.queue.close();

        let stats = PublishWorker::new(7, shared.clone()).run().await;

        assert_eq!(stats.worker_id, 7);
        assert_eq!(stats.published, 9);
        assert_eq!(shared.metrics.snapshot().published_by_partition, vec![3, 3, 3]);
        assert_eq!(writer.entries_for(1), vec![b"r1".to_vec(), b"r4".to_vec(), b"r7".to_vec()]);
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(boxed.as_ref()), "static");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(42);
        assert_eq!(panic_message(boxed.as_ref()), "non-string panic payload");
    }
}
