//! Bounded inbound queue
//!
//! The only decoupling point between the feed and the worker pool. Producers
//! `offer`; workers `take`. Closing stops new offers but leaves queued records
//! takeable; abandoning discards them.
//!
//! Every taken record carries a sequence number stamped while the receiver
//! lock is held, so sequence order is arrival order no matter how many
//! workers are taking.

use crate::config::FullQueuePolicy;
use crate::metrics::{DropReason, PipelineMetrics};
use crate::partitioner::SequenceCursor;
use crate::record::Record;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};

/// Outcome of [`BoundedQueue::offer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Accepted,
    Rejected(DropReason),
}

impl Offer {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Offer::Accepted)
    }
}

/// Fixed-capacity FIFO shared by the feed and the workers
pub struct BoundedQueue {
    sender: RwLock<Option<mpsc::Sender<Record>>>,
    receiver: Mutex<mpsc::Receiver<Record>>,
    abandoned: watch::Sender<bool>,
    cursor: SequenceCursor,
    depth: AtomicUsize,
    capacity: usize,
    policy: FullQueuePolicy,
    metrics: Arc<PipelineMetrics>,
}

impl BoundedQueue {
    /// `capacity` must be non-zero; `PipelineConfig::validate` guarantees it.
    pub fn new(capacity: usize, policy: FullQueuePolicy, metrics: Arc<PipelineMetrics>) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let (abandoned, _) = watch::channel(false);
        Self {
            sender: RwLock::new(Some(sender)),
            receiver: Mutex::new(receiver),
            abandoned,
            cursor: SequenceCursor::new(),
            depth: AtomicUsize::new(0),
            capacity: capacity.max(1),
            policy,
            metrics,
        }
    }

    /// Enqueue a record. Counts it received; a rejection also counts it dropped.
    pub async fn offer(&self, record: Record) -> Offer {
        self.metrics.record_received();

        let sender = self
            .sender
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(sender) = sender else {
            return self.reject(DropReason::Closed);
        };

        // Reserve depth before sending so a fast consumer never underflows it
        self.depth.fetch_add(1, Ordering::AcqRel);
        let result = match self.policy {
            FullQueuePolicy::Reject => sender.try_send(record).map_err(|e| match e {
                TrySendError::Full(_) => DropReason::QueueFull,
                TrySendError::Closed(_) => DropReason::Closed,
            }),
            FullQueuePolicy::Block { timeout } => {
                sender.send_timeout(record, timeout).await.map_err(|e| match e {
                    SendTimeoutError::Timeout(_) => DropReason::QueueFull,
                    SendTimeoutError::Closed(_) => DropReason::Closed,
                })
            }
        };

        match result {
            Ok(()) => {
                self.metrics.queue_depth(self.len());
                Offer::Accepted
            }
            Err(reason) => {
                self.depth.fetch_sub(1, Ordering::AcqRel);
                self.reject(reason)
            }
        }
    }

    fn reject(&self, reason: DropReason) -> Offer {
        self.metrics.record_dropped(reason);
        Offer::Rejected(reason)
    }

    /// Wait for the next record and its sequence number.
    ///
    /// `None` once the queue is closed and empty, or as soon as it has been
    /// abandoned.
    pub async fn take(&self) -> Option<(u64, Record)> {
        let mut abandoned = self.abandoned.subscribe();
        if *abandoned.borrow_and_update() {
            return None;
        }

        let next = tokio::select! {
            _ = abandoned.wait_for(|flag| *flag) => None,
            taken = async {
                let mut receiver = self.receiver.lock().await;
                let record = receiver.recv().await?;
                Some((self.cursor.next(), record))
            } => taken,
        };
        let taken = next?;

        self.depth.fetch_sub(1, Ordering::AcqRel);
        Some(taken)
    }

    /// Sequence numbers handed out so far
    pub fn taken(&self) -> u64 {
        self.cursor.current()
    }

    /// Stop accepting offers. Queued records stay takeable.
    pub fn close(&self) {
        self.sender
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Close the queue and discard everything still in it, counting each
    /// record as dropped. Returns the number discarded.
    pub async fn abandon(&self) -> usize {
        self.close();
        self.abandoned.send_replace(true);

        let mut receiver = self.receiver.lock().await;
        receiver.close();
        let mut discarded = 0;
        while receiver.try_recv().is_ok() {
            discarded += 1;
        }
        drop(receiver);

        self.depth.fetch_sub(discarded, Ordering::AcqRel);
        self.metrics
            .record_dropped_many(DropReason::Abandoned, discarded as u64);
        self.metrics.queue_depth(self.len());
        discarded
    }

    pub fn len(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.sender
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    pub fn is_abandoned(&self) -> bool {
        *self.abandoned.borrow()
    }
}

impl std::fmt::Debug for BoundedQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("policy", &self.policy)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn queue(capacity: usize, policy: FullQueuePolicy) -> (BoundedQueue, Arc<PipelineMetrics>) {
        let metrics = Arc::new(PipelineMetrics::new("test", 1));
        (BoundedQueue::new(capacity, policy, metrics.clone()), metrics)
    }

    #[tokio::test]
    async fn test_reject_when_full() {
        let (queue, metrics) = queue(2, FullQueuePolicy::Reject);

        let outcomes: Vec<Offer> = futures::future::join_all(
            (0..5).map(|i| queue.offer(Record::from(format!("r{}", i)))),
        )
        .await;

        let accepted = outcomes.iter().filter(|o| o.is_accepted()).count();
        assert_eq!(accepted, 2);
        assert_eq!(queue.len(), 2);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.received, 5);
        assert_eq!(snapshot.dropped, 3);
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let (queue, _) = queue(4, FullQueuePolicy::Reject);
        for line in ["a", "b", "c"] {
            queue.offer(Record::from(line)).await;
        }
        queue.close();

        let mut taken = Vec::new();
        while let Some((sequence, record)) = queue.take().await {
            taken.push((sequence, record.as_str().unwrap_or_default().to_string()));
        }
        assert_eq!(
            taken,
            vec![(0, "a".to_string()), (1, "b".to_string()), (2, "c".to_string())]
        );
        assert!(queue.is_empty());
        assert_eq!(queue.taken(), 3);
    }

    #[tokio::test]
    async fn test_offer_after_close_is_rejected() {
        let (queue, metrics) = queue(4, FullQueuePolicy::Reject);
        queue.close();

        assert_eq!(
            queue.offer(Record::from("late")).await,
            Offer::Rejected(DropReason::Closed)
        );
        assert!(queue.is_closed());
        assert_eq!(metrics.snapshot().dropped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_policy_times_out() {
        let (queue, metrics) = queue(
            1,
            FullQueuePolicy::Block {
                timeout: Duration::from_millis(100),
            },
        );
        assert!(queue.offer(Record::from("first")).await.is_accepted());

        let outcome = queue.offer(Record::from("second")).await;
        assert_eq!(outcome, Offer::Rejected(DropReason::QueueFull));
        assert_eq!(metrics.snapshot().dropped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_policy_waits_for_room() {
        let (queue, _) = queue(
            1,
            FullQueuePolicy::Block {
                timeout: Duration::from_secs(5),
            },
        );
        let queue = Arc::new(queue);
        assert!(queue.offer(Record::from("first")).await.is_accepted());

        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                queue.take().await
            })
        };

        assert!(queue.offer(Record::from("second")).await.is_accepted());
        assert!(consumer.await.unwrap().is_some());
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_abandon_discards_and_counts() {
        let (queue, metrics) = queue(8, FullQueuePolicy::Reject);
        for i in 0..4 {
            queue.offer(Record::from(format!("r{}", i))).await;
        }

        assert_eq!(queue.abandon().await, 4);
        assert!(queue.take().await.is_none());
        assert!(queue.is_abandoned());

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.received, 4);
        assert_eq!(snapshot.dropped, 4);
        assert_eq!(snapshot.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_abandon_wakes_waiting_taker() {
        let (queue, _) = queue(2, FullQueuePolicy::Reject);
        let queue = Arc::new(queue);

        let taker = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.take().await })
        };
        tokio::task::yield_now().await;

        queue.abandon().await;
        let taken = tokio::time::timeout(Duration::from_secs(1), taker)
            .await
            .expect("taker should wake")
            .unwrap();
        assert!(taken.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_takers_get_arrival_sequence() {
        let (queue, _) = queue(64, FullQueuePolicy::Reject);
        let queue = Arc::new(queue);
        for i in 0..48 {
            queue.offer(Record::from(format!("{}", i))).await;
        }
        queue.close();

        let takers: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move {
                    let mut taken = Vec::new();
                    while let Some((sequence, record)) = queue.take().await {
                        taken.push((sequence, record.as_str().unwrap_or_default().to_string()));
                        tokio::task::yield_now().await;
                    }
                    taken
                })
            })
            .collect();

        let mut all = Vec::new();
        for taker in takers {
            all.extend(taker.await.unwrap());
        }
        all.sort();
        assert_eq!(all.len(), 48);
        for (sequence, line) in all {
            assert_eq!(line, sequence.to_string());
        }
    }
}
