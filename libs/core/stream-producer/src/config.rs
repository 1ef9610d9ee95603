//! Pipeline configuration
//!
//! `PipelineConfig` is resolved once at startup (builder or `FromEnv`) and is
//! immutable afterwards. Every invalid setting is rejected here, so nothing in
//! the publish path can fail on configuration.

use crate::error::PipelineError;
use crate::retry::RetryPolicy;
use core_config::{
    env_parse_optional, env_parse_or, env_parse_required, env_required, ConfigError, FromEnv,
};
use std::num::NonZeroUsize;
use std::time::Duration;
use strum::{AsRefStr, Display, EnumString};

/// Number of target partitions; always at least one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShardCount(NonZeroUsize);

impl ShardCount {
    /// Validate a raw shard count. Zero and negative values are rejected.
    pub fn new(count: i64) -> Result<Self, PipelineError> {
        usize::try_from(count)
            .ok()
            .and_then(NonZeroUsize::new)
            .map(ShardCount)
            .ok_or_else(|| {
                PipelineError::config(format!("shard count must be positive, got {}", count))
            })
    }

    pub fn get(&self) -> usize {
        self.0.get()
    }
}

/// Publish rate limit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateLimit {
    /// Unconditional pass-through
    Disabled,
    /// Token bucket refilled at `per_second`, holding at most `burst` tokens
    PerSecond { per_second: f64, burst: u32 },
}

impl RateLimit {
    /// Build from the raw setting: a negative rate is the "disabled" sentinel.
    ///
    /// Without an explicit burst the bucket holds a tenth of a second of
    /// tokens (at least one).
    pub fn from_setting(rate: f64, burst: Option<u32>) -> Result<Self, PipelineError> {
        if rate.is_nan() {
            return Err(PipelineError::config("rate limit must be a number"));
        }
        if rate < 0.0 {
            return Ok(RateLimit::Disabled);
        }
        if rate == 0.0 || rate.is_infinite() {
            return Err(PipelineError::config(format!(
                "rate limit must be positive and finite (use a negative value to disable), got {}",
                rate
            )));
        }

        let burst = burst.unwrap_or_else(|| ((rate / 10.0).ceil() as u32).max(1));
        if burst == 0 {
            return Err(PipelineError::config("rate limit burst must be at least 1"));
        }

        Ok(RateLimit::PerSecond {
            per_second: rate,
            burst,
        })
    }

    pub fn per_second(per_second: f64) -> Result<Self, PipelineError> {
        Self::from_setting(per_second, None)
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, RateLimit::PerSecond { .. })
    }
}

/// What `offer` does when the queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FullQueuePolicy {
    /// Drop the record immediately
    Reject,
    /// Wait up to `timeout` for room, then drop
    Block { timeout: Duration },
}

/// Setting name for [`FullQueuePolicy`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum FullQueueMode {
    Reject,
    Block,
}

/// What happens to queued records on shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum ShutdownPolicy {
    /// Workers keep publishing queued records until the queue is empty or the
    /// shutdown timeout expires
    Drain,
    /// Queued records are dropped as soon as shutdown starts
    Discard,
}

/// Partition assignment strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum PartitionStrategy {
    /// Sequence number modulo shard count
    RoundRobin,
    /// murmur2 of the payload modulo shard count
    KeyHash,
}

/// Configuration for the producer pipeline
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Target log stream name (metrics label and key prefix)
    pub stream_name: String,

    /// Number of publish workers
    pub worker_count: usize,

    /// Inbound queue capacity
    pub queue_capacity: usize,

    /// Number of partitions in the target stream
    pub shard_count: ShardCount,

    /// How records are spread across partitions
    pub partition_strategy: PartitionStrategy,

    /// Aggregate publish rate limit
    pub rate_limit: RateLimit,

    /// Retry policy for transient write failures
    pub retry: RetryPolicy,

    /// Upper bound for a single write call before it counts as transient failure
    pub write_timeout: Duration,

    /// Behavior of `offer` on a full queue
    pub full_queue_policy: FullQueuePolicy,

    /// Behavior of queued records on shutdown
    pub shutdown_policy: ShutdownPolicy,

    /// Hard shutdown timeout; remaining queued records are dropped after it
    pub shutdown_timeout: Duration,

    /// Interval between metrics reports
    pub report_interval: Duration,
}

impl PipelineConfig {
    /// Create a config with defaults for everything but the stream and shard count
    pub fn new(stream_name: impl Into<String>, shard_count: ShardCount) -> Self {
        Self {
            stream_name: stream_name.into(),
            worker_count: 30,
            queue_capacity: 10_000,
            shard_count,
            partition_strategy: PartitionStrategy::RoundRobin,
            rate_limit: RateLimit::Disabled,
            retry: RetryPolicy::default(),
            write_timeout: Duration::from_secs(10),
            full_queue_policy: FullQueuePolicy::Reject,
            shutdown_policy: ShutdownPolicy::Drain,
            shutdown_timeout: Duration::from_secs(30),
            report_interval: Duration::from_secs(60),
        }
    }

    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_partition_strategy(mut self, strategy: PartitionStrategy) -> Self {
        self.partition_strategy = strategy;
        self
    }

    pub fn with_rate_limit(mut self, limit: RateLimit) -> Self {
        self.rate_limit = limit;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn with_full_queue_policy(mut self, policy: FullQueuePolicy) -> Self {
        self.full_queue_policy = policy;
        self
    }

    pub fn with_shutdown_policy(mut self, policy: ShutdownPolicy) -> Self {
        self.shutdown_policy = policy;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_report_interval(mut self, interval: Duration) -> Self {
        self.report_interval = interval;
        self
    }

    /// Check every setting; called by `Pipeline::new`.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.stream_name.trim().is_empty() {
            return Err(PipelineError::config("stream name must not be empty"));
        }
        if self.worker_count == 0 {
            return Err(PipelineError::config("worker count must be at least 1"));
        }
        if self.queue_capacity == 0 {
            return Err(PipelineError::config("queue capacity must be at least 1"));
        }
        if self.write_timeout.is_zero() {
            return Err(PipelineError::config("write timeout must be positive"));
        }
        if self.report_interval.is_zero() {
            return Err(PipelineError::config("report interval must be positive"));
        }
        if let FullQueuePolicy::Block { timeout } = self.full_queue_policy {
            if timeout.is_zero() {
                return Err(PipelineError::config(
                    "queue block timeout must be positive (use the reject policy instead)",
                ));
            }
        }
        self.retry.validate()
    }
}

fn invalid(key: &str, err: PipelineError) -> ConfigError {
    ConfigError::invalid(key, err.to_string())
}

impl FromEnv for PipelineConfig {
    /// Environment variables (names follow the dotted property names,
    /// e.g. `producer.thread.count` -> `PRODUCER_THREAD_COUNT`):
    /// - `STREAM_NAME` (required)
    /// - `SHARD_COUNT` (required, > 0)
    /// - `PRODUCER_THREAD_COUNT` (default 30)
    /// - `MESSAGE_QUEUE_SIZE` (default 10000)
    /// - `PARTITIONER` (`round_robin` | `key_hash`, default round_robin)
    /// - `RATE_LIMIT` records/sec (default -1 = unlimited), `RATE_LIMIT_BURST`
    /// - `RETRY_MAX_ATTEMPTS` (default 5), `RETRY_BACKOFF_BASE_MS` (100),
    ///   `RETRY_BACKOFF_CAP_MS` (10000)
    /// - `WRITE_TIMEOUT_MS` (default 10000)
    /// - `QUEUE_FULL_POLICY` (`reject` | `block`), `QUEUE_BLOCK_TIMEOUT_MS` (1000)
    /// - `SHUTDOWN_POLICY` (`drain` | `discard`), `SHUTDOWN_TIMEOUT_SECS` (30)
    /// - `METRIC_REPORT_INTERVAL_SECONDS` (default 60)
    fn from_env() -> Result<Self, ConfigError> {
        let stream_name = env_required("STREAM_NAME")?;
        let shard_count = ShardCount::new(env_parse_required("SHARD_COUNT")?)
            .map_err(|e| invalid("SHARD_COUNT", e))?;

        let rate_limit = RateLimit::from_setting(
            env_parse_or("RATE_LIMIT", -1.0)?,
            env_parse_optional("RATE_LIMIT_BURST")?,
        )
        .map_err(|e| invalid("RATE_LIMIT", e))?;

        let retry = RetryPolicy::new()
            .with_max_attempts(env_parse_or("RETRY_MAX_ATTEMPTS", 5)?)
            .with_base_delay(Duration::from_millis(env_parse_or(
                "RETRY_BACKOFF_BASE_MS",
                100,
            )?))
            .with_max_delay(Duration::from_millis(env_parse_or(
                "RETRY_BACKOFF_CAP_MS",
                10_000,
            )?));

        let full_queue_policy = match env_parse_or("QUEUE_FULL_POLICY", FullQueueMode::Reject)? {
            FullQueueMode::Reject => FullQueuePolicy::Reject,
            FullQueueMode::Block => FullQueuePolicy::Block {
                timeout: Duration::from_millis(env_parse_or("QUEUE_BLOCK_TIMEOUT_MS", 1_000)?),
            },
        };

        let config = PipelineConfig::new(stream_name, shard_count)
            .with_worker_count(env_parse_or("PRODUCER_THREAD_COUNT", 30)?)
            .with_queue_capacity(env_parse_or("MESSAGE_QUEUE_SIZE", 10_000)?)
            .with_partition_strategy(env_parse_or("PARTITIONER", PartitionStrategy::RoundRobin)?)
            .with_rate_limit(rate_limit)
            .with_retry(retry)
            .with_write_timeout(Duration::from_millis(env_parse_or("WRITE_TIMEOUT_MS", 10_000)?))
            .with_full_queue_policy(full_queue_policy)
            .with_shutdown_policy(env_parse_or("SHUTDOWN_POLICY", ShutdownPolicy::Drain)?)
            .with_shutdown_timeout(Duration::from_secs(env_parse_or("SHUTDOWN_TIMEOUT_SECS", 30)?))
            .with_report_interval(Duration::from_secs(env_parse_or(
                "METRIC_REPORT_INTERVAL_SECONDS",
                60,
            )?));

        config
            .validate()
            .map_err(|e| ConfigError::invalid("pipeline", e.to_string()))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PIPELINE_VARS: [&str; 16] = [
        "STREAM_NAME",
        "SHARD_COUNT",
        "PRODUCER_THREAD_COUNT",
        "MESSAGE_QUEUE_SIZE",
        "PARTITIONER",
        "RATE_LIMIT",
        "RATE_LIMIT_BURST",
        "RETRY_MAX_ATTEMPTS",
        "RETRY_BACKOFF_BASE_MS",
        "RETRY_BACKOFF_CAP_MS",
        "WRITE_TIMEOUT_MS",
        "QUEUE_FULL_POLICY",
        "QUEUE_BLOCK_TIMEOUT_MS",
        "SHUTDOWN_POLICY",
        "SHUTDOWN_TIMEOUT_SECS",
        "METRIC_REPORT_INTERVAL_SECONDS",
    ];

    fn with_pipeline_env<F: FnOnce()>(vars: &[(&str, &str)], f: F) {
        let mut all: Vec<(&str, Option<&str>)> =
            PIPELINE_VARS.iter().map(|key| (*key, None)).collect();
        for (key, value) in vars {
            all.retain(|(k, _)| k != key);
            all.push((*key, Some(*value)));
        }
        temp_env::with_vars(all, f);
    }

    #[test]
    fn test_shard_count_rejects_non_positive() {
        assert!(ShardCount::new(0).is_err());
        assert!(ShardCount::new(-3).is_err());
        assert_eq!(ShardCount::new(4).unwrap().get(), 4);
    }

    #[test]
    fn test_rate_limit_sentinel_disables() {
        assert_eq!(RateLimit::from_setting(-1.0, None).unwrap(), RateLimit::Disabled);
        assert!(!RateLimit::Disabled.is_enabled());
    }

    #[test]
    fn test_rate_limit_default_burst() {
        assert_eq!(
            RateLimit::per_second(500.0).unwrap(),
            RateLimit::PerSecond {
                per_second: 500.0,
                burst: 50
            }
        );
        assert_eq!(
            RateLimit::per_second(0.5).unwrap(),
            RateLimit::PerSecond {
                per_second: 0.5,
                burst: 1
            }
        );
    }

    #[test]
    fn test_rate_limit_rejects_zero_and_nan() {
        assert!(RateLimit::from_setting(0.0, None).is_err());
        assert!(RateLimit::from_setting(f64::NAN, None).is_err());
        assert!(RateLimit::from_setting(f64::INFINITY, None).is_err());
        assert!(RateLimit::from_setting(10.0, Some(0)).is_err());
    }

    #[test]
    fn test_builder_pattern() {
        let config = PipelineConfig::new("tweets", ShardCount::new(3).unwrap())
            .with_worker_count(4)
            .with_queue_capacity(100)
            .with_full_queue_policy(FullQueuePolicy::Block {
                timeout: Duration::from_millis(250),
            })
            .with_shutdown_policy(ShutdownPolicy::Discard);

        assert_eq!(config.worker_count, 4);
        assert_eq!(config.queue_capacity, 100);
        assert_eq!(config.shard_count.get(), 3);
        assert_eq!(config.shutdown_policy, ShutdownPolicy::Discard);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_sizes() {
        let shards = ShardCount::new(1).unwrap();
        assert!(PipelineConfig::new("s", shards).with_worker_count(0).validate().is_err());
        assert!(PipelineConfig::new("s", shards).with_queue_capacity(0).validate().is_err());
        assert!(PipelineConfig::new(" ", shards).validate().is_err());
        assert!(PipelineConfig::new("s", shards)
            .with_full_queue_policy(FullQueuePolicy::Block {
                timeout: Duration::ZERO
            })
            .validate()
            .is_err());
    }

    #[test]
    fn test_from_env_defaults() {
        with_pipeline_env(&[("STREAM_NAME", "tweets"), ("SHARD_COUNT", "2")], || {
            let config = PipelineConfig::from_env().unwrap();
            assert_eq!(config.stream_name, "tweets");
            assert_eq!(config.shard_count.get(), 2);
            assert_eq!(config.worker_count, 30);
            assert_eq!(config.queue_capacity, 10_000);
            assert_eq!(config.rate_limit, RateLimit::Disabled);
            assert_eq!(config.report_interval, Duration::from_secs(60));
            assert_eq!(config.full_queue_policy, FullQueuePolicy::Reject);
            assert_eq!(config.partition_strategy, PartitionStrategy::RoundRobin);
        });
    }

    #[test]
    fn test_from_env_overrides() {
        with_pipeline_env(
            &[
                ("STREAM_NAME", "tweets"),
                ("SHARD_COUNT", "8"),
                ("PRODUCER_THREAD_COUNT", "100"),
                ("RATE_LIMIT", "250.5"),
                ("RATE_LIMIT_BURST", "10"),
                ("QUEUE_FULL_POLICY", "Block"),
                ("QUEUE_BLOCK_TIMEOUT_MS", "50"),
                ("SHUTDOWN_POLICY", "discard"),
                ("PARTITIONER", "key_hash"),
                ("RETRY_MAX_ATTEMPTS", "2"),
            ],
            || {
                let config = PipelineConfig::from_env().unwrap();
                assert_eq!(config.worker_count, 100);
                assert_eq!(
                    config.rate_limit,
                    RateLimit::PerSecond {
                        per_second: 250.5,
                        burst: 10
                    }
                );
                assert_eq!(
                    config.full_queue_policy,
                    FullQueuePolicy::Block {
                        timeout: Duration::from_millis(50)
                    }
                );
                assert_eq!(config.shutdown_policy, ShutdownPolicy::Discard);
                assert_eq!(config.partition_strategy, PartitionStrategy::KeyHash);
                assert_eq!(config.retry.max_attempts, 2);
            },
        );
    }

    #[test]
    fn test_from_env_zero_shards_is_fatal() {
        with_pipeline_env(&[("STREAM_NAME", "tweets"), ("SHARD_COUNT", "0")], || {
            let err = PipelineConfig::from_env().unwrap_err();
            assert!(err.to_string().contains("SHARD_COUNT"));
        });
    }

    #[test]
    fn test_from_env_missing_shard_count() {
        with_pipeline_env(&[("STREAM_NAME", "tweets")], || {
            assert!(matches!(
                PipelineConfig::from_env(),
                Err(ConfigError::MissingEnvVar(_))
            ));
        });
    }

    #[test]
    fn test_from_env_unknown_policy() {
        with_pipeline_env(
            &[
                ("STREAM_NAME", "tweets"),
                ("SHARD_COUNT", "1"),
                ("SHUTDOWN_POLICY", "explode"),
            ],
            || {
                assert!(matches!(
                    PipelineConfig::from_env(),
                    Err(ConfigError::ParseError { .. })
                ));
            },
        );
    }
}
