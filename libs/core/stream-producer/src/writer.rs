//! Partitioned log write clients
//!
//! The pipeline only knows the tri-state [`LogWriter::write`] contract:
//! success, transient failure (retry) or permanent failure (drop).
//!
//! - [`RedisStreamWriter`]: one Redis stream per partition, `XADD` with
//!   approximate `MAXLEN` trimming
//! - [`MemoryLogWriter`]: in-process log with scripted failures, for tests and
//!   dry runs

use crate::error::WriteError;
use crate::partitioner::PartitionKey;
use async_trait::async_trait;
use core_config::redis::RedisConfig;
use core_config::{env_parse_optional, env_parse_or, ConfigError, FromEnv};
use redis::aio::ConnectionManager;
use redis::RedisError;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

/// Append-only, partitioned log
#[async_trait]
pub trait LogWriter: Send + Sync {
    /// Append `payload` to the partition identified by `key`.
    async fn write(&self, key: &PartitionKey, payload: &[u8]) -> Result<(), WriteError>;

    fn name(&self) -> &'static str;

    /// Whether the log service is reachable; used by readiness probes.
    async fn health_check(&self) -> Result<bool, WriteError> {
        Ok(true)
    }
}

/// Settings for [`RedisStreamWriter`]
#[derive(Debug, Clone)]
pub struct RedisStreamConfig {
    pub redis: RedisConfig,
    /// Approximate per-partition stream length cap (`MAXLEN ~`)
    pub max_len: Option<u64>,
    /// Payloads above this size are rejected as permanent failures
    pub max_record_bytes: usize,
}

impl RedisStreamConfig {
    pub fn new(redis: RedisConfig) -> Self {
        Self {
            redis,
            max_len: Some(100_000),
            max_record_bytes: 1024 * 1024,
        }
    }

    pub fn with_max_len(mut self, max_len: Option<u64>) -> Self {
        self.max_len = max_len;
        self
    }

    pub fn with_max_record_bytes(mut self, bytes: usize) -> Self {
        self.max_record_bytes = bytes;
        self
    }
}

impl FromEnv for RedisStreamConfig {
    /// - `REDIS_URL` / `REDIS_HOST`
    /// - `STREAM_MAX_LEN` (default 100000, `0` disables trimming)
    /// - `MAX_RECORD_BYTES` (default 1048576)
    fn from_env() -> Result<Self, ConfigError> {
        let max_len = match env_parse_optional::<u64>("STREAM_MAX_LEN")? {
            Some(0) => None,
            Some(len) => Some(len),
            None => Some(100_000),
        };
        let max_record_bytes = env_parse_or("MAX_RECORD_BYTES", 1024 * 1024)?;
        if max_record_bytes == 0 {
            return Err(ConfigError::invalid("MAX_RECORD_BYTES", "must be positive"));
        }

        Ok(Self {
            redis: RedisConfig::from_env()?,
            max_len,
            max_record_bytes,
        })
    }
}

/// Writes each partition to the Redis stream `"{stream}:{partition key}"`
#[derive(Clone)]
pub struct RedisStreamWriter {
    redis: ConnectionManager,
    stream_name: String,
    max_len: Option<u64>,
    max_record_bytes: usize,
}

impl RedisStreamWriter {
    pub fn new(redis: ConnectionManager, stream_name: impl Into<String>) -> Self {
        Self {
            redis,
            stream_name: stream_name.into(),
            max_len: Some(100_000),
            max_record_bytes: 1024 * 1024,
        }
    }

    /// Open a managed connection and build the writer.
    pub async fn connect(
        config: &RedisStreamConfig,
        stream_name: impl Into<String>,
    ) -> Result<Self, RedisError> {
        let client = redis::Client::open(config.redis.url.as_str())?;
        let redis = ConnectionManager::new(client).await?;
        info!(url = %config.redis.redacted_url(), "Connected to Redis");

        Ok(Self::new(redis, stream_name)
            .with_max_len(config.max_len)
            .with_max_record_bytes(config.max_record_bytes))
    }

    pub fn with_max_len(mut self, max_len: Option<u64>) -> Self {
        self.max_len = max_len;
        self
    }

    pub fn with_max_record_bytes(mut self, bytes: usize) -> Self {
        self.max_record_bytes = bytes;
        self
    }

    /// Redis key of the stream backing `key`
    pub fn stream_key(&self, key: &PartitionKey) -> String {
        format!("{}:{}", self.stream_name, key)
    }
}

#[async_trait]
impl LogWriter for RedisStreamWriter {
    async fn write(&self, key: &PartitionKey, payload: &[u8]) -> Result<(), WriteError> {
        if payload.len() > self.max_record_bytes {
            return Err(WriteError::permanent(format!(
                "record of {} bytes exceeds limit of {} bytes",
                payload.len(),
                self.max_record_bytes
            )));
        }

        let stream_key = self.stream_key(key);
        let mut cmd = redis::cmd("XADD");
        cmd.arg(&stream_key);
        if let Some(max_len) = self.max_len {
            cmd.arg("MAXLEN").arg("~").arg(max_len);
        }
        cmd.arg("*").arg("data").arg(payload);

        let mut conn = self.redis.clone();
        let entry_id: String = cmd
            .query_async(&mut conn)
            .await
            .map_err(classify_redis_error)?;

        debug!(stream = %stream_key, entry_id = %entry_id, "Appended record");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis_streams"
    }

    async fn health_check(&self) -> Result<bool, WriteError> {
        let mut conn = self.redis.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(classify_redis_error)?;
        Ok(pong == "PONG")
    }
}

impl std::fmt::Debug for RedisStreamWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamWriter")
            .field("stream_name", &self.stream_name)
            .field("max_len", &self.max_len)
            .field("max_record_bytes", &self.max_record_bytes)
            .finish()
    }
}

const TRANSIENT_SERVER_ERRORS: [&str; 5] = ["BUSY", "LOADING", "TRYAGAIN", "OOM", "MASTERDOWN"];

/// Connection trouble and "try again later" server replies are transient;
/// anything else means Redis will never accept the command as sent.
pub fn classify_redis_error(err: RedisError) -> WriteError {
    if err.is_timeout()
        || err.is_io_error()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
    {
        return WriteError::transient(err.to_string());
    }
    let message = err.to_string();
    if is_transient_reply(&message) {
        WriteError::transient(message)
    } else {
        WriteError::permanent(message)
    }
}

fn is_transient_reply(message: &str) -> bool {
    message
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(|word| TRANSIENT_SERVER_ERRORS.contains(&word))
}

/// In-process partitioned log.
///
/// Failures can be scripted: queued errors are returned (in order) by the next
/// writes before anything succeeds, and `always_fail` makes every write fail.
#[derive(Debug, Clone, Default)]
pub struct MemoryLogWriter {
    inner: Arc<Mutex<MemoryLog>>,
    latency: Option<Duration>,
}

#[derive(Debug, Default)]
struct MemoryLog {
    entries: Vec<(PartitionKey, Vec<u8>)>,
    scripted: VecDeque<WriteError>,
    always: Option<WriteError>,
    attempts: usize,
}

impl MemoryLogWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every write
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn fail_next(&self, errors: impl IntoIterator<Item = WriteError>) {
        self.lock().scripted.extend(errors);
    }

    pub fn always_fail(&self, error: WriteError) {
        self.lock().always = Some(error);
    }

    /// Successful writes, in completion order
    pub fn entries(&self) -> Vec<(PartitionKey, Vec<u8>)> {
        self.lock().entries.clone()
    }

    pub fn entries_for(&self, partition: usize) -> Vec<Vec<u8>> {
        self.lock()
            .entries
            .iter()
            .filter(|(key, _)| key.index() == partition)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    /// Every write call, successful or not
    pub fn attempts(&self) -> usize {
        self.lock().attempts
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryLog> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl LogWriter for MemoryLogWriter {
    async fn write(&self, key: &PartitionKey, payload: &[u8]) -> Result<(), WriteError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let mut log = self.lock();
        log.attempts += 1;
        if let Some(error) = log.always.clone() {
            return Err(error);
        }
        if let Some(error) = log.scripted.pop_front() {
            return Err(error);
        }
        log.entries.push((key.clone(), payload.to_vec()));
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
