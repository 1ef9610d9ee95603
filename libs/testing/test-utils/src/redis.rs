//! Redis test infrastructure
//!
//! Provides a `TestRedis` helper that creates a Redis container for testing
//! stream writers.

use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::Client;
use std::collections::HashMap;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::redis::Redis;

/// Test Redis wrapper that ensures proper cleanup
///
/// The container is automatically stopped and removed when this struct is dropped.
///
/// # Example
///
/// ```no_run
/// use test_utils::TestRedis;
///
/// # async fn example() {
/// let redis = TestRedis::new().await;
/// let writer_conn = redis.connection_manager().await;
///
/// // ... write through the pipeline ...
///
/// let len = redis.stream_len("tweets:shard-0000").await;
/// # }
/// ```
pub struct TestRedis {
    #[allow(dead_code)]
    container: ContainerAsync<Redis>,
    connection: MultiplexedConnection,
    pub connection_string: String,
}

impl TestRedis {
    /// Create a new test Redis instance
    ///
    /// Uses Redis 8 Alpine image by default.
    pub async fn new() -> Self {
        let redis_image = Redis::default().with_tag("8-alpine");

        let container = redis_image
            .start()
            .await
            .expect("Failed to start Redis container");

        let host_port = container
            .get_host_port_ipv4(6379)
            .await
            .expect("Failed to get Redis port");

        let connection_string = format!("redis://127.0.0.1:{}", host_port);

        let client = Client::open(connection_string.clone())
            .expect("Failed to create Redis client");

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .expect("Failed to connect to Redis");

        tracing::info!(port = host_port, "Test Redis ready (Redis 8-alpine)");

        Self {
            container,
            connection,
            connection_string,
        }
    }

    /// Get a cloned connection for assertions
    pub fn connection(&self) -> MultiplexedConnection {
        self.connection.clone()
    }

    /// Open a `ConnectionManager`, the connection type stream writers use
    pub async fn connection_manager(&self) -> ConnectionManager {
        let client = Client::open(self.connection_string.as_str())
            .expect("Failed to create Redis client");
        ConnectionManager::new(client)
            .await
            .expect("Failed to create ConnectionManager")
    }

    /// Get the connection string for manual client creation
    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    /// `XLEN` of a stream (0 when it does not exist)
    pub async fn stream_len(&self, key: &str) -> usize {
        let mut conn = self.connection();
        redis::cmd("XLEN")
            .arg(key)
            .query_async(&mut conn)
            .await
            .expect("XLEN failed")
    }

    /// Values of `field` for every entry in a stream, oldest first
    pub async fn stream_values(&self, key: &str, field: &str) -> Vec<Vec<u8>> {
        let mut conn = self.connection();
        let entries: Vec<(String, HashMap<String, Vec<u8>>)> = redis::cmd("XRANGE")
            .arg(key)
            .arg("-")
            .arg("+")
            .query_async(&mut conn)
            .await
            .expect("XRANGE failed");

        entries
            .into_iter()
            .filter_map(|(_, mut fields)| fields.remove(field))
            .collect()
    }
}

// Container is automatically cleaned up when TestRedis is dropped
impl Drop for TestRedis {
    fn drop(&mut self) {
        tracing::debug!("Cleaning up test Redis container");
    }
}
