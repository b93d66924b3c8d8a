// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Testcontainers setup for Redis.
//!
//! Provides helpers to spin up Redis containers for integration tests.

use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage};

/// Create a vanilla Redis container (streams-compatible).
///
/// Uses official redis:7 image. Waits for "Ready to accept connections".
pub fn redis_container(docker: &Cli) -> Container<'_, GenericImage> {
    let image = GenericImage::new("redis", "7-alpine")
        .with_exposed_port(6379)
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"));
    docker.run(image)
}

/// Get the Redis URL for a container.
pub fn redis_url(container: &Container<'_, GenericImage>) -> String {
    let port = container.get_host_port_ipv4(6379);
    format!("redis://127.0.0.1:{}", port)
}

/// A Redis container plus raw access to a topic's keys.
pub struct TestRedis<'a> {
    #[allow(dead_code)] // Kept alive for container lifetime
    container: Container<'a, GenericImage>,
    pub redis_url: String,
}

impl<'a> TestRedis<'a> {
    pub fn new(docker: &'a Cli) -> Self {
        let container = redis_container(docker);
        let redis_url = redis_url(&container);
        Self {
            container,
            redis_url,
        }
    }

    async fn conn(&self) -> redis::RedisResult<redis::aio::MultiplexedConnection> {
        let client = redis::Client::open(self.redis_url.as_str())?;
        client.get_multiplexed_async_connection().await
    }

    /// Stream length of the topic log.
    pub async fn stream_len(&self, log: &str) -> redis::RedisResult<usize> {
        use redis::AsyncCommands;
        self.conn().await?.xlen(log).await
    }

    /// Lease deadline recorded in the expiry index.
    pub async fn lease_score(&self, timeout_key: &str, subscriber_id: &str) -> redis::RedisResult<Option<f64>> {
        use redis::AsyncCommands;
        self.conn().await?.zscore(timeout_key, subscriber_id).await
    }

    /// Remaining TTL of a key in milliseconds (-1 none, -2 missing).
    pub async fn pttl(&self, key: &str) -> redis::RedisResult<i64> {
        use redis::AsyncCommands;
        self.conn().await?.pttl(key).await
    }

    /// Create a consumer group and lease directly, as a crashed process would have left them.
    pub async fn plant_subscriber(
        &self,
        log: &str,
        timeout_key: &str,
        subscriber_id: &str,
        deadline_ms: u64,
    ) -> redis::RedisResult<()> {
        use redis::AsyncCommands;
        let mut conn = self.conn().await?;
        conn.xgroup_create_mkstream::<_, _, _, ()>(log, subscriber_id, "0").await?;
        conn.zadd::<_, _, _, ()>(timeout_key, subscriber_id, deadline_ms).await?;
        Ok(())
    }
}
