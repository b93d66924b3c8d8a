// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis Streams topic store.
//!
//! # Key Layout
//!
//! | Key | Type | Contents |
//! |-----|------|----------|
//! | `{name}` | Stream | Messages, field `m` holds the encoded payload |
//! | `{name}:timeout` | Sorted set | Subscriber id → lease deadline (epoch ms) |
//!
//! Each subscriber owns one consumer group named after its id. The group's
//! `last-delivered-id` is the subscriber's cursor; there is no separate
//! cursor storage.
//!
//! # Atomicity
//!
//! Every grouped mutation runs as a single Lua script. Scripts do not roll
//! back on error, so each one performs the step that can fail (e.g.
//! `XGROUP CREATE`) before the step that cannot.
//!
//! # Connections
//!
//! Short commands share one [`ConnectionManager`]. Each subscriber's
//! blocking `XREADGROUP ... BLOCK 0` gets its own multiplexed connection
//! via [`RedisGroupReader`] so it never stalls other commands.

use super::{GroupReader, StoreFuture, StoreOp, StreamEntry, TopicKeys, TopicStore};
use crate::error::{Result, TopicError};
use crate::resilience::RetryConfig;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client, RedisError, Script};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

/// Payload field name inside each stream entry.
const PAYLOAD_FIELD: &str = "m";

/// Consumer name used inside every group (one consumer per group).
const CONSUMER_NAME: &str = "consumer";

/// Append, then report how many groups will see the entry.
const PUBLISH_SCRIPT: &str = r#"
redis.call('xadd', KEYS[1], '*', 'm', ARGV[1]);
return #redis.call('xinfo', 'groups', KEYS[1]);
"#;

/// Create the group first: if it fails, no lease is left behind.
const CREATE_SUBSCRIBER_SCRIPT: &str = r#"
redis.call('xgroup', 'create', KEYS[1], ARGV[1], '0', 'MKSTREAM');
redis.call('zadd', KEYS[2], ARGV[2], ARGV[1]);
return 1;
"#;

const REMOVE_SUBSCRIBER_SCRIPT: &str = r#"
if redis.call('exists', KEYS[1]) == 1 then
    redis.call('xgroup', 'destroy', KEYS[1], ARGV[1]);
end;
redis.call('zrem', KEYS[2], ARGV[1]);
return 1;
"#;

/// Only extend an existing lease; never recreate a reaped one.
const RENEW_LEASE_SCRIPT: &str = r#"
if redis.call('zscore', KEYS[2], ARGV[1]) == false then
    return 0;
end;
redis.call('zadd', KEYS[2], ARGV[2], ARGV[1]);
return 1;
"#;

/// ARGV[1] = caller's subscriber id, ARGV[2] = now (epoch ms).
///
/// 1. Destroy the group and drop the lease of every subscriber whose deadline
///    is strictly before now.
/// 2. With no groups left, empty the log. Otherwise take the smallest
///    `last-delivered-id` millisecond as bound `{ms}-0`; if nothing past the
///    bound exists empty the log, else drop everything below it.
/// 3. Report whether the caller's own lease survived.
const RECONCILE_SCRIPT: &str = r#"
local exists = redis.call('exists', KEYS[1]) == 1;
local expired = redis.call('zrangebyscore', KEYS[2], 0, '(' .. ARGV[2]);
for _, id in ipairs(expired) do
    if exists then
        redis.call('xgroup', 'destroy', KEYS[1], id);
    end;
    redis.call('zrem', KEYS[2], id);
end;

local alive = 0;
if redis.call('zscore', KEYS[2], ARGV[1]) ~= false then
    alive = 1;
end;

if not exists then
    return alive;
end;

local groups = redis.call('xinfo', 'groups', KEYS[1]);
if #groups == 0 then
    redis.call('xtrim', KEYS[1], 'maxlen', 0);
    return alive;
end;

local min = nil;
for _, g in ipairs(groups) do
    for i = 1, #g, 2 do
        if g[i] == 'last-delivered-id' then
            local ms = tonumber(string.match(g[i + 1], '^(%d+)'));
            if min == nil or ms < min then
                min = ms;
            end;
        end;
    end;
end;

local bound = string.format('%.0f', min) .. '-0';
local range = redis.call('xrange', KEYS[1], bound, '+', 'COUNT', 2);
if #range == 0 or (#range == 1 and range[1][1] == bound) then
    redis.call('xtrim', KEYS[1], 'maxlen', 0);
else
    redis.call('xtrim', KEYS[1], 'minid', bound);
end;
return alive;
"#;

const COUNT_GROUPS_SCRIPT: &str = r#"
if redis.call('exists', KEYS[1]) == 0 then
    return 0;
end;
return #redis.call('xinfo', 'groups', KEYS[1]);
"#;

/// Apply ARGV[1] (with the remaining ARGV) to every key; 1 if any key changed.
const APPLY_TO_KEYS_SCRIPT: &str = r#"
local changed = 0;
for _, k in ipairs(KEYS) do
    changed = changed + redis.call(ARGV[1], k, unpack(ARGV, 2));
end;
if changed > 0 then
    return 1;
end;
return 0;
"#;

const MEMORY_USAGE_SCRIPT: &str = r#"
local total = 0;
for _, k in ipairs(KEYS) do
    local n = redis.call('memory', 'usage', k);
    if n then
        total = total + n;
    end;
end;
return total;
"#;

/// Loaded scripts. `Script` caches the SHA and falls back to EVAL on NOSCRIPT.
struct Scripts {
    publish: Script,
    create_subscriber: Script,
    remove_subscriber: Script,
    renew_lease: Script,
    reconcile: Script,
    count_groups: Script,
    apply_to_keys: Script,
    memory_usage: Script,
}

impl Scripts {
    fn new() -> Self {
        Self {
            publish: Script::new(PUBLISH_SCRIPT),
            create_subscriber: Script::new(CREATE_SUBSCRIBER_SCRIPT),
            remove_subscriber: Script::new(REMOVE_SUBSCRIBER_SCRIPT),
            renew_lease: Script::new(RENEW_LEASE_SCRIPT),
            reconcile: Script::new(RECONCILE_SCRIPT),
            count_groups: Script::new(COUNT_GROUPS_SCRIPT),
            apply_to_keys: Script::new(APPLY_TO_KEYS_SCRIPT),
            memory_usage: Script::new(MEMORY_USAGE_SCRIPT),
        }
    }
}

/// Map a Redis error, recognising a vanished consumer group.
///
/// `NOGROUP` is returned when the group was destroyed; `UNBLOCKED` when a
/// blocked read's stream key was deleted underneath it.
fn map_redis_error(op: StoreOp, subscriber_id: &str, e: RedisError) -> TopicError {
    if is_group_gone(e.code()) {
        TopicError::lease_lost(subscriber_id)
    } else {
        TopicError::redis(op.as_str(), e)
    }
}

fn is_group_gone(code: Option<&str>) -> bool {
    matches!(code, Some("NOGROUP") | Some("UNBLOCKED"))
}

/// Redis-backed [`TopicStore`].
///
/// Cloning is cheap: the connection manager is multiplexed.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    conn: ConnectionManager,
    scripts: std::sync::Arc<Scripts>,
}

impl RedisStore {
    /// Connect with retry and per-attempt timeout.
    pub async fn connect(url: &str, retry_config: &RetryConfig) -> Result<Self> {
        info!(url = %url, "Connecting to Redis");

        let client = Client::open(url)
            .map_err(|e| TopicError::Config(format!("Invalid Redis URL: {}", e)))?;

        let mut attempt = 0;

        loop {
            attempt += 1;

            // Wrap connection attempt in a timeout to avoid hanging on unreachable hosts
            let conn_result = timeout(
                retry_config.connection_timeout,
                client.get_connection_manager(),
            )
            .await;

            let message = match conn_result {
                Ok(Ok(conn)) => {
                    if attempt > 1 {
                        info!(attempt, "Connected to Redis after retry");
                    } else {
                        info!("Connected to Redis");
                    }
                    return Ok(Self {
                        client,
                        conn,
                        scripts: std::sync::Arc::new(Scripts::new()),
                    });
                }
                Ok(Err(e)) => {
                    if attempt >= retry_config.max_attempts {
                        error!(attempt, error = %e, "Failed to connect after max retries");
                        return Err(TopicError::redis_msg(
                            "CONNECT",
                            format!("Connection failed after {} attempts: {}", attempt, e),
                        ));
                    }
                    e.to_string()
                }
                Err(_) => {
                    if attempt >= retry_config.max_attempts {
                        error!(
                            attempt,
                            timeout_ms = retry_config.connection_timeout.as_millis(),
                            "Connection timed out after max retries"
                        );
                        return Err(TopicError::redis_msg(
                            "CONNECT",
                            format!(
                                "Connection timed out after {} attempts ({}ms timeout)",
                                attempt,
                                retry_config.connection_timeout.as_millis()
                            ),
                        ));
                    }
                    "timed out".to_string()
                }
            };

            let delay = retry_config.delay_for_attempt(attempt);
            warn!(
                attempt,
                delay_ms = delay.as_millis(),
                error = %message,
                "Connection attempt failed, retrying"
            );

            tokio::time::sleep(delay).await;
        }
    }

    /// Shared connection for ad-hoc commands.
    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }

    fn apply_to_keys<'a>(
        &'a self,
        keys: &TopicKeys,
        op: StoreOp,
        command: &'static str,
        arg: Option<u64>,
    ) -> StoreFuture<'a, bool> {
        let keys = keys.clone();
        let mut conn = self.conn.clone();
        Box::pin(async move {
            let mut invocation = self.scripts.apply_to_keys.key(&keys.log);
            invocation.key(&keys.timeout).arg(command);
            if let Some(arg) = arg {
                invocation.arg(arg);
            }
            let changed: i64 = invocation
                .invoke_async(&mut conn)
                .await
                .map_err(|e| TopicError::redis(op.as_str(), e))?;
            Ok(changed > 0)
        })
    }
}

impl TopicStore for RedisStore {
    type Reader = RedisGroupReader;

    fn publish(&self, keys: &TopicKeys, payload: Vec<u8>) -> StoreFuture<'_, u64> {
        let log = keys.log.clone();
        let mut conn = self.conn.clone();
        Box::pin(async move {
            let groups: u64 = self
                .scripts
                .publish
                .key(&log)
                .arg(payload)
                .invoke_async(&mut conn)
                .await
                .map_err(|e| TopicError::redis(StoreOp::Publish.as_str(), e))?;
            trace!(topic = %log, groups, "Published entry");
            Ok(groups)
        })
    }

    fn create_subscriber(
        &self,
        keys: &TopicKeys,
        subscriber_id: &str,
        lease_deadline_ms: u64,
    ) -> StoreFuture<'_, ()> {
        let keys = keys.clone();
        let id = subscriber_id.to_string();
        let mut conn = self.conn.clone();
        Box::pin(async move {
            let _: i64 = self
                .scripts
                .create_subscriber
                .key(&keys.log)
                .key(&keys.timeout)
                .arg(&id)
                .arg(lease_deadline_ms)
                .invoke_async(&mut conn)
                .await
                .map_err(|e| TopicError::redis(StoreOp::CreateSubscriber.as_str(), e))?;
            debug!(topic = %keys.log, subscriber_id = %id, "Created consumer group and lease");
            Ok(())
        })
    }

    fn remove_subscriber(&self, keys: &TopicKeys, subscriber_id: &str) -> StoreFuture<'_, ()> {
        let keys = keys.clone();
        let id = subscriber_id.to_string();
        let mut conn = self.conn.clone();
        Box::pin(async move {
            let _: i64 = self
                .scripts
                .remove_subscriber
                .key(&keys.log)
                .key(&keys.timeout)
                .arg(&id)
                .invoke_async(&mut conn)
                .await
                .map_err(|e| TopicError::redis(StoreOp::RemoveSubscriber.as_str(), e))?;
            debug!(topic = %keys.log, subscriber_id = %id, "Removed consumer group and lease");
            Ok(())
        })
    }

    fn renew_lease(
        &self,
        keys: &TopicKeys,
        subscriber_id: &str,
        lease_deadline_ms: u64,
    ) -> StoreFuture<'_, bool> {
        let keys = keys.clone();
        let id = subscriber_id.to_string();
        let mut conn = self.conn.clone();
        Box::pin(async move {
            let renewed: i64 = self
                .scripts
                .renew_lease
                .key(&keys.log)
                .key(&keys.timeout)
                .arg(&id)
                .arg(lease_deadline_ms)
                .invoke_async(&mut conn)
                .await
                .map_err(|e| TopicError::redis(StoreOp::RenewLease.as_str(), e))?;
            Ok(renewed == 1)
        })
    }

    fn reconcile(&self, keys: &TopicKeys, subscriber_id: &str, now_ms: u64) -> StoreFuture<'_, bool> {
        let keys = keys.clone();
        let id = subscriber_id.to_string();
        let mut conn = self.conn.clone();
        Box::pin(async move {
            let alive: i64 = self
                .scripts
                .reconcile
                .key(&keys.log)
                .key(&keys.timeout)
                .arg(&id)
                .arg(now_ms)
                .invoke_async(&mut conn)
                .await
                .map_err(|e| TopicError::redis(StoreOp::Reconcile.as_str(), e))?;
            Ok(alive == 1)
        })
    }

    fn open_reader(&self, keys: &TopicKeys, subscriber_id: &str) -> StoreFuture<'_, Self::Reader> {
        let keys = keys.clone();
        let group = subscriber_id.to_string();
        Box::pin(async move {
            let conn = self
                .client
                .get_multiplexed_async_connection()
                .await
                .map_err(|e| TopicError::redis(StoreOp::OpenReader.as_str(), e))?;
            Ok(RedisGroupReader { conn, keys, group })
        })
    }

    fn size(&self, keys: &TopicKeys) -> StoreFuture<'_, u64> {
        let log = keys.log.clone();
        let mut conn = self.conn.clone();
        Box::pin(async move {
            let len: u64 = conn
                .xlen(&log)
                .await
                .map_err(|e| TopicError::redis(StoreOp::Size.as_str(), e))?;
            Ok(len)
        })
    }

    fn count_groups(&self, keys: &TopicKeys) -> StoreFuture<'_, u64> {
        let log = keys.log.clone();
        let mut conn = self.conn.clone();
        Box::pin(async move {
            let groups: u64 = self
                .scripts
                .count_groups
                .key(&log)
                .invoke_async(&mut conn)
                .await
                .map_err(|e| TopicError::redis(StoreOp::CountGroups.as_str(), e))?;
            Ok(groups)
        })
    }

    fn delete(&self, keys: &TopicKeys) -> StoreFuture<'_, bool> {
        let keys = keys.clone();
        let mut conn = self.conn.clone();
        Box::pin(async move {
            let deleted: u64 = conn
                .del(&[&keys.log, &keys.timeout])
                .await
                .map_err(|e| TopicError::redis(StoreOp::Delete.as_str(), e))?;
            Ok(deleted > 0)
        })
    }

    fn expire(&self, keys: &TopicKeys, ttl: Duration) -> StoreFuture<'_, bool> {
        self.apply_to_keys(keys, StoreOp::Expire, "pexpire", Some(ttl.as_millis() as u64))
    }

    fn expire_at(&self, keys: &TopicKeys, at_ms: u64) -> StoreFuture<'_, bool> {
        self.apply_to_keys(keys, StoreOp::Expire, "pexpireat", Some(at_ms))
    }

    fn clear_expire(&self, keys: &TopicKeys) -> StoreFuture<'_, bool> {
        self.apply_to_keys(keys, StoreOp::ClearExpire, "persist", None)
    }

    fn size_in_memory(&self, keys: &TopicKeys) -> StoreFuture<'_, u64> {
        let keys = keys.clone();
        let mut conn = self.conn.clone();
        Box::pin(async move {
            let bytes: u64 = self
                .scripts
                .memory_usage
                .key(&keys.log)
                .key(&keys.timeout)
                .invoke_async(&mut conn)
                .await
                .map_err(|e| TopicError::redis(StoreOp::SizeInMemory.as_str(), e))?;
            Ok(bytes)
        })
    }
}

/// Blocking `XREADGROUP` reader on a dedicated connection.
pub struct RedisGroupReader {
    conn: MultiplexedConnection,
    keys: TopicKeys,
    group: String,
}

impl GroupReader for RedisGroupReader {
    fn read(&mut self, count: Option<usize>) -> StoreFuture<'_, Vec<StreamEntry>> {
        Box::pin(async move {
            let mut opts = StreamReadOptions::default()
                .group(&self.group, CONSUMER_NAME)
                .block(0);
            if let Some(count) = count {
                opts = opts.count(count);
            }

            // XREADGROUP GROUP id consumer [COUNT n] BLOCK 0 STREAMS key >
            let reply: Option<StreamReadReply> = self
                .conn
                .xread_options(&[&self.keys.log], &[">"], &opts)
                .await
                .map_err(|e| map_redis_error(StoreOp::ReadGroup, &self.group, e))?;

            let mut entries = Vec::new();
            for stream_key in reply.map(|r| r.keys).unwrap_or_default() {
                for entry in stream_key.ids {
                    match get_bytes_field(&entry.map, PAYLOAD_FIELD) {
                        Ok(payload) => entries.push(StreamEntry {
                            id: entry.id,
                            payload,
                        }),
                        Err(e) => {
                            warn!(
                                topic = %self.keys.log,
                                stream_id = %entry.id,
                                error = %e,
                                "Malformed stream entry, skipping"
                            );
                        }
                    }
                }
            }
            Ok(entries)
        })
    }
}

/// Extract a binary field from a stream entry.
fn get_bytes_field(fields: &HashMap<String, redis::Value>, name: &str) -> Result<Vec<u8>> {
    let value = fields
        .get(name)
        .ok_or_else(|| TopicError::Codec(format!("Missing field: {}", name)))?;

    match value {
        redis::Value::BulkString(bytes) => Ok(bytes.clone()),
        redis::Value::SimpleString(s) => Ok(s.as_bytes().to_vec()),
        _ => Err(TopicError::Codec(format!(
            "Unexpected type for field {}: {:?}",
            name, value
        ))),
    }
}
