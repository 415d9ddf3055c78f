//! Remote mailbox backend over Redis (spec.md §6, "optional remote mailbox
//! backend"), speaking the same four operations as [`crate::InMemoryMailbox`]
//! via server-side Lua scripts so multi-instance gateways share one mailbox
//! without a distributed lock. Grounded on the `redis` crate usage in the
//! retrieval pack's gateway-shaped manifests (chainflip-backend,
//! nullsociety), not on the teacher, which has no remote key/value store.

use async_trait::async_trait;
use dg_errors::GatewayError;
use dg_types::event::Event;
use redis::{aio::ConnectionManager, AsyncCommands, Client, Script};

use crate::{Mailbox, MailboxPage};

const NEXT_OFFSET_SUFFIX: &str = ":next";
const ENTRIES_SUFFIX: &str = ":entries";

/// `ZADD`s entries into a sorted set keyed by offset, and tracks
/// `next_offset` in a companion string key, both mutated by a single script
/// so reservation and insertion are linearized server-side. `ARGV[1]` is the
/// queue limit (0 means unbounded); returns `-1` once the key's undiscarded
/// entry count (`ZCARD` of the entries set) has reached it (spec.md §7,
/// Resource 3xxx).
fn reserve_script() -> Script {
    Script::new(
        r"
        local next_key = KEYS[1]
        local entries_key = KEYS[2]
        local max_len = tonumber(ARGV[1])
        if max_len > 0 and redis.call('ZCARD', entries_key) >= max_len then
            return -1
        end
        local offset = tonumber(redis.call('GET', next_key) or '0')
        redis.call('SET', next_key, offset + 1)
        return offset
        ",
    )
}

fn insert_at_script() -> Script {
    Script::new(
        r"
        local next_key = KEYS[1]
        local entries_key = KEYS[2]
        local offset = tonumber(ARGV[1])
        local payload = ARGV[2]
        redis.call('ZADD', entries_key, offset, payload)
        local current = tonumber(redis.call('GET', next_key) or '0')
        if offset >= current then
            redis.call('SET', next_key, offset + 1)
        end
        return offset
        ",
    )
}

fn discard_script() -> Script {
    Script::new(
        r"
        local next_key = KEYS[1]
        local entries_key = KEYS[2]
        local offset = tonumber(ARGV[1])
        if redis.call('EXISTS', next_key) == 0 then
            return -1
        end
        redis.call('ZREMRANGEBYSCORE', entries_key, '-inf', '(' .. offset)
        local current = tonumber(redis.call('GET', next_key) or '0')
        if offset > current then
            redis.call('SET', next_key, offset)
        end
        return 0
        ",
    )
}

/// [`Mailbox`] backend that stores entries in a Redis (or Redis Cluster,
/// via `redis`'s cluster-async client) instance, for gateways sharing state
/// across more than one process.
pub struct RedisMailbox {
    manager: ConnectionManager,
    max_queue_len: usize,
}

impl RedisMailbox {
    /// Connects with no per-key queue limit enforced.
    pub async fn connect(url: &str) -> Result<Self, GatewayError> {
        Self::connect_with_queue_limit(url, 0).await
    }

    /// Connects with each key's undiscarded entry count capped at
    /// `max_queue_len` (0 means unbounded).
    pub async fn connect_with_queue_limit(url: &str, max_queue_len: usize) -> Result<Self, GatewayError> {
        let client = Client::open(url)
            .map_err(|e| GatewayError::UnexpectedRpcFailure(format!("redis client: {e}")))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| GatewayError::UnexpectedRpcFailure(format!("redis connect: {e}")))?;
        Ok(Self { manager, max_queue_len })
    }

    fn next_key(key: &str) -> String {
        format!("{key}{NEXT_OFFSET_SUFFIX}")
    }

    fn entries_key(key: &str) -> String {
        format!("{key}{ENTRIES_SUFFIX}")
    }
}

#[async_trait]
impl Mailbox for RedisMailbox {
    async fn reserve(&self, key: &str) -> Result<u64, GatewayError> {
        let mut conn = self.manager.clone();
        let offset: i64 = reserve_script()
            .key(Self::next_key(key))
            .key(Self::entries_key(key))
            .arg(self.max_queue_len)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| GatewayError::UnexpectedRpcFailure(format!("redis reserve: {e}")))?;
        if offset < 0 {
            return Err(GatewayError::MailboxQueueLimitReached);
        }
        Ok(offset as u64)
    }

    async fn insert_at(&self, key: &str, offset: u64, event: Event) {
        let mut conn = self.manager.clone();
        let payload = match serde_json::to_string(&event) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(error = %e, "mailbox.redis.serialize_failed");
                return;
            }
        };
        let result: redis::RedisResult<u64> = insert_at_script()
            .key(Self::next_key(key))
            .key(Self::entries_key(key))
            .arg(offset)
            .arg(payload)
            .invoke_async(&mut conn)
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "mailbox.redis.insert_failed");
        }
    }

    async fn get(&self, key: &str, offset: u64, count: u32) -> MailboxPage {
        let mut conn = self.manager.clone();
        let raw: redis::RedisResult<Vec<String>> = conn
            .zrangebyscore_limit(
                Self::entries_key(key),
                offset as isize,
                "+inf",
                0,
                count as isize,
            )
            .await;
        let events: Vec<Event> = raw
            .unwrap_or_default()
            .into_iter()
            .filter_map(|payload| serde_json::from_str(&payload).ok())
            .collect();
        let start_offset = events.first().map(|e| e.id()).unwrap_or(offset);
        MailboxPage {
            start_offset,
            events,
        }
    }

    async fn discard(&self, key: &str, offset: u64) -> Result<(), GatewayError> {
        let mut conn = self.manager.clone();
        let status: i64 = discard_script()
            .key(Self::next_key(key))
            .key(Self::entries_key(key))
            .arg(offset)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| GatewayError::UnexpectedRpcFailure(format!("redis discard: {e}")))?;
        if status < 0 {
            return Err(GatewayError::DiscardNonExistentQueue);
        }
        Ok(())
    }

    async fn remove(&self, key: &str) {
        let mut conn = self.manager.clone();
        let _: redis::RedisResult<()> = conn.del(&[Self::next_key(key), Self::entries_key(key)]).await;
    }
}
