//! Per-key ordered event log with offset-based read and prefix discard
//! (spec.md §4.3, component C3).
//!
//! `reserve`/`insert_at` split `insert` into two steps so a caller can hand
//! out the assigned offset synchronously (the `{id}` in a deploy/execute
//! HTTP response) before the event itself is known, then fill it in once
//! the asynchronous work completes (spec.md §7: "asynchronous errors ... are
//! delivered as ErrorEvent in the mailbox at the reserved request id").

mod memory;
#[cfg(feature = "redis-backend")]
mod redis_backend;

pub use memory::InMemoryMailbox;
#[cfg(feature = "redis-backend")]
pub use redis_backend::RedisMailbox;

use async_trait::async_trait;
use dg_errors::GatewayError;
use dg_types::event::Event;

/// Result of [`Mailbox::get`]: up to `count` contiguous events at or after
/// `offset`, plus the offset of the first one actually returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxPage {
    pub start_offset: u64,
    pub events: Vec<Event>,
}

#[async_trait]
pub trait Mailbox: Send + Sync + 'static {
    /// Atomically bumps `next_offset(key)` and returns the offset it just
    /// assigned, without storing anything. Reversible in the sense that an
    /// unused reservation is simply never filled in — it just leaves a gap
    /// no caller will ever poll for. Fails with
    /// [`GatewayError::MailboxQueueLimitReached`] (spec.md §7, Resource
    /// 3xxx) once the key's undiscarded entry count has reached the
    /// backend's configured limit.
    async fn reserve(&self, key: &str) -> Result<u64, GatewayError>;

    /// Stores `event` (with its `id` rewritten to `offset`) at the given,
    /// previously reserved offset.
    async fn insert_at(&self, key: &str, offset: u64, event: Event);

    /// Convenience combining `reserve` + `insert_at`; returns the assigned
    /// offset.
    async fn insert(&self, key: &str, event: Event) -> Result<u64, GatewayError> {
        let offset = self.reserve(key).await?;
        self.insert_at(key, offset, event).await;
        Ok(offset)
    }

    async fn get(&self, key: &str, offset: u64, count: u32) -> MailboxPage;

    /// Removes all entries with sequence `< offset`; raises
    /// `next_offset(key) <- max(next_offset(key), offset)`. Errors if the
    /// key has never been touched by `reserve`/`insert`.
    async fn discard(&self, key: &str, offset: u64) -> Result<(), GatewayError>;

    /// Drops the key entirely.
    async fn remove(&self, key: &str);
}
