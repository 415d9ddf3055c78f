use std::collections::BTreeMap;

use async_trait::async_trait;
use dashmap::DashMap;
use dg_errors::GatewayError;
use dg_types::event::Event;
use parking_lot::Mutex;

use crate::{Mailbox, MailboxPage};

#[derive(Default)]
struct KeyLog {
    next_offset: u64,
    entries: BTreeMap<u64, Event>,
}

/// Default, non-persistent [`Mailbox`] backend: a [`DashMap`] of per-key
/// logs, each guarded by a plain synchronous [`Mutex`]. Every operation is
/// pure in-memory work with no `.await` inside the critical section, so a
/// blocking lock never spans a suspension point.
pub struct InMemoryMailbox {
    keys: DashMap<String, Mutex<KeyLog>>,
    max_queue_len: Option<usize>,
}

impl Default for InMemoryMailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryMailbox {
    pub fn new() -> Self {
        Self {
            keys: DashMap::new(),
            max_queue_len: None,
        }
    }

    /// Caps each key's undiscarded entry count; `reserve` past the limit
    /// fails with [`GatewayError::MailboxQueueLimitReached`] (spec.md §7).
    pub fn with_queue_limit(max_queue_len: usize) -> Self {
        Self {
            keys: DashMap::new(),
            max_queue_len: Some(max_queue_len),
        }
    }
}

#[async_trait]
impl Mailbox for InMemoryMailbox {
    async fn reserve(&self, key: &str) -> Result<u64, GatewayError> {
        let entry = self
            .keys
            .entry(key.to_string())
            .or_insert_with(|| Mutex::new(KeyLog::default()));
        let mut log = entry.lock();
        if let Some(max) = self.max_queue_len {
            if log.entries.len() >= max {
                return Err(GatewayError::MailboxQueueLimitReached);
            }
        }
        let offset = log.next_offset;
        log.next_offset += 1;
        Ok(offset)
    }

    async fn insert_at(&self, key: &str, offset: u64, event: Event) {
        let entry = self
            .keys
            .entry(key.to_string())
            .or_insert_with(|| Mutex::new(KeyLog::default()));
        let mut log = entry.lock();
        if offset >= log.next_offset {
            log.next_offset = offset + 1;
        }
        log.entries.insert(offset, event.with_id(offset));
    }

    async fn get(&self, key: &str, offset: u64, count: u32) -> MailboxPage {
        let Some(entry) = self.keys.get(key) else {
            return MailboxPage {
                start_offset: offset,
                events: Vec::new(),
            };
        };
        let log = entry.lock();
        let events: Vec<Event> = log
            .entries
            .range(offset..)
            .take(count as usize)
            .map(|(_, event)| event.clone())
            .collect();
        let start_offset = events.first().map(|e| e.id()).unwrap_or(offset);
        MailboxPage {
            start_offset,
            events,
        }
    }

    async fn discard(&self, key: &str, offset: u64) -> Result<(), GatewayError> {
        let Some(entry) = self.keys.get(key) else {
            return Err(GatewayError::DiscardNonExistentQueue);
        };
        let mut log = entry.lock();
        log.entries = log.entries.split_off(&offset);
        if offset > log.next_offset {
            log.next_offset = offset;
        }
        Ok(())
    }

    async fn remove(&self, key: &str) {
        self.keys.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::Address;

    fn deploy(id: u64) -> Event {
        Event::Deploy {
            id,
            address: Address::ZERO,
        }
    }

    #[tokio::test]
    async fn insert_assigns_increasing_offsets() {
        let mailbox = InMemoryMailbox::new();
        let a = mailbox.insert("s1", deploy(0)).await.unwrap();
        let b = mailbox.insert("s1", deploy(0)).await.unwrap();
        let c = mailbox.insert("s1", deploy(0)).await.unwrap();
        assert_eq!((a, b, c), (0, 1, 2));
    }

    #[tokio::test]
    async fn reserved_offset_is_visible_once_filled_in() {
        let mailbox = InMemoryMailbox::new();
        let offset = mailbox.reserve("s1").await.unwrap();
        assert!(mailbox.get("s1", offset, 1).await.events.is_empty());
        mailbox.insert_at("s1", offset, deploy(0)).await;
        let page = mailbox.get("s1", offset, 1).await;
        assert_eq!(page.events.len(), 1);
        assert_eq!(page.events[0].id(), offset);
    }

    #[tokio::test]
    async fn get_returns_contiguous_window_and_start_offset() {
        let mailbox = InMemoryMailbox::new();
        for _ in 0..5 {
            mailbox.insert("k", deploy(0)).await.unwrap();
        }
        let page = mailbox.get("k", 2, 2).await;
        assert_eq!(page.start_offset, 2);
        assert_eq!(page.events.iter().map(|e| e.id()).collect::<Vec<_>>(), vec![2, 3]);
    }

    #[tokio::test]
    async fn poll_is_idempotent_without_intervening_mutation() {
        let mailbox = InMemoryMailbox::new();
        for _ in 0..3 {
            mailbox.insert("k", deploy(0)).await.unwrap();
        }
        let first = mailbox.get("k", 0, 10).await;
        let second = mailbox.get("k", 0, 10).await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn discard_drops_entries_strictly_before_offset() {
        let mailbox = InMemoryMailbox::new();
        for _ in 0..5 {
            mailbox.insert("k", deploy(0)).await.unwrap();
        }
        mailbox.discard("k", 3).await.unwrap();
        let page = mailbox.get("k", 0, 10).await;
        assert_eq!(page.start_offset, 3);
        assert!(page.events.iter().all(|e| e.id() >= 3));
    }

    #[tokio::test]
    async fn discard_on_never_touched_key_is_an_error() {
        let mailbox = InMemoryMailbox::new();
        let err = mailbox.discard("ghost", 0).await.unwrap_err();
        assert!(matches!(err, GatewayError::DiscardNonExistentQueue));
    }

    #[tokio::test]
    async fn discard_raises_next_offset_even_past_existing_entries() {
        let mailbox = InMemoryMailbox::new();
        mailbox.insert("k", deploy(0)).await.unwrap();
        mailbox.discard("k", 100).await.unwrap();
        let next = mailbox.reserve("k").await.unwrap();
        assert_eq!(next, 100);
    }

    #[tokio::test]
    async fn remove_drops_the_key_entirely() {
        let mailbox = InMemoryMailbox::new();
        mailbox.insert("k", deploy(0)).await.unwrap();
        mailbox.remove("k").await;
        let next = mailbox.reserve("k").await.unwrap();
        assert_eq!(next, 0);
    }

    #[tokio::test]
    async fn reserve_past_queue_limit_is_rejected() {
        let mailbox = InMemoryMailbox::with_queue_limit(2);
        mailbox.insert("k", deploy(0)).await.unwrap();
        mailbox.insert("k", deploy(0)).await.unwrap();
        let err = mailbox.reserve("k").await.unwrap_err();
        assert!(matches!(err, GatewayError::MailboxQueueLimitReached));

        mailbox.discard("k", 1).await.unwrap();
        assert!(mailbox.reserve("k").await.is_ok());
    }
}
