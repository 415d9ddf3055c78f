use alloy_primitives::{Address, B256};

/// Resume point / dedup key for a log subscription: `(block_number, log_index)`.
///
/// Ordered lexicographically on `(block_number, log_index)`, matching
/// spec.md §3's invariant that no event at or before `last_delivered` is
/// ever forwarded again after a resubscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct LogPointer {
    pub block_number: u64,
    pub log_index: u64,
}

impl LogPointer {
    pub fn new(block_number: u64, log_index: u64) -> Self {
        Self {
            block_number,
            log_index,
        }
    }
}

/// Filter describing what a subscription wants to hear about: a set of
/// addresses and a topic vector, URL-decoded from the `filter` query string
/// on `/v0/api/event/subscribe` (spec.md §4.6).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LogFilter {
    pub addresses: Vec<Address>,
    pub topics: Vec<B256>,
}

impl LogFilter {
    pub fn matches_address(&self, address: &Address) -> bool {
        self.addresses.is_empty() || self.addresses.contains(address)
    }
}
