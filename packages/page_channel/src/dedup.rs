//! Bounded window of recently processed inbound message ids.
//!
//! A peer that replays frames after a reconnect may deliver the same request
//! or response twice. The channel records every inbound id here and drops
//! repeats. The window is bounded by entry count and age so a long-lived
//! channel does not grow without limit.

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use crate::message::RequestId;

/// Default maximum number of remembered ids.
const DEFAULT_MAX_ENTRIES: usize = 1024;

/// Default maximum age of a remembered id.
const DEFAULT_MAX_AGE: Duration = Duration::from_secs(300); // 5 minutes

/// Requests and responses have independent id spaces: our own request ids
/// come back on responses while the peer numbers its requests separately.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SeenKey {
    Request(RequestId),
    Response(RequestId),
}

pub struct SeenWindow {
    order: VecDeque<Entry>,
    index: HashSet<SeenKey>,
    max_entries: usize,
    max_age: Duration,
}

struct Entry {
    key: SeenKey,
    timestamp: Instant,
}

impl SeenWindow {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_ENTRIES, DEFAULT_MAX_AGE)
    }

    pub fn with_limits(max_entries: usize, max_age: Duration) -> Self {
        Self {
            order: VecDeque::new(),
            index: HashSet::new(),
            max_entries: max_entries.max(1),
            max_age,
        }
    }

    /// Record `key`. Returns `false` if it was already in the window.
    pub fn insert(&mut self, key: SeenKey) -> bool {
        self.insert_at(key, Instant::now())
    }

    fn insert_at(&mut self, key: SeenKey, now: Instant) -> bool {
        self.evict_expired(now);

        if self.index.contains(&key) {
            return false;
        }

        while self.order.len() >= self.max_entries {
            if let Some(oldest) = self.order.pop_front() {
                self.index.remove(&oldest.key);
            }
        }

        self.index.insert(key.clone());
        self.order.push_back(Entry {
            key,
            timestamp: now,
        });
        true
    }

    pub fn contains(&self, key: &SeenKey) -> bool {
        self.index.contains(key)
    }

    fn evict_expired(&mut self, now: Instant) {
        let Some(cutoff) = now.checked_sub(self.max_age) else {
            return;
        };
        while let Some(front) = self.order.front() {
            if front.timestamp < cutoff {
                if let Some(entry) = self.order.pop_front() {
                    self.index.remove(&entry.key);
                }
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl Default for SeenWindow {
    fn default() -> Self {
        Self::new()
    }
}
