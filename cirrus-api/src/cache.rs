// SPDX-License-Identifier: AGPL-3.0-or-later
//! Response caching
//!
//! Keeps raw answers of idempotent reads for a short while. Entries expire
//! after a TTL, the oldest entry goes first when the cache is full, and any
//! mutating request clears the whole cache.
//!
//! Keys are built from the authenticated request, so services sharing a
//! cache never see answers fetched with someone else's credentials or host.

use bytes::Bytes;
use cirrus_core::ApiRequest;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Default time to live for cached answers
pub const DEFAULT_TTL: Duration = Duration::from_secs(30);

/// Default maximum number of cached answers
pub const DEFAULT_CAPACITY: usize = 256;

struct CachedAnswer {
    body: Bytes,
    stored_at: Instant,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CachedAnswer>,
    /// Insertion order, oldest first
    order: VecDeque<String>,
    /// Bumped by every clear
    generation: u64,
    hits: u64,
    misses: u64,
}

/// Cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

/// In-memory cache of successful read answers
pub struct ResponseCache {
    state: Mutex<CacheState>,
    ttl: Duration,
    capacity: usize,
}

impl ResponseCache {
    pub fn new(capacity: usize) -> Self {
        Self::with_ttl(capacity, DEFAULT_TTL)
    }

    pub fn with_ttl(capacity: usize, ttl: Duration) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            ttl,
            capacity: capacity.max(1),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Cache key for an authenticated request: URL, query parameters and
    /// headers. Parameter and header order does not matter.
    pub fn key(request: &ApiRequest) -> String {
        let mut params: Vec<_> = request
            .query
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        params.sort();
        let mut headers: Vec<_> = request
            .headers
            .iter()
            .map(|(k, v)| format!("{}:{v}", k.to_ascii_lowercase()))
            .collect();
        headers.sort();
        format!("{}?{}\n{}", request.url, params.join("&"), headers.join("\n"))
    }

    /// Current generation. Read it before sending a request and hand it to
    /// [`put_if_current`](Self::put_if_current) with the answer.
    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        let mut state = self.state.lock();
        let expired = state
            .entries
            .get(key)
            .map(|answer| answer.stored_at.elapsed() >= self.ttl);
        let fresh = match expired {
            Some(false) => state.entries.get(key).map(|answer| answer.body.clone()),
            Some(true) => {
                state.entries.remove(key);
                state.order.retain(|k| k != key);
                None
            }
            None => None,
        };
        match fresh {
            Some(_) => state.hits += 1,
            None => state.misses += 1,
        }
        fresh
    }

    pub fn put(&self, key: impl Into<String>, body: Bytes) {
        let mut state = self.state.lock();
        Self::insert(&mut state, self.capacity, key.into(), body);
    }

    /// Store `body` unless the cache was cleared since `generation` was
    /// read. Returns whether the answer was kept.
    pub fn put_if_current(&self, key: impl Into<String>, body: Bytes, generation: u64) -> bool {
        let mut state = self.state.lock();
        if state.generation != generation {
            return false;
        }
        Self::insert(&mut state, self.capacity, key.into(), body);
        true
    }

    fn insert(state: &mut CacheState, capacity: usize, key: String, body: Bytes) {
        if state.entries.contains_key(&key) {
            state.order.retain(|k| k != &key);
        }
        while state.entries.len() >= capacity && !state.entries.contains_key(&key) {
            let Some(oldest) = state.order.pop_front() else {
                break;
            };
            state.entries.remove(&oldest);
        }
        state.order.push_back(key.clone());
        state.entries.insert(
            key,
            CachedAnswer {
                body,
                stored_at: Instant::now(),
            },
        );
    }

    /// Drop every cached answer.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        if !state.entries.is_empty() {
            tracing::debug!(entries = state.entries.len(), "response cache cleared");
        }
        state.entries.clear();
        state.order.clear();
        state.generation += 1;
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            entries: state.entries.len(),
            hits: state.hits,
            misses: state.misses,
        }
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl std::fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCache")
            .field("ttl", &self.ttl)
            .field("capacity", &self.capacity)
            .field("entries", &self.len())
            .finish()
    }
}
