use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Time source seam so tests can sit exactly on the TTL boundary.
pub trait Clock {
    fn now(&self) -> Instant;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

struct CacheEntry<T> {
    value: T,
    stored_at: Instant,
    ttl: Duration,
}

impl<T> CacheEntry<T> {
    fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.stored_at) <= self.ttl
    }
}

/// Time-bounded key/value store. Never the system of record: every consumer
/// must be able to re-read the authoritative store on a miss.
///
/// Keys follow `<domain>:<discriminant...>` so a mutation whose blast radius
/// spans several keys can be invalidated by prefix.
pub struct Cache<T> {
    entries: HashMap<String, CacheEntry<T>>,
    clock: Box<dyn Clock>,
}

impl<T> Cache<T> {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }

    pub fn with_clock(clock: impl Clock + 'static) -> Self {
        Cache {
            entries: HashMap::new(),
            clock: Box::new(clock),
        }
    }

    /// Stores a value, unconditionally replacing any existing entry.
    pub fn set(&mut self, key: impl Into<String>, value: T, ttl: Duration) {
        let stored_at = self.clock.now();
        self.entries.insert(
            key.into(),
            CacheEntry {
                value,
                stored_at,
                ttl,
            },
        );
    }

    /// Returns the value while `now - stored_at <= ttl`; an expired entry is
    /// evicted on the spot and reported absent.
    pub fn get(&mut self, key: &str) -> Option<&T> {
        let now = self.clock.now();
        match self.entries.get(key) {
            Some(entry) if entry.is_fresh(now) => {}
            Some(_) => {
                self.entries.remove(key);
                return None;
            }
            None => return None,
        }
        self.entries.get(key).map(|e| &e.value)
    }

    /// Freshness-checked lookup that leaves an expired entry in place.
    /// For callers that may still fall back to it via `peek_stale` when
    /// the authoritative read fails.
    pub fn peek(&self, key: &str) -> Option<&T> {
        let now = self.clock.now();
        self.entries
            .get(key)
            .filter(|e| e.is_fresh(now))
            .map(|e| &e.value)
    }

    /// Returns the entry even past its TTL. Last-resort reads only.
    pub fn peek_stale(&self, key: &str) -> Option<&T> {
        self.entries.get(key).map(|e| &e.value)
    }

    pub fn invalidate(&mut self, key: &str) {
        self.entries.remove(key);
    }

    pub fn invalidate_prefix(&mut self, prefix: &str) {
        self.entries.retain(|k, _| !k.starts_with(prefix));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> Default for Cache<T> {
    fn default() -> Self {
        Self::new()
    }
}
