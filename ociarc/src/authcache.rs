use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::trace;

pub const DEFAULT_MAX_HOSTS: usize = 100;

/// Per-host LRU+TTL cache of Authorization header values. The empty string
/// is a cachable value meaning "no Authorization header for this host".
///
/// A zero TTL constructs a disabled cache that reports every lookup as a
/// miss and drops every insert.
pub struct AuthHeaderCache {
    inner: Option<Mutex<Lru>>,
    ttl: Duration,
}

struct Lru {
    max: usize,
    map: HashMap<String, Entry>,
    // front is least recently used
    order: VecDeque<String>,
}

struct Entry {
    value: String,
    expires_at: Instant,
}

impl AuthHeaderCache {
    pub fn new(max: usize, ttl: Duration) -> Self {
        if ttl.is_zero() {
            return Self::disabled();
        }
        AuthHeaderCache {
            inner: Some(Mutex::new(Lru {
                max: max.max(1),
                map: HashMap::new(),
                order: VecDeque::new(),
            })),
            ttl,
        }
    }

    pub fn disabled() -> Self {
        AuthHeaderCache {
            inner: None,
            ttl: Duration::ZERO,
        }
    }

    pub fn get(&self, host: &str) -> Option<String> {
        let mut lru = self.inner.as_ref()?.lock().unwrap();
        let (value, expired) = match lru.map.get(host) {
            Some(entry) if entry.expires_at <= Instant::now() => (None, true),
            Some(entry) => (Some(entry.value.clone()), false),
            None => (None, false),
        };
        if expired {
            trace!("auth header for {host} expired");
            lru.remove(host);
            return None;
        }
        value.inspect(|_| lru.promote(host))
    }

    pub fn set(&self, host: &str, value: String) {
        let Some(inner) = self.inner.as_ref() else {
            return;
        };
        let mut lru = inner.lock().unwrap();
        let expires_at = Instant::now() + self.ttl;
        if lru.map.contains_key(host) {
            lru.map.insert(host.to_string(), Entry { value, expires_at });
            lru.promote(host);
            return;
        }
        while lru.map.len() >= lru.max {
            if let Some(evicted) = lru.order.pop_front() {
                trace!("evicting auth header for {evicted}");
                lru.map.remove(&evicted);
            } else {
                break;
            }
        }
        lru.map.insert(host.to_string(), Entry { value, expires_at });
        lru.order.push_back(host.to_string());
    }

    pub fn invalidate(&self, host: &str) {
        if let Some(inner) = self.inner.as_ref() {
            inner.lock().unwrap().remove(host);
        }
    }
}

impl Lru {
    fn promote(&mut self, host: &str) {
        self.order.retain(|h| h != host);
        self.order.push_back(host.to_string());
    }

    fn remove(&mut self, host: &str) {
        self.map.remove(host);
        self.order.retain(|h| h != host);
    }
}
