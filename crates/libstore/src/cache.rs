use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use storage_proto::{QUERY_CACHE_SECONDS, QUERY_CACHE_THRESH};

/// A cached value: a string or an ordered list, matching the storage
/// engine's entry types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cached {
    Value(String),
    List(Vec<String>),
}

/// Outcome of consulting the cache for one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// A live lease covers the key; serve locally.
    Hit(Cached),
    /// Not cached, and the key is queried often enough to want a lease.
    MissWantLease,
    /// Not cached.
    Miss,
}

struct Entry {
    granted: bool,
    value: Option<Cached>,
    leased_at: Instant,
    ttl: Duration,
    /// Recent query instants, newest last, capped at the admission
    /// threshold.
    queries: VecDeque<Instant>,
}

impl Entry {
    fn new(now: Instant) -> Self {
        Self {
            granted: false,
            value: None,
            leased_at: now,
            ttl: Duration::ZERO,
            queries: VecDeque::new(),
        }
    }

    fn live(&self, now: Instant) -> bool {
        self.granted && now < self.leased_at + self.ttl
    }

    fn prune_queries(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.queries.front() {
            if now.duration_since(oldest) > window {
                self.queries.pop_front();
            } else {
                break;
            }
        }
    }
}

/// The client-side cache: lease-bounded values plus the query-frequency
/// history that drives lease admission. Idle entries are swept on every
/// access so a shifting workload cannot grow the map without bound.
pub struct Cache {
    window: Duration,
    threshold: usize,
    entries: Mutex<HashMap<String, Entry>>,
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

impl Cache {
    pub fn new() -> Self {
        Self::with_admission(
            Duration::from_secs(QUERY_CACHE_SECONDS),
            QUERY_CACHE_THRESH,
        )
    }

    /// Admission parameters are injectable so the pruning behavior is
    /// testable without ten-second waits.
    pub fn with_admission(window: Duration, threshold: usize) -> Self {
        Self {
            window,
            threshold,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Consult the cache for `key`, recording the query in its admission
    /// history on a miss.
    pub fn lookup(&self, key: &str) -> Lookup {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        Self::sweep_locked(&mut entries, now, self.window);

        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(now));
        if entry.live(now) {
            if let Some(value) = &entry.value {
                return Lookup::Hit(value.clone());
            }
        }
        entry.granted = false;

        entry.queries.push_back(now);
        while entry.queries.len() > self.threshold {
            entry.queries.pop_front();
        }
        entry.prune_queries(now, self.window);

        if entry.queries.len() >= self.threshold {
            Lookup::MissWantLease
        } else {
            Lookup::Miss
        }
    }

    /// Install a granted lease and its value.
    pub fn grant(&self, key: &str, value: Cached, ttl: Duration) {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(now));
        entry.granted = true;
        entry.value = Some(value);
        entry.leased_at = now;
        entry.ttl = ttl;
    }

    /// Invalidate a lease. Unknown keys are benign: the revocation may
    /// outrun the grant it targets, or the entry may already be swept.
    pub fn revoke(&self, key: &str) {
        if let Some(entry) = self.entries.lock().unwrap().get_mut(key) {
            entry.granted = false;
            entry.value = None;
        }
    }

    fn sweep_locked(entries: &mut HashMap<String, Entry>, now: Instant, window: Duration) {
        entries.retain(|_, entry| {
            if entry.live(now) {
                return true;
            }
            entry.granted = false;
            entry.prune_queries(now, window);
            !entry.queries.is_empty()
        });
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}
