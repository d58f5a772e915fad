//! Time-bounded key/value store shared between concurrent requests.
//!
//! One mutex guards the whole map. `take` looks up and removes under a single
//! acquisition so a key can never be claimed twice.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now = add_ttl(*now, by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn add_ttl(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

struct Entry<V> {
    value: V,
    expires_at: DateTime<Utc>,
}

pub struct ExpiringCache<K, V> {
    entries: Mutex<HashMap<K, Entry<V>>>,
    clock: Arc<dyn Clock>,
}

impl<K, V> ExpiringCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, Entry<V>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts or refreshes `key`.
    pub fn insert(&self, key: K, value: V, ttl: Duration) {
        let expires_at = add_ttl(self.clock.now(), ttl);
        self.lock().insert(key, Entry { value, expires_at });
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now();
        let mut entries = self.lock();
        match entries.get(key) {
            Some(entry) if entry.expires_at > now => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Removes and returns a live entry. Expired entries are dropped and
    /// reported as missing.
    pub fn take(&self, key: &K) -> Option<V> {
        let now = self.clock.now();
        let entry = self.lock().remove(key)?;
        (entry.expires_at > now).then_some(entry.value)
    }

    pub fn remove(&self, key: &K) -> bool {
        self.lock().remove(key).is_some()
    }

    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    /// Number of stored entries, including ones that expired but were not yet purged.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 2, 14, 0, 0, 0).unwrap(),
        ))
    }

    #[test]
    fn entries_expire_after_ttl() {
        let clock = clock();
        let cache: ExpiringCache<String, u32> = ExpiringCache::new(clock.clone());
        cache.insert("a".to_string(), 1, Duration::from_secs(180));

        clock.advance(Duration::from_secs(179));
        assert_eq!(cache.get(&"a".to_string()), Some(1));

        clock.advance(Duration::from_secs(1));
        assert_eq!(cache.get(&"a".to_string()), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn take_is_single_use() {
        let cache: ExpiringCache<String, u32> = ExpiringCache::new(clock());
        cache.insert("token".to_string(), 7, Duration::from_secs(60));

        assert_eq!(cache.take(&"token".to_string()), Some(7));
        assert_eq!(cache.take(&"token".to_string()), None);
    }

    #[test]
    fn take_of_expired_entry_reports_missing() {
        let clock = clock();
        let cache: ExpiringCache<String, u32> = ExpiringCache::new(clock.clone());
        cache.insert("token".to_string(), 7, Duration::from_secs(60));
        clock.advance(Duration::from_secs(61));

        assert_eq!(cache.take(&"token".to_string()), None);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn purge_drops_only_expired_entries() {
        let clock = clock();
        let cache: ExpiringCache<u32, &str> = ExpiringCache::new(clock.clone());
        cache.insert(1, "short", Duration::from_secs(10));
        cache.insert(2, "long", Duration::from_secs(600));
        clock.advance(Duration::from_secs(11));

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&2), Some("long"));
    }

    #[test]
    fn reinsert_refreshes_expiry() {
        let clock = clock();
        let cache: ExpiringCache<u32, u32> = ExpiringCache::new(clock.clone());
        cache.insert(1, 1, Duration::from_secs(10));
        clock.advance(Duration::from_secs(8));
        cache.insert(1, 2, Duration::from_secs(10));
        clock.advance(Duration::from_secs(8));

        assert_eq!(cache.get(&1), Some(2));
    }
}
