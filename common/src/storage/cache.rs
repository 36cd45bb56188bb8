use std::{
    collections::HashMap,
    hash::Hash,
    sync::Mutex,
    time::{Duration, Instant},
};

/// Bounded, TTL-expiring, per-key cache. Mirrors the `Mutex<HashMap<...>>` idiom used
/// for the API gate's rate limiter: no external cache dependency appears anywhere in the
/// corpus, so this stays in-process rather than reaching for a crate like `moka`.
///
/// Used for both the query-result cache (§4.4, TTL default 1h, bounded per KB) and the
/// embedding cache (§4.2, TTL default 7 days).
pub struct TtlCache<K, V> {
    entries: Mutex<HashMap<K, Entry<V>>>,
    capacity: usize,
    ttl: Duration,
}

struct Entry<V> {
    value: V,
    inserted_at: Instant,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        TtlCache {
            entries: Mutex::new(HashMap::new()),
            capacity,
            ttl,
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock().expect("cache mutex poisoned");
        match entries.get(key) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, key: K, value: V) {
        let mut entries = self.entries.lock().expect("cache mutex poisoned");
        if entries.len() >= self.capacity && !entries.contains_key(&key) {
            self.evict_one_expired_or_oldest(&mut entries);
        }
        entries.insert(
            key,
            Entry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn invalidate_prefix(&self, predicate: impl Fn(&K) -> bool) {
        let mut entries = self.entries.lock().expect("cache mutex poisoned");
        entries.retain(|k, _| !predicate(k));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict_one_expired_or_oldest(&self, entries: &mut HashMap<K, Entry<V>>) {
        let expired_key = entries
            .iter()
            .find(|(_, entry)| entry.inserted_at.elapsed() >= self.ttl)
            .map(|(k, _)| k.clone());

        let victim = expired_key.or_else(|| {
            entries
                .iter()
                .min_by_key(|(_, entry)| entry.inserted_at)
                .map(|(k, _)| k.clone())
        });

        if let Some(victim) = victim {
            entries.remove(&victim);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_then_expire() {
        let cache: TtlCache<String, u32> = TtlCache::new(10, Duration::from_millis(20));
        cache.put("k".to_string(), 1);
        assert_eq!(cache.get(&"k".to_string()), Some(1));
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.get(&"k".to_string()), None);
    }

    #[test]
    fn capacity_evicts_oldest() {
        let cache: TtlCache<u32, u32> = TtlCache::new(2, Duration::from_secs(60));
        cache.put(1, 1);
        std::thread::sleep(Duration::from_millis(5));
        cache.put(2, 2);
        std::thread::sleep(Duration::from_millis(5));
        cache.put(3, 3);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&1), None);
    }
}
