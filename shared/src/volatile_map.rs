use crate::clock::Clock;
use parking_lot::RwLock;
use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

struct Entry<V> {
    value: V,
    expires_at: SystemTime,
}

/// Concurrent key→value cache where every entry carries an absolute expiry.
/// Expired entries read as absent and are removed opportunistically on access;
/// there is no background evictor.
pub struct VolatileMap<K, V> {
    clock: Arc<dyn Clock>,
    entries: RwLock<HashMap<K, Entry<V>>>,
}

impl<K, V> VolatileMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        VolatileMap {
            clock,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Installs `value` when the slot is empty or its occupant has expired.
    /// Returns true iff this call installed the value.
    pub fn try_add(&self, key: K, value: V, ttl: Duration) -> bool {
        let now = self.clock.utc_now();
        let mut entries = self.entries.write();
        match entries.get(&key) {
            Some(entry) if entry.expires_at > now => false,
            _ => {
                entries.insert(
                    key,
                    Entry {
                        value,
                        expires_at: now + ttl,
                    },
                );
                true
            }
        }
    }

    /// Returns the value iff present and not expired.
    pub fn try_get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = self.clock.utc_now();
        {
            let entries = self.entries.read();
            match entries.get(key) {
                Some(entry) if entry.expires_at > now => return Some(entry.value.clone()),
                Some(_) => {}
                None => return None,
            }
        }

        // The entry lapsed; drop it unless a writer replaced it meanwhile.
        let mut entries = self.entries.write();
        let still_expired = entries
            .get(key)
            .is_some_and(|entry| entry.expires_at <= now);
        if still_expired {
            entries.remove(key);
        }
        None
    }

    /// Forces immediate expiry of the entry if present.
    pub fn invalidate<Q>(&self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.write().remove(key);
    }

    /// Single-shot get-or-install: read, construct, `try_add`, and on a lost
    /// race read the winner's value back out. The loser's candidate serves
    /// only its own caller if the winner's entry was already invalidated.
    pub fn get_or_install(&self, key: K, ttl: Duration, make: impl FnOnce() -> V) -> V {
        if let Some(existing) = self.try_get(&key) {
            return existing;
        }
        let candidate = make();
        if self.try_add(key.clone(), candidate.clone(), ttl) {
            return candidate;
        }
        self.try_get(&key).unwrap_or(candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn map() -> (Arc<ManualClock>, VolatileMap<String, u32>) {
        let clock = Arc::new(ManualClock::new(SystemTime::UNIX_EPOCH));
        let map = VolatileMap::new(clock.clone());
        (clock, map)
    }

    #[test]
    fn try_add_rejects_live_entry() {
        let (_clock, map) = map();
        assert!(map.try_add("k".into(), 1, Duration::from_secs(10)));
        assert!(!map.try_add("k".into(), 2, Duration::from_secs(10)));
        assert_eq!(map.try_get("k"), Some(1));
    }

    #[test]
    fn try_add_replaces_expired_entry() {
        let (clock, map) = map();
        assert!(map.try_add("k".into(), 1, Duration::from_secs(10)));

        clock.advance(Duration::from_secs(11));
        assert_eq!(map.try_get("k"), None);
        assert!(map.try_add("k".into(), 2, Duration::from_secs(10)));
        assert_eq!(map.try_get("k"), Some(2));
    }

    #[test]
    fn entry_expires_exactly_at_deadline() {
        let (clock, map) = map();
        map.try_add("k".into(), 1, Duration::from_secs(10));

        clock.advance(Duration::from_secs(10));
        assert_eq!(map.try_get("k"), None);
    }

    #[test]
    fn invalidate_removes_entry() {
        let (_clock, map) = map();
        map.try_add("k".into(), 1, Duration::from_secs(10));
        map.invalidate("k");
        assert_eq!(map.try_get("k"), None);
    }

    #[test]
    fn get_or_install_returns_existing() {
        let (_clock, map) = map();
        map.try_add("k".into(), 1, Duration::from_secs(10));

        let value = map.get_or_install("k".into(), Duration::from_secs(10), || 2);
        assert_eq!(value, 1);
    }

    #[test]
    fn get_or_install_installs_on_miss() {
        let (_clock, map) = map();
        let value = map.get_or_install("k".into(), Duration::from_secs(10), || 7);
        assert_eq!(value, 7);
        assert_eq!(map.try_get("k"), Some(7));
    }
}
