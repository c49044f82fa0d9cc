use dashmap::DashMap;
use log::info;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::{DecisionStore, StoreResult};

struct BlockEntry {
    reason: String,
    /// `None` means permanent.
    expiry: Option<Instant>,
}

impl BlockEntry {
    fn is_expired(&self) -> bool {
        matches!(self.expiry, Some(expiry) if Instant::now() > expiry)
    }
}

struct CounterEntry {
    count: u64,
    expiry: Instant,
}

impl CounterEntry {
    fn is_expired(&self) -> bool {
        Instant::now() > self.expiry
    }
}

struct DataEntry {
    value: String,
    expiry: Option<Instant>,
}

impl DataEntry {
    fn is_expired(&self) -> bool {
        matches!(self.expiry, Some(expiry) if Instant::now() > expiry)
    }
}

/// Decision store backed by concurrent maps, for a single process.
///
/// Per-key linearizability comes from the shard locking of the `DashMap`
/// entry API; expired entries are evicted lazily on lookup. Not suitable for
/// multi-instance deployments, where the distributed variant must be used so
/// decisions are shared across the fleet.
#[derive(Default)]
pub struct InMemoryDecisionStore {
    blocks: DashMap<String, BlockEntry>,
    counters: DashMap<String, CounterEntry>,
    data: DashMap<String, DataEntry>,
}

impl InMemoryDecisionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DecisionStore for InMemoryDecisionStore {
    fn is_blocked(&self, key: &str) -> StoreResult<bool> {
        self.blocks.remove_if(key, |_, entry| entry.is_expired());
        Ok(self.blocks.contains_key(key))
    }

    fn block(&self, key: &str, reason: &str, duration: Option<Duration>) -> StoreResult<()> {
        let expiry = duration.map(|d| Instant::now() + d);
        self.blocks.insert(
            key.to_string(),
            BlockEntry {
                reason: reason.to_string(),
                expiry,
            },
        );
        info!(
            "blocked '{}' for {}: {}",
            key,
            duration.map_or_else(|| "ever".to_string(), |d| format!("{}s", d.as_secs())),
            reason
        );
        Ok(())
    }

    fn unblock(&self, key: &str) -> StoreResult<()> {
        if self.blocks.remove(key).is_some() {
            info!("unblocked '{}'", key);
        }
        Ok(())
    }

    fn increment_counter(&self, key: &str, window: Duration) -> StoreResult<u64> {
        let mut entry = self
            .counters
            .entry(key.to_string())
            .or_insert_with(|| CounterEntry {
                count: 0,
                expiry: Instant::now() + window,
            });
        if entry.is_expired() {
            entry.count = 1;
            entry.expiry = Instant::now() + window;
        } else {
            entry.count += 1;
        }
        Ok(entry.count)
    }

    fn get_counter(&self, key: &str) -> StoreResult<u64> {
        Ok(self
            .counters
            .get(key)
            .filter(|entry| !entry.is_expired())
            .map_or(0, |entry| entry.count))
    }

    fn clear_counter(&self, key: &str) -> StoreResult<()> {
        self.counters.remove(key);
        Ok(())
    }

    fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let expiry = ttl.map(|d| Instant::now() + d);
        self.data.insert(
            key.to_string(),
            DataEntry {
                value: value.to_string(),
                expiry,
            },
        );
        Ok(())
    }

    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self
            .data
            .get(key)
            .filter(|entry| !entry.is_expired())
            .map(|entry| entry.value.clone()))
    }

    fn get_all_blocked(&self) -> StoreResult<HashMap<String, String>> {
        Ok(self
            .blocks
            .iter()
            .filter(|entry| !entry.is_expired())
            .map(|entry| (entry.key().clone(), entry.reason.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn block_expires_after_its_duration() {
        let store = InMemoryDecisionStore::new();
        store
            .block("10.0.0.1", "test", Some(Duration::from_millis(30)))
            .unwrap();

        assert!(store.is_blocked("10.0.0.1").unwrap());
        thread::sleep(Duration::from_millis(50));
        assert!(!store.is_blocked("10.0.0.1").unwrap());
        // The expired entry was evicted, not just hidden.
        assert!(store.get_all_blocked().unwrap().is_empty());
    }

    #[test]
    fn permanent_block_has_no_expiry() {
        let store = InMemoryDecisionStore::new();
        store.block("user:mallory", "stuffing", None).unwrap();
        assert!(store.is_blocked("user:mallory").unwrap());

        store.unblock("user:mallory").unwrap();
        assert!(!store.is_blocked("user:mallory").unwrap());
    }

    #[test]
    fn counters_increase_strictly_within_the_window() {
        let store = InMemoryDecisionStore::new();
        for expected in 1..=5 {
            let count = store
                .increment_counter("failures", Duration::from_secs(60))
                .unwrap();
            assert_eq!(count, expected);
        }
        assert_eq!(store.get_counter("failures").unwrap(), 5);
    }

    #[test]
    fn expired_counter_restarts_at_one() {
        let store = InMemoryDecisionStore::new();
        store
            .increment_counter("burst", Duration::from_millis(20))
            .unwrap();
        thread::sleep(Duration::from_millis(40));

        assert_eq!(store.get_counter("burst").unwrap(), 0);
        assert_eq!(
            store
                .increment_counter("burst", Duration::from_millis(20))
                .unwrap(),
            1
        );
    }

    #[test]
    fn clear_counter_removes_it() {
        let store = InMemoryDecisionStore::new();
        store
            .increment_counter("seq", Duration::from_secs(60))
            .unwrap();
        store.clear_counter("seq").unwrap();
        assert_eq!(store.get_counter("seq").unwrap(), 0);
    }

    #[test]
    fn kv_respects_ttl() {
        let store = InMemoryDecisionStore::new();
        store
            .put("last-id", "41", Some(Duration::from_millis(20)))
            .unwrap();
        assert_eq!(store.get("last-id").unwrap().as_deref(), Some("41"));

        thread::sleep(Duration::from_millis(40));
        assert_eq!(store.get("last-id").unwrap(), None);

        store.put("pinned", "x", None).unwrap();
        assert_eq!(store.get("pinned").unwrap().as_deref(), Some("x"));
    }

    #[test]
    fn get_all_blocked_reports_reasons() {
        let store = InMemoryDecisionStore::new();
        store.block("a", "first", None).unwrap();
        store
            .block("b", "second", Some(Duration::from_secs(60)))
            .unwrap();

        let blocked = store.get_all_blocked().unwrap();
        assert_eq!(blocked.len(), 2);
        assert_eq!(blocked.get("a").map(String::as_str), Some("first"));
        assert_eq!(blocked.get("b").map(String::as_str), Some("second"));
    }

    #[test]
    fn concurrent_increments_never_lose_updates() {
        let store = std::sync::Arc::new(InMemoryDecisionStore::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = store.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..250 {
                    store
                        .increment_counter("shared", Duration::from_secs(60))
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.get_counter("shared").unwrap(), 1000);
    }
}
