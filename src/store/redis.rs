use std::collections::HashMap;
use std::time::Duration;

use log::info;
use redis::{Client, Commands, Connection};

use super::{DecisionStore, StoreResult};

const BLOCK_PREFIX: &str = "sentinai:block:";
const COUNTER_PREFIX: &str = "sentinai:counter:";
const DATA_PREFIX: &str = "sentinai:data:";

/// Decision store over a shared Redis instance, so a block decided on one
/// instance is enforced across the fleet.
///
/// Semantics match the in-memory variant: blocks and keyed data rely on
/// Redis key expiry, counters use `INCR` with an expiry attached on first
/// insert. Connection or protocol faults surface as `StoreError::Redis`;
/// synchronous callers degrade to "no data" on fault.
pub struct RedisDecisionStore {
    client: Client,
}

impl RedisDecisionStore {
    pub fn new(url: &str) -> StoreResult<Self> {
        let client = Client::open(url)?;
        info!("decision store connected to redis at {}", url);
        Ok(Self { client })
    }

    fn conn(&self) -> StoreResult<Connection> {
        Ok(self.client.get_connection()?)
    }
}

impl DecisionStore for RedisDecisionStore {
    fn is_blocked(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.conn()?;
        Ok(conn.exists(format!("{BLOCK_PREFIX}{key}"))?)
    }

    fn block(&self, key: &str, reason: &str, duration: Option<Duration>) -> StoreResult<()> {
        let mut conn = self.conn()?;
        let redis_key = format!("{BLOCK_PREFIX}{key}");
        match duration {
            Some(duration) => {
                let _: () = conn.set_ex(redis_key, reason, duration.as_secs().max(1))?;
            }
            None => {
                let _: () = conn.set(redis_key, reason)?;
            }
        }
        info!(
            "blocked '{}' for {}: {}",
            key,
            duration.map_or_else(|| "ever".to_string(), |d| format!("{}s", d.as_secs())),
            reason
        );
        Ok(())
    }

    fn unblock(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.conn()?;
        let _: () = conn.del(format!("{BLOCK_PREFIX}{key}"))?;
        Ok(())
    }

    fn increment_counter(&self, key: &str, window: Duration) -> StoreResult<u64> {
        let mut conn = self.conn()?;
        let redis_key = format!("{COUNTER_PREFIX}{key}");
        let count: u64 = conn.incr(&redis_key, 1u64)?;
        if count == 1 {
            let _: () = conn.expire(&redis_key, window.as_secs().max(1) as i64)?;
        }
        Ok(count)
    }

    fn get_counter(&self, key: &str) -> StoreResult<u64> {
        let mut conn = self.conn()?;
        let count: Option<u64> = conn.get(format!("{COUNTER_PREFIX}{key}"))?;
        Ok(count.unwrap_or(0))
    }

    fn clear_counter(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.conn()?;
        let _: () = conn.del(format!("{COUNTER_PREFIX}{key}"))?;
        Ok(())
    }

    fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let mut conn = self.conn()?;
        let redis_key = format!("{DATA_PREFIX}{key}");
        match ttl {
            Some(ttl) => {
                let _: () = conn.set_ex(redis_key, value, ttl.as_secs().max(1))?;
            }
            None => {
                let _: () = conn.set(redis_key, value)?;
            }
        }
        Ok(())
    }

    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn()?;
        Ok(conn.get(format!("{DATA_PREFIX}{key}"))?)
    }

    fn get_all_blocked(&self) -> StoreResult<HashMap<String, String>> {
        let mut conn = self.conn()?;
        let keys: Vec<String> = conn.scan_match(format!("{BLOCK_PREFIX}*"))?.collect();

        let mut blocked = HashMap::with_capacity(keys.len());
        for redis_key in keys {
            // The key can expire between SCAN and GET; skip it if it did.
            let reason: Option<String> = conn.get(&redis_key)?;
            if let (Some(key), Some(reason)) = (redis_key.strip_prefix(BLOCK_PREFIX), reason) {
                blocked.insert(key.to_string(), reason);
            }
        }
        Ok(blocked)
    }
}
