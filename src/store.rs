//! Backing-store abstraction.
//!
//! The cache core only ever needs four operations from its store: single-key
//! get, single-key set-with-TTL, and pipelined multi-key variants of both.
//! Multi-key reads and writes are issued as one round trip each; a pipelined
//! write reports success per key, and partial failure is the caller's problem
//! to tolerate, not ours to retry.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use crate::error::Result;

/// One entry of a pipelined multi-key write.
#[derive(Debug, Clone)]
pub struct StoreWrite {
    pub key: String,
    pub value: String,
    /// TTL in seconds; `None` means no expiry.
    pub expiry: Option<u64>,
}

impl StoreWrite {
    pub fn new(key: impl Into<String>, value: impl Into<String>, expiry: Option<u64>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            expiry,
        }
    }
}

/// Client interface to the backing store.
///
/// The only consistency guarantee the core relies on is the store's own
/// atomicity for a single key's get/set.
#[async_trait]
pub trait StoreClient: Send + Sync {
    /// Fetch a single key. Missing keys are `Ok(None)`.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a single key, optionally with a TTL. Returns per-key success.
    async fn set(&self, write: &StoreWrite) -> Result<bool>;

    /// Fetch many keys in one pipelined round trip. The result is positional:
    /// `result[i]` corresponds to `keys[i]`, missing keys are `None`.
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>>;

    /// Write many keys in one pipelined round trip, returning per-key success
    /// in the same order. Some keys may succeed while others fail.
    async fn set_many(&self, writes: &[StoreWrite]) -> Result<Vec<bool>>;
}

/// Redis-backed store client over a multiplexed async connection.
pub struct RedisStore {
    client: redis::Client,
}

impl RedisStore {
    /// Create a client and verify connectivity with a PING.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        debug!(url, "Connected to redis");
        Ok(Self { client })
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    fn write_ok(value: &redis::Value) -> bool {
        matches!(value, redis::Value::Okay)
            || matches!(value, redis::Value::SimpleString(s) if s == "OK")
    }
}

#[async_trait]
impl StoreClient for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn().await?;
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, write: &StoreWrite) -> Result<bool> {
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(&write.key).arg(&write.value);
        if let Some(expiry) = write.expiry {
            cmd.arg("EX").arg(expiry);
        }
        let value: redis::Value = cmd.query_async(&mut conn).await?;
        Ok(Self::write_ok(&value))
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.get(key);
        }
        let values: Vec<Option<String>> = pipe.query_async(&mut conn).await?;
        Ok(values)
    }

    async fn set_many(&self, writes: &[StoreWrite]) -> Result<Vec<bool>> {
        if writes.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        let mut pipe = redis::pipe();
        for write in writes {
            match write.expiry {
                Some(expiry) => {
                    pipe.set_ex(&write.key, &write.value, expiry);
                }
                None => {
                    pipe.set(&write.key, &write.value);
                }
            }
        }
        let values: Vec<redis::Value> = pipe.query_async(&mut conn).await?;
        Ok(values.iter().map(Self::write_ok).collect())
    }
}

/// In-memory store for tests and local development.
///
/// Tracks round-trip counts so tests can assert the pipelined-batch contract:
/// N keys read through `get_many` must cost one round trip, not N.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
    failing_keys: Mutex<HashSet<String>>,
    get_round_trips: AtomicU64,
    set_round_trips: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of read round trips issued so far (single-key and pipelined
    /// reads each count as one).
    pub fn get_round_trips(&self) -> u64 {
        self.get_round_trips.load(Ordering::Relaxed)
    }

    /// Number of write round trips issued so far.
    pub fn set_round_trips(&self) -> u64 {
        self.set_round_trips.load(Ordering::Relaxed)
    }

    /// Direct peek at a stored value, bypassing round-trip accounting.
    pub fn peek(&self, key: &str) -> Option<String> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    /// Direct insert, bypassing round-trip accounting.
    pub fn seed(&self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.lock().unwrap().insert(key.into(), value.into());
    }

    /// Make every subsequent write to `key` report per-key failure, the way
    /// redis reports a refused SET inside a pipeline.
    pub fn fail_writes_to(&self, key: impl Into<String>) {
        self.failing_keys.lock().unwrap().insert(key.into());
    }

    fn write_entry(&self, entries: &mut HashMap<String, String>, write: &StoreWrite) -> bool {
        if self.failing_keys.lock().unwrap().contains(&write.key) {
            return false;
        }
        entries.insert(write.key.clone(), write.value.clone());
        true
    }
}

#[async_trait]
impl StoreClient for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.get_round_trips.fetch_add(1, Ordering::Relaxed);
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    async fn set(&self, write: &StoreWrite) -> Result<bool> {
        self.set_round_trips.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.lock().unwrap();
        Ok(self.write_entry(&mut entries, write))
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        self.get_round_trips.fetch_add(1, Ordering::Relaxed);
        let entries = self.entries.lock().unwrap();
        Ok(keys.iter().map(|k| entries.get(k).cloned()).collect())
    }

    async fn set_many(&self, writes: &[StoreWrite]) -> Result<Vec<bool>> {
        self.set_round_trips.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.lock().unwrap();
        Ok(writes
            .iter()
            .map(|write| self.write_entry(&mut entries, write))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryStore::new();
        let ok = store
            .set(&StoreWrite::new("k1", "v1", Some(60)))
            .await
            .unwrap();
        assert!(ok);
        assert_eq!(store.get("k1").await.unwrap(), Some("v1".to_string()));
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_get_many_is_positional_and_single_trip() {
        let store = MemoryStore::new();
        store.seed("a", "1");
        store.seed("c", "3");

        let keys: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        let values = store.get_many(&keys).await.unwrap();

        assert_eq!(
            values,
            vec![Some("1".to_string()), None, Some("3".to_string())]
        );
        assert_eq!(store.get_round_trips(), 1);
    }

    #[tokio::test]
    async fn test_set_many_reports_per_key() {
        let store = MemoryStore::new();
        let writes = vec![
            StoreWrite::new("x", "1", Some(10)),
            StoreWrite::new("y", "2", None),
        ];
        let results = store.set_many(&writes).await.unwrap();
        assert_eq!(results, vec![true, true]);
        assert_eq!(store.set_round_trips(), 1);
    }

    #[tokio::test]
    async fn test_set_many_reports_scripted_failures_in_position() {
        let store = MemoryStore::new();
        store.fail_writes_to("y");

        let writes = vec![
            StoreWrite::new("x", "1", Some(10)),
            StoreWrite::new("y", "2", Some(10)),
            StoreWrite::new("z", "3", None),
        ];
        let results = store.set_many(&writes).await.unwrap();

        assert_eq!(results, vec![true, false, true]);
        assert_eq!(store.peek("x"), Some("1".to_string()));
        assert_eq!(store.peek("y"), None);
        assert_eq!(store.peek("z"), Some("3".to_string()));
    }
}
