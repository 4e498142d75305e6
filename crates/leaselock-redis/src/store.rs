use std::time::Duration;

use async_trait::async_trait;
use leaselock_core::{StoreClient, StoreError};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError, Script, Value};
use tracing::{debug, info, instrument};

use crate::scripts;

/// `StoreClient` over a single Redis endpoint.
///
/// Uses a `ConnectionManager`, which multiplexes one connection and
/// reconnects on failure. Every Redis error surfaces as
/// `StoreError::Unavailable`.
///
/// Locks are only as safe as the endpoint: an asynchronous replica promoted
/// after a failover may not have the latest lock record.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    compare_and_delete: Script,
    compare_and_extend: Script,
}

impl RedisStore {
    /// Connect to the Redis server at `url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url).map_err(|e| unavailable("open client", e))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| unavailable("connect", e))?;
        info!("Connected to Redis at {}", url);
        Ok(Self::new(conn))
    }

    /// Wrap an existing connection manager.
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            compare_and_delete: scripts::compare_and_delete(),
            compare_and_extend: scripts::compare_and_extend(),
        }
    }
}

fn unavailable(op: &str, err: RedisError) -> StoreError {
    StoreError::Unavailable(format!("Redis {} failed: {}", op, err))
}

/// Redis expiries are whole milliseconds; round up so a sub-millisecond TTL
/// never becomes 0 (which `PX` rejects).
fn ttl_millis(ttl: Duration) -> u64 {
    let millis = ttl.as_millis();
    let rounded = if ttl.subsec_nanos() % 1_000_000 == 0 {
        millis
    } else {
        millis + 1
    };
    u64::try_from(rounded.max(1)).unwrap_or(u64::MAX)
}

#[async_trait]
impl StoreClient for RedisStore {
    fn backend_name(&self) -> &'static str {
        "redis"
    }

    #[instrument(skip(self, value), level = "debug")]
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let reply: Value = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| unavailable("SET NX", e))?;

        match reply {
            Value::Nil => Ok(false),
            Value::Okay => Ok(true),
            Value::SimpleString(s) if s == "OK" => Ok(true),
            other => Err(StoreError::UnexpectedReply(format!(
                "SET NX returned {:?}",
                other
            ))),
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await.map_err(|e| unavailable("GET", e))?;
        debug!("GET {} -> {}", key, if value.is_some() { "hit" } else { "miss" });
        Ok(value)
    }

    #[instrument(skip(self, expected), level = "debug")]
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .compare_and_delete
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| unavailable("compare-and-delete", e))?;
        Ok(deleted == 1)
    }

    #[instrument(skip(self, expected), level = "debug")]
    async fn compare_and_extend(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let extended: i64 = self
            .compare_and_extend
            .key(key)
            .arg(expected)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| unavailable("compare-and-extend", e))?;
        Ok(extended == 1)
    }

    #[instrument(skip(self, value), level = "debug")]
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(key, value)
            .await
            .map_err(|e| unavailable("SET", e))
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(key).await.map_err(|e| unavailable("DEL", e))?;
        Ok(removed > 0)
    }
}
