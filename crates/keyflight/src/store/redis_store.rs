use core::time::Duration;
use std::sync::LazyLock;

use redis::{Client, Script, aio::ConnectionManager};

use crate::{
    error::{Error, Result},
    store::{LockStore, SharedStore},
};

// Deletes the lock only if the caller still owns it.
static UNLOCK: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        if redis.call('GET', KEYS[1]) == ARGV[1] then
            return redis.call('DEL', KEYS[1])
        end
        return 0
        ",
    )
});

/// A [`SharedStore`] backed by Redis.
///
/// Counters use `INCR`, cached values use `GET`/`SET`, and store-wide flight
/// locks use `SET NX PX` with an owner-checked delete. Connections are
/// multiplexed and reconnected by [`ConnectionManager`]; clones share it.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connects to the server at `url` (for example
    /// `redis://127.0.0.1:6379`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`] if the URL is invalid or the first
    /// connection cannot be established.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url).map_err(Error::store)?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(Error::store)?;
        Ok(Self { conn })
    }

    pub const fn from_manager(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

impl SharedStore for RedisStore {
    async fn increment(&self, counter_key: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        redis::cmd("INCR")
            .arg(counter_key)
            .query_async(&mut conn)
            .await
            .map_err(Error::store)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(Error::store)
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async(&mut conn)
            .await
            .map_err(Error::store)
    }
}

impl LockStore for RedisStore {
    async fn try_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(owner)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(Error::store)?;
        Ok(reply.is_some())
    }

    async fn unlock(&self, key: &str, owner: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _released: i64 = UNLOCK
            .key(key)
            .arg(owner)
            .invoke_async(&mut conn)
            .await
            .map_err(Error::store)?;
        Ok(())
    }
}
