use core::time::Duration;
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};

use parking_lot::Mutex;

use crate::{
    error::{Error, Result},
    store::{LockStore, SharedStore},
};

/// Failures produced by [`MemoryStore`], surfaced as the source of
/// [`Error::StoreUnavailable`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryStoreError {
    /// The store was switched off with [`MemoryStore::set_available`].
    #[error("store is offline")]
    Offline,

    /// `increment` hit a value that is not a decimal `i64`.
    #[error("value at {key:?} is not an integer or out of range")]
    NotAnInteger { key: String },

    /// `increment` would overflow `i64`.
    #[error("increment of {key:?} would overflow")]
    Overflow { key: String },
}

#[derive(Debug)]
struct Lease {
    owner: String,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    values: HashMap<String, Vec<u8>>,
    leases: HashMap<String, Lease>,
}

/// An in-process [`SharedStore`] with Redis-like semantics.
///
/// Counters are stored as decimal strings in the same keyspace as cached
/// values, so `increment` on a key holding arbitrary bytes fails the way
/// `INCR` does. Clones share the same data.
///
/// Availability can be toggled to exercise failure paths: while offline,
/// every operation fails with [`Error::StoreUnavailable`].
#[derive(Clone, Debug)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    online: Arc<AtomicBool>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            online: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Switches the store on or off. Offline stores reject every command.
    pub fn set_available(&self, available: bool) {
        self.online.store(available, Ordering::Release);
    }

    pub fn is_available(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    /// Removes `key`, returning `true` if it was present. Starts a new miss
    /// episode for cached values.
    pub fn remove(&self, key: &str) -> bool {
        self.inner.lock().values.remove(key).is_some()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.lock().values.contains_key(key)
    }

    /// Returns `true` if a live lock is held at `key`.
    pub fn is_locked(&self, key: &str) -> bool {
        self.inner
            .lock()
            .leases
            .get(key)
            .is_some_and(|lease| lease.expires_at > Instant::now())
    }

    /// Number of leases kept, live or lapsed but not yet pruned.
    #[cfg(test)]
    pub(crate) fn lease_count(&self) -> usize {
        self.inner.lock().leases.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_online(&self) -> Result<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(Error::store(MemoryStoreError::Offline))
        }
    }

    fn increment_now(&self, counter_key: &str) -> Result<i64> {
        self.ensure_online()?;
        let mut inner = self.inner.lock();
        let current = match inner.values.get(counter_key) {
            None => 0,
            Some(raw) => parse_counter(raw).ok_or_else(|| {
                Error::store(MemoryStoreError::NotAnInteger {
                    key: counter_key.to_owned(),
                })
            })?,
        };
        let next = current.checked_add(1).ok_or_else(|| {
            Error::store(MemoryStoreError::Overflow {
                key: counter_key.to_owned(),
            })
        })?;
        inner
            .values
            .insert(counter_key.to_owned(), next.to_string().into_bytes());
        Ok(next)
    }

    fn get_now(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.ensure_online()?;
        Ok(self.inner.lock().values.get(key).cloned())
    }

    fn set_now(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.ensure_online()?;
        self.inner.lock().values.insert(key.to_owned(), value);
        Ok(())
    }

    fn try_lock_now(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        self.ensure_online()?;
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.leases.retain(|_, lease| lease.expires_at > now);
        if inner.leases.contains_key(key) {
            return Ok(false);
        }
        inner.leases.insert(
            key.to_owned(),
            Lease {
                owner: owner.to_owned(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    fn unlock_now(&self, key: &str, owner: &str) -> Result<()> {
        self.ensure_online()?;
        let mut inner = self.inner.lock();
        if inner
            .leases
            .get(key)
            .is_some_and(|lease| lease.owner == owner)
        {
            inner.leases.remove(key);
        }
        Ok(())
    }
}

fn parse_counter(raw: &[u8]) -> Option<i64> {
    core::str::from_utf8(raw).ok()?.parse().ok()
}

impl SharedStore for MemoryStore {
    async fn increment(&self, counter_key: &str) -> Result<i64> {
        self.increment_now(counter_key)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.get_now(key)
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.set_now(key, value)
    }
}

impl LockStore for MemoryStore {
    async fn try_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        self.try_lock_now(key, owner, ttl)
    }

    async fn unlock(&self, key: &str, owner: &str) -> Result<()> {
        self.unlock_now(key, owner)
    }
}
