use core::time::Duration;
use std::sync::Arc;

use crate::error::Result;

/// The narrow interface both [`IdIssuer`] and [`StampedeSafeLookup`] use to
/// reach the shared key-value store.
///
/// Implementations own connectivity, framing, and pooling. Every method fails
/// with [`Error::StoreUnavailable`] when the store cannot be reached or
/// rejects the command.
///
/// [`IdIssuer`]: crate::IdIssuer
/// [`StampedeSafeLookup`]: crate::StampedeSafeLookup
/// [`Error::StoreUnavailable`]: crate::Error::StoreUnavailable
pub trait SharedStore: Send + Sync {
    /// Atomically increments the counter at `counter_key` and returns the
    /// post-increment value. A missing counter starts at zero, so the first
    /// call returns `1`.
    fn increment(&self, counter_key: &str) -> impl Future<Output = Result<i64>> + Send;

    /// Reads the value at `key`. `None` means the entry is absent.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<Vec<u8>>>> + Send;

    /// Writes `value` at `key`, replacing anything already there.
    fn set(&self, key: &str, value: Vec<u8>) -> impl Future<Output = Result<()>> + Send;
}

/// Owner-tagged, expiring locks kept in the shared store.
///
/// Used to widen single-flight from one process to every process sharing the
/// store. See [`StoreScope`].
///
/// [`StoreScope`]: crate::StoreScope
pub trait LockStore: SharedStore {
    /// Takes the lock at `key` for `owner` unless someone else holds it.
    ///
    /// Returns `true` if the lock was taken. The lock lapses on its own after
    /// `ttl`.
    fn try_lock(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Releases the lock at `key` if `owner` still holds it. Releasing a lock
    /// that expired or changed hands is a no-op.
    fn unlock(&self, key: &str, owner: &str) -> impl Future<Output = Result<()>> + Send;
}

impl<S: SharedStore> SharedStore for Arc<S> {
    fn increment(&self, counter_key: &str) -> impl Future<Output = Result<i64>> + Send {
        (**self).increment(counter_key)
    }

    fn get(&self, key: &str) -> impl Future<Output = Result<Option<Vec<u8>>>> + Send {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: Vec<u8>) -> impl Future<Output = Result<()>> + Send {
        (**self).set(key, value)
    }
}

impl<S: LockStore> LockStore for Arc<S> {
    fn try_lock(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<bool>> + Send {
        (**self).try_lock(key, owner, ttl)
    }

    fn unlock(&self, key: &str, owner: &str) -> impl Future<Output = Result<()>> + Send {
        (**self).unlock(key, owner)
    }
}
