use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};

/// Per-key async locks, created on first use and dropped once nobody holds or
/// waits on them.
///
/// Every reference to a lock other than the map's own lives in a
/// [`FlightSlot`], and references are only cloned or inspected under the map
/// mutex, so the strong count is an exact census of interested callers.
#[derive(Debug, Default)]
pub(crate) struct FlightLocks {
    slots: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl FlightLocks {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers interest in `key` and returns a handle that can wait for its
    /// lock. Dropping the handle deregisters, even mid-wait.
    pub(crate) fn join<'a>(&'a self, key: &'a str) -> FlightSlot<'a> {
        let mut slots = self.slots.lock();
        let lock = match slots.get(key) {
            Some(lock) => Arc::clone(lock),
            None => {
                let lock = Arc::new(AsyncMutex::new(()));
                slots.insert(key.to_owned(), Arc::clone(&lock));
                lock
            }
        };
        FlightSlot {
            locks: self,
            key,
            lock,
        }
    }

    /// Number of keys with at least one caller holding or waiting on the
    /// lock.
    pub(crate) fn len(&self) -> usize {
        self.slots.lock().len()
    }
}

pub(crate) struct FlightSlot<'a> {
    locks: &'a FlightLocks,
    key: &'a str,
    lock: Arc<AsyncMutex<()>>,
}

impl FlightSlot<'_> {
    /// Waits for exclusive ownership of the key. Waiters are served in FIFO
    /// order.
    pub(crate) async fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().await
    }
}

impl Drop for FlightSlot<'_> {
    fn drop(&mut self) {
        let mut slots = self.locks.slots.lock();
        // The map and this slot are the only references left.
        if Arc::strong_count(&self.lock) == 2
            && slots
                .get(self.key)
                .is_some_and(|lock| Arc::ptr_eq(lock, &self.lock))
        {
            slots.remove(self.key);
            #[cfg(feature = "tracing")]
            tracing::trace!(key = self.key, "reclaimed flight lock");
        }
    }
}
