mod flight;
mod scope;
#[cfg(test)]
mod tests;

pub use scope::*;

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Serialize, de::DeserializeOwned};
#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::{
    error::{BoxError, Error, Result, ensure_key},
    store::SharedStore,
};
use flight::FlightLocks;
use scope::Claim;

/// A point-in-time copy of a lookup's counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LookupStats {
    /// Reads served by the lock-free fast path.
    pub hits: u64,
    /// Reads that found the entry absent on the fast path.
    pub misses: u64,
    /// Misses answered by the second check, without loading.
    pub coalesced: u64,
    /// Load function invocations.
    pub loads: u64,
    /// Load function invocations that returned an error.
    pub load_failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    loads: AtomicU64,
    load_failures: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> LookupStats {
        LookupStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
            load_failures: self.load_failures.load(Ordering::Relaxed),
        }
    }
}

/// Cache-aside reads with per-key single-flight loading.
///
/// On a hit the value comes straight from the store with no locking. On a
/// miss, callers for the same key queue on a per-key lock; the first one
/// re-checks the cache, runs its `load`, writes the result, and releases the
/// lock. Everyone queued behind it re-checks and finds the entry present, so
/// each miss episode triggers exactly one load. Different keys never wait on
/// each other.
///
/// A failed load writes nothing and reports [`Error::LoadFailed`] to the
/// caller that ran it only. Queued callers carry on independently and the
/// next one in line runs its own load.
///
/// The lock bookkeeping for a key is dropped as soon as no caller holds or
/// waits on it. Dropping a waiting `get` future (for example under
/// `tokio::time::timeout`) leaves the in-flight load untouched. Dropping the
/// owner's future abandons its load: the next caller in line loads instead,
/// and any store lock taken by the scope is released in the background.
///
/// Values are cached as JSON via [`get`](Self::get); [`get_raw`](Self::get_raw)
/// stores bytes as given.
///
/// # Example
/// ```
/// use keyflight::{BoxError, MemoryStore, StampedeSafeLookup};
///
/// # let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
/// # rt.block_on(async {
/// let lookup = StampedeSafeLookup::new(MemoryStore::new());
/// let name: String = lookup
///     .get("user:1", |_key| async { Ok::<_, BoxError>("Alice".to_owned()) })
///     .await?;
/// assert_eq!(name, "Alice");
/// assert_eq!(lookup.stats().loads, 1);
/// # Ok::<(), keyflight::Error>(())
/// # }).unwrap();
/// ```
#[derive(Debug)]
pub struct StampedeSafeLookup<S, F = ProcessScope> {
    store: S,
    scope: F,
    flights: FlightLocks,
    counters: Counters,
}

impl<S> StampedeSafeLookup<S, ProcessScope>
where
    S: SharedStore,
{
    /// Creates a lookup whose single-flight spans this process.
    pub fn new(store: S) -> Self {
        Self::with_scope(store, ProcessScope)
    }
}

impl<S, F> StampedeSafeLookup<S, F>
where
    S: SharedStore,
    F: FlightScope<S>,
{
    /// Creates a lookup with an explicit single-flight scope, such as
    /// [`StoreScope`] for fleet-wide collapsing.
    pub fn with_scope(store: S, scope: F) -> Self {
        Self {
            store,
            scope,
            flights: FlightLocks::new(),
            counters: Counters::default(),
        }
    }

    pub const fn store(&self) -> &S {
        &self.store
    }

    pub const fn scope(&self) -> &F {
        &self.scope
    }

    pub fn stats(&self) -> LookupStats {
        self.counters.snapshot()
    }

    /// Number of keys that currently have a caller loading or waiting.
    pub fn in_flight_keys(&self) -> usize {
        self.flights.len()
    }

    /// Returns the cached value for `key`, loading it with `load` on a miss.
    ///
    /// `load` receives the key and runs at most once per call, and only if
    /// this caller ends up owning the miss episode.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if `key` is empty or reserved by the
    ///   flight scope.
    /// - [`Error::StoreUnavailable`] if a cache read or write fails.
    /// - [`Error::LoadFailed`] if this caller's `load` failed. Nothing is
    ///   cached.
    /// - [`Error::Codec`] if the cached bytes are not valid JSON for `V`, or
    ///   the loaded value cannot be encoded.
    #[cfg_attr(feature = "tracing", instrument(level = "trace", skip(self, load)))]
    pub async fn get<V, L, Fut, E>(&self, key: &str, load: L) -> Result<V>
    where
        V: Serialize + DeserializeOwned,
        L: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<V, E>>,
        E: Into<BoxError>,
    {
        self.read_through(key, load, decode_json::<V>, encode_json::<V>)
            .await
    }

    /// Like [`get`](Self::get) but caches the loaded bytes verbatim.
    ///
    /// # Errors
    ///
    /// Same as [`get`](Self::get), minus codec failures.
    #[cfg_attr(feature = "tracing", instrument(level = "trace", skip(self, load)))]
    pub async fn get_raw<L, Fut, E>(&self, key: &str, load: L) -> Result<Vec<u8>>
    where
        L: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<Vec<u8>, E>>,
        E: Into<BoxError>,
    {
        self.read_through(key, load, |_, bytes| Ok(bytes), |_, bytes| Ok(bytes.clone()))
            .await
    }

    async fn read_through<V, L, Fut, E>(
        &self,
        key: &str,
        load: L,
        decode: fn(&str, Vec<u8>) -> Result<V>,
        encode: fn(&str, &V) -> Result<Vec<u8>>,
    ) -> Result<V>
    where
        L: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<V, E>>,
        E: Into<BoxError>,
    {
        ensure_key("cache key", key)?;
        self.scope.check_key(key)?;

        if let Some(bytes) = self.store.get(key).await? {
            Counters::bump(&self.counters.hits);
            return decode(key, bytes);
        }
        Counters::bump(&self.counters.misses);

        // Declared before the guard so the guard drops first.
        let slot = self.flights.join(key);
        let _guard = slot.lock().await;

        let claim = match self.scope.admit(&self.store, key).await? {
            Admission::Cached(bytes) => {
                Counters::bump(&self.counters.coalesced);
                return decode(key, bytes);
            }
            Admission::Load(ticket) => Claim::new(&self.scope, &self.store, key, ticket),
        };

        let outcome = self.fill(key, load, encode).await;
        claim.release().await;
        outcome
    }

    async fn fill<V, L, Fut, E>(
        &self,
        key: &str,
        load: L,
        encode: fn(&str, &V) -> Result<Vec<u8>>,
    ) -> Result<V>
    where
        L: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<V, E>>,
        E: Into<BoxError>,
    {
        Counters::bump(&self.counters.loads);
        #[cfg(feature = "tracing")]
        tracing::debug!(key, "loading on cache miss");

        let value = match load(key.to_owned()).await {
            Ok(value) => value,
            Err(e) => {
                Counters::bump(&self.counters.load_failures);
                let source: BoxError = e.into();
                #[cfg(feature = "tracing")]
                tracing::warn!(key, error = %source, "load failed");
                return Err(Error::LoadFailed {
                    key: key.to_owned(),
                    source,
                });
            }
        };

        let bytes = encode(key, &value)?;
        self.store.set(key, bytes).await?;
        Ok(value)
    }
}

fn decode_json<V: DeserializeOwned>(key: &str, bytes: Vec<u8>) -> Result<V> {
    serde_json::from_slice(&bytes).map_err(|source| Error::Codec {
        key: key.to_owned(),
        source,
    })
}

fn encode_json<V: Serialize>(key: &str, value: &V) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|source| Error::Codec {
        key: key.to_owned(),
        source,
    })
}
