
#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::{
    error::{Error, Result, ensure_key},
    id::CounterId,
    store::SharedStore,
    time::{DEFAULT_EPOCH, SystemClock, TimeSource},
};

/// Issues time-ordered [`CounterId`]s from counters kept in a
/// [`SharedStore`].
///
/// Each business type (for example `"order"`) names its own counter. An id
/// combines the seconds elapsed since the issuer's epoch with the counter's
/// post-increment value, so ids from every process sharing the store are
/// distinct and roughly increasing.
///
/// The issuer holds no mutable state and takes no locks: uniqueness comes
/// entirely from the store's atomic increment. Share it freely across tasks.
///
/// ## See Also
/// - [`CounterId`] for the bit layout and its wrap-around limit
///
/// # Example
/// ```
/// use keyflight::{IdIssuer, MemoryStore};
///
/// # let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
/// # rt.block_on(async {
/// let issuer = IdIssuer::new(MemoryStore::new());
/// let a = issuer.next_id("order").await?;
/// let b = issuer.next_id("order").await?;
/// assert_eq!(a.sequence(), 1);
/// assert_eq!(b.sequence(), 2);
/// assert!(a < b);
/// # Ok::<(), keyflight::Error>(())
/// # }).unwrap();
/// ```
#[derive(Clone, Debug)]
pub struct IdIssuer<S, T = SystemClock> {
    store: S,
    time: T,
    epoch: u64,
}

impl<S> IdIssuer<S, SystemClock>
where
    S: SharedStore,
{
    /// Creates an issuer on the system clock anchored at [`DEFAULT_EPOCH`].
    pub const fn new(store: S) -> Self {
        Self {
            store,
            time: SystemClock,
            epoch: DEFAULT_EPOCH,
        }
    }
}

impl<S, T> IdIssuer<S, T>
where
    S: SharedStore,
    T: TimeSource,
{
    /// Creates an issuer with an explicit time source and epoch (seconds
    /// since the Unix epoch).
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClockBeforeEpoch`] if `time` currently reads earlier
    /// than `epoch`. The epoch must not lie after any deployment time.
    pub fn with_epoch(store: S, time: T, epoch: u64) -> Result<Self> {
        let now = time.current_secs();
        if now < epoch {
            return Err(Error::ClockBeforeEpoch { now, epoch });
        }
        Ok(Self { store, time, epoch })
    }

    /// Upper bound on the ids reserved up front by [`IdIssuer::next_ids`].
    const PREALLOC_LIMIT: usize = 4096;

    pub const fn epoch(&self) -> u64 {
        self.epoch
    }

    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Issues the next id for `business_type`.
    ///
    /// Increments the counter named `business_type` (verbatim), then reads
    /// the clock. The returned id's high half is `now - epoch` and its low
    /// half is the counter value truncated to 32 bits.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if `business_type` is empty; the store is
    ///   not touched.
    /// - [`Error::StoreUnavailable`] if the increment fails. Nothing is
    ///   retried.
    /// - [`Error::ClockBeforeEpoch`] if the clock moved behind the epoch.
    #[cfg_attr(feature = "tracing", instrument(level = "trace", skip(self)))]
    pub async fn next_id(&self, business_type: &str) -> Result<CounterId> {
        ensure_key("business type", business_type)?;
        let counter = self.store.increment(business_type).await?;
        let now = self.time.current_secs();
        let delta = now.checked_sub(self.epoch).ok_or(Error::ClockBeforeEpoch {
            now,
            epoch: self.epoch,
        })?;
        // Negative counters are reinterpreted bitwise, then masked.
        Ok(CounterId::from_components(delta, counter as u64))
    }

    /// Issues `n` ids for `business_type`, one increment at a time.
    ///
    /// Stops at the first failure; ids issued before it are discarded by the
    /// caller's error path but their counter values stay consumed.
    ///
    /// # Errors
    ///
    /// Same as [`IdIssuer::next_id`].
    #[cfg_attr(feature = "tracing", instrument(level = "trace", skip(self)))]
    pub async fn next_ids(&self, business_type: &str, n: usize) -> Result<Vec<CounterId>> {
        ensure_key("business type", business_type)?;
        let mut ids = Vec::with_capacity(n.min(Self::PREALLOC_LIMIT));
        for _ in 0..n {
            ids.push(self.next_id(business_type).await?);
        }
        Ok(ids)
    }
}
