use core::time::Duration;

use crate::{
    error::{Error, Result},
    store::{LockStore, SharedStore},
};

/// What a caller holding the per-key lock should do next.
#[derive(Debug)]
pub enum Admission {
    /// The entry was filled while the caller waited. Serve these bytes.
    Cached(Vec<u8>),
    /// The entry is still absent and this caller owns the load.
    Load(FlightTicket),
}

/// Proof of ownership of a miss episode, handed back on release.
#[derive(Debug)]
pub struct FlightTicket {
    owner: Option<String>,
}

impl FlightTicket {
    /// A ticket that holds nothing outside this process.
    pub const fn local() -> Self {
        Self { owner: None }
    }

    /// A ticket backed by a store lock taken as `owner`.
    pub const fn store(owner: String) -> Self {
        Self { owner: Some(owner) }
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }
}

/// The domain across which loads for one key are collapsed.
///
/// [`StampedeSafeLookup`] always serializes callers in this process on a
/// per-key lock first. The scope then decides, for the single local owner,
/// whether it may load: [`ProcessScope`] only re-checks the cache, while
/// [`StoreScope`] also contends for a lock in the shared store so that one
/// process in the fleet loads.
///
/// [`StampedeSafeLookup`]: crate::StampedeSafeLookup
pub trait FlightScope<S: SharedStore>: Send + Sync {
    /// Rejects cache keys this scope cannot serve. Checked before the store
    /// is touched.
    fn check_key(&self, _key: &str) -> Result<()> {
        Ok(())
    }

    /// Re-checks the cache for `key` and, if still absent, claims the load.
    fn admit(&self, store: &S, key: &str) -> impl Future<Output = Result<Admission>> + Send;

    /// Gives up whatever [`FlightScope::admit`] claimed. Called after the
    /// load finished, whether it succeeded or not.
    fn release(&self, store: &S, key: &str, ticket: &FlightTicket)
    -> impl Future<Output = ()> + Send;

    /// Gives up the claim of an owner whose `get` was dropped before
    /// [`FlightScope::release`] completed. Runs inside `Drop`, so it must not
    /// block; any store work is detached.
    fn abandon(&self, store: &S, key: &str, ticket: &FlightTicket);
}

/// A claimed miss episode for `key`.
///
/// Handed back with [`Claim::release`] once the load is over. If the claim is
/// dropped instead, for example because the owning `get` future was
/// cancelled, [`FlightScope::abandon`] runs from `Drop`.
pub(crate) struct Claim<'a, S, F>
where
    S: SharedStore,
    F: FlightScope<S>,
{
    scope: &'a F,
    store: &'a S,
    key: &'a str,
    ticket: Option<FlightTicket>,
}

impl<'a, S, F> Claim<'a, S, F>
where
    S: SharedStore,
    F: FlightScope<S>,
{
    pub(crate) fn new(scope: &'a F, store: &'a S, key: &'a str, ticket: FlightTicket) -> Self {
        Self {
            scope,
            store,
            key,
            ticket: Some(ticket),
        }
    }

    pub(crate) async fn release(mut self) {
        if let Some(ticket) = &self.ticket {
            self.scope.release(self.store, self.key, ticket).await;
        }
        self.ticket = None;
    }

    /// Hands the ticket to the caller without releasing it.
    fn into_ticket(mut self) -> FlightTicket {
        self.ticket.take().unwrap_or_else(FlightTicket::local)
    }
}

impl<S, F> Drop for Claim<'_, S, F>
where
    S: SharedStore,
    F: FlightScope<S>,
{
    fn drop(&mut self) {
        if let Some(ticket) = self.ticket.take() {
            #[cfg(feature = "tracing")]
            tracing::debug!(key = self.key, "flight owner dropped before release");
            self.scope.abandon(self.store, self.key, &ticket);
        }
    }
}

/// Single-flight within this process only.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessScope;

impl<S: SharedStore> FlightScope<S> for ProcessScope {
    async fn admit(&self, store: &S, key: &str) -> Result<Admission> {
        Ok(match store.get(key).await? {
            Some(bytes) => Admission::Cached(bytes),
            None => Admission::Load(FlightTicket::local()),
        })
    }

    async fn release(&self, _store: &S, _key: &str, _ticket: &FlightTicket) {}

    fn abandon(&self, _store: &S, _key: &str, _ticket: &FlightTicket) {}
}

/// Single-flight across every process sharing the store.
///
/// The local owner polls for an expiring store lock at
/// `keyflight:flight-lock:{key}`, re-reading the cache between attempts.
/// Cache keys inside that namespace are rejected with
/// [`Error::InvalidArgument`].
///
/// If the owning `get` future is dropped mid-load, the unlock is spawned on
/// the current Tokio runtime. The lock also lapses after `lock_ttl`, so an
/// owner that crashes blocks other processes for at most that long.
#[derive(Clone, Copy, Debug)]
pub struct StoreScope {
    lock_ttl: Duration,
    poll: Duration,
}

impl Default for StoreScope {
    fn default() -> Self {
        Self::new(Self::DEFAULT_LOCK_TTL, Self::DEFAULT_POLL)
    }
}

impl StoreScope {
    pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(30);
    pub const DEFAULT_POLL: Duration = Duration::from_millis(25);
    pub const LOCK_PREFIX: &'static str = "keyflight:flight-lock:";

    /// `lock_ttl` should comfortably exceed the slowest expected load.
    pub const fn new(lock_ttl: Duration, poll: Duration) -> Self {
        Self { lock_ttl, poll }
    }

    pub const fn lock_ttl(&self) -> Duration {
        self.lock_ttl
    }

    pub const fn poll(&self) -> Duration {
        self.poll
    }

    pub fn lock_key(key: &str) -> String {
        format!("{}{key}", Self::LOCK_PREFIX)
    }
}

fn new_owner() -> String {
    format!("{:016x}", rand::random::<u64>())
}

async fn unlock_quietly<S: LockStore>(store: &S, lock_key: &str, owner: &str) {
    if let Err(_e) = store.unlock(lock_key, owner).await {
        #[cfg(feature = "tracing")]
        tracing::warn!(lock_key, error = %_e, "failed to release store flight lock");
    }
}

impl<S> FlightScope<S> for StoreScope
where
    S: LockStore + Clone + 'static,
{
    fn check_key(&self, key: &str) -> Result<()> {
        if key.starts_with(Self::LOCK_PREFIX) {
            return Err(Error::InvalidArgument {
                reason: format!("cache key must not start with {:?}", Self::LOCK_PREFIX),
            });
        }
        Ok(())
    }

    async fn admit(&self, store: &S, key: &str) -> Result<Admission> {
        let lock_key = Self::lock_key(key);
        let owner = new_owner();
        loop {
            if let Some(bytes) = store.get(key).await? {
                return Ok(Admission::Cached(bytes));
            }
            if store.try_lock(&lock_key, &owner, self.lock_ttl).await? {
                let claim = Claim::new(self, store, key, FlightTicket::store(owner));
                // Another process may have filled the entry between the read
                // and the lock.
                return match store.get(key).await {
                    Ok(None) => Ok(Admission::Load(claim.into_ticket())),
                    Ok(Some(bytes)) => {
                        claim.release().await;
                        Ok(Admission::Cached(bytes))
                    }
                    Err(e) => {
                        claim.release().await;
                        Err(e)
                    }
                };
            }
            tokio::time::sleep(self.poll).await;
        }
    }

    async fn release(&self, store: &S, key: &str, ticket: &FlightTicket) {
        if let Some(owner) = ticket.owner() {
            unlock_quietly(store, &Self::lock_key(key), owner).await;
        }
    }

    fn abandon(&self, store: &S, key: &str, ticket: &FlightTicket) {
        let Some(owner) = ticket.owner() else {
            return;
        };
        let lock_key = Self::lock_key(key);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let store = store.clone();
                let owner = owner.to_owned();
                handle.spawn(async move {
                    unlock_quietly(&store, &lock_key, &owner).await;
                });
            }
            Err(_) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    lock_key,
                    ttl = ?self.lock_ttl,
                    "no runtime to release abandoned flight lock; it lapses after its ttl"
                );
            }
        }
    }
}
