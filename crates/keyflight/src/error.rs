/// Boxed error carried as the source of store and loader failures.
pub type BoxError = Box<dyn core::error::Error + Send + Sync + 'static>;

/// A result type defaulting to the crate [`Error`].
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// All error variants that `keyflight` can emit.
///
/// Neither [`IdIssuer`] nor [`StampedeSafeLookup`] retries internally: any
/// error means no identifier was issued or no value was obtained.
///
/// [`IdIssuer`]: crate::IdIssuer
/// [`StampedeSafeLookup`]: crate::StampedeSafeLookup
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The shared store was unreachable or rejected the command.
    #[error("store unavailable: {source}")]
    StoreUnavailable {
        #[source]
        source: BoxError,
    },

    /// The caller-supplied load function failed for `key`.
    ///
    /// Only the caller that invoked the load observes this error. Callers
    /// that were waiting on the same key retry on their own.
    #[error("load failed for key {key:?}: {source}")]
    LoadFailed {
        key: String,
        #[source]
        source: BoxError,
    },

    /// A key or business type was rejected before touching the store.
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },

    /// The time source reports a time earlier than the configured epoch.
    #[error("clock reads {now}s which is before the epoch {epoch}s")]
    ClockBeforeEpoch { now: u64, epoch: u64 },

    /// A cached value could not be encoded or decoded.
    #[error("codec error for key {key:?}: {source}")]
    Codec {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl Error {
    /// Wraps any error as [`Error::StoreUnavailable`].
    pub fn store<E>(source: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::StoreUnavailable {
            source: source.into(),
        }
    }

    /// Returns `true` if this error came from the shared store.
    pub const fn is_store_unavailable(&self) -> bool {
        matches!(self, Self::StoreUnavailable { .. })
    }

    /// Returns `true` if this error came from a caller-supplied load.
    pub const fn is_load_failed(&self) -> bool {
        matches!(self, Self::LoadFailed { .. })
    }
}

pub(crate) fn ensure_key(what: &str, key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::InvalidArgument {
            reason: format!("{what} must not be empty"),
        });
    }
    Ok(())
}
