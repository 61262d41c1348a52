use std::time::{SystemTime, UNIX_EPOCH};

/// Default epoch: Saturday, May 4, 2024 07:39:12 UTC, in seconds.
///
/// Subtracted from the wall clock to form the high half of every
/// [`CounterId`]. With 31 usable bits for a non-negative `i64`, the layout
/// stays valid for roughly 68 years past the epoch.
///
/// [`CounterId`]: crate::CounterId
pub const DEFAULT_EPOCH: u64 = 1_714_808_352;

/// Unix epoch: Thursday, January 1, 1970 00:00:00 UTC
pub const UNIX_EPOCH_SECS: u64 = 0;

/// A trait for time sources that return wall-clock seconds.
///
/// This abstraction allows you to plug in the system clock or a mocked time
/// source in tests. The unit is **whole seconds since the Unix epoch**; the
/// issuer subtracts its own epoch.
///
/// # Example
///
/// ```
/// use keyflight::TimeSource;
///
/// struct FixedTime;
/// impl TimeSource for FixedTime {
///     fn current_secs(&self) -> u64 {
///         1234
///     }
/// }
///
/// assert_eq!(FixedTime.current_secs(), 1234);
/// ```
pub trait TimeSource {
    /// Returns the current time in whole seconds since the Unix epoch.
    fn current_secs(&self) -> u64;
}

impl<T: TimeSource + ?Sized> TimeSource for &T {
    fn current_secs(&self) -> u64 {
        (**self).current_secs()
    }
}

impl<T: TimeSource + ?Sized> TimeSource for std::sync::Arc<T> {
    fn current_secs(&self) -> u64 {
        (**self).current_secs()
    }
}

/// Wall-clock time source backed by [`SystemTime`].
///
/// A clock set before 1970 reads as `0`, which the issuer then rejects as
/// being before its epoch.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl TimeSource for SystemClock {
    fn current_secs(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs())
    }
}
