use core::fmt;

/// A 64-bit identifier made of a seconds delta and a store counter.
///
/// - 32 bits: seconds elapsed since the issuer's epoch
/// - 32 bits: the counter's post-increment value, truncated to 32 bits
///
/// ```text
///  Bit Index:  63                 32 31                  0
///              +---------------------+---------------------+
///  Field:      | timestamp (32 bits) | sequence (32 bits)  |
///              +---------------------+---------------------+
///              |<----- MSB ---------- 64 bits -------- LSB ----->|
/// ```
///
/// Ids issued in later seconds always sort after ids issued earlier. Within
/// one second, ids sort by counter value. Two ids collide only if a counter
/// passes 2^32 and lands on the same low half within a repeated second; this
/// is an accepted limit of the layout.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct CounterId {
    id: u64,
}

impl CounterId {
    pub const SEQUENCE_BITS: u32 = 32;
    pub const SEQUENCE_MASK: u64 = (1 << Self::SEQUENCE_BITS) - 1;
    pub const TIMESTAMP_SHIFT: u32 = Self::SEQUENCE_BITS;
    pub const TIMESTAMP_MASK: u64 = (1 << (64 - Self::SEQUENCE_BITS)) - 1;

    /// Builds an id from a seconds delta and a raw counter value.
    ///
    /// Both inputs are masked to 32 bits, matching what the shared store
    /// hands back for long-lived counters.
    pub const fn from_components(timestamp: u64, counter: u64) -> Self {
        let t = (timestamp & Self::TIMESTAMP_MASK) << Self::TIMESTAMP_SHIFT;
        let s = counter & Self::SEQUENCE_MASK;
        Self { id: t | s }
    }

    /// Seconds since the issuer's epoch.
    pub const fn timestamp(&self) -> u64 {
        (self.id >> Self::TIMESTAMP_SHIFT) & Self::TIMESTAMP_MASK
    }

    /// Low 32 bits of the counter value.
    pub const fn sequence(&self) -> u64 {
        self.id & Self::SEQUENCE_MASK
    }

    /// The id as the signed 64-bit integer callers persist.
    pub const fn to_raw(&self) -> i64 {
        self.id as i64
    }

    pub const fn from_raw(raw: i64) -> Self {
        Self { id: raw as u64 }
    }

    pub const fn to_u64(&self) -> u64 {
        self.id
    }
}

impl From<CounterId> for i64 {
    fn from(id: CounterId) -> Self {
        id.to_raw()
    }
}

impl From<i64> for CounterId {
    fn from(raw: i64) -> Self {
        Self::from_raw(raw)
    }
}

impl fmt::Display for CounterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_raw())
    }
}

impl fmt::Debug for CounterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CounterId")
            .field("id", &self.to_raw())
            .field("timestamp", &self.timestamp())
            .field("sequence", &self.sequence())
            .finish()
    }
}
