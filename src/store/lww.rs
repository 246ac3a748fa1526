/// Mergeable registers.
///
/// `Lww<T>`: last writer wins by lamport timestamp. Equal timestamps are
/// resolved by the lexicographically greater CBOR encoding of the value, so
/// the winner never depends on which writer merges first.
///
/// `Tiered<T>`: authority first, then timestamp, then a fixed code. A value
/// of a higher tier can never be replaced by one of a lower tier, whatever
/// the clocks say.
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::store::cbor_encode;

// ---------------------------------------------------------------------------
// Lww
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct Lww<T> {
    value: T,
    ts: u64,
}

impl<T> Lww<T>
where
    T: Serialize + Clone + PartialEq + Default,
{
    pub fn new(value: T, ts: u64) -> Self {
        Lww { value, ts }
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    pub fn ts(&self) -> u64 {
        self.ts
    }

    /// The value, or the default if it was written at or before `horizon`.
    pub fn visible_after(&self, horizon: u64) -> T {
        if self.ts > horizon {
            self.value.clone()
        } else {
            T::default()
        }
    }

    /// Local write. Returns false when the value is already current.
    pub fn set(&mut self, value: T, ts: u64) -> bool {
        if self.value == value {
            return false;
        }
        self.stamp(value, ts)
    }

    /// Local write that re-stamps even an unchanged value, so it outlives a
    /// tombstone horizon.
    pub fn stamp(&mut self, value: T, ts: u64) -> bool {
        let candidate = Lww { value, ts };
        if candidate.supersedes(self) {
            *self = candidate;
            true
        } else {
            false
        }
    }

    /// Adopt `other` if it wins. Returns true when the value changed.
    pub fn merge(&mut self, other: &Self) -> bool {
        if other.supersedes(self) {
            *self = other.clone();
            true
        } else {
            false
        }
    }

    fn supersedes(&self, current: &Self) -> bool {
        match self.ts.cmp(&current.ts) {
            Ordering::Greater => true,
            Ordering::Less => false,
            // register values are plain data, which always encode; a value
            // that cannot be encoded never displaces the current one
            Ordering::Equal => match (cbor_encode(&self.value), cbor_encode(&current.value)) {
                (Ok(ours), Ok(theirs)) => ours > theirs,
                (Err(e), _) | (_, Err(e)) => {
                    log::error!("Cannot encode register value for tie-break: {}", e);
                    false
                }
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Tiered
// ---------------------------------------------------------------------------

/// A state with an authority rank.
pub trait Authority {
    /// Higher tiers always beat lower ones.
    fn tier(&self) -> u8;

    /// Final tie-break between distinct values with equal tier and timestamp.
    fn code(&self) -> u8;
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct Tiered<T> {
    value: T,
    ts: u64,
}

impl<T> Tiered<T>
where
    T: Authority + Clone + PartialEq,
{
    pub fn new(value: T, ts: u64) -> Self {
        Tiered { value, ts }
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    pub fn ts(&self) -> u64 {
        self.ts
    }

    fn rank(&self) -> (u8, u64, u8) {
        (self.value.tier(), self.ts, self.value.code())
    }

    /// Local write. Loses, like a merge would, against a higher authority.
    pub fn set(&mut self, value: T, ts: u64) -> bool {
        self.merge(&Tiered { value, ts })
    }

    pub fn merge(&mut self, other: &Self) -> bool {
        if other.rank() > self.rank() {
            *self = other.clone();
            true
        } else {
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    enum Level {
        #[default]
        Low,
        Mid,
        High,
    }

    impl Authority for Level {
        fn tier(&self) -> u8 {
            match self {
                Level::Low | Level::Mid => 0,
                Level::High => 1,
            }
        }

        fn code(&self) -> u8 {
            *self as u8
        }
    }

    #[test]
    fn test_lww_higher_timestamp_wins() {
        let mut reg = Lww::new("old".to_string(), 1);
        assert!(reg.merge(&Lww::new("new".to_string(), 2)));
        assert_eq!(reg.get(), "new");
        assert!(!reg.merge(&Lww::new("stale".to_string(), 1)));
        assert_eq!(reg.get(), "new");
    }

    #[test]
    fn test_lww_tie_break_is_order_independent() {
        let a = Lww::new("alpha".to_string(), 5);
        let b = Lww::new("bravo".to_string(), 5);

        let mut ab = a.clone();
        ab.merge(&b);
        let mut ba = b.clone();
        ba.merge(&a);
        assert_eq!(ab, ba);
    }

    #[derive(Clone, Debug, Default, PartialEq)]
    struct Unencodable(u8);

    impl Serialize for Unencodable {
        fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("unencodable"))
        }
    }

    #[test]
    fn test_lww_tie_with_unencodable_value_keeps_current() {
        let mut reg = Lww::new(Unencodable(1), 5);
        assert!(!reg.merge(&Lww::new(Unencodable(2), 5)));
        assert_eq!(reg.get(), &Unencodable(1));
        // timestamps still decide without encoding
        assert!(reg.merge(&Lww::new(Unencodable(3), 6)));
    }

    #[test]
    fn test_lww_merge_idempotent() {
        let mut reg = Lww::new(7u32, 3);
        let copy = reg.clone();
        assert!(!reg.merge(&copy));
    }

    #[test]
    fn test_lww_set_same_value_is_noop() {
        let mut reg = Lww::new("x".to_string(), 1);
        assert!(!reg.set("x".to_string(), 2));
        assert_eq!(reg.ts(), 1);
        assert!(reg.set("y".to_string(), 2));
        assert!(reg.stamp("y".to_string(), 3));
        assert_eq!(reg.ts(), 3);
    }

    #[test]
    fn test_lww_visible_after_horizon() {
        let reg = Lww::new("name".to_string(), 4);
        assert_eq!(reg.visible_after(3), "name");
        assert_eq!(reg.visible_after(4), "");
    }

    #[test]
    fn test_tiered_authority_beats_timestamp() {
        let mut reg = Tiered::new(Level::High, 1);
        assert!(!reg.merge(&Tiered::new(Level::Low, 100)));
        assert_eq!(*reg.get(), Level::High);
    }

    #[test]
    fn test_tiered_same_tier_uses_timestamp_then_code() {
        let mut reg = Tiered::new(Level::Mid, 2);
        assert!(reg.merge(&Tiered::new(Level::Low, 3)));
        assert_eq!(*reg.get(), Level::Low);

        let mut x = Tiered::new(Level::Low, 3);
        let y = Tiered::new(Level::Mid, 3);
        x.merge(&y);
        let mut z = y.clone();
        z.merge(&Tiered::new(Level::Low, 3));
        assert_eq!(x, z);
        assert_eq!(*x.get(), Level::Mid);
    }
}
