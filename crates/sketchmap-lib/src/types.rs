//! Width-configurable core types.
//!
//! The integer widths below bound the size of the indexed reference set:
//! `Feature` must hold 2 bits per k-mer base, `TargetId` bounds the number
//! of reference sequences, `WindowId` the number of windows per reference
//! and `BucketSize` the number of locations stored per feature. All four
//! widths are recorded in the database header so that a loader built with
//! different widths rejects the file instead of misreading it.

/// A sketch element: the hash of one k-mer after 3N conversion.
pub type Feature = u32;

/// Dense reference-sequence index, assigned in ingestion order.
pub type TargetId = u32;

/// Index of a sampling window within its target, 0-based.
pub type WindowId = u32;

/// Location-list (bucket) size tracking type.
pub type BucketSize = u8;

/// Sentinel for "no target".
pub const NULL_TARGET: TargetId = TargetId::MAX;

/// A window within a target sequence.
///
/// The derived ordering (target first, then window) is what the whole
/// match pipeline relies on: buckets, merged match lists and the
/// candidate scan all expect this order.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Location {
    /// Target (reference sequence) id
    pub tgt: TargetId,
    /// Window index within the target
    pub win: WindowId,
}

impl Location {
    /// Create a new location
    #[inline]
    pub const fn new(tgt: TargetId, win: WindowId) -> Self {
        Self { tgt, win }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_ordering() {
        let a = Location::new(0, 5);
        let b = Location::new(1, 0);
        let c = Location::new(1, 3);

        // target dominates, window breaks ties
        assert!(a < b);
        assert!(b < c);
        assert!(a < c);
    }

    #[test]
    fn test_location_is_tightly_packed() {
        assert_eq!(
            std::mem::size_of::<Location>(),
            std::mem::size_of::<TargetId>() + std::mem::size_of::<WindowId>()
        );
    }
}
