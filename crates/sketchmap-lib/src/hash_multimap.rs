//! Open-addressing hash multimap: feature -> bucket of locations.
//!
//! Linear probing over a prime-sized slot array. Each occupied slot owns
//! a bounded bucket whose values live in runs of the [`ChunkAllocator`].
//! Erased slots become tombstones that probes walk across; tombstones
//! are swept whenever the table rehashes. Because ingestion inserts
//! locations in strictly increasing (target, window) order through a
//! single consumer, every bucket stays sorted without ever sorting.

use crate::chunk_alloc::{ChunkAllocator, Run};
use crate::constants::DEFAULT_MAX_LOAD_FACTOR;
use crate::hasher::{FeatureHash, SeededHash};
use crate::types::{BucketSize, Feature, Location};

/// Smallest table size used once the first key arrives.
const MIN_BUCKET_COUNT: usize = 53;

/// Opaque handle to an occupied slot, valid until the next mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotId(usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SlotState {
    Empty,
    Occupied,
    Deleted,
}

#[derive(Clone, Copy, Default)]
struct BucketHeader {
    run: Run,
    size: BucketSize,
    capacity: BucketSize,
}

/// Hash multimap with bounded per-key buckets.
pub struct HashMultimap<H: FeatureHash = SeededHash> {
    keys: Vec<Feature>,
    states: Vec<SlotState>,
    buckets: Vec<BucketHeader>,
    values: ChunkAllocator<Location>,
    hasher: H,
    num_keys: u64,
    num_tombstones: u64,
    num_nonempty: u64,
    num_values: u64,
    max_load_factor: f32,
}

impl HashMultimap<SeededHash> {
    /// Create an empty map hashed with the given seed
    pub fn new(seed: u64) -> Self {
        Self::with_hasher(SeededHash::new(seed))
    }
}

impl<H: FeatureHash> HashMultimap<H> {
    /// Create an empty map with a custom slot hash function
    pub fn with_hasher(hasher: H) -> Self {
        Self {
            keys: Vec::new(),
            states: Vec::new(),
            buckets: Vec::new(),
            values: ChunkAllocator::new(),
            hasher,
            num_keys: 0,
            num_tombstones: 0,
            num_nonempty: 0,
            num_values: 0,
            max_load_factor: DEFAULT_MAX_LOAD_FACTOR,
        }
    }

    /// Number of slots in the table
    #[inline]
    pub fn bucket_count(&self) -> u64 {
        self.states.len() as u64
    }

    /// Number of keys present (erased keys no longer count)
    #[inline]
    pub fn key_count(&self) -> u64 {
        self.num_keys
    }

    /// Number of keys whose bucket holds at least one location
    #[inline]
    pub fn non_empty_bucket_count(&self) -> u64 {
        self.num_nonempty
    }

    /// Total number of stored locations
    #[inline]
    pub fn value_count(&self) -> u64 {
        self.num_values
    }

    /// Current maximum load factor
    pub fn max_load_factor(&self) -> f32 {
        self.max_load_factor
    }

    /// Set the maximum load factor (clamped to [0.1, 0.95]);
    /// takes effect on the next growth decision.
    pub fn set_max_load_factor(&mut self, lf: f32) {
        self.max_load_factor = lf.clamp(0.1, 0.95);
    }

    /// Upper bound on bucket capacity imposed by the size type
    #[inline]
    pub fn max_bucket_size() -> usize {
        BucketSize::MAX as usize
    }

    /// Insert one location for `key`, creating the bucket on first use.
    /// The bucket capacity starts at 1 and doubles on overflow, clamped
    /// to the size-type maximum; a saturated bucket silently drops the
    /// value (callers cap sizes well below saturation via `shrink`).
    pub fn insert(&mut self, key: Feature, value: Location) -> SlotId {
        self.grow_if_needed();

        let slot = self.probe_insert(key);
        match self.states[slot] {
            SlotState::Occupied => {
                self.append(slot, value);
            }
            state => {
                if state == SlotState::Deleted {
                    self.num_tombstones -= 1;
                }
                self.keys[slot] = key;
                self.states[slot] = SlotState::Occupied;
                let run = self.values.allocate(1);
                self.values.slice_mut(run, 1)[0] = value;
                self.buckets[slot] = BucketHeader { run, size: 1, capacity: 1 };
                self.num_keys += 1;
                self.num_nonempty += 1;
                self.num_values += 1;
            }
        }
        SlotId(slot)
    }

    /// Insert a whole bucket at once (used when loading a database).
    /// Any existing bucket for `key` is replaced.
    pub fn insert_bucket(&mut self, key: Feature, locations: &[Location]) {
        if locations.is_empty() {
            return;
        }
        debug_assert!(locations.len() <= Self::max_bucket_size());
        self.grow_if_needed();

        let slot = self.probe_insert(key);
        if self.states[slot] == SlotState::Occupied {
            self.erase(SlotId(slot));
            self.num_tombstones -= 1; // slot is reused immediately
        } else if self.states[slot] == SlotState::Deleted {
            self.num_tombstones -= 1;
        }

        let run = self.values.allocate(locations.len());
        self.values
            .slice_mut(run, locations.len())
            .copy_from_slice(locations);
        self.keys[slot] = key;
        self.states[slot] = SlotState::Occupied;
        self.buckets[slot] = BucketHeader {
            run,
            size: locations.len() as BucketSize,
            capacity: locations.len() as BucketSize,
        };
        self.num_keys += 1;
        self.num_nonempty += 1;
        self.num_values += locations.len() as u64;
    }

    /// Find the slot of `key`, walking across tombstones
    pub fn find(&self, key: Feature) -> Option<SlotId> {
        if self.states.is_empty() {
            return None;
        }
        let n = self.states.len();
        let mut slot = (self.hasher.hash_u64(key as u64) % n as u64) as usize;
        for _ in 0..n {
            match self.states[slot] {
                SlotState::Empty => return None,
                SlotState::Occupied if self.keys[slot] == key => return Some(SlotId(slot)),
                _ => {}
            }
            slot += 1;
            if slot == n {
                slot = 0;
            }
        }
        None
    }

    /// The key stored at a slot
    #[inline]
    pub fn key(&self, slot: SlotId) -> Feature {
        debug_assert_eq!(self.states[slot.0], SlotState::Occupied);
        self.keys[slot.0]
    }

    /// Number of locations in the bucket at `slot`
    #[inline]
    pub fn bucket_size(&self, slot: SlotId) -> usize {
        self.buckets[slot.0].size as usize
    }

    /// The locations stored in the bucket at `slot`
    #[inline]
    pub fn locations(&self, slot: SlotId) -> &[Location] {
        let hdr = self.buckets[slot.0];
        self.values.slice(hdr.run, hdr.size as usize)
    }

    /// Truncate the bucket at `slot` to at most `cap` locations
    pub fn shrink(&mut self, slot: SlotId, cap: usize) {
        let hdr = &mut self.buckets[slot.0];
        let size = hdr.size as usize;
        if size > cap {
            self.num_values -= (size - cap) as u64;
            hdr.size = cap as BucketSize;
            if cap == 0 && size > 0 {
                self.num_nonempty -= 1;
            }
        }
    }

    /// Remove the key and its bucket, leaving a tombstone
    pub fn erase(&mut self, slot: SlotId) {
        debug_assert_eq!(self.states[slot.0], SlotState::Occupied);
        let hdr = self.buckets[slot.0];
        self.num_values -= hdr.size as u64;
        if hdr.size > 0 {
            self.num_nonempty -= 1;
        }
        self.values.deallocate(hdr.run);
        self.buckets[slot.0] = BucketHeader::default();
        self.states[slot.0] = SlotState::Deleted;
        self.num_keys -= 1;
        self.num_tombstones += 1;
    }

    /// Erase all buckets holding more than `cap` locations;
    /// returns the number of removed features.
    pub fn remove_features_with_more_locations_than(&mut self, cap: usize) -> u64 {
        let mut removed = 0;
        for i in 0..self.states.len() {
            if self.states[i] == SlotState::Occupied && self.buckets[i].size as usize > cap {
                self.erase(SlotId(i));
                removed += 1;
            }
        }
        removed
    }

    /// Erase all buckets whose locations span more than `max_targets`
    /// distinct targets; returns the number of removed features.
    /// Relies on buckets being sorted by target.
    pub fn remove_ambiguous_features(&mut self, max_targets: usize) -> u64 {
        let mut removed = 0;
        for i in 0..self.states.len() {
            if self.states[i] != SlotState::Occupied {
                continue;
            }
            let hdr = self.buckets[i];
            let locs = self.values.slice(hdr.run, hdr.size as usize);
            let mut distinct = 0usize;
            let mut prev = None;
            for loc in locs {
                if prev != Some(loc.tgt) {
                    distinct += 1;
                    prev = Some(loc.tgt);
                }
            }
            if distinct > max_targets {
                self.erase(SlotId(i));
                removed += 1;
            }
        }
        removed
    }

    /// Visit every non-empty bucket as (key, sorted locations)
    pub fn for_each_bucket<F>(&self, mut f: F)
    where
        F: FnMut(Feature, &[Location]),
    {
        for i in 0..self.states.len() {
            if self.states[i] == SlotState::Occupied {
                let hdr = self.buckets[i];
                if hdr.size > 0 {
                    f(self.keys[i], self.values.slice(hdr.run, hdr.size as usize));
                }
            }
        }
    }

    /// Drop all keys, buckets and value storage
    pub fn clear(&mut self) {
        self.keys.clear();
        self.states.clear();
        self.buckets.clear();
        self.values.clear();
        self.num_keys = 0;
        self.num_tombstones = 0;
        self.num_nonempty = 0;
        self.num_values = 0;
    }

    /// Grow the bucket of an occupied slot and append one value
    fn append(&mut self, slot: usize, value: Location) {
        let mut hdr = self.buckets[slot];
        if hdr.size == hdr.capacity {
            if hdr.capacity as usize == Self::max_bucket_size() {
                return; // saturated
            }
            let new_cap = if hdr.capacity == 0 {
                1
            } else {
                (hdr.capacity as usize * 2).min(Self::max_bucket_size())
            };
            let new_run = self.values.allocate(new_cap);
            self.values.copy_run(hdr.run, new_run, hdr.size as usize);
            self.values.deallocate(hdr.run);
            hdr.run = new_run;
            hdr.capacity = new_cap as BucketSize;
        }
        let size = hdr.size as usize;
        self.values.slice_mut(hdr.run, size + 1)[size] = value;
        if hdr.size == 0 {
            self.num_nonempty += 1;
        }
        hdr.size += 1;
        self.buckets[slot] = hdr;
        self.num_values += 1;
    }

    /// Probe for `key`, returning a matching occupied slot or the best
    /// free slot (preferring the first tombstone on the probe path).
    fn probe_insert(&self, key: Feature) -> usize {
        let n = self.states.len();
        let mut slot = (self.hasher.hash_u64(key as u64) % n as u64) as usize;
        let mut first_free = None;
        loop {
            match self.states[slot] {
                SlotState::Occupied if self.keys[slot] == key => return slot,
                SlotState::Occupied => {}
                SlotState::Deleted => {
                    if first_free.is_none() {
                        first_free = Some(slot);
                    }
                }
                SlotState::Empty => return first_free.unwrap_or(slot),
            }
            slot += 1;
            if slot == n {
                slot = 0;
            }
        }
    }

    /// Occupancy counts both live keys and tombstones since both extend
    /// probe chains; rehashing sweeps the tombstones away.
    fn grow_if_needed(&mut self) {
        let used = self.num_keys + self.num_tombstones + 1;
        let limit = (self.states.len() as f64 * self.max_load_factor as f64) as u64;
        if self.states.is_empty() || used > limit {
            let target = (self.states.len() * 2).max(MIN_BUCKET_COUNT);
            self.rehash(next_prime(target));
        }
    }

    fn rehash(&mut self, new_size: usize) {
        let old_keys = std::mem::take(&mut self.keys);
        let old_states = std::mem::take(&mut self.states);
        let old_buckets = std::mem::take(&mut self.buckets);

        self.keys = vec![0; new_size];
        self.states = vec![SlotState::Empty; new_size];
        self.buckets = vec![BucketHeader::default(); new_size];
        self.num_tombstones = 0;

        for i in 0..old_states.len() {
            if old_states[i] != SlotState::Occupied {
                continue;
            }
            let key = old_keys[i];
            let n = self.states.len();
            let mut slot = (self.hasher.hash_u64(key as u64) % n as u64) as usize;
            while self.states[slot] == SlotState::Occupied {
                slot += 1;
                if slot == n {
                    slot = 0;
                }
            }
            self.keys[slot] = key;
            self.states[slot] = SlotState::Occupied;
            self.buckets[slot] = old_buckets[i];
        }
    }
}

/// Smallest prime >= n (trial division; table sizes stay modest)
fn next_prime(n: usize) -> usize {
    fn is_prime(x: usize) -> bool {
        if x < 2 {
            return false;
        }
        if x % 2 == 0 {
            return x == 2;
        }
        let mut d = 3;
        while d * d <= x {
            if x % d == 0 {
                return false;
            }
            d += 2;
        }
        true
    }
    let mut x = n.max(2);
    while !is_prime(x) {
        x += 1;
    }
    x
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::IdentityHash;

    fn loc(tgt: u32, win: u32) -> Location {
        Location::new(tgt, win)
    }

    fn map() -> HashMultimap<IdentityHash> {
        HashMultimap::with_hasher(IdentityHash)
    }

    #[test]
    fn test_next_prime() {
        assert_eq!(next_prime(1), 2);
        assert_eq!(next_prime(53), 53);
        assert_eq!(next_prime(54), 59);
        assert_eq!(next_prime(106), 107);
    }

    #[test]
    fn test_insert_and_find() {
        let mut m = map();
        m.insert(7, loc(0, 0));
        m.insert(7, loc(0, 1));
        m.insert(9, loc(1, 0));

        let slot = m.find(7).unwrap();
        assert_eq!(m.key(slot), 7);
        assert_eq!(m.locations(slot), &[loc(0, 0), loc(0, 1)]);
        assert_eq!(m.bucket_size(slot), 2);

        assert!(m.find(8).is_none());
        assert_eq!(m.key_count(), 2);
        assert_eq!(m.value_count(), 3);
        assert_eq!(m.non_empty_bucket_count(), 2);
    }

    #[test]
    fn test_bucket_capacity_doubles() {
        let mut m = map();
        for i in 0..20 {
            m.insert(1, loc(0, i));
        }
        let slot = m.find(1).unwrap();
        assert_eq!(m.bucket_size(slot), 20);
        let locs: Vec<_> = m.locations(slot).to_vec();
        assert_eq!(locs, (0..20).map(|i| loc(0, i)).collect::<Vec<_>>());
    }

    #[test]
    fn test_shrink_keeps_first_entries() {
        // bucket cap 2: insert three locations, shrink back to two
        let mut m = map();
        for i in 0..3 {
            let slot = m.insert(5, loc(0, i));
            if m.bucket_size(slot) > 2 {
                m.shrink(slot, 2);
            }
        }
        let slot = m.find(5).unwrap();
        assert_eq!(m.locations(slot), &[loc(0, 0), loc(0, 1)]);
        assert_eq!(m.value_count(), 2);
    }

    #[test]
    fn test_erase_leaves_no_key() {
        let mut m = map();
        m.insert(1, loc(0, 0));
        m.insert(2, loc(0, 1));
        let slot = m.find(1).unwrap();
        m.erase(slot);

        assert!(m.find(1).is_none());
        assert!(m.find(2).is_some());
        assert_eq!(m.key_count(), 1);
        assert_eq!(m.value_count(), 1);
    }

    #[test]
    fn test_probe_walks_across_tombstones() {
        let mut m = map();
        // identity hash: consecutive keys probe consecutive slots,
        // so colliding keys placed behind an erased one must stay findable
        for k in 0..30u32 {
            m.insert(k, loc(k, 0));
        }
        let bc = m.bucket_count();
        // force a collision chain: keys that map to the same slot
        let a = 100;
        let b = a + bc as u32; // same slot under identity % n
        m.insert(a, loc(1, 1));
        m.insert(b, loc(2, 2));
        let sa = m.find(a).unwrap();
        m.erase(sa);
        let sb = m.find(b).unwrap();
        assert_eq!(m.locations(sb), &[loc(2, 2)]);
    }

    #[test]
    fn test_load_factor_is_respected() {
        let mut m = map();
        for k in 0..5000u32 {
            m.insert(k, loc(k, 0));
        }
        assert_eq!(m.key_count(), 5000);
        assert!(
            m.key_count() as f64 <= m.bucket_count() as f64 * m.max_load_factor() as f64,
            "load factor exceeded: {} keys in {} buckets",
            m.key_count(),
            m.bucket_count()
        );
        // everything still findable after multiple rehashes
        for k in (0..5000u32).step_by(97) {
            assert!(m.find(k).is_some(), "lost key {}", k);
        }
    }

    #[test]
    fn test_remove_overpopulated_features() {
        let mut m = map();
        for i in 0..5 {
            m.insert(1, loc(0, i));
        }
        m.insert(2, loc(0, 0));

        let removed = m.remove_features_with_more_locations_than(4);
        assert_eq!(removed, 1);
        assert!(m.find(1).is_none());
        assert!(m.find(2).is_some());
    }

    #[test]
    fn test_remove_ambiguous_features() {
        let mut m = map();
        // feature 1 spans targets 0..=3
        for t in 0..4 {
            m.insert(1, loc(t, 0));
        }
        // feature 2 spans a single target
        m.insert(2, loc(0, 0));

        // threshold 4 keeps both
        assert_eq!(m.remove_ambiguous_features(4), 0);
        assert!(m.find(1).is_some());

        // threshold 3 erases feature 1
        assert_eq!(m.remove_ambiguous_features(3), 1);
        assert!(m.find(1).is_none());
        assert!(m.find(2).is_some());
    }

    #[test]
    fn test_insert_bucket_roundtrip() {
        let mut m = map();
        let locs = vec![loc(0, 1), loc(0, 9), loc(3, 2)];
        m.insert_bucket(77, &locs);

        let slot = m.find(77).unwrap();
        assert_eq!(m.locations(slot), locs.as_slice());
        assert_eq!(m.value_count(), 3);
        assert_eq!(m.key_count(), 1);
    }

    #[test]
    fn test_buckets_stay_sorted_under_build_order() {
        // ingestion inserts in increasing (target, window) order
        let mut m = map();
        for t in 0..3u32 {
            for w in 0..10u32 {
                m.insert(42, loc(t, w));
            }
        }
        let slot = m.find(42).unwrap();
        let locs = m.locations(slot);
        for pair in locs.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn test_for_each_bucket_visits_all() {
        let mut m = map();
        m.insert(1, loc(0, 0));
        m.insert(2, loc(0, 1));
        m.insert(3, loc(0, 2));
        let mut seen = Vec::new();
        m.for_each_bucket(|k, locs| {
            seen.push((k, locs.len()));
        });
        seen.sort_unstable();
        assert_eq!(seen, vec![(1, 1), (2, 1), (3, 1)]);
    }
}
