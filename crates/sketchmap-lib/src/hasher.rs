//! Seeded deterministic feature hashing built on ahash.
//!
//! All four internal seeds are derived from one explicit seed, so hash
//! values are reproducible across runs and processes. The seed travels
//! with the sketching configuration and is stored in the database header;
//! a database queried with a different seed would produce disjoint
//! sketches.

use crate::types::Feature;
use ahash::RandomState;
use std::hash::{BuildHasher, Hasher};

/// Maps an encoded k-mer to its feature value.
pub trait FeatureHash: Clone {
    /// Hash a feature-width value onto the feature space
    fn hash(&self, value: Feature) -> Feature;

    /// Hash onto the full 64-bit space (used for table slot placement)
    fn hash_u64(&self, value: u64) -> u64;
}

/// The production hasher: seeded ahash, folded to feature width.
#[derive(Clone)]
pub struct SeededHash {
    seed: u64,
    state: RandomState,
}

impl SeededHash {
    /// Create a hasher with the given seed
    pub fn new(seed: u64) -> Self {
        let state = RandomState::with_seeds(seed, !seed, seed.rotate_left(17), !seed.rotate_left(31));
        Self { seed, state }
    }

    /// The seed this hasher was built with
    pub fn seed(&self) -> u64 {
        self.seed
    }
}

impl FeatureHash for SeededHash {
    #[inline]
    fn hash(&self, value: Feature) -> Feature {
        let h = self.hash_u64(value as u64);
        (h as Feature) ^ ((h >> 32) as Feature)
    }

    #[inline]
    fn hash_u64(&self, value: u64) -> u64 {
        let mut hasher = self.state.build_hasher();
        hasher.write_u64(value);
        hasher.finish()
    }
}

/// Pass-through hash; useful when feature values should be inspectable.
#[derive(Clone, Copy, Debug, Default)]
pub struct IdentityHash;

impl FeatureHash for IdentityHash {
    #[inline]
    fn hash(&self, value: Feature) -> Feature {
        value
    }

    #[inline]
    fn hash_u64(&self, value: u64) -> u64 {
        value
    }
}
