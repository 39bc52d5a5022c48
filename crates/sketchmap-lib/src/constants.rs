//! Constants and defaults used throughout the library.

use crate::types::{BucketSize, Feature};

/// Default seed for the feature hash function
pub const DEFAULT_SEED: u64 = 1;

/// Default k-mer length
pub const DEFAULT_KMER_LEN: usize = 16;

/// Default number of features per window sketch
pub const DEFAULT_SKETCH_LEN: usize = 16;

/// Default sampling window length
pub const DEFAULT_WINDOW_LEN: usize = 127;

/// Default maximum load factor of the feature table
pub const DEFAULT_MAX_LOAD_FACTOR: f32 = 0.8;

/// Default number of window sketches per ingestion batch
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Default capacity of the ingestion batch queue
pub const DEFAULT_QUEUE_SIZE: usize = 100;

/// Maximum directory nesting level searched for sequence files
pub const MAX_DIR_DEPTH: usize = 10;

/// Version number
pub const VERSION: (u8, u8, u8) = (0, 1, 0);

/// Largest k supported by the compiled feature width (2 bits per base)
#[inline]
pub const fn max_kmer_len() -> usize {
    4 * std::mem::size_of::<Feature>()
}

/// Largest location count a bucket may hold; one value of the size type
/// is reserved so that saturation is detectable.
#[inline]
pub const fn max_supported_locations_per_feature() -> usize {
    BucketSize::MAX as usize - 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_kmer_len_matches_feature_width() {
        // 2 bits per base must fit into the feature type
        assert_eq!(max_kmer_len() * 2, std::mem::size_of::<Feature>() * 8);
        assert!(DEFAULT_KMER_LEN <= max_kmer_len());
    }

    #[test]
    fn test_bucket_size_reserve() {
        assert_eq!(
            max_supported_locations_per_feature(),
            BucketSize::MAX as usize - 1
        );
    }
}
