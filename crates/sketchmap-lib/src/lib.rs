// sketchmap: windowed min-hash read mapping for 3N-converted reads
//
// Builds a compact on-disk index of reference sequences sketched by
// windowed min-hashing and maps (possibly bisulfite- or otherwise
// base-converted) reads back to their most likely origin windows.

#![warn(missing_docs)]
#![doc = include_str!("../README.md")]

pub mod alphabet;
pub mod batch;
pub mod candidates;
pub mod chunk_alloc;
pub mod classify;
pub mod constants;
pub mod database;
pub mod hash_multimap;
pub mod hasher;
pub mod input;
pub mod matches;
pub mod serialization;
pub mod sketcher;
pub mod stats;
pub mod types;

pub use alphabet::Conversion;
pub use candidates::{
    AllDistinctCandidates, BestDistinctCandidates, CandidateRules, MatchCandidate, WindowRange,
};
pub use classify::{ClassifyOptions, MappingSummary, PerformanceOptions, QueryMapping};
pub use database::{Database, DatabaseError, FileSource, Scope, Target};
pub use input::{PairingMode, QueryRecord};
pub use matches::MatchesSorter;
pub use sketcher::{Sketcher, SketcherConfig};
pub use types::{Feature, Location, TargetId, WindowId};

/// Version information
pub fn version() -> (u8, u8, u8) {
    constants::VERSION
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        let (major, minor, patch) = version();
        assert_eq!(major, 0);
        assert_eq!(minor, 1);
        assert_eq!(patch, 0);
    }
}
