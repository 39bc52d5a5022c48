//! Windowed min-hash sketching.
//!
//! A sequence is cut into windows of `winlen` bases whose start positions
//! advance by `winstride`; each window is summarized by the `sketchlen`
//! smallest distinct hashed k-mer values it contains. Small substitutions
//! perturb at most a few features of a sketch, which is what makes the
//! downstream feature->location lookup robust.

use crate::alphabet::{Conversion, KmerEncoder};
use crate::constants::{
    max_kmer_len, DEFAULT_KMER_LEN, DEFAULT_SEED, DEFAULT_SKETCH_LEN, DEFAULT_WINDOW_LEN,
};
use crate::hasher::{FeatureHash, SeededHash};
use crate::types::Feature;

/// Sketching parameters.
///
/// `winstride` defaults to `winlen - kmerlen + 1`, which makes adjacent
/// windows share exactly `kmerlen - 1` bases so that no k-mer spans a
/// window boundary unseen.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SketcherConfig {
    /// Number of bases per k-mer
    pub kmerlen: usize,
    /// Number of features kept per window
    pub sketchlen: usize,
    /// Number of bases per sampling window
    pub winlen: usize,
    /// Distance between window start positions
    pub winstride: usize,
    /// 3N nucleotide conversion applied before encoding
    pub conversion: Conversion,
    /// Seed of the feature hash function
    pub seed: u64,
}

impl Default for SketcherConfig {
    fn default() -> Self {
        Self {
            kmerlen: DEFAULT_KMER_LEN,
            sketchlen: DEFAULT_SKETCH_LEN,
            winlen: DEFAULT_WINDOW_LEN,
            winstride: DEFAULT_WINDOW_LEN - DEFAULT_KMER_LEN + 1,
            conversion: Conversion::default(),
            seed: DEFAULT_SEED,
        }
    }
}

impl SketcherConfig {
    /// Validate parameter consistency
    pub fn validate(&self) -> Result<(), String> {
        if self.kmerlen < 1 || self.kmerlen > max_kmer_len() {
            return Err(format!(
                "kmerlen must be in [1, {}], got {}",
                max_kmer_len(),
                self.kmerlen
            ));
        }
        if self.sketchlen < 1 {
            return Err("sketchlen must be at least 1".into());
        }
        if self.winlen < self.kmerlen {
            return Err(format!(
                "winlen ({}) must not be smaller than kmerlen ({})",
                self.winlen, self.kmerlen
            ));
        }
        if self.winstride < 1 {
            return Err("winstride must be at least 1".into());
        }
        Ok(())
    }
}

/// Produces one min-hash sketch per sampling window of a sequence.
#[derive(Clone)]
pub struct Sketcher<H: FeatureHash = SeededHash> {
    cfg: SketcherConfig,
    hasher: H,
}

impl Sketcher<SeededHash> {
    /// Create a sketcher with the production hash function
    pub fn new(cfg: SketcherConfig) -> Self {
        let hasher = SeededHash::new(cfg.seed);
        Self { cfg, hasher }
    }
}

impl<H: FeatureHash> Sketcher<H> {
    /// Create a sketcher with a custom hash function
    pub fn with_hasher(cfg: SketcherConfig, hasher: H) -> Self {
        Self { cfg, hasher }
    }

    /// The sketching parameters
    pub fn config(&self) -> &SketcherConfig {
        &self.cfg
    }

    /// Number of window sketches produced for a sequence of `len` bases:
    /// 0 if the sequence is shorter than one window, otherwise
    /// `(len - winlen + 1) / winstride + 1`. The final window may be
    /// truncated at the sequence end but still spans at least
    /// `winlen - 1 >= kmerlen` bases.
    pub fn num_windows(&self, len: usize) -> usize {
        if len < self.cfg.winlen {
            0
        } else {
            (len - self.cfg.winlen + 1) / self.cfg.winstride + 1
        }
    }

    /// Number of consecutive windows a fragment of `span` bases can touch.
    pub fn window_range_for(&self, span: usize) -> usize {
        if span <= self.cfg.kmerlen {
            1
        } else {
            (span - self.cfg.kmerlen) / self.cfg.winstride + 1
        }
    }

    /// Call `consume` with the sketch of every window, in window order.
    /// Stops early when `consume` returns false.
    pub fn for_each_sketch<F>(&self, seq: &[u8], mut consume: F)
    where
        F: FnMut(Vec<Feature>) -> bool,
    {
        let windows = self.num_windows(seq.len());
        let mut scratch: Vec<Feature> = Vec::with_capacity(self.cfg.winlen);

        for i in 0..windows {
            let beg = i * self.cfg.winstride;
            let end = (beg + self.cfg.winlen).min(seq.len());
            let sketch = self.window_sketch(&seq[beg..end], &mut scratch);
            if !consume(sketch) {
                return;
            }
        }
    }

    /// Sketch of one window: the `sketchlen` smallest distinct hashed
    /// k-mer values, ascending. Invalid k-mers are skipped, so a window
    /// may yield fewer features than `sketchlen`.
    fn window_sketch(&self, window: &[u8], scratch: &mut Vec<Feature>) -> Vec<Feature> {
        scratch.clear();
        let mut enc = KmerEncoder::new(self.cfg.kmerlen, self.cfg.conversion);
        for &base in window {
            if let Some(kmer) = enc.push(base) {
                scratch.push(self.hasher.hash(kmer));
            }
        }
        scratch.sort_unstable();
        scratch.dedup();
        scratch.truncate(self.cfg.sketchlen);
        scratch.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::IdentityHash;

    fn tiny_config() -> SketcherConfig {
        SketcherConfig {
            kmerlen: 4,
            sketchlen: 3,
            winlen: 8,
            winstride: 5,
            conversion: Conversion::default(),
            seed: 1,
        }
    }

    fn identity_sketcher(cfg: SketcherConfig) -> Sketcher<IdentityHash> {
        Sketcher::with_hasher(cfg, IdentityHash)
    }

    #[test]
    fn test_window_count_formula() {
        let sk = identity_sketcher(tiny_config());
        // shorter than one window
        assert_eq!(sk.num_windows(7), 0);
        assert_eq!(sk.num_windows(8), 1);
        assert_eq!(sk.num_windows(12), 2);
        assert_eq!(sk.num_windows(13), 2);
        assert_eq!(sk.num_windows(100), (100 - 8 + 1) / 5 + 1);
    }

    #[test]
    fn test_sketch_deterministic_with_identity_hash() {
        // k=4, w=8, s=5, m=3, conv C->T, identity hash on the encoding.
        // First window of "ACGTACGTACGT" is "ACGTACGT"; after conversion
        // "ATGTATGT" with 5 k-mers: ATGT TGTA GTAT TATG ATGT.
        let sk = identity_sketcher(tiny_config());
        let seq = b"ACGTACGTACGT";

        let mut sketches = Vec::new();
        sk.for_each_sketch(seq, |s| {
            sketches.push(s);
            true
        });
        assert_eq!(sketches.len(), 2);

        // window 0 k-mers (converted): ATGT TGTA GTAT TATG ATGT
        // encodings (A,C,G,T -> 0,1,2,3):
        let atgt = 0b00_11_10_11;
        let tgta = 0b11_10_11_00;
        let gtat = 0b10_11_00_11;
        let tatg = 0b11_00_11_10;
        let mut expect = vec![atgt, tgta, gtat, tatg];
        expect.sort_unstable();
        expect.truncate(3);
        assert_eq!(sketches[0], expect);

        // same input twice yields identical sketches
        let mut again = Vec::new();
        sk.for_each_sketch(seq, |s| {
            again.push(s);
            true
        });
        assert_eq!(sketches, again);
    }

    #[test]
    fn test_sketch_sorted_distinct_bounded() {
        let cfg = SketcherConfig {
            kmerlen: 4,
            sketchlen: 5,
            winlen: 16,
            winstride: 13,
            ..SketcherConfig::default()
        };
        let sk = Sketcher::new(cfg);
        let seq = b"ACGTACGTACGTACGTACGTACGTACGTACGT";

        sk.for_each_sketch(seq, |s| {
            assert!(s.len() <= 5);
            for pair in s.windows(2) {
                assert!(pair[0] < pair[1], "sketch must be sorted and distinct");
            }
            true
        });
    }

    #[test]
    fn test_ambiguous_bases_are_skipped() {
        let cfg = tiny_config();
        let sk = identity_sketcher(cfg);
        // all k-mers touch the N, so the only window yields no feature
        let seq = b"ACGNTACG";
        let mut sketches = Vec::new();
        sk.for_each_sketch(seq, |s| {
            sketches.push(s);
            true
        });
        assert_eq!(sketches.len(), 1);
        assert!(sketches[0].len() < 3);
    }

    #[test]
    fn test_consume_false_aborts() {
        let sk = identity_sketcher(tiny_config());
        let seq = b"ACGTACGTACGTACGTACGT";
        let mut calls = 0;
        sk.for_each_sketch(seq, |_| {
            calls += 1;
            false
        });
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_config_validation() {
        assert!(SketcherConfig::default().validate().is_ok());

        let bad_k = SketcherConfig { kmerlen: 99, ..SketcherConfig::default() };
        assert!(bad_k.validate().is_err());

        let bad_w = SketcherConfig { winlen: 3, kmerlen: 8, ..SketcherConfig::default() };
        assert!(bad_w.validate().is_err());

        let bad_s = SketcherConfig { winstride: 0, ..SketcherConfig::default() };
        assert!(bad_s.validate().is_err());
    }
}
