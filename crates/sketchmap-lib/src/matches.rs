//! Per-query match accumulation and merging.
//!
//! During a query, every feature hit appends one bucket's locations to a
//! flat buffer and records the run boundary. Since each bucket is already
//! sorted by (target, window), the buffer is a concatenation of sorted
//! runs, which a bottom-up k-way merge turns into one sorted sequence in
//! O(L log R). The scratch buffers are retained across queries.

use crate::types::Location;

/// Accumulates per-feature location runs and merges them into one
/// sorted match list.
#[derive(Debug, Default)]
pub struct MatchesSorter {
    locs: Vec<Location>,
    offsets: Vec<usize>,
    temp: Vec<Location>,
}

impl MatchesSorter {
    /// Create an empty accumulator
    pub fn new() -> Self {
        Self {
            locs: Vec::new(),
            offsets: vec![0],
            temp: Vec::new(),
        }
    }

    /// Forget all matches but keep the backing capacity
    pub fn clear(&mut self) {
        self.locs.clear();
        self.offsets.clear();
        self.offsets.push(0);
    }

    /// True when no match has been accumulated
    pub fn is_empty(&self) -> bool {
        self.locs.is_empty()
    }

    /// Number of accumulated match locations
    pub fn len(&self) -> usize {
        self.locs.len()
    }

    /// The accumulated (after `sort`: sorted) locations
    pub fn locations(&self) -> &[Location] {
        &self.locs
    }

    /// Append one sorted run (a bucket's contents)
    pub fn append_run(&mut self, run: &[Location]) {
        if run.is_empty() {
            return;
        }
        self.locs.extend_from_slice(run);
        self.offsets.push(self.locs.len());
    }

    /// Merge all runs into a single sorted sequence.
    ///
    /// Bottom-up: pairs of adjacent runs are merged into a same-sized
    /// temp buffer, the buffers swap, the run width doubles.
    pub fn sort(&mut self) {
        let num_runs = self.offsets.len() - 1;
        if num_runs < 2 {
            return;
        }
        self.temp.resize(self.locs.len(), Location::default());

        let mut width = 1;
        while width < num_runs {
            let mut i = 0;
            while i < num_runs {
                let beg = self.offsets[i];
                let mid = self.offsets[(i + width).min(num_runs)];
                let end = self.offsets[(i + 2 * width).min(num_runs)];
                merge_into(&self.locs[beg..mid], &self.locs[mid..end], &mut self.temp[beg..end]);
                i += 2 * width;
            }
            std::mem::swap(&mut self.locs, &mut self.temp);
            width *= 2;
        }
        // collapse bookkeeping to a single run
        self.offsets.clear();
        self.offsets.push(0);
        self.offsets.push(self.locs.len());
    }
}

/// Stable two-way merge of sorted slices into `out`
fn merge_into(a: &[Location], b: &[Location], out: &mut [Location]) {
    debug_assert_eq!(a.len() + b.len(), out.len());
    let (mut i, mut j) = (0, 0);
    for slot in out.iter_mut() {
        if i < a.len() && (j >= b.len() || a[i] <= b[j]) {
            *slot = a[i];
            i += 1;
        } else {
            *slot = b[j];
            j += 1;
        }
    }
}
