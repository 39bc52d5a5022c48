//! Candidate generation from sorted match lists.
//!
//! A sliding window walks the sorted locations of each target and keeps
//! the contiguous window range (at most `max_windows_in_range` windows
//! wide) with the most hits. One best candidate is emitted per target;
//! two policies collect them: top-K sorted by hits, or all of them.

use crate::types::{Location, TargetId, WindowId, NULL_TARGET};

/// Inclusive window index range [beg, end]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WindowRange {
    /// First window of the range
    pub beg: WindowId,
    /// Last window of the range
    pub end: WindowId,
}

impl WindowRange {
    /// Construct a range; `beg <= end` is the caller's invariant
    pub const fn new(beg: WindowId, end: WindowId) -> Self {
        Self { beg, end }
    }

    /// Number of windows covered
    pub const fn num_windows(&self) -> WindowId {
        self.end - self.beg + 1
    }
}

/// Hit count and window position of one candidate target
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MatchCandidate {
    /// Candidate target
    pub tgt: TargetId,
    /// Hits accumulated inside `pos`
    pub hits: u64,
    /// Contiguous window range covered
    pub pos: WindowRange,
}

impl Default for MatchCandidate {
    fn default() -> Self {
        Self {
            tgt: NULL_TARGET,
            hits: 0,
            pos: WindowRange::default(),
        }
    }
}

/// Candidate generation parameters
#[derive(Clone, Copy, Debug)]
pub struct CandidateRules {
    /// Maximum width of a contiguous window range
    pub max_windows_in_range: WindowId,
    /// Maximum number of candidates kept (top-K policy)
    pub max_candidates: usize,
}

impl Default for CandidateRules {
    fn default() -> Self {
        Self {
            max_windows_in_range: 3,
            max_candidates: usize::MAX,
        }
    }
}

/// Scan sorted matches and emit, per target, the contiguous window range
/// (at most `num_windows` wide) with the maximal hit count. The scan
/// aborts when `consume` returns false.
///
/// Precondition: `matches` sorted by (target, window).
pub fn for_all_contiguous_window_ranges<F>(
    matches: &[Location],
    num_windows: WindowId,
    mut consume: F,
) where
    F: FnMut(MatchCandidate) -> bool,
{
    let mut fst = match matches.first() {
        Some(_) => 0usize,
        None => return,
    };

    let mut hits: u64 = 1;
    let mut best = MatchCandidate {
        tgt: matches[fst].tgt,
        hits,
        pos: WindowRange::new(matches[fst].win, matches[fst].win),
    };

    for lst in 1..matches.len() {
        if matches[lst].tgt == best.tgt {
            // extend to the right, then retire hits that fall out of range
            hits += 1;
            while fst != lst && matches[lst].win - matches[fst].win >= num_windows {
                hits -= 1;
                fst += 1;
            }
            if hits > best.hits {
                best.hits = hits;
                best.pos = WindowRange::new(matches[fst].win, matches[lst].win);
            }
        } else {
            if !consume(best) {
                return;
            }
            fst = lst;
            hits = 1;
            best = MatchCandidate {
                tgt: matches[fst].tgt,
                hits,
                pos: WindowRange::new(matches[fst].win, matches[fst].win),
            };
        }
    }
    consume(best);
}

/// Best candidates of distinct targets, sorted by hits descending and
/// truncated to `max_candidates`. Equal hit counts keep the earlier
/// (lower target id) entry in front.
#[derive(Debug, Default)]
pub struct BestDistinctCandidates {
    top: Vec<MatchCandidate>,
}

impl BestDistinctCandidates {
    /// Generate and rank candidates from a sorted match list
    pub fn from_matches(matches: &[Location], rules: &CandidateRules) -> Self {
        let mut out = Self { top: Vec::new() };
        for_all_contiguous_window_ranges(matches, rules.max_windows_in_range, |cand| {
            out.insert(cand, rules)
        });
        out
    }

    /// Insert keeping the list sorted; drops the candidate when the list
    /// is full and every kept entry has at least as many hits.
    pub fn insert(&mut self, cand: MatchCandidate, rules: &CandidateRules) -> bool {
        let i = self.top.partition_point(|c| c.hits >= cand.hits);
        if i < self.top.len() || self.top.len() < rules.max_candidates {
            self.top.insert(i, cand);
            self.top.truncate(rules.max_candidates);
        }
        true
    }

    /// Ranked candidates, best first
    pub fn as_slice(&self) -> &[MatchCandidate] {
        &self.top
    }

    /// Iterate over the ranked candidates
    pub fn iter(&self) -> std::slice::Iter<'_, MatchCandidate> {
        self.top.iter()
    }

    /// True when no candidate was generated
    pub fn is_empty(&self) -> bool {
        self.top.is_empty()
    }

    /// Number of candidates kept
    pub fn len(&self) -> usize {
        self.top.len()
    }
}

/// Every distinct target's best candidate, in emission (target id) order.
#[derive(Debug, Default)]
pub struct AllDistinctCandidates {
    cand: Vec<MatchCandidate>,
}

impl AllDistinctCandidates {
    /// Generate candidates from a sorted match list
    pub fn from_matches(matches: &[Location], rules: &CandidateRules) -> Self {
        let mut out = Self { cand: Vec::new() };
        for_all_contiguous_window_ranges(matches, rules.max_windows_in_range, |cand| {
            out.cand.push(cand);
            true
        });
        out
    }

    /// Candidates in target order
    pub fn as_slice(&self) -> &[MatchCandidate] {
        &self.cand
    }

    /// True when no candidate was generated
    pub fn is_empty(&self) -> bool {
        self.cand.is_empty()
    }

    /// Number of candidates
    pub fn len(&self) -> usize {
        self.cand.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(tgt: u32, win: u32) -> Location {
        Location::new(tgt, win)
    }

    #[test]
    fn test_sliding_window_scan() {
        // matches: t0 windows 0,1,2,10,11 and t1 window 0; range width 3
        let matches = vec![
            loc(0, 0),
            loc(0, 1),
            loc(0, 2),
            loc(0, 10),
            loc(0, 11),
            loc(1, 0),
        ];
        let mut emitted = Vec::new();
        for_all_contiguous_window_ranges(&matches, 3, |c| {
            emitted.push(c);
            true
        });

        assert_eq!(emitted.len(), 2);
        assert_eq!(emitted[0].tgt, 0);
        assert_eq!(emitted[0].hits, 3);
        assert_eq!(emitted[0].pos, WindowRange::new(0, 2));
        assert_eq!(emitted[1].tgt, 1);
        assert_eq!(emitted[1].hits, 1);
        assert_eq!(emitted[1].pos, WindowRange::new(0, 0));
    }

    #[test]
    fn test_range_width_is_bounded() {
        let matches: Vec<Location> = (0..50).map(|w| loc(0, w)).collect();
        let w = 5;
        for_all_contiguous_window_ranges(&matches, w, |c| {
            assert!(c.pos.num_windows() <= w);
            // one hit per distinct window here
            assert!(c.hits <= c.pos.num_windows() as u64);
            true
        });
    }

    #[test]
    fn test_duplicate_windows_count_as_hits() {
        // three hits in the same window: hits may exceed range width in windows
        let matches = vec![loc(0, 4), loc(0, 4), loc(0, 4)];
        let mut emitted = Vec::new();
        for_all_contiguous_window_ranges(&matches, 3, |c| {
            emitted.push(c);
            true
        });
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].hits, 3);
        assert_eq!(emitted[0].pos, WindowRange::new(4, 4));
    }

    #[test]
    fn test_consumer_abort() {
        let matches = vec![loc(0, 0), loc(1, 0), loc(2, 0)];
        let mut emitted = 0;
        for_all_contiguous_window_ranges(&matches, 3, |_| {
            emitted += 1;
            false
        });
        assert_eq!(emitted, 1);
    }

    #[test]
    fn test_empty_match_list() {
        let mut emitted = 0;
        for_all_contiguous_window_ranges(&[], 3, |_| {
            emitted += 1;
            true
        });
        assert_eq!(emitted, 0);
    }

    #[test]
    fn test_best_k_ranking_and_truncation() {
        // t0: 1 hit, t1: 3 hits, t2: 2 hits
        let matches = vec![
            loc(0, 0),
            loc(1, 0),
            loc(1, 1),
            loc(1, 2),
            loc(2, 5),
            loc(2, 6),
        ];
        let rules = CandidateRules { max_windows_in_range: 3, max_candidates: 2 };
        let best = BestDistinctCandidates::from_matches(&matches, &rules);

        assert_eq!(best.len(), 2);
        assert_eq!(best.as_slice()[0].tgt, 1);
        assert_eq!(best.as_slice()[0].hits, 3);
        assert_eq!(best.as_slice()[1].tgt, 2);
        assert_eq!(best.as_slice()[1].hits, 2);
    }

    #[test]
    fn test_best_k_tie_keeps_earlier_target() {
        let matches = vec![loc(0, 0), loc(1, 0), loc(2, 0)];
        let rules = CandidateRules { max_windows_in_range: 3, max_candidates: 2 };
        let best = BestDistinctCandidates::from_matches(&matches, &rules);

        // all tie at 1 hit; the two earliest targets survive, in order
        assert_eq!(best.len(), 2);
        assert_eq!(best.as_slice()[0].tgt, 0);
        assert_eq!(best.as_slice()[1].tgt, 1);
    }

    #[test]
    fn test_each_target_appears_once() {
        let matches = vec![
            loc(0, 0),
            loc(0, 50),
            loc(1, 0),
            loc(1, 90),
        ];
        let best =
            BestDistinctCandidates::from_matches(&matches, &CandidateRules::default());
        let mut tgts: Vec<_> = best.iter().map(|c| c.tgt).collect();
        tgts.sort_unstable();
        tgts.dedup();
        assert_eq!(tgts.len(), best.len());
    }

    #[test]
    fn test_all_distinct_collects_everything() {
        let matches = vec![loc(0, 0), loc(1, 0), loc(2, 0), loc(3, 0)];
        let all = AllDistinctCandidates::from_matches(&matches, &CandidateRules::default());
        assert_eq!(all.len(), 4);
        let tgts: Vec<_> = all.as_slice().iter().map(|c| c.tgt).collect();
        assert_eq!(tgts, vec![0, 1, 2, 3]);
    }
}
