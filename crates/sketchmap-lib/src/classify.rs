//! Query classification: from reads to ranked mapping candidates.
//!
//! Each query (read or read pair) is sketched, its feature hits are
//! gathered and merged, and the candidate generator picks the best
//! contiguous window range per target. Threshold filters then prune the
//! ranked candidates. Queries fan out over a rayon pool; every worker
//! owns its own match accumulator and shares the database immutably.

use std::io::Write;

use anyhow::{Context, Result};
use rayon::prelude::*;
use tracing::info;

use crate::candidates::{BestDistinctCandidates, CandidateRules, MatchCandidate};
use crate::database::Database;
use crate::input::QueryRecord;
use crate::matches::MatchesSorter;
use crate::types::WindowId;

/// Candidate filtering thresholds
#[derive(Clone, Copy, Debug)]
pub struct ClassifyOptions {
    /// Candidates with fewer hits are discarded
    pub hits_min: u64,
    /// Candidates with fewer hits than this fraction of the top
    /// candidate's hits are discarded (0 disables)
    pub hits_cutoff: f64,
    /// Candidates covering less than this fraction of the query's
    /// windows are discarded (0 disables)
    pub cov_min: f64,
    /// Maximum number of candidates kept per query
    pub max_candidates: usize,
    /// Maximum insert size of a read pair; widens the allowed window
    /// range (0 = use the reads' combined length)
    pub insert_size_max: usize,
}

impl Default for ClassifyOptions {
    fn default() -> Self {
        Self {
            hits_min: 1,
            hits_cutoff: 0.8,
            cov_min: 0.0,
            max_candidates: 2,
            insert_size_max: 0,
        }
    }
}

/// Parallel execution parameters
#[derive(Clone, Copy, Debug)]
pub struct PerformanceOptions {
    /// Worker threads (0 = all cores)
    pub threads: usize,
    /// Queries handed to one worker at a time
    pub batch_size: usize,
}

impl Default for PerformanceOptions {
    fn default() -> Self {
        Self { threads: 0, batch_size: 1024 }
    }
}

/// Mapping result of one query
#[derive(Clone, Debug)]
pub struct QueryMapping {
    /// Query header
    pub header: String,
    /// Filtered candidates, best first
    pub candidates: Vec<MatchCandidate>,
}

impl QueryMapping {
    /// True when at least one candidate survived filtering
    pub fn is_mapped(&self) -> bool {
        !self.candidates.is_empty()
    }
}

/// Totals reported after a query run
#[derive(Clone, Copy, Debug, Default)]
pub struct MappingSummary {
    /// Number of queries processed
    pub total: u64,
    /// Number of queries with at least one candidate
    pub mapped: u64,
}

/// Classify one query using a caller-provided scratch accumulator
pub fn classify_query(
    db: &Database,
    query: &QueryRecord,
    opts: &ClassifyOptions,
    sorter: &mut MatchesSorter,
) -> QueryMapping {
    sorter.clear();
    db.accumulate_matches(&query.seq, sorter);
    if let Some(mate) = &query.mate {
        db.accumulate_matches(mate, sorter);
    }
    sorter.sort();

    let sketcher = db.query_sketcher();
    let mate_len = query.mate.as_ref().map_or(0, |m| m.len());
    let span = (query.seq.len() + mate_len).max(opts.insert_size_max);
    let rules = CandidateRules {
        max_windows_in_range: sketcher.window_range_for(span) as WindowId,
        max_candidates: opts.max_candidates,
    };
    let ranked = BestDistinctCandidates::from_matches(sorter.locations(), &rules);

    let query_windows = (sketcher.num_windows(query.seq.len())
        + query.mate.as_ref().map_or(0, |m| sketcher.num_windows(m.len())))
        as u64;
    let candidates = filter_candidates(ranked.as_slice(), query_windows, opts);

    QueryMapping { header: query.header.clone(), candidates }
}

/// Apply the hit-count, relative-cutoff and coverage filters to a
/// ranked (hits descending) candidate list.
pub fn filter_candidates(
    ranked: &[MatchCandidate],
    query_windows: u64,
    opts: &ClassifyOptions,
) -> Vec<MatchCandidate> {
    let top_hits = ranked.first().map_or(0, |c| c.hits);
    ranked
        .iter()
        .filter(|c| c.hits >= opts.hits_min.max(1))
        .filter(|c| c.hits as f64 >= opts.hits_cutoff * top_hits as f64)
        .filter(|c| {
            opts.cov_min <= 0.0
                || query_windows == 0
                || c.hits as f64 / query_windows as f64 >= opts.cov_min
        })
        .copied()
        .collect()
}

/// Map all queries against the database.
pub fn map_queries(
    db: &Database,
    queries: &[QueryRecord],
    opts: &ClassifyOptions,
    perf: &PerformanceOptions,
) -> Result<Vec<QueryMapping>> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(perf.threads)
        .build()
        .context("failed to create query thread pool")?;

    let batch = perf.batch_size.max(1);
    let mappings: Vec<QueryMapping> = pool.install(|| {
        queries
            .par_chunks(batch)
            .flat_map_iter(|chunk| {
                let mut sorter = MatchesSorter::new();
                chunk
                    .iter()
                    .map(|q| classify_query(db, q, opts, &mut sorter))
                    .collect::<Vec<_>>()
            })
            .collect()
    });

    let summary = summarize(&mappings);
    info!(
        "classified {} queries, {} mapped",
        summary.total, summary.mapped
    );
    Ok(mappings)
}

/// Count mapped/unmapped queries
pub fn summarize(mappings: &[QueryMapping]) -> MappingSummary {
    let mapped = mappings.iter().filter(|m| m.is_mapped()).count() as u64;
    MappingSummary { total: mappings.len() as u64, mapped }
}

/// Default mapping output: one line per query,
/// `header | target | windows | hits`, columns separated by `\t|\t`.
pub fn write_mappings<W: Write>(
    out: &mut W,
    db: &Database,
    mappings: &[QueryMapping],
    show_unmapped: bool,
) -> std::io::Result<()> {
    for mapping in mappings {
        if !mapping.is_mapped() {
            if show_unmapped {
                writeln!(out, "{}\t|\t--", mapping.header)?;
            }
            continue;
        }
        write!(out, "{}", mapping.header)?;
        for cand in &mapping.candidates {
            let name = db
                .get_target(cand.tgt)
                .map(|t| t.name())
                .unwrap_or("?");
            write!(
                out,
                "\t|\t{}\t{}:{}\t{}",
                name, cand.pos.beg, cand.pos.end, cand.hits
            )?;
        }
        writeln!(out)?;
    }
    Ok(())
}

/// SAM output: header from cached target sequences, then one record per
/// query. Positions derive from the window range (no alignment step),
/// so records carry `*` CIGARs.
pub fn write_sam<W: Write>(
    out: &mut W,
    db: &Database,
    queries: &[QueryRecord],
    mappings: &[QueryMapping],
) -> std::io::Result<()> {
    out.write_all(db.sam_header().as_bytes())?;
    let stride = db.target_sketcher().config().winstride;

    for (query, mapping) in queries.iter().zip(mappings) {
        let qname = mapping.header.split_whitespace().next().unwrap_or("*");
        let seq = String::from_utf8_lossy(&query.seq);
        match mapping.candidates.first() {
            Some(best) => {
                let rname = db.get_target(best.tgt).map(|t| t.name()).unwrap_or("*");
                let pos = best.pos.beg as usize * stride + 1;
                writeln!(
                    out,
                    "{qname}\t0\t{rname}\t{pos}\t255\t*\t*\t0\t0\t{seq}\t*"
                )?;
            }
            None => {
                writeln!(out, "{qname}\t4\t*\t0\t0\t*\t*\t0\t0\t{seq}\t*")?;
            }
        }
    }
    Ok(())
}
