//! The sketch database: feature map, target metadata, ingestion.
//!
//! Maps features (min-hash values of reference windows) to locations
//! (window, target) and owns everything needed to build, persist and
//! query that mapping. Reference ingestion is asynchronous: the caller's
//! thread sketches windows while a single inserter thread populates the
//! feature table, which keeps every bucket sorted by construction (see
//! `hash_multimap`).

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::batch::{BatchExecutor, BatchOptions, ExecutorError};
use crate::constants::{max_supported_locations_per_feature, VERSION};
use crate::hash_multimap::HashMultimap;
use crate::input;
use crate::matches::MatchesSorter;
use crate::sketcher::{Sketcher, SketcherConfig};
use crate::stats::Statistics;
use crate::types::{Feature, Location, TargetId, WindowId};

/// Errors produced by database operations
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// The configured maximum number of targets was reached
    #[error("target count limit exceeded")]
    TargetLimitExceeded,
    /// The asynchronous sketch inserter failed
    #[error("sketch insertion failed: {0}")]
    Ingestion(#[from] ExecutorError),
    /// An I/O error while reading or writing a database file
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// The file is not a sketch database or is corrupt
    #[error("invalid database file: {0}")]
    InvalidFormat(String),
    /// The file was written by an incompatible version
    #[error("unsupported database format version {found} (expected {expected})")]
    UnsupportedVersion {
        /// Version found in the file
        found: u32,
        /// Version this build understands
        expected: u32,
    },
    /// The file was written with different compile-time type widths
    #[error("database type widths do not match this build")]
    IncompatibleWidths,
    /// Invalid parameter combination
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Re-reading target sequences from their source files failed
    #[error("failed to re-read target sequences: {0}")]
    RereadFailed(String),
}

/// Where a target came from: file, record index, and how many windows
/// it contributed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FileSource {
    /// Path of the sequence file
    pub filename: String,
    /// 0-based record index within the file
    pub index: u64,
    /// Number of window sketches produced for this target
    pub windows: u64,
}

/// Reference sequence metadata. Header and raw sequence are cached only
/// after `reread_targets` (needed for SAM output).
#[derive(Clone, Debug, Default)]
pub struct Target {
    pub(crate) name: String,
    pub(crate) source: FileSource,
    pub(crate) header: String,
    pub(crate) seq: Vec<u8>,
}

impl Target {
    /// Unique target name (typically the record accession)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Origin of the target
    pub fn source(&self) -> &FileSource {
        &self.source
    }

    /// Cached full header (empty unless re-read)
    pub fn header(&self) -> &str {
        &self.header
    }

    /// Cached raw sequence (empty unless re-read)
    pub fn seq(&self) -> &[u8] {
        &self.seq
    }
}

/// How much of a database file to load
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scope {
    /// Configuration, targets and the feature map
    Sketches,
    /// Configuration and targets only
    MetadataOnly,
    /// Everything stored in the file
    Everything,
}

/// Work item of the ingestion pipeline: one window sketch
#[derive(Debug, Default)]
pub(crate) struct WindowSketch {
    pub(crate) tgt: TargetId,
    pub(crate) win: WindowId,
    pub(crate) sk: Vec<Feature>,
}

/// Sketch database mapping features to reference locations.
pub struct Database {
    pub(crate) target_sketcher: Sketcher,
    pub(crate) query_sketcher: Sketcher,
    pub(crate) max_locs_per_feature: usize,
    pub(crate) features: Arc<RwLock<HashMultimap>>,
    pub(crate) targets: Vec<Target>,
    pub(crate) name_to_id: BTreeMap<String, TargetId>,
    inserter: Option<BatchExecutor<WindowSketch>>,
}

impl Database {
    /// Create an empty database; targets and queries are sketched with
    /// the same parameters.
    pub fn new(cfg: SketcherConfig) -> Result<Self, DatabaseError> {
        Self::with_sketchers(Sketcher::new(cfg), Sketcher::new(cfg))
    }

    /// Create an empty database with distinct target/query sketchers
    pub fn with_sketchers(
        target_sketcher: Sketcher,
        query_sketcher: Sketcher,
    ) -> Result<Self, DatabaseError> {
        target_sketcher
            .config()
            .validate()
            .map_err(DatabaseError::Config)?;
        query_sketcher
            .config()
            .validate()
            .map_err(DatabaseError::Config)?;

        let seed = target_sketcher.config().seed;
        Ok(Self {
            target_sketcher,
            query_sketcher,
            max_locs_per_feature: max_supported_locations_per_feature(),
            features: Arc::new(RwLock::new(HashMultimap::new(seed))),
            targets: Vec::new(),
            name_to_id: BTreeMap::new(),
            inserter: None,
        })
    }

    /// Sketcher applied to reference sequences
    pub fn target_sketcher(&self) -> &Sketcher {
        &self.target_sketcher
    }

    /// Sketcher applied to query sequences
    pub fn query_sketcher(&self) -> &Sketcher {
        &self.query_sketcher
    }

    /// Replace the query sketcher (query parameters may differ from the
    /// build parameters; the conversion and seed normally should not)
    pub fn set_query_sketcher(&mut self, sketcher: Sketcher) -> Result<(), DatabaseError> {
        sketcher.config().validate().map_err(DatabaseError::Config)?;
        self.query_sketcher = sketcher;
        Ok(())
    }

    // ----- storage configuration ------------------------------------

    /// Current per-feature location cap
    pub fn max_locations_per_feature(&self) -> usize {
        self.max_locs_per_feature
    }

    /// Set the per-feature location cap (clamped to the supported
    /// maximum); buckets over the new cap are truncated on their next
    /// insertion, or all at once by `remove_features_with_more_locations_than`.
    pub fn set_max_locations_per_feature(&mut self, cap: usize) {
        self.max_locs_per_feature = cap.clamp(1, max_supported_locations_per_feature());
    }

    /// Hard upper bound imposed by the bucket size type
    pub fn max_supported_locations_per_feature() -> usize {
        max_supported_locations_per_feature()
    }

    /// Maximum load factor of the feature table
    pub fn max_load_factor(&self) -> f32 {
        self.read_features().max_load_factor()
    }

    /// Set the maximum load factor of the feature table
    pub fn set_max_load_factor(&mut self, lf: f32) {
        self.write_features().set_max_load_factor(lf);
    }

    /// Erase all features with more than `cap` locations;
    /// returns how many were removed.
    pub fn remove_features_with_more_locations_than(&mut self, cap: usize) -> u64 {
        let removed = self
            .write_features()
            .remove_features_with_more_locations_than(cap);
        if removed > 0 {
            info!("removed {} overpopulated features", removed);
        }
        removed
    }

    /// Erase all features occurring in more than `max_targets` distinct
    /// targets; returns how many were removed.
    pub fn remove_ambiguous_features(&mut self, max_targets: usize) -> u64 {
        let removed = self.write_features().remove_ambiguous_features(max_targets);
        if removed > 0 {
            info!("removed {} ambiguous features", removed);
        }
        removed
    }

    // ----- target ingestion -----------------------------------------

    /// Highest number of targets this build can index
    pub fn max_target_count() -> u64 {
        TargetId::MAX as u64
    }

    /// Number of targets ingested
    pub fn target_count(&self) -> u64 {
        self.targets.len() as u64
    }

    /// Target metadata by id
    pub fn get_target(&self, id: TargetId) -> Option<&Target> {
        self.targets.get(id as usize)
    }

    /// Exact name lookup
    pub fn target_with_name(&self, name: &str) -> Option<TargetId> {
        if name.is_empty() {
            return None;
        }
        self.name_to_id.get(name).copied()
    }

    /// Prefix lookup: finds a target whose name extends `name`
    /// (e.g. a versioned accession)
    pub fn target_with_similar_name(&self, name: &str) -> Option<TargetId> {
        if name.is_empty() {
            return None;
        }
        self.name_to_id
            .range::<str, _>((
                std::ops::Bound::Excluded(name),
                std::ops::Bound::Unbounded,
            ))
            .next()
            .filter(|(key, _)| key.starts_with(name))
            .map(|(_, &id)| id)
    }

    /// Sketch a reference sequence and enqueue its windows for insertion.
    ///
    /// Returns `Ok(false)` for duplicate names (the target is skipped),
    /// `Err(TargetLimitExceeded)` once the id space is exhausted. The
    /// target is addressable immediately; its sketches become queryable
    /// after `wait_until_add_target_complete`.
    pub fn add_target(
        &mut self,
        seq: &[u8],
        name: &str,
        mut source: FileSource,
    ) -> Result<bool, DatabaseError> {
        if self.target_count() >= Self::max_target_count() {
            return Err(DatabaseError::TargetLimitExceeded);
        }
        if name.is_empty() || self.name_to_id.contains_key(name) {
            return Ok(false);
        }
        if self.inserter.is_none() {
            self.make_sketch_inserter();
        }

        let tgt = self.targets.len() as TargetId;
        let windows = self.add_all_window_sketches(seq, tgt);
        source.windows = windows as u64;
        debug!(target_id = tgt, windows, name, "added target");

        self.targets.push(Target {
            name: name.to_string(),
            source,
            header: String::new(),
            seq: Vec::new(),
        });
        self.name_to_id.insert(name.to_string(), tgt);
        Ok(true)
    }

    /// Flush pending sketch batches and join the inserter thread.
    /// Must be called (or the database dropped) before querying.
    pub fn wait_until_add_target_complete(&mut self) -> Result<(), DatabaseError> {
        match self.inserter.take() {
            Some(ex) => ex.finish().map_err(DatabaseError::from),
            None => Ok(()),
        }
    }

    /// True if the inserter is running but has failed
    pub fn add_target_failed(&self) -> bool {
        self.inserter.as_ref().is_some_and(|i| !i.valid())
    }

    fn make_sketch_inserter(&mut self) {
        let features = Arc::clone(&self.features);
        let max_locs = self.max_locs_per_feature;
        self.inserter = Some(BatchExecutor::new(BatchOptions::default(), move |batch: &[WindowSketch]| {
            let mut map = features
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            for ws in batch {
                for &f in &ws.sk {
                    let slot = map.insert(f, Location::new(ws.tgt, ws.win));
                    if map.bucket_size(slot) > max_locs {
                        map.shrink(slot, max_locs);
                    }
                }
            }
            Ok(())
        }));
    }

    fn add_all_window_sketches(&mut self, seq: &[u8], tgt: TargetId) -> usize {
        let inserter = match self.inserter.as_mut() {
            Some(i) => i,
            None => return 0,
        };
        let mut win: WindowId = 0;
        self.target_sketcher.for_each_sketch(seq, |sk| {
            if inserter.valid() {
                let item = inserter.next_item();
                item.tgt = tgt;
                item.win = win;
                item.sk = sk;
            }
            win += 1;
            true
        });
        win as usize
    }

    // ----- target sequence cache ------------------------------------

    /// Re-open the source files and cache header + raw sequence of every
    /// target (grouped by file, one sequential pass per file). Needed
    /// for SAM output.
    pub fn reread_targets(&mut self) -> Result<(), DatabaseError> {
        let mut by_file: HashMap<String, HashMap<u64, TargetId>> = HashMap::new();
        for (id, target) in self.targets.iter().enumerate() {
            by_file
                .entry(target.source.filename.clone())
                .or_default()
                .insert(target.source.index, id as TargetId);
        }

        for (filename, wanted) in by_file {
            let mut result: Vec<(TargetId, String, Vec<u8>)> = Vec::with_capacity(wanted.len());
            input::for_each_record(&filename, |rec| {
                if let Some(&tgt) = wanted.get(&rec.index) {
                    result.push((tgt, rec.header, rec.seq));
                }
                result.len() < wanted.len()
            })
            .map_err(|e| DatabaseError::RereadFailed(format!("{filename}: {e}")))?;

            if result.len() < wanted.len() {
                warn!(
                    "{}: found only {} of {} indexed records",
                    filename,
                    result.len(),
                    wanted.len()
                );
            }
            for (tgt, header, seq) in result {
                let target = &mut self.targets[tgt as usize];
                target.header = header;
                target.seq = seq;
            }
        }
        Ok(())
    }

    /// SAM header built from cached target sequences
    pub fn sam_header(&self) -> String {
        let mut out = String::from("@HD\tVN:1.0\tSO:unsorted\n");
        for target in &self.targets {
            let name = if target.header.is_empty() {
                target.name.as_str()
            } else {
                input::accession_of(&target.header)
            };
            out.push_str(&format!("@SQ\tSN:{}\tLN:{}\n", name, target.seq.len()));
        }
        let (maj, min, pat) = VERSION;
        out.push_str(&format!(
            "@PG\tID:sketchmap\tPN:sketchmap\tVN:{maj}.{min}.{pat}\n"
        ));
        out
    }

    // ----- queries --------------------------------------------------

    /// Sketch a query and append every feature's bucket to `res`.
    /// `res` then holds one sorted run per feature hit; call
    /// `res.sort()` to merge them.
    pub fn accumulate_matches(&self, seq: &[u8], res: &mut MatchesSorter) {
        let map = self.read_features();
        self.query_sketcher.for_each_sketch(seq, |sk| {
            for f in sk {
                if let Some(slot) = map.find(f) {
                    res.append_run(map.locations(slot));
                }
            }
            true
        });
    }

    // ----- statistics -----------------------------------------------

    /// Number of slots in the feature table
    pub fn bucket_count(&self) -> u64 {
        self.read_features().bucket_count()
    }

    /// Number of distinct features stored
    pub fn feature_count(&self) -> u64 {
        self.read_features().key_count()
    }

    /// Features whose buckets were truncated to zero
    pub fn dead_feature_count(&self) -> u64 {
        let map = self.read_features();
        map.key_count() - map.non_empty_bucket_count()
    }

    /// Total number of stored locations
    pub fn location_count(&self) -> u64 {
        self.read_features().value_count()
    }

    /// Distribution of location-list sizes over non-empty buckets
    pub fn location_list_size_statistics(&self) -> Statistics {
        let mut stats = Statistics::new();
        self.read_features()
            .for_each_bucket(|_, locs| stats.push(locs.len() as f64));
        stats
    }

    /// Dump the feature map as `feature -> (tgt,win)...` lines
    pub fn print_feature_map<W: Write>(&self, out: &mut W) -> std::io::Result<()> {
        let map = self.read_features();
        let mut err = None;
        map.for_each_bucket(|feature, locs| {
            if err.is_some() {
                return;
            }
            let mut line = format!("{feature} ->");
            for loc in locs {
                line.push_str(&format!(" ({},{})", loc.tgt, loc.win));
            }
            line.push('\n');
            if let Err(e) = out.write_all(line.as_bytes()) {
                err = Some(e);
            }
        });
        match err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Dump per-feature location counts
    pub fn print_feature_counts<W: Write>(&self, out: &mut W) -> std::io::Result<()> {
        let map = self.read_features();
        let mut err = None;
        map.for_each_bucket(|feature, locs| {
            if err.is_some() {
                return;
            }
            if let Err(e) = writeln!(out, "{feature} -> {}", locs.len()) {
                err = Some(e);
            }
        });
        match err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Drop all targets and features
    pub fn clear(&mut self) {
        self.targets.clear();
        self.name_to_id.clear();
        self.write_features().clear();
    }

    pub(crate) fn read_features(&self) -> RwLockReadGuard<'_, HashMultimap> {
        self.features.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write_features(&self) -> RwLockWriteGuard<'_, HashMultimap> {
        self.features
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        // best effort: flush pending sketches; errors were observable
        // through add_target_failed / wait_until_add_target_complete
        if let Some(ex) = self.inserter.take() {
            let _ = ex.finish();
        }
    }
}
