//! Binary database file format.
//!
//! All integers are fixed-width little-endian; strings are a u64 length
//! prefix followed by raw bytes. Layout:
//!
//! 1. magic `"SKMP3NDB"` + format version (u32)
//! 2. type widths in bits: feature, target id, window id, bucket size
//! 3. target sketcher config, query sketcher config
//!    (k, m, w, s, conversion pair, hash seed each)
//! 4. max locations per feature (u64), max load factor (f32)
//! 5. target store: count, then per target
//!    {name, filename, record index, window count}
//! 6. feature map: non-empty bucket count, then per bucket
//!    {feature, size, locations[size] as (tgt, win) pairs}
//!
//! Loading re-inserts keys and whole buckets instead of copying table
//! memory, so files survive changes to the table layout. A file whose
//! magic, version or type widths do not match is refused.

use byteorder::{LittleEndian as LE, ReadBytesExt, WriteBytesExt};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::{Arc, RwLock};
use tracing::info;

use crate::alphabet::Conversion;
use crate::constants::max_supported_locations_per_feature;
use crate::database::{Database, DatabaseError, FileSource, Scope, Target};
use crate::hash_multimap::HashMultimap;
use crate::sketcher::{Sketcher, SketcherConfig};
use crate::types::{BucketSize, Feature, Location, TargetId, WindowId};

/// Magic bytes identifying a sketch database file
pub const DB_MAGIC: &[u8; 8] = b"SKMP3NDB";

/// Format version; bump on breaking layout changes
pub const DB_FORMAT_VERSION: u32 = 1;

/// Fixed-size file header: magic, version and compile-time type widths.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DatabaseFileHeader {
    /// Format version of the file
    pub version: u32,
    /// Bits of the feature type
    pub feature_bits: u8,
    /// Bits of the target id type
    pub target_bits: u8,
    /// Bits of the window id type
    pub window_bits: u8,
    /// Bits of the bucket size type
    pub bucket_size_bits: u8,
}

impl DatabaseFileHeader {
    /// Header describing this build
    pub fn current() -> Self {
        Self {
            version: DB_FORMAT_VERSION,
            feature_bits: (std::mem::size_of::<Feature>() * 8) as u8,
            target_bits: (std::mem::size_of::<TargetId>() * 8) as u8,
            window_bits: (std::mem::size_of::<WindowId>() * 8) as u8,
            bucket_size_bits: (std::mem::size_of::<BucketSize>() * 8) as u8,
        }
    }

    /// Write magic + header
    pub fn write<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_all(DB_MAGIC)?;
        w.write_u32::<LE>(self.version)?;
        w.write_u8(self.feature_bits)?;
        w.write_u8(self.target_bits)?;
        w.write_u8(self.window_bits)?;
        w.write_u8(self.bucket_size_bits)?;
        Ok(())
    }

    /// Read and validate magic + header
    pub fn read<R: Read>(r: &mut R) -> Result<Self, DatabaseError> {
        let mut magic = [0u8; 8];
        r.read_exact(&mut magic)?;
        if &magic != DB_MAGIC {
            return Err(DatabaseError::InvalidFormat(
                "not a sketch database (bad magic)".into(),
            ));
        }
        let version = r.read_u32::<LE>()?;
        if version != DB_FORMAT_VERSION {
            return Err(DatabaseError::UnsupportedVersion {
                found: version,
                expected: DB_FORMAT_VERSION,
            });
        }
        let header = Self {
            version,
            feature_bits: r.read_u8()?,
            target_bits: r.read_u8()?,
            window_bits: r.read_u8()?,
            bucket_size_bits: r.read_u8()?,
        };
        if header != Self::current() {
            return Err(DatabaseError::IncompatibleWidths);
        }
        Ok(header)
    }
}

fn write_string<W: Write>(w: &mut W, s: &str) -> std::io::Result<()> {
    w.write_u64::<LE>(s.len() as u64)?;
    w.write_all(s.as_bytes())
}

fn read_string<R: Read>(r: &mut R) -> Result<String, DatabaseError> {
    let len = r.read_u64::<LE>()?;
    if len > u32::MAX as u64 {
        return Err(DatabaseError::InvalidFormat(format!(
            "implausible string length {len}"
        )));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf)
        .map_err(|_| DatabaseError::InvalidFormat("non-utf8 string".into()))
}

fn write_sketcher_config<W: Write>(w: &mut W, cfg: &SketcherConfig) -> std::io::Result<()> {
    w.write_u64::<LE>(cfg.kmerlen as u64)?;
    w.write_u64::<LE>(cfg.sketchlen as u64)?;
    w.write_u64::<LE>(cfg.winlen as u64)?;
    w.write_u64::<LE>(cfg.winstride as u64)?;
    w.write_u8(cfg.conversion.orig)?;
    w.write_u8(cfg.conversion.repl)?;
    w.write_u64::<LE>(cfg.seed)
}

fn read_sketcher_config<R: Read>(r: &mut R) -> Result<SketcherConfig, DatabaseError> {
    let kmerlen = r.read_u64::<LE>()? as usize;
    let sketchlen = r.read_u64::<LE>()? as usize;
    let winlen = r.read_u64::<LE>()? as usize;
    let winstride = r.read_u64::<LE>()? as usize;
    let orig = r.read_u8()?;
    let repl = r.read_u8()?;
    let seed = r.read_u64::<LE>()?;
    let cfg = SketcherConfig {
        kmerlen,
        sketchlen,
        winlen,
        winstride,
        conversion: Conversion::new(orig as char, repl as char)
            .map_err(|e| DatabaseError::InvalidFormat(e.to_string()))?,
        seed,
    };
    cfg.validate()
        .map_err(|e| DatabaseError::InvalidFormat(format!("stored sketching config: {e}")))?;
    Ok(cfg)
}

fn write_target<W: Write>(w: &mut W, target: &Target) -> std::io::Result<()> {
    write_string(w, target.name())?;
    write_string(w, &target.source().filename)?;
    w.write_u64::<LE>(target.source().index)?;
    w.write_u64::<LE>(target.source().windows)
}

impl Database {
    /// Write the database to `path`. A file left behind by a failed
    /// write is not a valid database (the header is only complete when
    /// everything before it succeeded, and loading validates all
    /// sections).
    pub fn write_file<P: AsRef<Path>>(&self, path: P) -> Result<(), DatabaseError> {
        let path = path.as_ref();
        let mut w = BufWriter::new(File::create(path)?);

        DatabaseFileHeader::current().write(&mut w)?;
        write_sketcher_config(&mut w, self.target_sketcher.config())?;
        write_sketcher_config(&mut w, self.query_sketcher.config())?;
        w.write_u64::<LE>(self.max_locs_per_feature as u64)?;
        w.write_f32::<LE>(self.max_load_factor())?;

        w.write_u64::<LE>(self.targets.len() as u64)?;
        for target in &self.targets {
            write_target(&mut w, target)?;
        }

        let map = self.read_features();
        w.write_u64::<LE>(map.non_empty_bucket_count())?;
        let mut io_err: Option<std::io::Error> = None;
        map.for_each_bucket(|feature, locs| {
            if io_err.is_some() {
                return;
            }
            let res = (|| -> std::io::Result<()> {
                w.write_u32::<LE>(feature)?;
                w.write_u8(locs.len() as BucketSize)?;
                for loc in locs {
                    w.write_u32::<LE>(loc.tgt)?;
                    w.write_u32::<LE>(loc.win)?;
                }
                Ok(())
            })();
            if let Err(e) = res {
                io_err = Some(e);
            }
        });
        if let Some(e) = io_err {
            return Err(e.into());
        }
        w.flush()?;

        info!(
            "wrote database: {} targets, {} features, {} locations",
            self.targets.len(),
            map.key_count(),
            map.value_count()
        );
        Ok(())
    }

    /// Load a database from `path`. `scope` controls whether the feature
    /// map is read; `MetadataOnly` skips it (targets and configuration
    /// only).
    pub fn read_file<P: AsRef<Path>>(path: P, scope: Scope) -> Result<Database, DatabaseError> {
        let path = path.as_ref();
        let mut r = BufReader::new(File::open(path)?);

        DatabaseFileHeader::read(&mut r)?;
        let target_cfg = read_sketcher_config(&mut r)?;
        let query_cfg = read_sketcher_config(&mut r)?;
        let max_locs = r.read_u64::<LE>()? as usize;
        let max_load_factor = r.read_f32::<LE>()?;

        let num_targets = r.read_u64::<LE>()?;
        let mut targets = Vec::with_capacity(num_targets.min(1 << 20) as usize);
        let mut name_to_id: BTreeMap<String, TargetId> = BTreeMap::new();
        for id in 0..num_targets {
            let name = read_string(&mut r)?;
            let filename = read_string(&mut r)?;
            let index = r.read_u64::<LE>()?;
            let windows = r.read_u64::<LE>()?;
            name_to_id.insert(name.clone(), id as TargetId);
            targets.push(Target {
                name,
                source: FileSource { filename, index, windows },
                header: String::new(),
                seq: Vec::new(),
            });
        }

        let mut map = HashMultimap::new(target_cfg.seed);
        map.set_max_load_factor(max_load_factor);

        if scope != Scope::MetadataOnly {
            let num_buckets = r.read_u64::<LE>()?;
            let mut locs: Vec<Location> = Vec::new();
            for _ in 0..num_buckets {
                let feature = r.read_u32::<LE>()?;
                let size = r.read_u8()? as usize;
                locs.clear();
                for _ in 0..size {
                    let tgt = r.read_u32::<LE>()?;
                    let win = r.read_u32::<LE>()?;
                    locs.push(Location::new(tgt, win));
                }
                map.insert_bucket(feature, &locs);
            }
            info!(
                "loaded database: {} targets, {} features, {} locations",
                targets.len(),
                map.key_count(),
                map.value_count()
            );
        } else {
            info!("loaded database metadata: {} targets", targets.len());
        }

        let mut db = Database::with_sketchers(
            Sketcher::new(target_cfg),
            Sketcher::new(query_cfg),
        )?;
        db.max_locs_per_feature = max_locs.clamp(1, max_supported_locations_per_feature());
        db.features = Arc::new(RwLock::new(map));
        db.targets = targets;
        db.name_to_id = name_to_id;
        Ok(db)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matches::MatchesSorter;

    fn small_config() -> SketcherConfig {
        SketcherConfig {
            kmerlen: 5,
            sketchlen: 4,
            winlen: 16,
            winstride: 4,
            ..SketcherConfig::default()
        }
    }

    fn seq(n: usize, salt: usize) -> Vec<u8> {
        let bases = b"ACGTTGCAACGGTACTGATC";
        (0..n)
            .map(|i| bases[(i * 7 + i / 3 + salt * 11) % bases.len()])
            .collect()
    }

    fn build_db() -> Database {
        let mut db = Database::new(small_config()).unwrap();
        db.add_target(&seq(64, 0), "ref0", FileSource {
            filename: "refs.fa".into(),
            index: 0,
            windows: 0,
        })
        .unwrap();
        db.add_target(&seq(64, 1), "ref1", FileSource {
            filename: "refs.fa".into(),
            index: 1,
            windows: 0,
        })
        .unwrap();
        db.wait_until_add_target_complete().unwrap();
        db
    }

    #[test]
    fn test_header_roundtrip() {
        let header = DatabaseFileHeader::current();
        let mut buf = Vec::new();
        header.write(&mut buf).unwrap();
        let back = DatabaseFileHeader::read(&mut buf.as_slice()).unwrap();
        assert_eq!(header, back);
    }

    #[test]
    fn test_bad_magic_is_refused() {
        let mut buf = Vec::new();
        DatabaseFileHeader::current().write(&mut buf).unwrap();
        buf[0] ^= 0xff;
        let err = DatabaseFileHeader::read(&mut buf.as_slice()).unwrap_err();
        assert!(matches!(err, DatabaseError::InvalidFormat(_)));
    }

    #[test]
    fn test_wrong_version_is_refused() {
        let mut buf = Vec::new();
        let mut header = DatabaseFileHeader::current();
        header.version = DB_FORMAT_VERSION + 1;
        header.write(&mut buf).unwrap();
        let err = DatabaseFileHeader::read(&mut buf.as_slice()).unwrap_err();
        assert!(matches!(err, DatabaseError::UnsupportedVersion { .. }));
    }

    #[test]
    fn test_wrong_widths_are_refused() {
        let mut buf = Vec::new();
        let mut header = DatabaseFileHeader::current();
        header.bucket_size_bits *= 2;
        header.write(&mut buf).unwrap();
        let err = DatabaseFileHeader::read(&mut buf.as_slice()).unwrap_err();
        assert!(matches!(err, DatabaseError::IncompatibleWidths));
    }

    #[test]
    fn test_database_roundtrip() {
        let db = build_db();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        db.write_file(&path).unwrap();

        let db2 = Database::read_file(&path, Scope::Everything).unwrap();
        assert_eq!(db2.target_count(), db.target_count());
        assert_eq!(db2.feature_count(), db.feature_count());
        assert_eq!(db2.location_count(), db.location_count());
        assert_eq!(db2.max_locations_per_feature(), db.max_locations_per_feature());
        assert_eq!(db2.target_sketcher().config(), db.target_sketcher().config());
        assert_eq!(db2.target_with_name("ref1"), Some(1));

        // per-feature location multisets agree
        let orig = db.read_features();
        let loaded = db2.read_features();
        let mut checked = 0;
        orig.for_each_bucket(|feature, locs| {
            let slot = loaded.find(feature).expect("feature lost in round-trip");
            assert_eq!(loaded.locations(slot), locs);
            checked += 1;
        });
        assert!(checked > 0);
    }

    #[test]
    fn test_metadata_only_scope_skips_feature_map() {
        let db = build_db();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        db.write_file(&path).unwrap();

        let db2 = Database::read_file(&path, Scope::MetadataOnly).unwrap();
        assert_eq!(db2.target_count(), 2);
        assert_eq!(db2.feature_count(), 0);
        assert_eq!(db2.location_count(), 0);
    }

    #[test]
    fn test_truncated_file_is_invalid() {
        let db = build_db();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        db.write_file(&path).unwrap();

        let data = std::fs::read(&path).unwrap();
        let cut = data.len() / 2;
        std::fs::write(&path, &data[..cut]).unwrap();
        assert!(Database::read_file(&path, Scope::Everything).is_err());
    }

    #[test]
    fn test_loaded_database_answers_queries() {
        let db = build_db();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        db.write_file(&path).unwrap();

        let db2 = Database::read_file(&path, Scope::Everything).unwrap();
        let query = seq(64, 0);

        let mut a = MatchesSorter::new();
        let mut b = MatchesSorter::new();
        db.accumulate_matches(&query, &mut a);
        db2.accumulate_matches(&query, &mut b);
        a.sort();
        b.sort();
        assert_eq!(a.locations(), b.locations());
        assert!(!a.is_empty());
    }
}
