//! Sequence input: FASTA/FASTQ reading, directory expansion, pairing.
//!
//! Reading goes through needletail, which transparently decompresses
//! gzipped files. Every record carries its index within its file so that
//! targets can be located again later (see `Database::reread_targets`).

use anyhow::{Context, Result};
use needletail::parse_fastx_file;
use std::path::{Path, PathBuf};

use crate::constants::MAX_DIR_DEPTH;

/// One sequence record with its position in the source file
#[derive(Clone, Debug)]
pub struct SequenceRecord {
    /// 0-based record index within the file
    pub index: u64,
    /// Full header line (without '>' / '@')
    pub header: String,
    /// Raw sequence bytes
    pub seq: Vec<u8>,
}

/// First whitespace-delimited token of a header; used as target name
pub fn accession_of(header: &str) -> &str {
    header.split_whitespace().next().unwrap_or(header)
}

/// Call `f` for every record of a FASTA/FASTQ file, in file order.
/// Stops early when `f` returns false.
pub fn for_each_record<P, F>(path: P, mut f: F) -> Result<()>
where
    P: AsRef<Path>,
    F: FnMut(SequenceRecord) -> bool,
{
    let path = path.as_ref();
    let mut reader = parse_fastx_file(path)
        .with_context(|| format!("failed to open sequence file: {}", path.display()))?;

    let mut index = 0u64;
    while let Some(record) = reader.next() {
        let record = record
            .with_context(|| format!("failed to parse record {} in {}", index, path.display()))?;
        let rec = SequenceRecord {
            index,
            header: String::from_utf8_lossy(record.id()).into_owned(),
            seq: record.seq().into_owned(),
        };
        if !f(rec) {
            break;
        }
        index += 1;
    }
    Ok(())
}

/// Replace directories by the files they contain (searched up to
/// [`MAX_DIR_DEPTH`] levels deep); plain files pass through. The result
/// is sorted for reproducible ingestion order.
pub fn expand_input_paths(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut out = Vec::with_capacity(paths.len());
    for path in paths {
        if path.is_dir() {
            collect_files(path, 0, &mut out);
        } else {
            out.push(path.clone());
        }
    }
    out.sort();
    out
}

fn collect_files(dir: &Path, depth: usize, out: &mut Vec<PathBuf>) {
    if depth >= MAX_DIR_DEPTH {
        return;
    }
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, depth + 1, out);
        } else {
            out.push(path);
        }
    }
}

/// How reads pair up into queries
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PairingMode {
    /// Every record is its own query
    #[default]
    None,
    /// Record n of file 2m pairs with record n of file 2m+1
    Files,
    /// Consecutive records (1+2, 3+4, ...) of one file pair up
    Sequences,
}

/// One query: a read, or a read pair
#[derive(Clone, Debug)]
pub struct QueryRecord {
    /// Header of the (first) read
    pub header: String,
    /// First read
    pub seq: Vec<u8>,
    /// Second read of a pair
    pub mate: Option<Vec<u8>>,
}

/// Read all queries from `files` according to the pairing mode.
/// `limit` caps the number of queries taken per file (0 = no limit).
/// In `Files` mode the caller is expected to have sorted the file list.
pub fn read_queries(
    files: &[PathBuf],
    pairing: PairingMode,
    limit: usize,
) -> Result<Vec<QueryRecord>> {
    let mut queries = Vec::new();

    match pairing {
        PairingMode::None => {
            for file in files {
                let mut taken = 0usize;
                for_each_record(file, |rec| {
                    queries.push(QueryRecord { header: rec.header, seq: rec.seq, mate: None });
                    taken += 1;
                    limit == 0 || taken < limit
                })?;
            }
        }
        PairingMode::Sequences => {
            for file in files {
                let mut pending: Option<SequenceRecord> = None;
                let mut taken = 0usize;
                for_each_record(file, |rec| {
                    match pending.take() {
                        None => pending = Some(rec),
                        Some(first) => {
                            queries.push(QueryRecord {
                                header: first.header,
                                seq: first.seq,
                                mate: Some(rec.seq),
                            });
                            taken += 1;
                        }
                    }
                    limit == 0 || taken < limit
                })?;
                if let Some(first) = pending {
                    // odd record count: last read stays unpaired
                    queries.push(QueryRecord { header: first.header, seq: first.seq, mate: None });
                }
            }
        }
        PairingMode::Files => {
            for pair in files.chunks(2) {
                if pair.len() < 2 {
                    let mut taken = 0usize;
                    for_each_record(&pair[0], |rec| {
                        queries.push(QueryRecord { header: rec.header, seq: rec.seq, mate: None });
                        taken += 1;
                        limit == 0 || taken < limit
                    })?;
                    continue;
                }
                let mut first_reads = Vec::new();
                let mut taken = 0usize;
                for_each_record(&pair[0], |rec| {
                    first_reads.push(rec);
                    taken += 1;
                    limit == 0 || taken < limit
                })?;
                let mut i = 0usize;
                for_each_record(&pair[1], |rec| {
                    if i < first_reads.len() {
                        let first = &mut first_reads[i];
                        queries.push(QueryRecord {
                            header: std::mem::take(&mut first.header),
                            seq: std::mem::take(&mut first.seq),
                            mate: Some(rec.seq),
                        });
                    } else {
                        queries.push(QueryRecord { header: rec.header, seq: rec.seq, mate: None });
                    }
                    i += 1;
                    limit == 0 || i < limit
                })?;
                // mates missing in file 2: keep the remaining reads unpaired
                for first in first_reads.drain(..).skip(i) {
                    queries.push(QueryRecord {
                        header: first.header,
                        seq: first.seq,
                        mate: None,
                    });
                }
            }
        }
    }

    Ok(queries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn fasta(records: &[(&str, &str)]) -> NamedTempFile {
        let mut f = tempfile::Builder::new().suffix(".fa").tempfile().unwrap();
        for (h, s) in records {
            writeln!(f, ">{}", h).unwrap();
            writeln!(f, "{}", s).unwrap();
        }
        f.flush().unwrap();
        f
    }

    #[test]
    fn test_for_each_record_indices() {
        let f = fasta(&[("r1 descr", "ACGT"), ("r2", "TTTT")]);
        let mut seen = Vec::new();
        for_each_record(f.path(), |rec| {
            seen.push((rec.index, rec.header.clone(), rec.seq.clone()));
            true
        })
        .unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, 0);
        assert_eq!(seen[0].1, "r1 descr");
        assert_eq!(seen[0].2, b"ACGT");
        assert_eq!(seen[1].0, 1);
    }

    #[test]
    fn test_accession_of() {
        assert_eq!(accession_of("chr1 Homo sapiens"), "chr1");
        assert_eq!(accession_of("read_7"), "read_7");
    }

    #[test]
    fn test_pairing_by_sequences() {
        let f = fasta(&[("a", "AAAA"), ("b", "CCCC"), ("c", "GGGG")]);
        let queries =
            read_queries(&[f.path().to_path_buf()], PairingMode::Sequences, 0).unwrap();
        assert_eq!(queries.len(), 2);
        assert_eq!(queries[0].header, "a");
        assert_eq!(queries[0].mate.as_deref(), Some(b"CCCC".as_slice()));
        assert_eq!(queries[1].header, "c");
        assert!(queries[1].mate.is_none());
    }

    #[test]
    fn test_pairing_by_files() {
        let f1 = fasta(&[("a", "AAAA"), ("b", "CCCC")]);
        let f2 = fasta(&[("a2", "TTTT"), ("b2", "GGGG")]);
        let queries = read_queries(
            &[f1.path().to_path_buf(), f2.path().to_path_buf()],
            PairingMode::Files,
            0,
        )
        .unwrap();
        assert_eq!(queries.len(), 2);
        assert_eq!(queries[0].header, "a");
        assert_eq!(queries[0].seq, b"AAAA");
        assert_eq!(queries[0].mate.as_deref(), Some(b"TTTT".as_slice()));
    }

    #[test]
    fn test_query_limit_per_file() {
        let f = fasta(&[("a", "AAAA"), ("b", "CCCC"), ("c", "GGGG")]);
        let queries = read_queries(&[f.path().to_path_buf()], PairingMode::None, 2).unwrap();
        assert_eq!(queries.len(), 2);
    }

    #[test]
    fn test_expand_input_paths() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        std::fs::write(dir.path().join("a.fa"), ">x\nACGT\n").unwrap();
        std::fs::write(sub.join("b.fa"), ">y\nACGT\n").unwrap();

        let files = expand_input_paths(&[dir.path().to_path_buf()]);
        assert_eq!(files.len(), 2);
        assert!(files.iter().any(|p| p.ends_with("a.fa")));
        assert!(files.iter().any(|p| p.ends_with("sub/b.fa")));
    }
}
