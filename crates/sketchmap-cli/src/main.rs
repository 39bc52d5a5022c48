use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use sketchmap_lib::classify::{self, ClassifyOptions, PerformanceOptions};
use sketchmap_lib::input::{self, PairingMode};
use sketchmap_lib::{Conversion, Database, DatabaseError, FileSource, Scope, SketcherConfig};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "sketchmap")]
#[command(version)]
#[command(about = "Map 3N-converted reads to reference windows via min-hash sketches", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Default)]
struct SketchingArgs {
    /// Number of bases per k-mer
    #[arg(long)]
    kmerlen: Option<usize>,

    /// Number of features (k-mer hashes) per sampling window
    #[arg(long)]
    sketchlen: Option<usize>,

    /// Number of bases per sampling window
    #[arg(long)]
    winlen: Option<usize>,

    /// Distance between window start positions (default: winlen - kmerlen + 1)
    #[arg(long)]
    winstride: Option<usize>,

    /// Nucleotide conversion original -> replacement, e.g. for BS-seq: --conv C T
    #[arg(long, num_args = 2, value_names = ["ORIG", "REPL"])]
    conv: Option<Vec<char>>,
}

impl SketchingArgs {
    /// Overlay these flags onto a base configuration
    fn apply(&self, mut cfg: SketcherConfig) -> Result<SketcherConfig> {
        if let Some(k) = self.kmerlen {
            cfg.kmerlen = k;
        }
        if let Some(m) = self.sketchlen {
            cfg.sketchlen = m;
        }
        if let Some(w) = self.winlen {
            cfg.winlen = w;
        }
        match self.winstride {
            Some(s) => cfg.winstride = s,
            None => {
                if self.winlen.is_some() || self.kmerlen.is_some() {
                    cfg.winstride = cfg.winlen.saturating_sub(cfg.kmerlen) + 1;
                }
            }
        }
        if let Some(pair) = &self.conv {
            cfg.conversion = Conversion::new(pair[0], pair[1])?;
        }
        cfg.validate().map_err(|e| anyhow!(e))?;
        Ok(cfg)
    }

    fn any_set(&self) -> bool {
        self.kmerlen.is_some()
            || self.sketchlen.is_some()
            || self.winlen.is_some()
            || self.winstride.is_some()
            || self.conv.is_some()
    }
}

#[derive(Args, Debug, Default)]
struct StorageArgs {
    /// Maximum number of reference locations stored per feature
    #[arg(long = "max-locations-per-feature")]
    max_locations_per_feature: Option<usize>,

    /// Remove all features that reached the per-feature location cap
    #[arg(long = "remove-overpopulated-features")]
    remove_overpopulated_features: bool,

    /// Remove features occurring in more than this many distinct references
    #[arg(long = "max-ambig-per-feature")]
    max_ambig_per_feature: Option<usize>,

    /// Maximum hash table load factor
    #[arg(long = "max-load-factor", alias = "max-load-fac")]
    max_load_factor: Option<f32>,
}

impl StorageArgs {
    fn apply(&self, db: &mut Database) {
        if let Some(cap) = self.max_locations_per_feature {
            db.set_max_locations_per_feature(cap);
        }
        if let Some(lf) = self.max_load_factor {
            db.set_max_load_factor(lf);
        }
    }

    fn prune(&self, db: &mut Database) {
        if self.remove_overpopulated_features {
            let cap = db.max_locations_per_feature();
            db.remove_features_with_more_locations_than(cap);
        }
        if let Some(maxambig) = self.max_ambig_per_feature {
            db.remove_ambiguous_features(maxambig);
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum InfoMode {
    /// List reference sequence metadata
    Targets,
    /// Hash table and location list statistics
    Statistics,
    /// Dump the feature -> locations map
    Locations,
    /// Dump per-feature location counts
    Featurecounts,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a database from reference sequence files
    Build {
        /// Database file to create (".db" is appended if missing)
        database: String,

        /// FASTA/FASTQ files or directories (searched up to 10 levels deep)
        #[arg(required = true)]
        infiles: Vec<PathBuf>,

        #[command(flatten)]
        sketching: SketchingArgs,

        #[command(flatten)]
        storage: StorageArgs,
    },

    /// Map reads against a database
    Query {
        /// Database file
        database: String,

        /// FASTA/FASTQ files or directories with reads to map
        #[arg(required = true)]
        infiles: Vec<PathBuf>,

        /// Redirect mapping output to a file (default: stdout)
        #[arg(long)]
        out: Option<PathBuf>,

        /// Emit SAM instead of the default mapping format
        #[arg(long)]
        sam: bool,

        /// Emit SAM to a file in addition to the default output
        #[arg(long = "with-sam-out")]
        with_sam_out: Option<PathBuf>,

        /// Discard candidates with fewer hits
        #[arg(long = "hitmin", alias = "hit-min")]
        hitmin: Option<u64>,

        /// Maximum number of candidates per query
        #[arg(long = "maxcand", alias = "max-cand")]
        maxcand: Option<usize>,

        /// Discard candidates below this fraction of the top candidate's
        /// hits (values > 1 are read as percentages)
        #[arg(long = "hit-cutoff", alias = "cutoff")]
        hit_cutoff: Option<f64>,

        /// Discard candidates covering less than this fraction of the
        /// query windows (values > 1 are read as percentages)
        #[arg(long = "cov-min", alias = "covmin")]
        cov_min: Option<f64>,

        /// Worker threads (0 = all cores)
        #[arg(long)]
        threads: Option<usize>,

        /// Queries per worker batch
        #[arg(long = "batch-size", alias = "batchsize")]
        batch_size: Option<usize>,

        /// Map at most this many queries per input file (0 = all)
        #[arg(long = "query-limit", alias = "querylimit")]
        query_limit: Option<usize>,

        /// Pair reads across consecutive files (sorted by name)
        #[arg(long = "pairfiles", alias = "pair-files")]
        pairfiles: bool,

        /// Pair consecutive reads within each file
        #[arg(long = "pairseq", alias = "pair-seq")]
        pairseq: bool,

        /// Maximum insert size of read pairs
        #[arg(long = "insertsize", alias = "insert-size")]
        insertsize: Option<usize>,

        /// Do not list unmapped reads
        #[arg(long = "mapped-only", alias = "mappedonly")]
        mapped_only: bool,

        #[command(flatten)]
        sketching: SketchingArgs,

        #[command(flatten)]
        storage: StorageArgs,
    },

    /// Show information stored in a database
    Info {
        /// Database file
        database: String,

        /// What to show (omit for basic properties)
        #[arg(value_enum)]
        mode: Option<InfoMode>,

        /// Restrict `targets` output to these names
        names: Vec<String>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Commands::Build { database, infiles, sketching, storage } => {
            build_command(&database, infiles, sketching, storage)
        }
        Commands::Query {
            database,
            infiles,
            out,
            sam,
            with_sam_out,
            hitmin,
            maxcand,
            hit_cutoff,
            cov_min,
            threads,
            batch_size,
            query_limit,
            pairfiles,
            pairseq,
            insertsize,
            mapped_only,
            sketching,
            storage,
        } => query_command(QueryArgs {
            database,
            infiles,
            out,
            sam,
            with_sam_out,
            hitmin,
            maxcand,
            hit_cutoff,
            cov_min,
            threads,
            batch_size,
            query_limit,
            pairfiles,
            pairseq,
            insertsize,
            mapped_only,
            sketching,
            storage,
        }),
        Commands::Info { database, mode, names } => info_command(&database, mode, &names),
    }
}

/// Database filename with the conventional extension
fn sanitize_database_name(name: &str) -> String {
    if name.contains(".db") {
        name.to_string()
    } else {
        format!("{name}.db")
    }
}

fn build_command(
    database: &str,
    infiles: Vec<PathBuf>,
    sketching: SketchingArgs,
    storage: StorageArgs,
) -> Result<()> {
    let dbfile = sanitize_database_name(database);
    let cfg = sketching.apply(SketcherConfig::default())?;
    info!(
        "building database {} (k={}, sketchlen={}, winlen={}, winstride={}, conv {}->{})",
        dbfile,
        cfg.kmerlen,
        cfg.sketchlen,
        cfg.winlen,
        cfg.winstride,
        cfg.conversion.orig as char,
        cfg.conversion.repl as char,
    );

    let files = input::expand_input_paths(&infiles);
    if files.is_empty() {
        bail!("no reference sequence files provided or found");
    }

    let mut db = Database::new(cfg)?;
    storage.apply(&mut db);

    for file in &files {
        info!("reading {}", file.display());
        let filename = file.display().to_string();
        let mut failure: Option<DatabaseError> = None;
        input::for_each_record(file, |rec| {
            let name = input::accession_of(&rec.header).to_string();
            let source = FileSource { filename: filename.clone(), index: rec.index, windows: 0 };
            match db.add_target(&rec.seq, &name, source) {
                Ok(true) => {}
                Ok(false) => warn!("skipping duplicate or unnamed target '{name}'"),
                Err(e) => {
                    failure = Some(e);
                    return false;
                }
            }
            !db.add_target_failed()
        })?;
        if let Some(e) = failure {
            return Err(e.into());
        }
    }
    db.wait_until_add_target_complete()?;

    storage.prune(&mut db);
    db.write_file(&dbfile)?;

    let stats = db.location_list_size_statistics();
    info!(
        "done: {} targets, {} features, {} locations (locations/feature: mean {:.2}, max {})",
        db.target_count(),
        db.feature_count(),
        db.location_count(),
        stats.mean(),
        stats.max(),
    );
    Ok(())
}

struct QueryArgs {
    database: String,
    infiles: Vec<PathBuf>,
    out: Option<PathBuf>,
    sam: bool,
    with_sam_out: Option<PathBuf>,
    hitmin: Option<u64>,
    maxcand: Option<usize>,
    hit_cutoff: Option<f64>,
    cov_min: Option<f64>,
    threads: Option<usize>,
    batch_size: Option<usize>,
    query_limit: Option<usize>,
    pairfiles: bool,
    pairseq: bool,
    insertsize: Option<usize>,
    mapped_only: bool,
    sketching: SketchingArgs,
    storage: StorageArgs,
}

fn query_command(args: QueryArgs) -> Result<()> {
    let dbfile = sanitize_database_name(&args.database);
    info!("loading database {dbfile}");
    let mut db = Database::read_file(&dbfile, Scope::Sketches)?;
    args.storage.apply(&mut db);
    args.storage.prune(&mut db);

    if args.sketching.any_set() {
        let cfg = args.sketching.apply(*db.query_sketcher().config())?;
        db.set_query_sketcher(sketchmap_lib::Sketcher::new(cfg))?;
    }

    let need_sam = args.sam || args.with_sam_out.is_some();
    if need_sam {
        info!("re-reading target sequences for SAM output");
        db.reread_targets()?;
    }

    let mut opts = ClassifyOptions::default();
    if let Some(v) = args.hitmin {
        opts.hits_min = v;
    }
    if let Some(v) = args.maxcand {
        opts.max_candidates = if v == 0 { usize::MAX } else { v };
    }
    if let Some(mut v) = args.hit_cutoff {
        // numbers > 1 are percentages
        if v > 1.0 {
            v *= 0.01;
        }
        opts.hits_cutoff = v;
    }
    if let Some(mut v) = args.cov_min {
        if v > 1.0 {
            v *= 0.01;
        }
        opts.cov_min = v;
    }
    if let Some(v) = args.insertsize {
        opts.insert_size_max = v;
    }

    let perf = PerformanceOptions {
        threads: args.threads.unwrap_or(0),
        batch_size: args.batch_size.unwrap_or(1024).max(1),
    };

    let mut files = input::expand_input_paths(&args.infiles);
    if files.is_empty() {
        bail!("no query sequence files provided or found");
    }
    let mut pairing = if args.pairfiles {
        PairingMode::Files
    } else if args.pairseq {
        PairingMode::Sequences
    } else {
        PairingMode::None
    };
    if pairing == PairingMode::Files {
        if files.len() > 1 {
            files.sort();
        } else {
            warn!("pairing by files needs at least two input files; reading unpaired");
            pairing = PairingMode::None;
        }
    }

    let queries = input::read_queries(&files, pairing, args.query_limit.unwrap_or(0))?;
    info!("mapping {} queries", queries.len());
    let mappings = classify::map_queries(&db, &queries, &opts, &perf)?;

    if args.sam {
        let mut out = open_output(args.out.as_deref())?;
        classify::write_sam(&mut out, &db, &queries, &mappings)?;
        out.flush()?;
    } else {
        let mut out = open_output(args.out.as_deref())?;
        classify::write_mappings(&mut out, &db, &mappings, !args.mapped_only)?;
        let summary = classify::summarize(&mappings);
        writeln!(out, "# queries: {} mapped: {}", summary.total, summary.mapped)?;
        out.flush()?;
    }
    if let Some(path) = &args.with_sam_out {
        let mut out = BufWriter::new(
            std::fs::File::create(path)
                .with_context(|| format!("cannot create {}", path.display()))?,
        );
        classify::write_sam(&mut out, &db, &queries, &mappings)?;
        out.flush()?;
    }
    Ok(())
}

fn open_output(path: Option<&std::path::Path>) -> Result<Box<dyn Write>> {
    match path {
        Some(p) => {
            let f = std::fs::File::create(p)
                .with_context(|| format!("cannot create {}", p.display()))?;
            Ok(Box::new(BufWriter::new(f)))
        }
        None => Ok(Box::new(BufWriter::new(std::io::stdout()))),
    }
}

fn info_command(database: &str, mode: Option<InfoMode>, names: &[String]) -> Result<()> {
    let dbfile = sanitize_database_name(database);
    let scope = match mode {
        None | Some(InfoMode::Targets) => Scope::MetadataOnly,
        _ => Scope::Sketches,
    };
    let db = Database::read_file(&dbfile, scope)?;
    let stdout = std::io::stdout();
    let mut out = BufWriter::new(stdout.lock());

    match mode {
        None => {
            let cfg = db.target_sketcher().config();
            writeln!(out, "database: {dbfile}")?;
            writeln!(out, "targets: {}", db.target_count())?;
            writeln!(out, "kmerlen: {}", cfg.kmerlen)?;
            writeln!(out, "sketchlen: {}", cfg.sketchlen)?;
            writeln!(out, "winlen: {}", cfg.winlen)?;
            writeln!(out, "winstride: {}", cfg.winstride)?;
            writeln!(
                out,
                "conversion: {} -> {}",
                cfg.conversion.orig as char, cfg.conversion.repl as char
            )?;
            writeln!(out, "hash seed: {}", cfg.seed)?;
            writeln!(
                out,
                "max locations per feature: {}",
                db.max_locations_per_feature()
            )?;
        }
        Some(InfoMode::Targets) => {
            for id in 0..db.target_count() {
                let target = match db.get_target(id as u32) {
                    Some(t) => t,
                    None => continue,
                };
                if !names.is_empty() && !names.iter().any(|n| n == target.name()) {
                    continue;
                }
                writeln!(
                    out,
                    "{}\t{}\t{}\t{}\t{} windows",
                    id,
                    target.name(),
                    target.source().filename,
                    target.source().index,
                    target.source().windows,
                )?;
            }
        }
        Some(InfoMode::Statistics) => {
            let stats = db.location_list_size_statistics();
            writeln!(out, "buckets: {}", db.bucket_count())?;
            writeln!(out, "features: {}", db.feature_count())?;
            writeln!(out, "dead features: {}", db.dead_feature_count())?;
            writeln!(out, "locations: {}", db.location_count())?;
            writeln!(
                out,
                "locations/feature: mean {:.3} stddev {:.3} min {} max {}",
                stats.mean(),
                stats.stddev(),
                stats.min(),
                stats.max(),
            )?;
        }
        Some(InfoMode::Locations) => db.print_feature_map(&mut out)?,
        Some(InfoMode::Featurecounts) => db.print_feature_counts(&mut out)?,
    }
    out.flush()?;
    Ok(())
}
