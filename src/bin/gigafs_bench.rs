//! Create-throughput benchmark for the metadata plane.
//!
//! Drives N file creates from T threads, each thread under its own parent
//! directory, either against remote servers (`--uri`) or an embedded engine
//! (`--db`). The `batch` workload goes through the batched-create path; the
//! `creates` workload issues one RPC per file.
//!
//! Usage:
//!   gigafs_bench --bench creates --threads 4 --num 100000 --db /tmp/bench
//!   gigafs_bench --bench batch --num 1000000 --uri host0:50128,host1:50128

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;

use gigafs::client::{FilesystemCli, FilesystemCliOptions};
use gigafs::db::{FilesystemDbOptions, FjallDb, DB_ENV_PREFIX};
use gigafs::logging;
use gigafs::server::{FilesystemOptions, MetadataEngine};
use gigafs::types::User;

/// GigaFS metadata benchmark
#[derive(Parser)]
#[command(name = "gigafs_bench")]
#[command(about = "Benchmark bursty file creation against the metadata plane")]
struct Args {
    /// Workload: "creates" (one RPC per file) or "batch" (batched creates)
    #[arg(long, default_value = "creates")]
    bench: String,

    /// Number of client threads
    #[arg(long, default_value_t = 1)]
    threads: u32,

    /// Total number of files to create
    #[arg(long, default_value_t = 10_000)]
    num: u32,

    /// Print a per-operation latency histogram (0|1)
    #[arg(long, default_value_t = 0)]
    histogram: u8,

    /// Comma-separated server addresses; omit to run embedded
    #[arg(long)]
    uri: Option<String>,

    /// Store directory for the embedded engine
    #[arg(long, default_value = "/tmp/gigafs/bench-db")]
    db: PathBuf,

    /// Bloom filter bits per key for the embedded store
    #[arg(long = "bloom_bits", default_value_t = 12)]
    bloom_bits: u32,

    /// Block cache size in bytes for the embedded store
    #[arg(long = "cache_size", default_value_t = 8 << 20)]
    cache_size: u64,

    /// Keep an existing store instead of starting fresh (0|1)
    #[arg(long = "use_existing_db", default_value_t = 0)]
    use_existing_db: u8,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,
}

/// Power-of-two latency histogram, microseconds.
#[derive(Default)]
struct Histogram {
    buckets: [u64; 32],
}

impl Histogram {
    fn record(&mut self, latency: Duration) {
        let micros = latency.as_micros().max(1) as u64;
        let bucket = (63 - micros.leading_zeros() as usize).min(self.buckets.len() - 1);
        self.buckets[bucket] += 1;
    }

    fn merge(&mut self, other: &Histogram) {
        for (mine, theirs) in self.buckets.iter_mut().zip(other.buckets.iter()) {
            *mine += theirs;
        }
    }

    fn print(&self) {
        let total: u64 = self.buckets.iter().sum();
        if total == 0 {
            return;
        }
        println!("latency histogram (us):");
        let mut cumulative = 0u64;
        for (i, count) in self.buckets.iter().enumerate() {
            if *count == 0 {
                continue;
            }
            cumulative += count;
            println!(
                "  [{:>9} - {:>9}) {:>10}  {:>6.2}%  cum {:>6.2}%",
                1u64 << i,
                1u64 << (i + 1),
                count,
                *count as f64 * 100.0 / total as f64,
                cumulative as f64 * 100.0 / total as f64,
            );
        }
    }
}

struct WorkerResult {
    created: u32,
    histogram: Histogram,
}

fn run_worker(
    cli: &FilesystemCli,
    who: &User,
    thread_id: u32,
    count: u32,
    batched: bool,
    record_latency: bool,
) -> Result<WorkerResult, gigafs::error::FsError> {
    let parent = format!("/bench-{thread_id}");
    cli.mkdir(who, None, &parent, 0o777)?;
    let mut histogram = Histogram::default();

    if batched {
        let batch = cli.batch_start(who, None, &parent, 0o660)?;
        for i in 0..count {
            let started = record_latency.then(Instant::now);
            cli.batch_creat(&batch, &format!("f{i}"))?;
            if let Some(started) = started {
                histogram.record(started.elapsed());
            }
        }
        cli.batch_commit(&batch)?;
        cli.batch_end(batch)?;
    } else {
        for i in 0..count {
            let started = record_latency.then(Instant::now);
            cli.mkfle(who, None, &format!("{parent}/f{i}"), 0o660)?;
            if let Some(started) = started {
                histogram.record(started.elapsed());
            }
        }
    }
    Ok(WorkerResult {
        created: count,
        histogram,
    })
}

fn build_client(args: &Args) -> Result<FilesystemCli, Box<dyn std::error::Error>> {
    let mut options = FilesystemCliOptions::default();
    match &args.uri {
        Some(uri) => {
            let addrs: Vec<String> = uri.split(',').map(str::to_string).collect();
            options.dir_index.num_servers = addrs.len() as u32;
            options.dir_index.num_virtual_servers = addrs.len() as u32;
            Ok(FilesystemCli::open_rpc(addrs, options)?)
        }
        None => {
            if args.use_existing_db == 0 && args.db.exists() {
                std::fs::remove_dir_all(&args.db)?;
            }
            std::fs::create_dir_all(&args.db)?;
            let mut db_options = FilesystemDbOptions {
                filter_bits_per_key: args.bloom_bits,
                block_cache_size: args.cache_size,
                ..FilesystemDbOptions::default()
            };
            db_options.read_from_env(DB_ENV_PREFIX);
            let db = Arc::new(FjallDb::open(&args.db, &db_options)?);
            let engine = MetadataEngine::open(db, FilesystemOptions::default())?;
            Ok(FilesystemCli::open_local(engine, options)?)
        }
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    logging::init(&args.log_level);
    let batched = match args.bench.as_str() {
        "creates" => false,
        "batch" => true,
        other => return Err(format!("unknown benchmark: {other}").into()),
    };
    let threads = args.threads.max(1);
    let per_thread = args.num / threads;
    let record_latency = args.histogram != 0;

    let cli = Arc::new(build_client(&args)?);
    let who = User::new(1, 1);

    println!(
        "gigafs_bench: {} x {} threads ({} per thread), workload={}",
        args.num, threads, per_thread, args.bench
    );
    let started = Instant::now();
    let mut results = Vec::new();
    std::thread::scope(|scope| {
        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let cli = cli.clone();
                scope.spawn(move || run_worker(&cli, &who, t, per_thread, batched, record_latency))
            })
            .collect();
        for handle in handles {
            results.push(handle.join().expect("worker panicked"));
        }
    });
    let elapsed = started.elapsed();

    let mut created = 0u64;
    let mut histogram = Histogram::default();
    for result in results {
        let result = result?;
        created += result.created as u64;
        histogram.merge(&result.histogram);
    }

    let rate = created as f64 / elapsed.as_secs_f64();
    println!(
        "created {} files in {:.3}s: {:.0} creates/s",
        created,
        elapsed.as_secs_f64(),
        rate
    );
    if record_latency {
        histogram.print();
    }
    Ok(())
}

fn main() {
    let args = Args::parse();
    if let Err(e) = run(args) {
        eprintln!("gigafs_bench: {e}");
        std::process::exit(1);
    }
}
