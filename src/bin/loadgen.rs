//! LatticeKV Load Generator
//!
//! Loads `KEY1..KEYn`, verifies the data with point reads and a full scan,
//! optionally deletes a prefix of the keys, and reports block and memory
//! statistics.

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use clap::{Parser, ValueEnum};
use latticekv::{CodecType, Config, Engine, LatticeError};
use tracing_subscriber::{fmt, EnvFilter};

/// LatticeKV load generator
#[derive(Parser, Debug)]
#[command(name = "latticekv-loadgen")]
#[command(about = "Load, verify and trim an in-memory LatticeKV engine")]
#[command(version)]
struct Args {
    /// Number of keys to load
    #[arg(short = 'n', long, default_value = "1000")]
    count: u64,

    /// Number of keys to delete after loading (KEY1..KEYd)
    #[arg(short, long, default_value = "0")]
    delete: u64,

    /// Maximum data block size in bytes
    #[arg(short, long, default_value = "4096")]
    block_size: usize,

    /// Block codec
    #[arg(short, long, value_enum, default_value = "none")]
    codec: CodecArg,

    /// Writer threads
    #[arg(short, long, default_value = "1")]
    threads: u64,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CodecArg {
    None,
    Lz4,
}

impl From<CodecArg> for CodecType {
    fn from(arg: CodecArg) -> Self {
        match arg {
            CodecArg::None => CodecType::None,
            CodecArg::Lz4 => CodecType::Lz4,
        }
    }
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,latticekv=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();
    tracing::info!("LatticeKV loadgen v{}", latticekv::VERSION);

    if let Err(e) = run(&args) {
        tracing::error!("Load failed: {}", e);
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), LatticeError> {
    let config = Config::builder()
        .max_block_size(args.block_size)
        .codec(args.codec.into())
        .build();
    let engine = Arc::new(Engine::open(config)?);

    // Load
    let started = Instant::now();
    let threads = args.threads.max(1);
    let per_thread = args.count.div_ceil(threads);
    let mut handles = Vec::new();
    for t in 0..threads {
        let engine = Arc::clone(&engine);
        let first = t * per_thread + 1;
        let last = ((t + 1) * per_thread).min(args.count);
        handles.push(thread::spawn(move || -> Result<(), LatticeError> {
            for i in first..=last {
                let version = engine.next_version();
                engine.put(format!("KEY{}", i).as_bytes(), format!("VALUE{}", i).as_bytes(), version, 0)?;
            }
            Ok(())
        }));
    }
    for handle in handles {
        handle
            .join()
            .map_err(|_| LatticeError::InvalidOperation("writer thread panicked".into()))??;
    }
    tracing::info!(
        keys = args.count,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "loaded"
    );

    // Verify
    let mut missing = 0;
    for i in 1..=args.count {
        let expected = format!("VALUE{}", i);
        if engine.get(format!("KEY{}", i).as_bytes(), u64::MAX)?.as_deref() != Some(expected.as_bytes()) {
            missing += 1;
        }
    }
    let scanned = engine.len()?;
    tracing::info!(scanned, missing, "verified");

    // Trim
    if args.delete > 0 {
        let started = Instant::now();
        let mut deleted = 0;
        for i in 1..=args.delete.min(args.count) {
            let version = engine.next_version();
            if engine.delete(format!("KEY{}", i).as_bytes(), version)? == latticekv::OpResult::Ok {
                deleted += 1;
            }
        }
        tracing::info!(
            deleted,
            remaining = engine.len()?,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "deleted"
        );
    }

    let stats = engine.memory_stats();
    tracing::info!(
        index_blocks = engine.index_block_count(),
        data_blocks = engine.data_block_count(),
        allocated = stats.allocated,
        index_bytes = stats.index,
        data_bytes = stats.data,
        external_bytes = stats.external,
        "engine statistics"
    );
    Ok(())
}
