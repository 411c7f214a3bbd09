use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use bigindex::core::config;
use bigindex::core::FnCodec;
use bigindex::stats::MemoryReport;
use bigindex::{EngineConfig, Indexer, StorageMode};
use clap::Parser;
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// 生成记录、建等值 + 有序索引、跑几个查询并打印耗时与内存报告。
#[derive(Parser, Debug)]
#[command(name = "bigindex-demo", version)]
struct Args {
    /// in-memory | memory-mapped | random-access-file
    #[arg(long, default_value = "in-memory")]
    mode: StorageMode,

    #[arg(long, default_value_t = 1_000_000)]
    items: u64,

    /// TOML 配置文件（缺省字段取默认值）
    #[arg(long)]
    config: Option<PathBuf>,

    /// 以 JSON 输出结果
    #[arg(long)]
    json: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct Record {
    id: i64,
    bucket: i32,
    score: f64,
}

const RECORD_WIDTH: usize = 20;

fn read_record(b: &[u8]) -> Record {
    let mut id = [0u8; 8];
    let mut bucket = [0u8; 4];
    let mut score = [0u8; 8];
    id.copy_from_slice(&b[0..8]);
    bucket.copy_from_slice(&b[8..12]);
    score.copy_from_slice(&b[12..20]);
    Record {
        id: i64::from_le_bytes(id),
        bucket: i32::from_le_bytes(bucket),
        score: f64::from_le_bytes(score),
    }
}

fn write_record(r: &Record, b: &mut [u8]) {
    b[0..8].copy_from_slice(&r.id.to_le_bytes());
    b[8..12].copy_from_slice(&r.bucket.to_le_bytes());
    b[12..20].copy_from_slice(&r.score.to_le_bytes());
}

#[derive(Serialize)]
struct Timings {
    mode: StorageMode,
    items: u64,
    insert_ms: u128,
    commit_ms: u128,
    equality_hits: u64,
    equality_ms: u128,
    range_hits: u64,
    range_ms: u128,
    memory: MemoryReport,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let cfg = match &args.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    config::install(cfg)?;
    let cfg = config::global();

    info!("Starting bigindex demo: mode={} items={}", args.mode, args.items);

    let codec = FnCodec::shared(RECORD_WIDTH, read_record, write_record);
    let mut indexer = match args.mode {
        StorageMode::InMemory => Indexer::in_memory_with_config(Arc::clone(&cfg)),
        StorageMode::MemoryMapped => Indexer::memory_mapped_with_config(codec, Arc::clone(&cfg)),
        StorageMode::RandomAccessFile => {
            Indexer::random_access_file_with_config(codec, Arc::clone(&cfg))
        }
    };
    indexer.add_equality_index("bucket", |r: &Record| r.bucket)?;
    indexer.add_ordered_index_by("score", |r: &Record| r.score, |a: &f64, b: &f64| a.total_cmp(b))?;

    let t = Instant::now();
    let mut tx = indexer.start_transaction()?;
    for i in 0..args.items {
        tx.add(Record {
            id: i as i64,
            bucket: (i % 1_000) as i32,
            score: ((i.wrapping_mul(2_654_435_761)) % 1_000_000) as f64 / 1_000.0,
        })?;
    }
    let insert_ms = t.elapsed().as_millis();

    let t = Instant::now();
    tx.commit()?;
    let commit_ms = t.elapsed().as_millis();
    info!("Committed {} items in {} ms", indexer.committed_count(), commit_ms);

    let t = Instant::now();
    let by_bucket = indexer.equality_index::<i32>("bucket")?;
    let mut equality_hits = 0u64;
    for item in by_bucket.items(42) {
        item?;
        equality_hits += 1;
    }
    let equality_ms = t.elapsed().as_millis();

    let t = Instant::now();
    let by_score = indexer.ordered_index::<f64>("score")?;
    let mut range_hits = 0u64;
    for item in by_score.items_in_range(100.0, 101.0) {
        item?;
        range_hits += 1;
    }
    let range_ms = t.elapsed().as_millis();

    let timings = Timings {
        mode: args.mode,
        items: args.items,
        insert_ms,
        commit_ms,
        equality_hits,
        equality_ms,
        range_hits,
        range_ms,
        memory: MemoryReport::collect(),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&timings)?);
    } else {
        println!("mode:           {}", timings.mode);
        println!("items:          {}", timings.items);
        println!("insert:         {} ms", timings.insert_ms);
        println!("commit:         {} ms", timings.commit_ms);
        println!("bucket == 42:   {} hits in {} ms", timings.equality_hits, timings.equality_ms);
        println!("score 100..101: {} hits in {} ms", timings.range_hits, timings.range_ms);
        print!("{}", timings.memory);
    }

    indexer.dispose()?;
    info!("Done");
    Ok(())
}
