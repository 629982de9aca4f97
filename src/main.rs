//! Emblem-DB CLI
//!
//! A persistent image-embedding store with periodic ANN index builds.
//!
//! # Usage
//!
//! ```bash
//! # Append embeddings from a JSON file
//! emblem-db ingest --data-dir ./data --input embeddings.json
//!
//! # Build an index generation over everything stored so far
//! emblem-db build --data-dir ./data --trees 10
//!
//! # Query the latest generation
//! emblem-db query --data-dir ./data --id 42 --count 5
//! emblem-db query --data-dir ./data --vector "0.1,0.4,0.2" --count 5
//! emblem-db query --data-dir ./data --random
//!
//! # Show store and index statistics
//! emblem-db stats --data-dir ./data
//! ```
//!
//! Ingest input format: a JSON array of `{"id": 42, "vector": [0.1, ...]}`
//! objects. Re-ingesting an existing id is a no-op.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

use emblem_db::engine::{Engine, EngineConfig, RebuildOutcome};
use emblem_db::model::{ErrorBody, QueryResponse};

#[derive(Parser)]
#[command(name = "emblem-db")]
#[command(about = "Persistent image-embedding store with periodic ANN index builds")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Append embeddings from a JSON file to the store
    Ingest {
        /// Data directory holding the store and index generations
        #[arg(short, long)]
        data_dir: PathBuf,

        /// JSON array of {"id": ..., "vector": [...]} records
        #[arg(short, long)]
        input: PathBuf,
    },

    /// Build one index generation from the current store contents
    Build {
        #[arg(short, long)]
        data_dir: PathBuf,

        /// Randomized trees per index (accuracy/size/speed trade-off)
        #[arg(long, default_value = "10")]
        trees: usize,

        /// Fixed build seed for reproducible indexes
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Query the latest index generation
    Query {
        #[arg(short, long)]
        data_dir: PathBuf,

        /// Look up neighbors of an indexed external id
        #[arg(long)]
        id: Option<u64>,

        /// Look up neighbors of a raw vector (comma-separated floats)
        #[arg(long)]
        vector: Option<String>,

        /// Look up neighbors of one uniformly sampled indexed id
        #[arg(long)]
        random: bool,

        /// Number of neighbors to return
        #[arg(short, long, default_value = "10")]
        count: usize,
    },

    /// Show store and index statistics
    Stats {
        #[arg(short, long)]
        data_dir: PathBuf,
    },
}

#[derive(Deserialize)]
struct IngestRecord {
    id: u64,
    vector: Vec<f32>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Ingest { data_dir, input } => cmd_ingest(data_dir, input),
        Commands::Build {
            data_dir,
            trees,
            seed,
        } => cmd_build(data_dir, trees, seed),
        Commands::Query {
            data_dir,
            id,
            vector,
            random,
            count,
        } => cmd_query(data_dir, id, vector, random, count),
        Commands::Stats { data_dir } => cmd_stats(data_dir),
    }
}

fn cmd_ingest(data_dir: PathBuf, input: PathBuf) -> Result<()> {
    let records: Vec<IngestRecord> = serde_json::from_slice(
        &std::fs::read(&input).with_context(|| format!("reading {input:?}"))?,
    )
    .with_context(|| format!("parsing {input:?}"))?;

    let ids: Vec<u64> = records.iter().map(|r| r.id).collect();
    let vectors: Vec<Vec<f32>> = records.into_iter().map(|r| r.vector).collect();

    let engine = Engine::open(EngineConfig::from_data_dir(data_dir))?;
    let inserted = engine.ingest_batch(&ids, &vectors)?;
    println!("ingested {inserted} of {} records", ids.len());
    Ok(())
}

fn cmd_build(data_dir: PathBuf, trees: usize, seed: Option<u64>) -> Result<()> {
    let mut config = EngineConfig::from_data_dir(data_dir);
    config.tree_count = trees;
    config.build_seed = seed;

    let engine = Engine::open(config)?;
    match engine.rebuild_once()? {
        RebuildOutcome::Idle => println!("store is empty; nothing to index"),
        RebuildOutcome::Built {
            generation,
            indexed,
        } => println!("built generation {generation} over {indexed} vectors"),
    }
    Ok(())
}

fn cmd_query(
    data_dir: PathBuf,
    id: Option<u64>,
    vector: Option<String>,
    random: bool,
    count: usize,
) -> Result<()> {
    let engine = Engine::open(EngineConfig::from_data_dir(data_dir))?;

    let result = match (id, vector, random) {
        (Some(id), None, false) => engine.query_by_key(id, count),
        (None, Some(raw), false) => {
            let vector = parse_vector(&raw)?;
            engine.query_by_vector(&vector, count)
        }
        (None, None, true) => engine.query_random(count),
        _ => bail!("pass exactly one of --id, --vector, or --random"),
    };

    match result {
        Ok(neighbors) => {
            let response = QueryResponse::from_neighbors(neighbors);
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(())
        }
        Err(err) => {
            let body = ErrorBody::from_error(&err);
            eprintln!("{}", serde_json::to_string_pretty(&body)?);
            std::process::exit(1);
        }
    }
}

fn cmd_stats(data_dir: PathBuf) -> Result<()> {
    let engine = Engine::open(EngineConfig::from_data_dir(data_dir))?;
    println!("{}", serde_json::to_string_pretty(&engine.stats())?);
    Ok(())
}

fn parse_vector(raw: &str) -> Result<Vec<f32>> {
    raw.split(',')
        .map(|part| {
            part.trim()
                .parse::<f32>()
                .with_context(|| format!("invalid vector component '{part}'"))
        })
        .collect()
}
