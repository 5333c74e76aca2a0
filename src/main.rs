//! Command-line front end for engram collections.
//!
//! Vectors are supplied explicitly (JSON arrays); producing them from text is
//! an embedding provider's job and stays outside this binary.

use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use engram::prelude::*;

#[derive(Parser, Debug)]
#[command(name = "engram", version, about = "Embedded exact nearest-neighbor vector index")]
struct Cli {
    /// Log filter (e.g. info, engram=debug); RUST_LOG is honored too
    #[arg(long, global = true)]
    log: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Insert one vector with its text
    Insert {
        /// Database file path
        #[arg(long, default_value = "tree.bin")]
        db: PathBuf,

        /// Vector dimensions when creating a new database
        #[arg(long, default_value_t = 512)]
        dims: usize,

        /// Vector as a JSON array: [0.1, 0.2, ...]
        #[arg(long)]
        vector: String,

        /// Text to store
        #[arg(long)]
        text: String,

        /// Metadata as a JSON object
        #[arg(long)]
        metadata: Option<String>,

        /// Write the scalar-quantized container variant
        #[arg(long)]
        compress: bool,
    },

    /// Search for nearby vectors
    Search {
        #[arg(long, default_value = "tree.bin")]
        db: PathBuf,

        /// Query vector as a JSON array
        #[arg(long)]
        vector: String,

        /// Per-dimension search radius
        #[arg(long, default_value_t = 0.3)]
        epsilon: f32,

        /// Distance-bound tightener in [0, 1]
        #[arg(long, default_value_t = 0.5)]
        threshold: f32,

        /// Maximum results
        #[arg(long, default_value_t = 5)]
        top_k: usize,

        /// Semantic radius word (exact|precise|similar|related|broad|fuzzy);
        /// overrides --epsilon
        #[arg(long)]
        radius: Option<String>,
    },

    /// Bulk insert from a CSV file of `text,vector-json` rows
    InsertCsv {
        #[arg(long, default_value = "tree.bin")]
        db: PathBuf,

        #[arg(long, default_value_t = 512)]
        dims: usize,

        /// CSV file path
        #[arg(long)]
        csv: PathBuf,

        #[arg(long)]
        compress: bool,
    },

    /// Bulk insert from a JSON array of `{vector, text, metadata?}` records
    InsertJson {
        #[arg(long, default_value = "tree.bin")]
        db: PathBuf,

        #[arg(long, default_value_t = 512)]
        dims: usize,

        /// JSON file path
        #[arg(long)]
        json: PathBuf,

        #[arg(long)]
        compress: bool,
    },

    /// Show database info
    Info {
        #[arg(long, default_value = "tree.bin")]
        db: PathBuf,
    },
}

#[derive(Deserialize)]
struct ImportRecord {
    vector: Vec<f32>,
    text: String,
    #[serde(default)]
    metadata: Option<Metadata>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log.as_deref());

    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(filter: Option<&str>) {
    let filter = match filter {
        Some(f) => tracing_subscriber::EnvFilter::new(f),
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn run(command: Commands) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Insert {
            db,
            dims,
            vector,
            text,
            metadata,
            compress,
        } => {
            let key: Vec<f32> = serde_json::from_str(&vector)?;
            let metadata = metadata
                .as_deref()
                .map(serde_json::from_str::<Metadata>)
                .transpose()?;

            let mut collection = open_for_write(&db, dims)?.with_compression(compress);
            collection.insert_with_metadata(key, text, metadata)?;
            collection.flush()?;
            println!(
                "inserted 1 node (total {})",
                collection.node_count()
            );
        }

        Commands::Search {
            db,
            vector,
            epsilon,
            threshold,
            top_k,
            radius,
        } => {
            let query: Vec<f32> = serde_json::from_str(&vector)?;
            let epsilon = match radius.as_deref() {
                Some(word) => {
                    let resolved = radius_or_default(word, epsilon);
                    println!("using semantic radius '{word}' -> epsilon {resolved:.2}");
                    resolved
                }
                None => epsilon,
            };

            let collection = open_existing(&db)?;
            let results = collection.search_nodes(
                &query,
                &SearchParams::new(epsilon, threshold, top_k),
                None,
            )?;

            println!("found {} results:", results.len());
            for m in results {
                println!("  {} (distance {:.4})", m.node.value, m.distance);
            }
        }

        Commands::InsertCsv {
            db,
            dims,
            csv,
            compress,
        } => {
            let mut reader = csv::ReaderBuilder::new()
                .has_headers(false)
                .from_path(&csv)?;

            let mut items = Vec::new();
            for record in reader.records() {
                let record = record?;
                let text = record
                    .get(0)
                    .ok_or("csv row is missing the text column")?;
                let vector = record
                    .get(1)
                    .ok_or("csv row is missing the vector column")?;
                let key: Vec<f32> = serde_json::from_str(vector)?;
                items.push(BatchItem::new(key, text));
            }

            let count = items.len();
            let mut collection = open_for_write(&db, dims)?.with_compression(compress);
            collection.batch_insert(items)?;
            println!("imported {count} rows (total {})", collection.node_count());
        }

        Commands::InsertJson {
            db,
            dims,
            json,
            compress,
        } => {
            let records: Vec<ImportRecord> = serde_json::from_str(&fs::read_to_string(&json)?)?;

            let items: Vec<BatchItem> = records
                .into_iter()
                .map(|r| {
                    let item = BatchItem::new(r.vector, r.text);
                    match r.metadata {
                        Some(meta) => item.with_metadata(meta),
                        None => item,
                    }
                })
                .collect();

            let count = items.len();
            let mut collection = open_for_write(&db, dims)?.with_compression(compress);
            collection.batch_insert(items)?;
            println!(
                "imported {count} records (total {})",
                collection.node_count()
            );
        }

        Commands::Info { db } => {
            let collection = open_existing(&db)?;
            let size = fs::metadata(&db)?.len();
            println!("database info:");
            println!("  file:       {}", db.display());
            println!("  nodes:      {}", collection.node_count());
            println!("  dimensions: {}", collection.dimensions());
            println!("  size:       {}", format_bytes(size));
        }
    }
    Ok(())
}

/// Open a database for mutation: an existing file supplies its own
/// dimensions, a new one is created with `dims`.
fn open_for_write(db: &Path, dims: usize) -> Result<Collection, CollectionError> {
    let exists = fs::metadata(db).map(|m| m.len() > 0).unwrap_or(false);
    Collection::open(db, if exists { 0 } else { dims })
}

fn open_existing(db: &Path) -> Result<Collection, Box<dyn std::error::Error>> {
    let exists = fs::metadata(db).map(|m| m.len() > 0).unwrap_or(false);
    if !exists {
        return Err(format!("database not found: {}", db.display()).into());
    }
    Ok(Collection::open(db, 0)?)
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} {}", UNITS[0])
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
