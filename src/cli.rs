// po_ingestor/src/cli.rs
// Command Line Interface for the po_ingestor binary.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::config::LoaderConfig;

/// Command Line Interface for the procurement purchase-order loader.
#[derive(Parser, Debug,)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,

    /// Write the completion report to load_report.json after a load.
    #[clap(long)]
    pub report: bool,
}

#[derive(Parser, Debug,)]
pub enum Commands {
    /// Load a purchase order CSV extract into the store
    Load(LoadArgs,),
    /// Verify a completed load (document count plus sample records)
    Verify(VerifyArgs,),
    /// Report observed field names and inferred types
    Schema(SchemaArgs,),
    /// Collection statistics
    Stats(VerifyArgs,),
    /// Dataset overview and canned spending analyses
    Explore(ExploreArgs,),
    /// Execute a find filter or aggregation pipeline specification
    Query(QueryArgs,),
}

/// Store connection arguments shared by every subcommand.
#[derive(Parser, Debug,)]
pub struct StoreArgs {
    /// Connection string for MongoDB
    #[clap(long, env = "MONGODB_URI", default_value = "mongodb://localhost:27017")]
    pub uri: String,

    #[clap(long, env = "MONGODB_DATABASE", default_value = crate::DEFAULT_DATABASE_NAME)]
    pub database: String,

    #[clap(long, env = "MONGODB_COLLECTION", default_value = crate::DEFAULT_COLLECTION_NAME)]
    pub collection: String,

    /// Hard cap on rows returned by any query
    #[clap(long, default_value_t = crate::DEFAULT_RESULT_CAP)]
    pub result_cap: usize,

    /// Per-query timeout in seconds
    #[clap(long, default_value_t = crate::DEFAULT_QUERY_TIMEOUT_SECS)]
    pub query_timeout_secs: u64,

    /// Spend aggregations only count totals strictly above this value
    #[clap(long, default_value_t = 0.0)]
    pub spend_floor: f64,
}

impl StoreArgs {
    /// Materializes the injected configuration object. The library itself
    /// never reads the environment; clap resolves env bindings here.
    pub fn to_config(&self,) -> LoaderConfig {
        LoaderConfig {
            uri: self.uri.clone(),
            database: self.database.clone(),
            collection: self.collection.clone(),
            result_cap: self.result_cap,
            query_timeout: Duration::from_secs(self.query_timeout_secs,),
            spend_floor: self.spend_floor,
            ..LoaderConfig::default()
        }
    }
}

#[derive(Parser, Debug,)]
pub struct LoadArgs {
    /// Path to the CSV extract to ingest
    #[clap(short, long)]
    pub path: PathBuf,

    /// Records per ingestion chunk
    #[clap(long, default_value_t = crate::DEFAULT_CHUNK_SIZE)]
    pub chunk_size: usize,

    /// Stop after ingesting this many records
    #[clap(long)]
    pub max_records: Option<u64,>,

    #[clap(flatten)]
    pub store: StoreArgs,
}

#[derive(Parser, Debug,)]
pub struct VerifyArgs {
    /// Number of sample documents to include
    #[clap(long, default_value_t = 3)]
    pub samples: usize,

    #[clap(flatten)]
    pub store: StoreArgs,
}

#[derive(Parser, Debug,)]
pub struct SchemaArgs {
    /// Number of documents to sample for type inference
    #[clap(long, default_value_t = crate::DEFAULT_SAMPLE_SIZE)]
    pub sample_size: usize,

    #[clap(flatten)]
    pub store: StoreArgs,
}

#[derive(Parser, Debug,)]
pub struct ExploreArgs {
    /// How many departments, suppliers and items to rank
    #[clap(long, default_value_t = 10)]
    pub top_n: usize,

    #[clap(flatten)]
    pub store: StoreArgs,
}

#[derive(Parser, Debug,)]
pub struct QueryArgs {
    /// JSON find filter, bare or wrapped in {"query": ...}
    #[clap(long, conflicts_with = "pipeline")]
    pub filter: Option<String,>,

    /// JSON aggregation pipeline, bare array or wrapped in {"pipeline": ...}
    #[clap(long)]
    pub pipeline: Option<String,>,

    /// Row limit for find queries (still subject to the hard cap)
    #[clap(long)]
    pub limit: Option<usize,>,

    #[clap(flatten)]
    pub store: StoreArgs,
}
