// po_ingestor/src/lib.rs
// Public API for the po_ingestor crate.

pub mod cli;
pub mod config;
pub mod error;
pub mod indexes;
pub mod loader;
pub mod mongo;
pub mod normalize;
pub mod query;
pub mod retry;
pub mod schema;
pub mod stats;

pub const DEFAULT_DATABASE_NAME: &str = "california_procurement";
pub const DEFAULT_COLLECTION_NAME: &str = "purchase_orders";
pub const DEFAULT_CHUNK_SIZE: usize = 10_000;
pub const DEFAULT_RESULT_CAP: usize = 100;
pub const DEFAULT_SAMPLE_SIZE: usize = 50;
pub const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_WRITE_RETRY_SECS: u64 = 30;

/// Field the idempotency fingerprint is stored under. A unique index on this
/// field backs the per-chunk existence check during ingestion.
pub const ROW_KEY_FIELD: &str = "row_key";
