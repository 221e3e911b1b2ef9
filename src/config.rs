// po_ingestor/src/config.rs
// Injected configuration for the loader and query layer.

use std::time::Duration;

/// Configuration consumed by every component of the crate. Built by the
/// caller (the CLI in this binary); the library itself never reads the
/// process environment.
#[derive(Debug, Clone,)]
pub struct LoaderConfig {
    /// MongoDB connection string.
    pub uri:                String,
    pub database:           String,
    pub collection:         String,
    /// Records per ingestion chunk.
    pub chunk_size:         usize,
    /// Hard cap on rows returned by any query or aggregation.
    pub result_cap:         usize,
    /// Documents sampled by the schema introspector.
    pub sample_size:        usize,
    /// Per-execution timeout on the query path.
    pub query_timeout:      Duration,
    /// Wall-clock window inside which a failing batch write is retried
    /// before the chunk is marked failed.
    pub write_retry_window: Duration,
    /// Spend aggregations only count totals strictly greater than this.
    /// Non-positive totals stay in the store for audit but are excluded
    /// from financial sums.
    pub spend_floor:        f64,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            uri:                "mongodb://localhost:27017".to_string(),
            database:           crate::DEFAULT_DATABASE_NAME.to_string(),
            collection:         crate::DEFAULT_COLLECTION_NAME.to_string(),
            chunk_size:         crate::DEFAULT_CHUNK_SIZE,
            result_cap:         crate::DEFAULT_RESULT_CAP,
            sample_size:        crate::DEFAULT_SAMPLE_SIZE,
            query_timeout:      Duration::from_secs(crate::DEFAULT_QUERY_TIMEOUT_SECS,),
            write_retry_window: Duration::from_secs(crate::DEFAULT_WRITE_RETRY_SECS,),
            spend_floor:        0.0,
        }
    }
}
