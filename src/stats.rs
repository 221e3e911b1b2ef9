// po_ingestor/src/stats.rs
// Observational collection statistics and dataset overview.

use mongodb::bson::{Bson, Document, doc};
use serde::Serialize;
use tracing::info;

use crate::config::LoaderConfig;
use crate::error::Result;
use crate::mongo::MongoStore;
use crate::query::spend_match_stage;

/// Collection-level counts plus a small sample for manual verification.
#[derive(Debug, Serialize,)]
pub struct CollectionStats {
    pub total_documents:    u64,
    /// On-disk size estimate from collStats; zero when the server does not
    /// report one.
    pub storage_size_bytes: i64,
    pub sample_documents:   Vec<Document,>,
}

fn bson_as_i64(value: Option<&Bson,>,) -> i64 {
    match value {
        Some(Bson::Int32(n,),) => *n as i64,
        Some(Bson::Int64(n,),) => *n,
        Some(Bson::Double(n,),) => *n as i64,
        _ => 0,
    }
}

/// Returns document count, a storage-size estimate and `sample_count`
/// documents. Purely observational.
pub async fn collect(store: &MongoStore, sample_count: usize,) -> Result<CollectionStats,> {
    let total_documents = store.count().await?;
    let stats_doc = store.coll_stats().await?;
    let storage_size_bytes = bson_as_i64(stats_doc.get("storageSize",),);
    let sample_documents = store.sample(sample_count,).await?;
    info!("Verification complete. Found {} documents", total_documents);
    Ok(CollectionStats {
        total_documents,
        storage_size_bytes,
        sample_documents,
    },)
}

/// High-level dataset overview for sanity checks after a load.
#[derive(Debug, Serialize,)]
pub struct DatasetOverview {
    pub total_records:       u64,
    pub fiscal_years:        Vec<String,>,
    pub departments:         usize,
    pub suppliers:           usize,
    pub acquisition_types:   Vec<String,>,
    pub acquisition_methods: usize,
    /// Sum of totals above the configured spend floor; absent when the
    /// collection holds no qualifying documents.
    pub total_spending:      Option<f64,>,
}

fn string_values(values: Vec<Bson,>,) -> Vec<String,> {
    let mut out: Vec<String,> = values
        .into_iter()
        .filter_map(|v| match v {
            Bson::String(s,) => Some(s,),
            Bson::Null => None,
            other => Some(other.to_string(),),
        },)
        .collect();
    out.sort();
    out
}

pub async fn overview(store: &MongoStore, config: &LoaderConfig,) -> Result<DatasetOverview,> {
    let total_records = store.count().await?;
    let fiscal_years = string_values(store.distinct_values("fiscal_year",).await?,);
    let departments = store.distinct_values("department_name",).await?.len();
    let suppliers = store.distinct_values("supplier_name",).await?.len();
    let acquisition_types = string_values(store.distinct_values("acquisition_type",).await?,);
    let acquisition_methods = store.distinct_values("acquisition_method",).await?.len();

    let spend_rows = store
        .run_pipeline(vec![
            spend_match_stage(config.spend_floor,),
            doc! { "$group": { "_id": null, "total": { "$sum": "$total_price" } } },
        ],)
        .await?;
    let total_spending = spend_rows
        .first()
        .and_then(|row| row.get("total",),)
        .and_then(|v| match v {
            Bson::Double(n,) if n.is_finite() => Some(*n,),
            Bson::Int32(n,) => Some(*n as f64,),
            Bson::Int64(n,) => Some(*n as f64,),
            _ => None,
        },);

    Ok(DatasetOverview {
        total_records,
        fiscal_years,
        departments,
        suppliers,
        acquisition_types,
        acquisition_methods,
        total_spending,
    },)
}
