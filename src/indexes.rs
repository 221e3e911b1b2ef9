// po_ingestor/src/indexes.rs
// Idempotent index provisioning for the purchase order collection.

use mongodb::bson::{Document, doc};
use mongodb::options::IndexOptions;
use mongodb::{Collection, IndexModel};
use tracing::{debug, info};

use crate::error::{LoaderError, Result};

/// Ascending single-field indexes required by the query layer.
const REQUIRED_FIELDS: &[&str] = &[
    "creation_date",
    "fiscal_year",
    "department_name",
    "supplier_name",
    "acquisition_method",
    "total_price",
];

fn index_name(field: &str,) -> String {
    format!("{}_1", field)
}

fn required_models() -> Vec<IndexModel,> {
    let mut models: Vec<IndexModel,> = REQUIRED_FIELDS
        .iter()
        .map(|field| {
            IndexModel::builder()
                .keys(doc! { (*field): 1 },)
                .options(IndexOptions::builder().name(index_name(field,),).build(),)
                .build()
        },)
        .collect();
    // The idempotency key is unique by construction; the unique index both
    // enforces that and serves the existence check.
    models.push(
        IndexModel::builder()
            .keys(doc! { (crate::ROW_KEY_FIELD): 1 },)
            .options(
                IndexOptions::builder()
                    .name(index_name(crate::ROW_KEY_FIELD,),)
                    .unique(true,)
                    .build(),
            )
            .build(),
    );
    models
}

/// Ensures the required index set exists, creating only what is missing.
/// Safe to call before, during or after a load; an index that already
/// matches is left untouched, so repeated invocation is a no-op. Returns the
/// number of indexes created.
pub async fn ensure_indexes(collection: &Collection<Document,>,) -> Result<usize,> {
    let existing = collection
        .list_index_names()
        .await
        .map_err(|e| LoaderError::Execution(format!("Failed to list indexes: {}", e),),)?;

    let mut created = 0;
    for model in required_models() {
        let name = model
            .options
            .as_ref()
            .and_then(|o| o.name.clone(),)
            .unwrap_or_default();
        if existing.iter().any(|n| n == &name,) {
            debug!("Index '{}' already present, skipping", name);
            continue;
        }
        collection.create_index(model, None,).await.map_err(|e| {
            LoaderError::Execution(format!("Failed to create index '{}': {}", name, e),)
        },)?;
        info!("Created index: {}", name);
        created += 1;
    }
    Ok(created,)
}
