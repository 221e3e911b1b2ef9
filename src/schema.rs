// po_ingestor/src/schema.rs
// Advisory schema introspection from stored document samples.

use std::collections::{BTreeMap, BTreeSet};

use mongodb::bson::Bson;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::Result;
use crate::mongo::MongoStore;

/// Low-cardinality fields worth enumerating for query-shape validation.
const CATEGORICAL_FIELDS: &[&str] = &[
    "fiscal_year",
    "acquisition_type",
    "acquisition_method",
    "calcard_used",
    "department_name",
];

/// Distinct values are only reported when the field stays at or under this
/// cardinality.
const MAX_DISTINCT: usize = 50;

/// Observed field names and inferred types. Advisory: derived from a bounded
/// sample, not from the full collection.
#[derive(Debug, Default, Serialize,)]
pub struct SchemaReport {
    pub sampled_documents: usize,
    /// Field name to inferred type, e.g. "double", "string (nullable)",
    /// "mixed".
    pub fields:            BTreeMap<String, String,>,
    pub distinct_values:   BTreeMap<String, Vec<String,>,>,
}

pub fn bson_type_name(value: &Bson,) -> &'static str {
    match value {
        Bson::Double(_,) => "double",
        Bson::String(_,) => "string",
        Bson::Boolean(_,) => "bool",
        Bson::Int32(_,) | Bson::Int64(_,) => "int",
        Bson::Null => "null",
        Bson::DateTime(_,) => "date",
        Bson::Array(_,) => "array",
        Bson::Document(_,) => "document",
        Bson::ObjectId(_,) => "objectId",
        _ => "other",
    }
}

fn render_types(types: &BTreeSet<&'static str,>,) -> String {
    let non_null: Vec<&&str,> = types.iter().filter(|t| **t != "null",).collect();
    match (non_null.len(), types.contains("null",),) {
        (0, _,) => "null".to_string(),
        (1, false,) => non_null[0].to_string(),
        (1, true,) => format!("{} (nullable)", non_null[0]),
        _ => "mixed".to_string(),
    }
}

fn distinct_display(value: &Bson,) -> String {
    match value {
        Bson::String(s,) => s.clone(),
        other => other.to_string(),
    }
}

/// Samples up to `sample_size` stored documents and reports field names with
/// inferred types, plus distinct values for the small categorical fields.
/// Read-only and side-effect free.
pub async fn introspect(store: &MongoStore, sample_size: usize,) -> Result<SchemaReport,> {
    let docs = store.sample(sample_size,).await?;
    let mut observed: BTreeMap<String, BTreeSet<&'static str,>,> = BTreeMap::new();
    for doc in &docs {
        for (key, value,) in doc {
            if key == "_id" {
                continue;
            }
            observed
                .entry(key.clone(),)
                .or_default()
                .insert(bson_type_name(value,),);
        }
    }

    let mut report = SchemaReport {
        sampled_documents: docs.len(),
        ..SchemaReport::default()
    };
    for (field, types,) in &observed {
        report.fields.insert(field.clone(), render_types(types,),);
    }

    for field in CATEGORICAL_FIELDS {
        // Distinct enumeration is best-effort; a failure here must not sink
        // the whole report.
        match store.distinct_values(field,).await {
            Ok(values,) if values.len() <= MAX_DISTINCT => {
                report.distinct_values.insert(
                    field.to_string(),
                    values.iter().map(distinct_display,).collect(),
                );
            },
            Ok(values,) => {
                debug!(
                    "Skipping distinct values for '{}': cardinality {}",
                    field,
                    values.len()
                );
            },
            Err(e,) => warn!("Could not enumerate distinct values for '{}': {}", field, e),
        }
    }

    Ok(report,)
}
