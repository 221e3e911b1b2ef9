// po_ingestor/src/query.rs
// Read-only query/aggregation execution over half-trusted specifications.
//
// Specifications arrive from a query generator that may produce malformed or
// unsafe shapes. Validation is an allow-list: stage operators, filter
// operators and expression operators outside the lists below are rejected
// before anything touches the store, and write-capable stages are rejected
// categorically.

use mongodb::bson::{Bson, Document, doc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::config::LoaderConfig;
use crate::error::{LoaderError, Result};
use crate::mongo::MongoStore;

/// Pipeline stages the executor will run.
const STAGE_OPERATORS: &[&str] = &[
    "$match",
    "$group",
    "$sort",
    "$limit",
    "$skip",
    "$project",
    "$addFields",
    "$count",
    "$unwind",
];

/// Rejected regardless of context: write-capable, cross-collection or
/// code-executing.
const BLOCKED_OPERATORS: &[&str] = &[
    "$out",
    "$merge",
    "$where",
    "$function",
    "$accumulator",
    "$unionWith",
    "$lookup",
    "$graphLookup",
];

/// Filter, accumulator and expression operators allowed inside stages. The
/// expression set covers what the stored date representation requires
/// ($dateFromString plus the extraction operators) and basic arithmetic.
const VALUE_OPERATORS: &[&str] = &[
    // filters
    "$eq",
    "$ne",
    "$gt",
    "$gte",
    "$lt",
    "$lte",
    "$in",
    "$nin",
    "$and",
    "$or",
    "$nor",
    "$not",
    "$exists",
    "$type",
    "$regex",
    "$options",
    "$expr",
    // accumulators
    "$sum",
    "$avg",
    "$min",
    "$max",
    "$first",
    "$last",
    "$push",
    "$addToSet",
    // expressions
    "$dateFromString",
    "$year",
    "$month",
    "$dayOfMonth",
    "$week",
    "$switch",
    "$cond",
    "$ifNull",
    "$literal",
    "$concat",
    "$toDouble",
    "$toInt",
    "$toString",
    "$abs",
    "$add",
    "$subtract",
    "$multiply",
    "$divide",
    "$round",
    "$size",
];

/// Shaped result of one execution. `truncated` is set whenever the hard
/// result cap cut the row set short; partial results are never silent.
#[derive(Debug, Serialize,)]
pub struct QueryOutput {
    pub rows:      Vec<Document,>,
    pub row_count: usize,
    pub truncated: bool,
}

fn json_to_document(stage: &str, value: &JsonValue,) -> Result<Document,> {
    if !value.is_object() {
        return Err(LoaderError::validation(stage, "expected a JSON object",),);
    }
    mongodb::bson::to_document(value,)
        .map_err(|e| LoaderError::validation(stage, format!("not a valid document: {}", e),),)
}

/// Parses a find-filter specification. Accepts either the bare filter object
/// or the `{"query": {...}}` envelope the translation layer emits.
pub fn parse_filter(raw: &str,) -> Result<Document,> {
    let value: JsonValue = serde_json::from_str(raw,)
        .map_err(|e| LoaderError::validation("filter", format!("invalid JSON: {}", e),),)?;
    let inner = match &value {
        JsonValue::Object(map,) if map.len() == 1 && map.contains_key("query",) => &map["query"],
        _ => &value,
    };
    json_to_document("filter", inner,)
}

/// Parses an aggregation pipeline specification. Accepts either the bare
/// stage array or the `{"pipeline": [...]}` envelope.
pub fn parse_pipeline(raw: &str,) -> Result<Vec<Document,>,> {
    let value: JsonValue = serde_json::from_str(raw,)
        .map_err(|e| LoaderError::validation("pipeline", format!("invalid JSON: {}", e),),)?;
    let stages = match &value {
        JsonValue::Array(stages,) => stages,
        JsonValue::Object(map,) => match map.get("pipeline",) {
            Some(JsonValue::Array(stages,),) => stages,
            _ => {
                return Err(LoaderError::validation(
                    "pipeline",
                    "expected a JSON array of stages",
                ),);
            },
        },
        _ => {
            return Err(LoaderError::validation(
                "pipeline",
                "expected a JSON array of stages",
            ),);
        },
    };
    stages
        .iter()
        .enumerate()
        .map(|(i, stage,)| json_to_document(&format!("stage {}", i), stage,),)
        .collect()
}

fn scan_operators(stage: &str, value: &Bson,) -> Result<(),> {
    match value {
        Bson::Document(map,) => {
            for (key, inner,) in map {
                if key.starts_with('$',) {
                    if BLOCKED_OPERATORS.contains(&key.as_str(),) {
                        return Err(LoaderError::validation(
                            stage,
                            format!("operator '{}' is write-capable or executes code", key),
                        ),);
                    }
                    if !VALUE_OPERATORS.contains(&key.as_str(),) {
                        return Err(LoaderError::validation(
                            stage,
                            format!("operator '{}' is not in the allow-list", key),
                        ),);
                    }
                }
                scan_operators(stage, inner,)?;
            }
            Ok((),)
        },
        Bson::Array(items,) => {
            for item in items {
                scan_operators(stage, item,)?;
            }
            Ok((),)
        },
        _ => Ok((),),
    }
}

/// Validates a find filter against the operator allow-list.
pub fn validate_filter(filter: &Document,) -> Result<(),> {
    scan_operators("filter", &Bson::Document(filter.clone(),),)
}

/// Validates every stage of a pipeline: each stage must be a single-key
/// document whose key is an allowed stage operator, and everything inside it
/// must pass the operator allow-list. Errors identify the offending stage.
pub fn validate_pipeline(pipeline: &[Document],) -> Result<(),> {
    for (i, stage,) in pipeline.iter().enumerate() {
        let mut keys = stage.keys();
        let (op, extra,) = (keys.next(), keys.next(),);
        let op = match (op, extra,) {
            (Some(op,), None,) => op,
            _ => {
                return Err(LoaderError::validation(
                    format!("stage {}", i),
                    "a stage must contain exactly one operator",
                ),);
            },
        };
        if BLOCKED_OPERATORS.contains(&op.as_str(),) {
            return Err(LoaderError::validation(
                format!("stage {} ({})", i, op),
                "write-capable and code-executing stages are rejected",
            ),);
        }
        if !STAGE_OPERATORS.contains(&op.as_str(),) {
            return Err(LoaderError::validation(
                format!("stage {} ({})", i, op),
                "not an allowed stage operator",
            ),);
        }
        if op == "$limit" {
            let valid = matches!(stage.get(op), Some(Bson::Int32(n)) if *n > 0)
                || matches!(stage.get(op), Some(Bson::Int64(n)) if *n > 0)
                || matches!(stage.get(op), Some(Bson::Double(n)) if *n > 0.0 && n.fract() == 0.0);
            if !valid {
                return Err(LoaderError::validation(
                    format!("stage {} ($limit)", i),
                    "$limit requires a positive integer",
                ),);
            }
        }
        for value in stage.values() {
            scan_operators(&format!("stage {} ({})", i, op), value,)?;
        }
    }
    Ok((),)
}

fn limit_value(stage: &Document,) -> Option<i64,> {
    match stage.get("$limit",) {
        Some(Bson::Int32(n,),) => Some(*n as i64,),
        Some(Bson::Int64(n,),) => Some(*n,),
        Some(Bson::Double(n,),) => Some(*n as i64,),
        _ => None,
    }
}

/// Applies the hard result cap to a validated pipeline. A caller limit at or
/// under the cap is honored as-is; a missing or over-cap limit becomes
/// `cap + 1` so truncation is detectable after the fetch.
pub fn apply_result_cap(pipeline: &mut Vec<Document,>, cap: usize,) {
    let fetch = (cap + 1) as i64;
    for stage in pipeline.iter_mut() {
        if let Some(existing,) = limit_value(stage,) {
            if existing > cap as i64 {
                stage.insert("$limit", Bson::Int64(fetch,),);
            }
            return;
        }
    }
    pipeline.push(doc! { "$limit": fetch },);
}

fn shape_rows(mut rows: Vec<Document,>, cap: usize,) -> QueryOutput {
    let truncated = rows.len() > cap;
    rows.truncate(cap,);
    QueryOutput {
        row_count: rows.len(),
        truncated,
        rows,
    }
}

/// How many rows a find must fetch for a caller limit under the hard cap.
/// `None` means the answer is already known to be empty: a zero limit never
/// reaches the store, because the driver treats `limit(0)` as "no limit" and
/// would drain the whole collection.
fn find_fetch_limit(limit: Option<usize,>, cap: usize,) -> Option<usize,> {
    match limit {
        Some(0,) => None,
        Some(l,) if l <= cap => Some(l,),
        _ => Some(cap + 1,),
    }
}

/// Stateless execution layer over the store. Instances are cheap and safe to
/// use concurrently across caller requests.
pub struct QueryExecutor<'a,> {
    store:  &'a MongoStore,
    config: &'a LoaderConfig,
}

impl<'a,> QueryExecutor<'a,> {
    pub fn new(store: &'a MongoStore, config: &'a LoaderConfig,) -> Self {
        QueryExecutor { store, config, }
    }

    async fn with_timeout<T,>(
        &self,
        fut: impl std::future::Future<Output = Result<T,>,>,
    ) -> Result<T,> {
        bounded(self.config.query_timeout, fut,).await
    }

    /// Executes a validated find filter, returning at most the configured
    /// cap (or the caller's limit, when smaller).
    pub async fn find(&self, filter: Document, limit: Option<usize,>,) -> Result<QueryOutput,> {
        validate_filter(&filter,)?;
        let cap = self.config.result_cap;
        let Some(fetch,) = find_fetch_limit(limit, cap,) else {
            return Ok(QueryOutput {
                rows:      Vec::new(),
                row_count: 0,
                truncated: false,
            },);
        };
        debug!("Executing find (fetch limit {})", fetch);
        let rows = self
            .with_timeout(self.store.find_docs(filter, fetch as i64,),)
            .await?;
        Ok(shape_rows(rows, cap,),)
    }

    /// Validates and executes an aggregation pipeline under the hard cap and
    /// the execution timeout.
    pub async fn aggregate(&self, pipeline: Vec<Document,>,) -> Result<QueryOutput,> {
        validate_pipeline(&pipeline,)?;
        let cap = self.config.result_cap;
        let mut pipeline = pipeline;
        apply_result_cap(&mut pipeline, cap,);
        debug!("Executing aggregation ({} stages)", pipeline.len());
        let rows = self
            .with_timeout(self.store.run_pipeline(pipeline,),)
            .await?;
        Ok(shape_rows(rows, cap,),)
    }
}

/// Runs a store operation under a wall-clock window, mapping expiry to an
/// execution error.
async fn bounded<T,>(
    window: std::time::Duration,
    fut: impl std::future::Future<Output = Result<T,>,>,
) -> Result<T,> {
    tokio::time::timeout(window, fut,)
        .await
        .map_err(|_| {
            LoaderError::Execution(format!("query timed out after {:.0}s", window.as_secs_f64()),)
        },)?
}

/// Match stage excluding non-positive totals from spend aggregations.
/// Stored documents keep non-positive totals for audit; the exclusion
/// happens here, at query time, with the floor applied exclusively.
pub fn spend_match_stage(floor: f64,) -> Document {
    doc! { "$match": { "total_price": { "$gt": floor, "$type": "number" } } }
}

/// Spending and order counts grouped by fiscal year.
pub fn spending_by_fiscal_year(floor: f64,) -> Vec<Document,> {
    vec![
        spend_match_stage(floor,),
        doc! { "$group": {
            "_id": "$fiscal_year",
            "total_spending": { "$sum": "$total_price" },
            "order_count": { "$sum": 1 },
            "avg_order_value": { "$avg": "$total_price" },
        } },
        doc! { "$sort": { "_id": 1 } },
    ]
}

/// Top `n` departments by total spend.
pub fn top_departments(n: usize, floor: f64,) -> Vec<Document,> {
    top_by_group("$department_name", n, floor,)
}

/// Top `n` suppliers by total spend.
pub fn top_suppliers(n: usize, floor: f64,) -> Vec<Document,> {
    top_by_group("$supplier_name", n, floor,)
}

fn top_by_group(group_field: &str, n: usize, floor: f64,) -> Vec<Document,> {
    vec![
        spend_match_stage(floor,),
        doc! { "$group": {
            "_id": group_field,
            "total_spending": { "$sum": "$total_price" },
            "order_count": { "$sum": 1 },
        } },
        doc! { "$sort": { "total_spending": -1 } },
        doc! { "$limit": n as i64 },
    ]
}

/// Spend, order count, and average order value per acquisition method.
pub fn acquisition_methods(floor: f64,) -> Vec<Document,> {
    vec![
        spend_match_stage(floor,),
        doc! { "$group": {
            "_id": "$acquisition_method",
            "total_spending": { "$sum": "$total_price" },
            "order_count": { "$sum": 1 },
            "avg_order_value": { "$avg": "$total_price" },
        } },
        doc! { "$sort": { "total_spending": -1 } },
    ]
}

/// Most frequently ordered items (blank item names excluded).
pub fn top_items(n: usize, floor: f64,) -> Vec<Document,> {
    vec![
        doc! { "$match": {
            "item_name": { "$ne": "" },
            "total_price": { "$gt": floor, "$type": "number" },
        } },
        doc! { "$group": {
            "_id": "$item_name",
            "order_count": { "$sum": 1 },
            "total_quantity": { "$sum": "$quantity" },
            "total_spending": { "$sum": "$total_price" },
        } },
        doc! { "$sort": { "order_count": -1 } },
        doc! { "$limit": n as i64 },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_capable_stage_rejected() {
        let pipeline = vec![doc! { "$out": "evil_collection" }];
        let err = validate_pipeline(&pipeline,).unwrap_err();
        match err {
            LoaderError::Validation { stage, .. } => assert!(stage.contains("$out")),
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn code_execution_operator_rejected_inside_match() {
        let pipeline = vec![doc! { "$match": { "$where": "sleep(1000)" } }];
        assert!(validate_pipeline(&pipeline,).is_err());
    }

    #[test]
    fn unknown_operator_names_offending_stage() {
        let pipeline = vec![
            doc! { "$match": { "fiscal_year": "2013-2014" } },
            doc! { "$group": { "_id": null, "t": { "$stddevPop": "$total_price" } } },
        ];
        let err = validate_pipeline(&pipeline,).unwrap_err();
        match err {
            LoaderError::Validation { stage, reason, } => {
                assert!(stage.contains("stage 1"));
                assert!(reason.contains("$stddevPop"));
            },
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn quarterly_pipeline_shape_passes_validation() {
        // The operator set the stored ISO date representation requires.
        let raw = r#"[
            {"$match": {"total_price": {"$gt": 0, "$type": "number"}}},
            {"$addFields": {"date_obj": {"$dateFromString": {"dateString": "$creation_date"}}}},
            {"$addFields": {"month": {"$month": "$date_obj"}}},
            {"$addFields": {"quarter": {"$switch": {
                "branches": [
                    {"case": {"$in": ["$month", [7, 8, 9]]}, "then": "Q1"},
                    {"case": {"$in": ["$month", [10, 11, 12]]}, "then": "Q2"}
                ],
                "default": "Unknown"
            }}}},
            {"$group": {"_id": "$quarter", "total_spending": {"$sum": "$total_price"}}},
            {"$sort": {"total_spending": -1}},
            {"$limit": 1}
        ]"#;
        let pipeline = parse_pipeline(raw,).unwrap();
        validate_pipeline(&pipeline,).unwrap();
    }

    #[test]
    fn multi_key_stage_rejected() {
        let pipeline = vec![doc! { "$match": {}, "$limit": 5 }];
        assert!(validate_pipeline(&pipeline,).is_err());
    }

    #[test]
    fn filter_envelope_accepted() {
        let filter = parse_filter(r#"{"query": {"department_name": "Justice"}}"#,).unwrap();
        assert_eq!(filter.get_str("department_name").unwrap(), "Justice");
        let bare = parse_filter(r#"{"department_name": "Justice"}"#,).unwrap();
        assert_eq!(bare, filter);
    }

    #[test]
    fn cap_appended_when_limit_missing() {
        let mut pipeline = vec![doc! { "$match": {} }];
        apply_result_cap(&mut pipeline, 100,);
        assert_eq!(pipeline.last().unwrap(), &doc! { "$limit": 101i64 });
    }

    #[test]
    fn over_cap_limit_clamped_small_limit_honored() {
        let mut pipeline = vec![doc! { "$limit": 5000i64 }];
        apply_result_cap(&mut pipeline, 100,);
        assert_eq!(limit_value(&pipeline[0]), Some(101));

        let mut pipeline = vec![doc! { "$limit": 5i64 }];
        apply_result_cap(&mut pipeline, 100,);
        assert_eq!(limit_value(&pipeline[0]), Some(5));
        assert_eq!(pipeline.len(), 1);
    }

    #[test]
    fn truncation_flagged_at_cap() {
        let rows: Vec<Document,> = (0..101).map(|i| doc! { "i": i },).collect();
        let out = shape_rows(rows, 100,);
        assert_eq!(out.row_count, 100);
        assert!(out.truncated);

        let rows: Vec<Document,> = (0..100).map(|i| doc! { "i": i },).collect();
        let out = shape_rows(rows, 100,);
        assert_eq!(out.row_count, 100);
        assert!(!out.truncated);
    }

    #[test]
    fn non_numeric_limit_rejected() {
        let pipeline = vec![doc! { "$limit": "all" }];
        assert!(validate_pipeline(&pipeline,).is_err());
    }

    #[test]
    fn spend_floor_is_exclusive() {
        let stage = spend_match_stage(0.0,);
        let match_doc = stage.get_document("$match").unwrap();
        let price = match_doc.get_document("total_price").unwrap();
        assert_eq!(price.get_f64("$gt").unwrap(), 0.0);
        assert!(price.get_str("$type").is_ok());
    }

    #[test]
    fn zero_find_limit_never_reaches_the_store() {
        // limit(0) means "no limit" to the driver, so a zero caller limit
        // must resolve to an empty answer, not a fetch.
        assert_eq!(find_fetch_limit(Some(0,), 100,), None);
        assert_eq!(find_fetch_limit(Some(5,), 100,), Some(5,));
        assert_eq!(find_fetch_limit(Some(100,), 100,), Some(100,));
        assert_eq!(find_fetch_limit(Some(5000,), 100,), Some(101,));
        assert_eq!(find_fetch_limit(None, 100,), Some(101,));
    }

    #[test]
    fn acquisition_method_pipeline_validates() {
        let pipeline = acquisition_methods(0.0,);
        validate_pipeline(&pipeline,).unwrap();
        let group = pipeline[1].get_document("$group").unwrap();
        assert_eq!(group.get_str("_id").unwrap(), "$acquisition_method");
        assert!(group.get_document("total_spending").is_ok());
        assert!(group.get_document("order_count").is_ok());
        assert!(group.get_document("avg_order_value").is_ok());
    }

    #[tokio::test]
    async fn slow_query_maps_to_execution_error() {
        let window = std::time::Duration::from_millis(10,);
        let err = bounded(window, async {
            tokio::time::sleep(std::time::Duration::from_secs(5,),).await;
            Ok(42i64,)
        },)
        .await
        .unwrap_err();
        match err {
            LoaderError::Execution(msg,) => assert!(msg.contains("timed out")),
            other => panic!("expected execution error, got {:?}", other),
        }

        let value = bounded(std::time::Duration::from_secs(5,), async { Ok(7i64,) },)
            .await
            .unwrap();
        assert_eq!(value, 7);
    }
}
