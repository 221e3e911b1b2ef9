// po_ingestor/src/mongo/mod.rs
// MongoDB store handle shared by the loader and the query layer.

use std::collections::HashSet;

use async_trait::async_trait;
use futures_util::TryStreamExt;
use mongodb::bson::{Bson, Document, doc};
use mongodb::options::{ClientOptions, FindOptions, InsertManyOptions};
use mongodb::{Client, Collection, Database};
use tracing::info;

use crate::config::LoaderConfig;
use crate::error::{LoaderError, Result};
use crate::loader::DocumentSink;
use crate::retry::{execute_with_retry, wrap_error};

/// Explicitly constructed connection handle. Opened once at process start
/// and passed to each component; concurrent readers share it freely, but
/// only one ingestion writer may run against a collection at a time.
pub struct MongoStore {
    client:          Client,
    database:        Database,
    collection:      Collection<Document,>,
    collection_name: String,
}

impl MongoStore {
    /// Parses the connection string, builds the client and verifies the
    /// deployment with a retried ping.
    pub async fn connect(config: &LoaderConfig,) -> Result<Self,> {
        let client_options = ClientOptions::parse(&config.uri,).await.map_err(|e| {
            LoaderError::Configuration(format!("Failed to parse MongoDB URI: {}", e),)
        },)?;
        let client = Client::with_options(client_options,).map_err(|e| {
            LoaderError::Connection(format!("Failed to create MongoDB client: {}", e),)
        },)?;

        let retry_window = config.write_retry_window;
        execute_with_retry(
            || async {
                client
                    .database("admin",)
                    .run_command(doc! {"ping": 1}, None,)
                    .await
                    .map(|_| (),)
                    .map_err(|e| {
                        wrap_error(LoaderError::Connection(format!(
                            "Failed to connect to MongoDB: {}",
                            e
                        ),),)
                    },)
            },
            retry_window,
        )
        .await?;

        let database = client.database(&config.database,);
        let collection = database.collection(&config.collection,);
        info!(
            "Connected to MongoDB: database '{}', collection '{}'",
            config.database, config.collection
        );

        Ok(MongoStore {
            client,
            database,
            collection,
            collection_name: config.collection.clone(),
        },)
    }

    pub fn collection(&self,) -> &Collection<Document,> {
        &self.collection
    }

    pub async fn count(&self,) -> Result<u64,> {
        self.collection
            .count_documents(doc! {}, None,)
            .await
            .map_err(|e| LoaderError::Execution(format!("Failed to count documents: {}", e),),)
    }

    pub async fn distinct_values(&self, field: &str,) -> Result<Vec<Bson,>,> {
        self.collection.distinct(field, None, None,).await.map_err(|e| {
            LoaderError::Execution(format!("Failed to collect distinct '{}': {}", field, e),)
        },)
    }

    /// Runs a find with the given filter, returning at most `limit` rows.
    /// A non-positive limit returns nothing: the driver reads `limit(0)` as
    /// "no limit" and must never see one.
    pub async fn find_docs(&self, filter: Document, limit: i64,) -> Result<Vec<Document,>,> {
        if limit <= 0 {
            return Ok(Vec::new(),);
        }
        let options = FindOptions::builder().limit(limit,).build();
        let cursor = self
            .collection
            .find(filter, options,)
            .await
            .map_err(|e| LoaderError::Execution(format!("Failed to execute find: {}", e),),)?;
        cursor
            .try_collect()
            .await
            .map_err(|e| LoaderError::Execution(format!("Failed to drain find cursor: {}", e),),)
    }

    pub async fn run_pipeline(&self, pipeline: Vec<Document,>,) -> Result<Vec<Document,>,> {
        let cursor = self.collection.aggregate(pipeline, None,).await.map_err(|e| {
            LoaderError::Execution(format!("Failed to execute aggregation: {}", e),)
        },)?;
        cursor.try_collect().await.map_err(|e| {
            LoaderError::Execution(format!("Failed to drain aggregation cursor: {}", e),)
        },)
    }

    /// First `count` documents, used for verification samples and schema
    /// inference.
    pub async fn sample(&self, count: usize,) -> Result<Vec<Document,>,> {
        self.find_docs(doc! {}, count as i64,).await
    }

    /// Raw `collStats` output for the collection.
    pub async fn coll_stats(&self,) -> Result<Document,> {
        self.database
            .run_command(doc! {"collStats": &self.collection_name}, None,)
            .await
            .map_err(|e| LoaderError::Execution(format!("Failed to read collStats: {}", e),),)
    }

    pub async fn shutdown(self,) {
        self.client.shutdown().await;
        info!("MongoDB connection closed");
    }
}

#[async_trait]
impl DocumentSink for MongoStore {
    /// Batched existence check: one `$in` find per chunk, projected down to
    /// the row key.
    async fn existing_keys(&self, keys: &[String],) -> Result<HashSet<String,>,> {
        if keys.is_empty() {
            return Ok(HashSet::new(),);
        }
        let filter = doc! { (crate::ROW_KEY_FIELD): { "$in": keys } };
        let options = FindOptions::builder()
            .projection(doc! { (crate::ROW_KEY_FIELD): 1, "_id": 0 },)
            .build();
        let mut cursor = self.collection.find(filter, options,).await.map_err(|e| {
            LoaderError::Execution(format!("Failed to check existing keys: {}", e),)
        },)?;

        let mut present = HashSet::new();
        while let Some(doc,) = cursor.try_next().await.map_err(|e| {
            LoaderError::Execution(format!("Failed to drain key cursor: {}", e),)
        },)? {
            if let Ok(key,) = doc.get_str(crate::ROW_KEY_FIELD,) {
                present.insert(key.to_string(),);
            }
        }
        Ok(present,)
    }

    async fn insert_batch(&self, docs: Vec<Document,>,) -> Result<usize,> {
        if docs.is_empty() {
            return Ok(0,);
        }
        let options = InsertManyOptions::builder().ordered(false,).build();
        let result = self
            .collection
            .insert_many(docs, options,)
            .await
            .map_err(|e| LoaderError::BatchWrite(format!("insert_many failed: {}", e),),)?;
        Ok(result.inserted_ids.len(),)
    }

    async fn provision_indexes(&self,) -> Result<usize,> {
        crate::indexes::ensure_indexes(&self.collection,).await
    }
}
