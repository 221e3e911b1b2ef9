// po_ingestor/src/loader.rs
// Chunked, idempotent CSV ingestion.

use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::path::Path;
use std::time::Instant;

use async_trait::async_trait;
use csv::StringRecord;
use mongodb::bson::Document;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::LoaderConfig;
use crate::error::{LoaderError, Result};
use crate::normalize::{NormalizedRecord, field_name, normalize_record};
use crate::retry::{execute_with_retry, wrap_error};

/// Write side of the store, seen from the loader. The production
/// implementation is [`crate::mongo::MongoStore`]; tests substitute an
/// in-memory sink.
#[async_trait]
pub trait DocumentSink: Send + Sync {
    /// Which of `keys` are already present in the store.
    async fn existing_keys(&self, keys: &[String],) -> Result<HashSet<String,>,>;

    /// Inserts one batch, returning how many documents were written.
    async fn insert_batch(&self, docs: Vec<Document,>,) -> Result<usize,>;

    /// Ensures the required index set exists; returns how many indexes were
    /// created.
    async fn provision_indexes(&self,) -> Result<usize,>;
}

/// Explicit cursor over the source file. Chunk position and record offset
/// are tracked here rather than buried in iterator state, so resumption
/// behavior is observable and testable.
pub struct ChunkReader {
    reader:       csv::Reader<File,>,
    headers:      Vec<String,>,
    chunk_size:   usize,
    chunk_index:  usize,
    records_read: u64,
}

impl ChunkReader {
    pub fn open(path: &Path, chunk_size: usize,) -> Result<Self,> {
        if chunk_size == 0 {
            return Err(LoaderError::Configuration(
                "chunk_size must be at least 1".to_string(),
            ),);
        }
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true,)
            .from_path(path,)?;
        let headers = reader
            .byte_headers()?
            .iter()
            .map(|raw| field_name(&String::from_utf8_lossy(raw,),),)
            .collect();
        Ok(ChunkReader {
            reader,
            headers,
            chunk_size,
            chunk_index: 0,
            records_read: 0,
        },)
    }

    /// Normalized header names, positionally aligned with every record.
    pub fn headers(&self,) -> &[String] {
        &self.headers
    }

    pub fn records_read(&self,) -> u64 {
        self.records_read
    }

    /// Reads the next chunk, returning its 1-based index. `None` once the
    /// file is exhausted. Rows with invalid UTF-8 are decoded lossily rather
    /// than aborting the load mid-file.
    pub fn next_chunk(&mut self,) -> Result<Option<(usize, Vec<StringRecord,>,),>,> {
        let mut buf = Vec::with_capacity(self.chunk_size,);
        for result in self.reader.byte_records() {
            buf.push(StringRecord::from_byte_record_lossy(result?,),);
            if buf.len() == self.chunk_size {
                break;
            }
        }
        if buf.is_empty() {
            return Ok(None,);
        }
        self.chunk_index += 1;
        self.records_read += buf.len() as u64;
        Ok(Some((self.chunk_index, buf,),),)
    }
}

#[derive(Debug, Clone, Serialize,)]
pub struct ChunkFailure {
    pub chunk_index: usize,
    pub records:     usize,
    pub reason:      String,
}

/// Completion report for one ingestion run.
#[derive(Debug, Default, Serialize,)]
pub struct LoadReport {
    pub total_records:      u64,
    pub inserted_records:   u64,
    pub skipped_duplicates: u64,
    pub rejected_records:   u64,
    pub failed_records:     u64,
    pub chunks_processed:   usize,
    pub failed_chunks:      Vec<ChunkFailure,>,
    /// Rejection counts by reason code.
    pub rejections:         BTreeMap<String, u64,>,
    pub indexes_created:    usize,
    pub duration_secs:      f64,
}

impl LoadReport {
    pub fn save(&self, path: &Path,) -> Result<(),> {
        let json = serde_json::to_string_pretty(self,)
            .map_err(|e| LoaderError::Other(format!("Failed to serialize load report: {}", e),),)?;
        std::fs::write(path, json,)?;
        info!("Load report saved to {}", path.display());
        Ok((),)
    }
}

/// Chunked, idempotent loader. Chunks are processed sequentially; within a
/// chunk the existence check and the batch insert form the deduplication
/// unit, which assumes a single ingestion writer against the collection.
pub struct Loader<'a, S: DocumentSink,> {
    sink:   &'a S,
    config: &'a LoaderConfig,
}

impl<'a, S: DocumentSink,> Loader<'a, S,> {
    pub fn new(sink: &'a S, config: &'a LoaderConfig,) -> Self {
        Loader { sink, config, }
    }

    /// Loads the delimited file at `path` into the store. Re-running after a
    /// partial load resumes without duplication: previously inserted rows
    /// are recognized by their fingerprint and skipped. A chunk whose write
    /// keeps failing is recorded and skipped; it never aborts the load.
    pub async fn load_csv(&self, path: &Path, max_records: Option<u64,>,) -> Result<LoadReport,> {
        info!("Starting data load from: {}", path.display());
        let start = Instant::now();
        let mut reader = ChunkReader::open(path, self.config.chunk_size,)?;
        let mut report = LoadReport::default();

        while let Some((chunk_index, mut records,),) = reader.next_chunk()? {
            if let Some(limit,) = max_records {
                let remaining = limit.saturating_sub(report.total_records,) as usize;
                if remaining == 0 {
                    info!("Reached maximum records limit: {}", limit);
                    break;
                }
                records.truncate(remaining,);
            }

            report.chunks_processed += 1;
            report.total_records += records.len() as u64;

            // Normalize the whole chunk; rejected rows are counted, not
            // fatal.
            let mut normalized: Vec<NormalizedRecord,> = Vec::with_capacity(records.len(),);
            let mut seen_in_chunk: HashSet<String,> = HashSet::new();
            for record in &records {
                match normalize_record(reader.headers(), record,) {
                    Ok(rec,) => {
                        // A row repeated inside one chunk is the same
                        // duplicate case as a row repeated across runs.
                        if seen_in_chunk.insert(rec.key.clone(),) {
                            normalized.push(rec,);
                        } else {
                            report.skipped_duplicates += 1;
                        }
                    },
                    Err(reason,) => {
                        report.rejected_records += 1;
                        *report
                            .rejections
                            .entry(reason.as_str().to_string(),)
                            .or_insert(0,) += 1;
                    },
                }
            }

            match self.ingest_chunk(&normalized,).await {
                Ok((inserted, skipped,),) => {
                    report.inserted_records += inserted as u64;
                    report.skipped_duplicates += skipped as u64;
                    info!(
                        "Chunk {}: inserted {} records (total processed: {})",
                        chunk_index, inserted, report.total_records
                    );
                },
                Err(e,) => {
                    report.failed_records += normalized.len() as u64;
                    error!("Error ingesting chunk {}: {}", chunk_index, e);
                    report.failed_chunks.push(ChunkFailure {
                        chunk_index,
                        records: normalized.len(),
                        reason: e.to_string(),
                    },);
                },
            }
        }

        match self.sink.provision_indexes().await {
            Ok(created,) => report.indexes_created = created,
            // The load itself succeeded; a provisioning failure is reported
            // but does not discard the completion report.
            Err(e,) => warn!("Index provisioning failed: {}", e),
        }

        report.duration_secs = start.elapsed().as_secs_f64();
        info!(
            "Load complete: {} processed, {} inserted, {} duplicates skipped, {} rejected, {} \
             failed in {:.2}s",
            report.total_records,
            report.inserted_records,
            report.skipped_duplicates,
            report.rejected_records,
            report.failed_records,
            report.duration_secs
        );
        Ok(report,)
    }

    /// Dedupe-then-insert for one chunk. The insert is retried with backoff
    /// inside the configured window before the chunk is given up on.
    async fn ingest_chunk(&self, normalized: &[NormalizedRecord],) -> Result<(usize, usize,),> {
        if normalized.is_empty() {
            return Ok((0, 0,),);
        }

        let keys: Vec<String,> = normalized.iter().map(|r| r.key.clone(),).collect();
        let present = self.sink.existing_keys(&keys,).await?;

        let fresh: Vec<Document,> = normalized
            .iter()
            .filter(|r| !present.contains(&r.key,),)
            .map(|r| r.doc.clone(),)
            .collect();
        let skipped = normalized.len() - fresh.len();
        if fresh.is_empty() {
            return Ok((0, skipped,),);
        }

        let inserted = execute_with_retry(
            || async {
                self.sink
                    .insert_batch(fresh.clone(),)
                    .await
                    .map_err(wrap_error,)
            },
            self.config.write_retry_window,
        )
        .await?;

        Ok((inserted, skipped,),)
    }
}
