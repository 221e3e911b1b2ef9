// po_ingestor/src/error.rs
// Defines custom error types for the po_ingestor crate.

use thiserror::Error;

#[derive(Debug, Error,)]
pub enum LoaderError {
    #[error("Failed to connect to store: {0}")]
    Connection(String,),
    #[error("Invalid query specification at {stage}: {reason}")]
    Validation { stage: String, reason: String, },
    #[error("Query execution failed: {0}")]
    Execution(String,),
    #[error("Batch write failed: {0}")]
    BatchWrite(String,),
    #[error("Invalid configuration: {0}")]
    Configuration(String,),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error,),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error,),
    #[error("Other error: {0}")]
    Other(String,),
}

impl LoaderError {
    /// A validation failure identifying the offending stage of a query or
    /// pipeline specification. Nothing is executed when one is returned.
    pub fn validation(stage: impl Into<String,>, reason: impl Into<String,>,) -> Self {
        LoaderError::Validation {
            stage:  stage.into(),
            reason: reason.into(),
        }
    }

    pub fn is_transient(&self,) -> bool {
        match self {
            LoaderError::Connection(_,) => true,
            LoaderError::BatchWrite(msg,) | LoaderError::Execution(msg,) => {
                let m = msg.to_lowercase();
                m.contains("timeout",)
                    || m.contains("timed out",)
                    || m.contains("connection",)
                    || m.contains("server selection",)
                    || m.contains("connection reset",)
                    || m.contains("service unavailable",)
                    || m.contains("interrupted",)
            },
            _ => false,
        }
    }
}

pub type Result<T,> = std::result::Result<T, LoaderError,>;
