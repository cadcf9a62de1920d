use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Boundary at which a schema check ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaStage {
    RawRecords,
    NormalizedTransactions,
}

impl fmt::Display for SchemaStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaStage::RawRecords => f.write_str("raw records"),
            SchemaStage::NormalizedTransactions => f.write_str("normalized transactions"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{stage} missing required fields: {}", join_names(.missing))]
pub struct SchemaError {
    pub stage: SchemaStage,
    pub missing: BTreeSet<String>,
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("model unavailable at {}: {reason}", .path.display())]
    ModelUnavailable { path: PathBuf, reason: String },

    #[error("invalid feature for wallet {wallet}: {reason}")]
    InvalidFeature { wallet: String, reason: String },

    #[error("not enough data to train: {0}")]
    InsufficientData(String),

    #[error("model error: {0}")]
    Model(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

fn join_names(names: &BTreeSet<String>) -> String {
    names.iter().map(String::as_str).collect::<Vec<_>>().join(", ")
}

pub type Result<T> = std::result::Result<T, PipelineError>;
