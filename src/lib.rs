//! Wallet-level features and a bounded credit score from lending-protocol
//! transaction logs, plus the model, ledger and HTTP pieces around them.

pub mod aggregator;
pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod export;
pub mod model;
pub mod models;
pub mod normalizer;
pub mod pipeline;
pub mod schema;

pub use error::{PipelineError, Result, SchemaError};
