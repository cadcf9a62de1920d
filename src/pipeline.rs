use std::fs::File;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::aggregator;
use crate::config::ScoringConfig;
use crate::error::Result;
use crate::models::{ScoredWallet, TransactionTable, WalletFeatures};
use crate::normalizer::{self, NormalizeReport};

#[derive(Debug, Clone)]
pub struct ScoringOutput {
    pub as_of: DateTime<Utc>,
    pub report: NormalizeReport,
    pub wallets: Vec<WalletFeatures>,
}

/// Raw records through the normalizer and aggregator.
pub fn score_records(records: &[Value], cfg: &ScoringConfig, as_of: DateTime<Utc>) -> Result<ScoringOutput> {
    let normalized = normalizer::normalize(records, cfg)?;
    let wallets = aggregator::aggregate(&normalized.table, cfg, as_of)?;
    Ok(ScoringOutput {
        as_of,
        report: normalized.report,
        wallets,
    })
}

pub fn score_file(path: &Path, cfg: &ScoringConfig, as_of: DateTime<Utc>) -> Result<ScoringOutput> {
    let records = normalizer::read_records(path)?;
    score_records(&records, cfg, as_of)
}

/// Features from an already-normalized CSV table.
pub fn score_normalized_csv(path: &Path, cfg: &ScoringConfig, as_of: DateTime<Utc>) -> Result<ScoringOutput> {
    let table = TransactionTable::from_csv(File::open(path)?)?;
    let rows = table.len();
    let wallets = aggregator::aggregate(&table, cfg, as_of)?;
    Ok(ScoringOutput {
        as_of,
        report: NormalizeReport {
            input_rows: rows,
            kept_rows: rows,
            dropped_rows: 0,
        },
        wallets,
    })
}

/// Pair each wallet with its prediction, in order. Without predictions the
/// rows carry the formula score only.
pub fn attach_predictions(wallets: Vec<WalletFeatures>, predictions: Option<&[f64]>) -> Vec<ScoredWallet> {
    wallets
        .into_iter()
        .enumerate()
        .map(|(i, features)| ScoredWallet {
            predicted_score: predictions.and_then(|p| p.get(i).copied()),
            features,
        })
        .collect()
}

/// Evaluation time: the given epoch seconds, or now.
pub fn resolve_as_of(epoch_seconds: Option<i64>) -> Option<DateTime<Utc>> {
    match epoch_seconds {
        Some(secs) => DateTime::from_timestamp(secs, 0),
        None => Some(Utc::now()),
    }
}
