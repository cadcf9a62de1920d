// src/models.rs
use std::io::Read;

use chrono::{DateTime, Utc};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::schema::Schema;

/// One lending-protocol transaction after normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedTransaction {
    #[serde(rename = "userWallet")]
    pub wallet: String,
    pub action: String,
    pub amount: f64,          // natural token units
    pub unit_price_usd: f64,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,
}

impl NormalizedTransaction {
    pub fn usd_value(&self) -> f64 {
        self.amount * self.unit_price_usd
    }
}

/// Normalized transactions in input order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionTable {
    rows: Vec<NormalizedTransaction>,
}

impl TransactionTable {
    pub fn from_rows(rows: Vec<NormalizedTransaction>) -> Self {
        Self { rows }
    }

    /// Read a normalized table from CSV. The header must carry every
    /// normalized column; extra columns are ignored.
    pub fn from_csv<R: Read>(reader: R) -> Result<Self> {
        let mut rdr = csv::Reader::from_reader(reader);
        let headers = rdr.headers()?.clone();
        Schema::normalized().check(headers.iter())?;

        let mut rows = Vec::new();
        for record in rdr.deserialize() {
            let tx: NormalizedTransaction = record?;
            rows.push(tx);
        }
        Ok(Self { rows })
    }

    pub fn rows(&self) -> &[NormalizedTransaction] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Feature columns in matrix order; excludes the wallet id and the score.
pub const FEATURE_COLUMNS: [&str; 14] = [
    "total_usd",
    "avg_usd",
    "tx_count",
    "active_days",
    "last_action_days_ago",
    "deposit_count",
    "borrow_count",
    "repay_count",
    "redeemunderlying_count",
    "liquidationcall_count",
    "repay_to_borrow_ratio",
    "redeem_to_deposit_ratio",
    "liquidation_rate",
    "tx_per_day",
];

/// Aggregated features and formula score for one wallet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletFeatures {
    #[serde(rename = "userWallet")]
    pub wallet: String,
    pub total_usd: f64,
    pub avg_usd: f64,
    pub tx_count: u64,
    pub active_days: i64,
    pub last_action_days_ago: i64,
    pub deposit_count: u64,
    pub borrow_count: u64,
    pub repay_count: u64,
    pub redeemunderlying_count: u64,
    pub liquidationcall_count: u64,
    pub repay_to_borrow_ratio: f64,
    pub redeem_to_deposit_ratio: f64,
    pub liquidation_rate: f64,
    pub tx_per_day: f64,
    pub credit_score: f64,
}

impl WalletFeatures {
    /// Values in `FEATURE_COLUMNS` order.
    pub fn feature_vector(&self) -> Vec<f64> {
        vec![
            self.total_usd,
            self.avg_usd,
            self.tx_count as f64,
            self.active_days as f64,
            self.last_action_days_ago as f64,
            self.deposit_count as f64,
            self.borrow_count as f64,
            self.repay_count as f64,
            self.redeemunderlying_count as f64,
            self.liquidationcall_count as f64,
            self.repay_to_borrow_ratio,
            self.redeem_to_deposit_ratio,
            self.liquidation_rate,
            self.tx_per_day,
        ]
    }
}

/// Feature row with the model's prediction attached.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredWallet {
    #[serde(flatten)]
    pub features: WalletFeatures,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub predicted_score: Option<f64>,
}

/// Split a feature table into a matrix and the formula-score target.
pub fn feature_matrix(rows: &[WalletFeatures]) -> (Array2<f64>, Array1<f64>) {
    let mut x = Array2::zeros((rows.len(), FEATURE_COLUMNS.len()));
    for (mut out, row) in x.rows_mut().into_iter().zip(rows) {
        out.assign(&Array1::from(row.feature_vector()));
    }
    let y = rows.iter().map(|r| r.credit_score).collect();
    (x, y)
}
