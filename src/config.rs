use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, env, fs, path::PathBuf};
use tracing::info;

use crate::error::{PipelineError, Result};
use crate::schema::FieldMapping;

/// Current revision of the reference scoring formula.
pub const SCORING_CONFIG_VERSION: u32 = 1;

/// Upload limit for `POST /score`; a full transaction export is tens of MB.
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 256 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct Config {
    pub data_path: PathBuf,
    pub db_path: String,
    pub model_dir: PathBuf,
    pub port: u16,
    pub max_upload_bytes: usize,
    pub scoring: ScoringConfig,
}

pub fn load() -> Result<Config> {
    dotenv().ok(); // .env is optional

    let data_path = env::var("DATA_PATH")
        .unwrap_or_else(|_| "data/user-wallet-transactions.json".to_string())
        .into();

    let db_path = env::var("DATABASE_URL").unwrap_or_else(|_| "credit_scores.db".to_string());

    let model_dir = env::var("MODEL_DIR")
        .unwrap_or_else(|_| "models".to_string())
        .into();

    let port = env::var("PORT")
        .unwrap_or_else(|_| "8080".to_string())
        .parse()
        .unwrap_or(8080);

    let max_upload_bytes = env::var("MAX_UPLOAD_BYTES")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_MAX_UPLOAD_BYTES);

    let scoring = match env::var("SCORING_CONFIG") {
        Ok(path) => ScoringConfig::from_file(&path)?,
        Err(_) => ScoringConfig::default(),
    };

    let cfg = Config {
        data_path,
        db_path,
        model_dir,
        port,
        max_upload_bytes,
        scoring,
    };

    info!("Loaded config: {:?}", cfg);

    Ok(cfg)
}

/// Labels of the five actions that feed the named counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionLabels {
    pub deposit: String,
    pub borrow: String,
    pub repay: String,
    pub redeem_underlying: String,
    pub liquidation_call: String,
}

impl Default for ActionLabels {
    fn default() -> Self {
        Self {
            deposit: "deposit".to_string(),
            borrow: "borrow".to_string(),
            repay: "repay".to_string(),
            redeem_underlying: "redeemunderlying".to_string(),
            liquidation_call: "liquidationcall".to_string(),
        }
    }
}

impl ActionLabels {
    pub fn all(&self) -> [&str; 5] {
        [
            self.deposit.as_str(),
            self.borrow.as_str(),
            self.repay.as_str(),
            self.redeem_underlying.as_str(),
            self.liquidation_call.as_str(),
        ]
    }
}

/// Coefficients of the credit score formula.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub base: f64,
    pub log_total_usd: f64,
    pub repay_to_borrow_ratio: f64,
    pub redeem_to_deposit_ratio: f64,
    pub tx_per_day: f64,
    /// Subtracted per unit of liquidation rate.
    pub liquidation_penalty: f64,
    /// Subtracted per day since the last action.
    pub recency_penalty: f64,
    pub min_score: f64,
    pub max_score: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            base: 400.0,
            log_total_usd: 50.0,
            repay_to_borrow_ratio: 100.0,
            redeem_to_deposit_ratio: 50.0,
            tx_per_day: 10.0,
            liquidation_penalty: 120.0,
            recency_penalty: 0.8,
            min_score: 0.0,
            max_score: 1000.0,
        }
    }
}

/// Everything the normalizer and aggregator need, versioned so coefficient
/// changes can be traced to the scores they produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub version: u32,
    /// Raw token amounts are divided by this.
    pub amount_scale: f64,
    pub fields: FieldMapping,
    pub actions: ActionLabels,
    pub weights: ScoreWeights,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            version: SCORING_CONFIG_VERSION,
            amount_scale: 1_000_000.0,
            fields: FieldMapping::default(),
            actions: ActionLabels::default(),
            weights: ScoreWeights::default(),
        }
    }
}

impl ScoringConfig {
    pub fn from_file(path: &str) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| PipelineError::Config(format!("cannot read {}: {}", path, e)))?;
        let cfg: ScoringConfig = serde_json::from_str(&text)
            .map_err(|e| PipelineError::Config(format!("invalid scoring config {}: {}", path, e)))?;
        cfg.validate()?;
        info!("Scoring config v{} loaded from {}", cfg.version, path);
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.amount_scale.is_finite() || self.amount_scale <= 0.0 {
            return Err(PipelineError::Config(format!(
                "amount_scale must be positive, got {}",
                self.amount_scale
            )));
        }

        let labels = self.actions.all();
        if labels.iter().any(|l| l.trim().is_empty()) {
            return Err(PipelineError::Config("action labels must not be empty".into()));
        }
        let distinct: HashSet<String> = labels.iter().map(|l| l.to_lowercase()).collect();
        if distinct.len() != labels.len() {
            return Err(PipelineError::Config("action labels must be distinct".into()));
        }

        let w = &self.weights;
        if !(w.min_score.is_finite() && w.max_score.is_finite()) || w.min_score > w.max_score {
            return Err(PipelineError::Config(format!(
                "score bounds [{}, {}] are invalid",
                w.min_score, w.max_score
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_reference_formula() {
        let cfg = ScoringConfig::default();
        assert_eq!(cfg.version, 1);
        assert_eq!(cfg.amount_scale, 1e6);
        assert_eq!(cfg.weights.base, 400.0);
        assert_eq!(cfg.weights.recency_penalty, 0.8);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_override_keeps_defaults() {
        let cfg: ScoringConfig =
            serde_json::from_str(r#"{"version": 2, "weights": {"base": 350.0}}"#).unwrap();
        assert_eq!(cfg.version, 2);
        assert_eq!(cfg.weights.base, 350.0);
        assert_eq!(cfg.weights.log_total_usd, 50.0);
        assert_eq!(cfg.actions.repay, "repay");
    }

    #[test]
    fn rejects_duplicate_labels_and_bad_scale() {
        let mut cfg = ScoringConfig::default();
        cfg.actions.borrow = "Deposit".to_string();
        assert!(matches!(cfg.validate(), Err(PipelineError::Config(_))));

        let mut cfg = ScoringConfig::default();
        cfg.amount_scale = 0.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn from_file_reports_invalid_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scoring.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = ScoringConfig::from_file(path.to_str().unwrap()).unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }
}
