//! Regression models trained on the wallet feature table.
//!
//! The target is the formula `credit_score`, so a trained model learns to
//! reproduce the heuristic rather than an independent label.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use smartcore::ensemble::random_forest_regressor::{
    RandomForestRegressor, RandomForestRegressorParameters,
};
use smartcore::linear::linear_regression::{LinearRegression, LinearRegressionParameters};
use smartcore::tree::decision_tree_regressor::{
    DecisionTreeRegressor, DecisionTreeRegressorParameters,
};
use tracing::{info, warn};

use crate::error::{PipelineError, Result};
use crate::models::{feature_matrix, WalletFeatures, FEATURE_COLUMNS};

pub const SPLIT_SEED: u64 = 42;
pub const TEST_FRACTION: f64 = 0.2;
const FOREST_TREES: usize = 100;

pub type Matrix = Array2<f64>;
pub type Target = Array1<f64>;

pub type LinearModel = LinearRegression<f64, f64, Matrix, Target>;
pub type TreeModel = DecisionTreeRegressor<f64, f64, Matrix, Target>;
pub type ForestModel = RandomForestRegressor<f64, f64, Matrix, Target>;

pub trait Regressor: Sized {
    const NAME: &'static str;
    fn train(x: &Matrix, y: &Target) -> Result<Self>;
    fn infer(&self, x: &Matrix) -> Result<Vec<f64>>;
}

fn model_error(e: impl fmt::Display) -> PipelineError {
    PipelineError::Model(e.to_string())
}

impl Regressor for LinearModel {
    const NAME: &'static str = "LinearRegression";

    fn train(x: &Matrix, y: &Target) -> Result<Self> {
        LinearRegression::fit(x, y, LinearRegressionParameters::default()).map_err(model_error)
    }

    fn infer(&self, x: &Matrix) -> Result<Vec<f64>> {
        self.predict(x).map(|p| p.to_vec()).map_err(model_error)
    }
}

impl Regressor for TreeModel {
    const NAME: &'static str = "DecisionTree";

    fn train(x: &Matrix, y: &Target) -> Result<Self> {
        DecisionTreeRegressor::fit(x, y, DecisionTreeRegressorParameters::default())
            .map_err(model_error)
    }

    fn infer(&self, x: &Matrix) -> Result<Vec<f64>> {
        self.predict(x).map(|p| p.to_vec()).map_err(model_error)
    }
}

impl Regressor for ForestModel {
    const NAME: &'static str = "RandomForest";

    fn train(x: &Matrix, y: &Target) -> Result<Self> {
        let params = RandomForestRegressorParameters {
            n_trees: FOREST_TREES,
            seed: SPLIT_SEED,
            ..Default::default()
        };
        RandomForestRegressor::fit(x, y, params).map_err(model_error)
    }

    fn infer(&self, x: &Matrix) -> Result<Vec<f64>> {
        self.predict(x).map(|p| p.to_vec()).map_err(model_error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelMetrics {
    pub mse: f64,
    pub r2: f64,
}

pub fn metrics(y_true: &[f64], y_pred: &[f64]) -> ModelMetrics {
    let n = y_true.len().max(1) as f64;
    let mean = y_true.iter().sum::<f64>() / n;
    let ss_res: f64 = y_true.iter().zip(y_pred).map(|(t, p)| (t - p).powi(2)).sum();
    let ss_tot: f64 = y_true.iter().map(|t| (t - mean).powi(2)).sum();

    let r2 = if ss_tot == 0.0 {
        if ss_res == 0.0 {
            1.0
        } else {
            0.0
        }
    } else {
        1.0 - ss_res / ss_tot
    };

    ModelMetrics { mse: ss_res / n, r2 }
}

/// Deterministic shuffled split; returns (train, test) row indices.
pub fn train_test_split(n: usize, test_fraction: f64, seed: u64) -> Result<(Vec<usize>, Vec<usize>)> {
    let n_test = (n as f64 * test_fraction).ceil() as usize;
    if n < 2 || n_test == 0 || n_test >= n {
        return Err(PipelineError::InsufficientData(format!(
            "cannot split {} wallets with test fraction {}",
            n, test_fraction
        )));
    }

    let mut idx: Vec<usize> = (0..n).collect();
    idx.shuffle(&mut StdRng::seed_from_u64(seed));
    let train = idx.split_off(n_test);
    Ok((train, idx))
}

/// A fitted estimator, tagged by kind in the artifact.
#[derive(Serialize, Deserialize)]
pub enum Estimator {
    LinearRegression(LinearModel),
    DecisionTree(TreeModel),
    RandomForest(ForestModel),
}

impl From<LinearModel> for Estimator {
    fn from(m: LinearModel) -> Self {
        Estimator::LinearRegression(m)
    }
}

impl From<TreeModel> for Estimator {
    fn from(m: TreeModel) -> Self {
        Estimator::DecisionTree(m)
    }
}

impl From<ForestModel> for Estimator {
    fn from(m: ForestModel) -> Self {
        Estimator::RandomForest(m)
    }
}

/// A fitted model as stored on disk, with the feature columns it expects.
#[derive(Serialize, Deserialize)]
pub struct SavedModel {
    pub feature_columns: Vec<String>,
    pub estimator: Estimator,
}

impl fmt::Debug for SavedModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SavedModel")
            .field("name", &self.name())
            .field("feature_columns", &self.feature_columns)
            .finish()
    }
}

impl SavedModel {
    pub fn new(estimator: impl Into<Estimator>) -> Self {
        Self {
            feature_columns: FEATURE_COLUMNS.iter().map(|c| c.to_string()).collect(),
            estimator: estimator.into(),
        }
    }

    pub fn name(&self) -> &'static str {
        match &self.estimator {
            Estimator::LinearRegression(_) => LinearModel::NAME,
            Estimator::DecisionTree(_) => TreeModel::NAME,
            Estimator::RandomForest(_) => ForestModel::NAME,
        }
    }

    pub fn predict(&self, x: &Matrix) -> Result<Vec<f64>> {
        if x.ncols() != self.feature_columns.len() {
            return Err(PipelineError::Model(format!(
                "{} expects {} features, got {}",
                self.name(),
                self.feature_columns.len(),
                x.ncols()
            )));
        }
        if x.nrows() == 0 {
            return Ok(Vec::new());
        }
        match &self.estimator {
            Estimator::LinearRegression(m) => m.infer(x),
            Estimator::DecisionTree(m) => m.infer(x),
            Estimator::RandomForest(m) => m.infer(x),
        }
    }

    pub fn predict_wallets(&self, rows: &[WalletFeatures]) -> Result<Vec<f64>> {
        let (x, _) = feature_matrix(rows);
        self.predict(&x)
    }

    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.json", self.name()));
        fs::write(&path, serde_json::to_string(self)?)?;
        Ok(path)
    }

    /// Fails with `ModelUnavailable` when the file is missing, unreadable, or
    /// was trained on other feature columns.
    pub fn load(path: &Path) -> Result<Self> {
        let unavailable = |reason: String| PipelineError::ModelUnavailable {
            path: path.to_path_buf(),
            reason,
        };
        let text = fs::read_to_string(path).map_err(|e| unavailable(e.to_string()))?;
        let model: SavedModel = serde_json::from_str(&text).map_err(|e| unavailable(e.to_string()))?;

        if model.feature_columns.iter().map(String::as_str).ne(FEATURE_COLUMNS) {
            return Err(unavailable(format!(
                "trained on columns [{}], expected [{}]",
                model.feature_columns.join(", "),
                FEATURE_COLUMNS.join(", ")
            )));
        }
        Ok(model)
    }
}

pub struct TrainingReport {
    pub results: BTreeMap<String, ModelMetrics>,
    pub best_model_name: String,
    pub best: SavedModel,
}

struct Split {
    x_train: Matrix,
    y_train: Target,
    x_test: Matrix,
    y_test: Vec<f64>,
}

type CandidateFit = fn(&Split) -> Result<(Estimator, ModelMetrics)>;

fn fit_candidate<M>(split: &Split) -> Result<(Estimator, ModelMetrics)>
where
    M: Regressor + Into<Estimator>,
{
    let model = M::train(&split.x_train, &split.y_train)?;
    let m = metrics(&split.y_test, &model.infer(&split.x_test)?);
    Ok((model.into(), m))
}

fn candidates() -> [(&'static str, CandidateFit); 3] {
    [
        (LinearModel::NAME, fit_candidate::<LinearModel>),
        (TreeModel::NAME, fit_candidate::<TreeModel>),
        (ForestModel::NAME, fit_candidate::<ForestModel>),
    ]
}

/// Fit every candidate on a train split and keep the one with the best r2
/// on the held-out split.
pub fn train_and_select(rows: &[WalletFeatures]) -> Result<TrainingReport> {
    warn!("Training target is the formula credit score; models reproduce the heuristic");

    let (x, y) = feature_matrix(rows);
    let (train_idx, test_idx) = train_test_split(rows.len(), TEST_FRACTION, SPLIT_SEED)?;
    let split = Split {
        x_train: x.select(Axis(0), &train_idx),
        y_train: y.select(Axis(0), &train_idx),
        x_test: x.select(Axis(0), &test_idx),
        y_test: test_idx.iter().map(|&i| y[i]).collect(),
    };
    info!(
        "Split {} wallets into {} train / {} test",
        rows.len(),
        train_idx.len(),
        test_idx.len()
    );

    let mut results = BTreeMap::new();
    let mut best: Option<(f64, Estimator)> = None;

    for (name, fit) in candidates() {
        let (estimator, m) = match fit(&split) {
            Ok(fitted) => fitted,
            Err(e) => {
                warn!("{} failed to fit: {}", name, e);
                continue;
            }
        };
        info!("{} - MSE: {:.4}, R2: {:.4}", name, m.mse, m.r2);
        results.insert(name.to_string(), m);

        if best.as_ref().map_or(true, |(r2, _)| m.r2 > *r2) {
            best = Some((m.r2, estimator));
        }
    }

    let (_, best) = best.ok_or_else(|| {
        PipelineError::InsufficientData("no candidate model could be fitted".to_string())
    })?;
    let best = SavedModel::new(best);
    Ok(TrainingReport {
        results,
        best_model_name: best.name().to_string(),
        best,
    })
}

/// Score a saved model against the formula scores of `rows`.
pub fn evaluate_saved_model(rows: &[WalletFeatures], model_path: &Path) -> Result<ModelMetrics> {
    let model = SavedModel::load(model_path)?;
    let (x, y) = feature_matrix(rows);
    let m = metrics(&y.to_vec(), &model.predict(&x)?);
    info!("Evaluated {} on {} wallets: MSE {:.4}, R2 {:.4}", model.name(), rows.len(), m.mse, m.r2);
    Ok(m)
}

#[cfg(test)]
pub(crate) fn constant_model(score: f64) -> SavedModel {
    let x = Array2::zeros((2, FEATURE_COLUMNS.len()));
    let y = Array1::from_elem(2, score);
    SavedModel::new(TreeModel::train(&x, &y).unwrap())
}
