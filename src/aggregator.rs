use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use tracing::info;

use crate::config::{ScoreWeights, ScoringConfig};
use crate::error::{PipelineError, Result};
use crate::models::{TransactionTable, WalletFeatures};
use crate::normalizer::normalize_action;

const SECONDS_PER_DAY: i64 = 86_400;

#[derive(Debug)]
struct WalletAccumulator {
    total_usd: f64,
    tx_count: u64,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    // deposit, borrow, repay, redeemunderlying, liquidationcall
    action_counts: [u64; 5],
}

impl WalletAccumulator {
    fn new(at: DateTime<Utc>) -> Self {
        Self {
            total_usd: 0.0,
            tx_count: 0,
            first_seen: at,
            last_seen: at,
            action_counts: [0; 5],
        }
    }
}

/// Whole days in `d`, floored (a negative span of half a day is -1).
fn whole_days(d: Duration) -> i64 {
    d.num_seconds().div_euclid(SECONDS_PER_DAY)
}

/// Group transactions by wallet and derive features plus the formula score.
///
/// Wallets come out sorted by id. `as_of` is the evaluation time used for
/// `last_action_days_ago`, so scores computed against the wall clock drift
/// from one day to the next.
pub fn aggregate(
    table: &TransactionTable,
    cfg: &ScoringConfig,
    as_of: DateTime<Utc>,
) -> Result<Vec<WalletFeatures>> {
    let labels: Vec<String> = cfg.actions.all().iter().map(|l| normalize_action(l)).collect();

    let mut wallets: BTreeMap<&str, WalletAccumulator> = BTreeMap::new();
    for tx in table.rows() {
        let acc = wallets
            .entry(tx.wallet.as_str())
            .or_insert_with(|| WalletAccumulator::new(tx.timestamp));

        acc.total_usd += tx.usd_value();
        acc.tx_count += 1;
        acc.first_seen = acc.first_seen.min(tx.timestamp);
        acc.last_seen = acc.last_seen.max(tx.timestamp);

        let action = normalize_action(&tx.action);
        if let Some(idx) = labels.iter().position(|l| *l == action) {
            acc.action_counts[idx] += 1;
        }
    }

    let mut rows: Vec<WalletFeatures> = wallets
        .into_iter()
        .map(|(wallet, acc)| wallet_features(wallet, acc, as_of))
        .collect();

    for row in &mut rows {
        row.credit_score = credit_score(row, &cfg.weights)?;
    }

    info!(
        "Aggregated {} transactions into {} wallets (as of {})",
        table.len(),
        rows.len(),
        as_of.to_rfc3339()
    );

    Ok(rows)
}

fn wallet_features(wallet: &str, acc: WalletAccumulator, as_of: DateTime<Utc>) -> WalletFeatures {
    let [deposit, borrow, repay, redeem, liquidation] = acc.action_counts;
    let tx_count = acc.tx_count;
    let active_days = whole_days(acc.last_seen - acc.first_seen) + 1;

    WalletFeatures {
        wallet: wallet.to_string(),
        total_usd: acc.total_usd,
        avg_usd: acc.total_usd / tx_count as f64,
        tx_count,
        active_days,
        last_action_days_ago: whole_days(as_of - acc.last_seen),
        deposit_count: deposit,
        borrow_count: borrow,
        repay_count: repay,
        redeemunderlying_count: redeem,
        liquidationcall_count: liquidation,
        repay_to_borrow_ratio: repay as f64 / (borrow + 1) as f64,
        redeem_to_deposit_ratio: redeem as f64 / (deposit + 1) as f64,
        liquidation_rate: liquidation as f64 / (tx_count + 1) as f64,
        tx_per_day: tx_count as f64 / active_days.max(1) as f64,
        credit_score: 0.0,
    }
}

/// Linear-plus-log score over the aggregates, clamped to the configured bounds.
pub fn credit_score(f: &WalletFeatures, w: &ScoreWeights) -> Result<f64> {
    if f.total_usd.is_nan() || f.total_usd < -1.0 {
        return Err(PipelineError::InvalidFeature {
            wallet: f.wallet.clone(),
            reason: format!("total_usd {} is outside the domain of ln(1 + x)", f.total_usd),
        });
    }

    let raw = w.base
        + w.log_total_usd * f.total_usd.ln_1p()
        + w.repay_to_borrow_ratio * f.repay_to_borrow_ratio
        + w.redeem_to_deposit_ratio * f.redeem_to_deposit_ratio
        + w.tx_per_day * f.tx_per_day
        - w.liquidation_penalty * f.liquidation_rate
        - w.recency_penalty * f.last_action_days_ago as f64;

    if raw.is_nan() {
        return Err(PipelineError::InvalidFeature {
            wallet: f.wallet.clone(),
            reason: "score is not a number".to_string(),
        });
    }

    Ok(raw.clamp(w.min_score, w.max_score))
}
