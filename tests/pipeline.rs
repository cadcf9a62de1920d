use chrono::DateTime;
use serde_json::{json, Value};

use wallet_credit_score::config::ScoringConfig;
use wallet_credit_score::error::SchemaStage;
use wallet_credit_score::model::{self, SavedModel};
use wallet_credit_score::models::TransactionTable;
use wallet_credit_score::{aggregator, export, normalizer, pipeline, PipelineError};

const T0: i64 = 1_629_178_166;
const DAY: i64 = 86_400;

fn raw(wallet: &str, kind: &str, amount: &str, price: &str, ts: i64) -> Value {
    json!({
        "userWallet": wallet,
        "network": "polygon",
        "protocol": "aave_v2",
        "timestamp": ts,
        "blockNumber": 1629178166,
        "action": kind.to_lowercase(),
        "actionData": {
            "type": kind,
            "amount": amount,
            "assetSymbol": "USDC",
            "assetPriceUSD": price,
            "userId": wallet
        }
    })
}

#[test]
fn deposit_and_repay_wallet_end_to_end() {
    let records = vec![
        raw("W1", "Deposit", "2000000", "1.0", T0),
        raw("W1", "Repay", "1000000", "1.0", T0 + DAY),
    ];
    let as_of = DateTime::from_timestamp(T0 + 5 * DAY, 0).unwrap();
    let cfg = ScoringConfig::default();

    let normalized = normalizer::normalize(&records, &cfg).unwrap();
    let amounts: Vec<f64> = normalized.table.rows().iter().map(|t| t.amount).collect();
    assert_eq!(amounts, vec![2.0, 1.0]);

    let wallets = aggregator::aggregate(&normalized.table, &cfg, as_of).unwrap();
    assert_eq!(wallets.len(), 1);
    let w = &wallets[0];
    assert_eq!((w.deposit_count, w.repay_count, w.borrow_count), (1, 1, 0));
    assert_eq!(w.total_usd, 3.0);
    assert_eq!(w.active_days, 2);
    assert_eq!(w.tx_per_day, 1.0);
    assert_eq!(w.repay_to_borrow_ratio, 1.0);
    assert_eq!(w.liquidation_rate, 0.0);
    assert_eq!(w.redeem_to_deposit_ratio, 0.0);
    assert_eq!(w.last_action_days_ago, 4);

    let expected = 400.0 + 50.0 * 4f64.ln() + 100.0 + 10.0 - 0.8 * 4.0;
    assert!((w.credit_score - expected).abs() < 1e-9);
}

#[test]
fn missing_payload_fails_before_any_row() {
    let records = vec![json!({"userWallet": "W1", "timestamp": T0, "type": "deposit"})];
    let err = pipeline::score_records(
        &records,
        &ScoringConfig::default(),
        DateTime::from_timestamp(T0, 0).unwrap(),
    )
    .unwrap_err();
    match err {
        PipelineError::Schema(e) => {
            assert_eq!(e.stage, SchemaStage::RawRecords);
            assert!(e.to_string().contains("actionData"));
        }
        other => panic!("expected schema error, got {:?}", other),
    }
}

#[test]
fn normalized_table_without_timestamp_fails() {
    let csv = "userWallet,action,amount,unit_price_usd\nW1,deposit,1.0,1.0\n";
    match TransactionTable::from_csv(csv.as_bytes()).unwrap_err() {
        PipelineError::Schema(e) => {
            assert_eq!(e.stage, SchemaStage::NormalizedTransactions);
            assert!(e.missing.contains("timestamp"));
        }
        other => panic!("expected schema error, got {:?}", other),
    }
}

#[test]
fn normalized_csv_round_trip_gives_same_features() {
    let records = vec![
        raw("0xb", "borrow", "4000000", "1.01", T0),
        raw("0xa", "deposit", "2500000", "2000.5", T0 + 3 * DAY),
        raw("0xb", "repay", "4100000", "1.0", T0 + 7 * DAY),
        raw("0xb", "liquidationcall", "100000", "1.0", T0 + 8 * DAY),
    ];
    let cfg = ScoringConfig::default();
    let as_of = DateTime::from_timestamp(T0 + 30 * DAY, 0).unwrap();
    let direct = pipeline::score_records(&records, &cfg, as_of).unwrap();

    let mut buf = Vec::new();
    let normalized = normalizer::normalize(&records, &cfg).unwrap();
    export::write_normalized(&normalized.table, &mut buf).unwrap();
    let table = TransactionTable::from_csv(buf.as_slice()).unwrap();
    let via_csv = aggregator::aggregate(&table, &cfg, as_of).unwrap();

    assert_eq!(direct.wallets, via_csv);
    assert_eq!(via_csv[0].wallet, "0xa");
    assert_eq!(via_csv[1].active_days, 9);
}

#[test]
fn scores_stay_within_bounds() {
    let cfg = ScoringConfig::default();
    let amounts = ["0", "1", "1000000", "999999999999999999999999", "1e30"];
    let prices = ["0", "0.5", "1", "1e12", "1e300"];
    let kinds = ["deposit", "borrow", "repay", "redeemunderlying", "liquidationcall", "swap"];

    let mut records = Vec::new();
    for (i, amount) in amounts.iter().enumerate() {
        for (j, price) in prices.iter().enumerate() {
            for (k, kind) in kinds.iter().enumerate() {
                let wallet = format!("0x{}{}", i, j);
                let ts = T0 + (k as i64) * 400 * DAY;
                records.push(raw(&wallet, kind, amount, price, ts));
            }
        }
    }
    for n in 0..40 {
        records.push(raw("0xliquidated", "liquidationcall", "1", "1", T0 + n));
    }

    for as_of in [T0 - 3000 * DAY, T0, T0 + 4000 * DAY] {
        let out = pipeline::score_records(&records, &cfg, DateTime::from_timestamp(as_of, 0).unwrap()).unwrap();
        assert!(!out.wallets.is_empty());
        for w in &out.wallets {
            assert!(
                (0.0..=1000.0).contains(&w.credit_score),
                "{} scored {}",
                w.wallet,
                w.credit_score
            );
        }
    }
}

#[test]
fn training_selects_a_model_that_tracks_the_formula() {
    let kinds = ["deposit", "borrow", "repay", "redeemunderlying"];
    let mut records = Vec::new();
    for w in 0..30 {
        let wallet = format!("0x{:040x}", w);
        for n in 0..(1 + w % 5) {
            let kind = kinds[(w + n) % kinds.len()];
            let amount = format!("{}", (w + 1) * 1_000_000 * (n + 1));
            let ts = T0 + ((w * 3 + n * 2) as i64) * DAY;
            records.push(raw(&wallet, kind, &amount, "1.0", ts));
        }
    }

    let cfg = ScoringConfig::default();
    let as_of = DateTime::from_timestamp(T0 + 200 * DAY, 0).unwrap();
    let out = pipeline::score_records(&records, &cfg, as_of).unwrap();
    assert_eq!(out.wallets.len(), 30);

    let report = model::train_and_select(&out.wallets).unwrap();
    assert!(report.results.contains_key("DecisionTree"));
    assert!(report.results.contains_key("RandomForest"));
    let best_r2 = report.results[&report.best_model_name].r2;
    assert!(report.results.values().all(|m| m.r2 <= best_r2));

    let dir = tempfile::tempdir().unwrap();
    let path = report.best.save(dir.path()).unwrap();
    let reloaded = SavedModel::load(&path).unwrap();
    assert_eq!(reloaded.name(), report.best_model_name);
    assert_eq!(
        reloaded.predict_wallets(&out.wallets).unwrap(),
        report.best.predict_wallets(&out.wallets).unwrap()
    );

    let metrics = model::evaluate_saved_model(&out.wallets, &path).unwrap();
    assert!(metrics.r2 > 0.5, "r2 {}", metrics.r2);
}

#[test]
fn evaluating_a_missing_model_is_model_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let err = model::evaluate_saved_model(&[], &dir.path().join("absent.json")).unwrap_err();
    assert!(matches!(err, PipelineError::ModelUnavailable { .. }));
}

#[test]
fn training_with_one_wallet_is_rejected() {
    let records = vec![raw("W1", "deposit", "1000000", "1", T0)];
    let out = pipeline::score_records(
        &records,
        &ScoringConfig::default(),
        DateTime::from_timestamp(T0, 0).unwrap(),
    )
    .unwrap();
    assert!(matches!(
        model::train_and_select(&out.wallets),
        Err(PipelineError::InsufficientData(_))
    ));
}
