// CSV output for the normalized and feature tables.
use std::io::Write;

use crate::error::{PipelineError, Result};
use crate::models::{TransactionTable, WalletFeatures, FEATURE_COLUMNS};

pub fn write_normalized<W: Write>(table: &TransactionTable, out: W) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(out);
    for tx in table.rows() {
        wtr.serialize(tx)?;
    }
    wtr.flush()?;
    Ok(())
}

/// Feature table with a header row. With `predictions`, the last column is
/// `predicted_score` instead of the formula's `credit_score`.
pub fn write_features<W: Write>(
    rows: &[WalletFeatures],
    predictions: Option<&[f64]>,
    out: W,
) -> Result<()> {
    if let Some(p) = predictions {
        if p.len() != rows.len() {
            return Err(PipelineError::InvalidFeature {
                wallet: String::new(),
                reason: format!("{} predictions for {} wallets", p.len(), rows.len()),
            });
        }
    }

    let mut wtr = csv::Writer::from_writer(out);

    let mut header = vec!["userWallet"];
    header.extend(FEATURE_COLUMNS);
    header.push(if predictions.is_some() { "predicted_score" } else { "credit_score" });
    wtr.write_record(&header)?;

    for (i, row) in rows.iter().enumerate() {
        let score = predictions.map_or(row.credit_score, |p| p[i]);
        let mut record = Vec::with_capacity(header.len());
        record.push(row.wallet.clone());
        record.push(row.total_usd.to_string());
        record.push(row.avg_usd.to_string());
        record.push(row.tx_count.to_string());
        record.push(row.active_days.to_string());
        record.push(row.last_action_days_ago.to_string());
        record.push(row.deposit_count.to_string());
        record.push(row.borrow_count.to_string());
        record.push(row.repay_count.to_string());
        record.push(row.redeemunderlying_count.to_string());
        record.push(row.liquidationcall_count.to_string());
        record.push(row.repay_to_borrow_ratio.to_string());
        record.push(row.redeem_to_deposit_ratio.to_string());
        record.push(row.liquidation_rate.to_string());
        record.push(row.tx_per_day.to_string());
        record.push(score.to_string());
        wtr.write_record(&record)?;
    }

    wtr.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NormalizedTransaction;
    use chrono::DateTime;

    fn features(wallet: &str, score: f64) -> WalletFeatures {
        WalletFeatures {
            wallet: wallet.to_string(),
            total_usd: 3.0,
            avg_usd: 1.5,
            tx_count: 2,
            active_days: 2,
            last_action_days_ago: 4,
            deposit_count: 1,
            borrow_count: 0,
            repay_count: 1,
            redeemunderlying_count: 0,
            liquidationcall_count: 0,
            repay_to_borrow_ratio: 1.0,
            redeem_to_deposit_ratio: 0.0,
            liquidation_rate: 0.0,
            tx_per_day: 1.0,
            credit_score: score,
        }
    }

    #[test]
    fn feature_csv_has_header_and_score_column() {
        let mut buf = Vec::new();
        write_features(&[features("0xa", 576.1)], None, &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let mut lines = text.lines();
        let header = lines.next().unwrap();
        assert!(header.starts_with("userWallet,total_usd,avg_usd,tx_count"));
        assert!(header.ends_with(",tx_per_day,credit_score"));
        assert_eq!(lines.next().unwrap(), "0xa,3,1.5,2,2,4,1,0,1,0,0,1,0,0,1,576.1");
    }

    #[test]
    fn prediction_replaces_score_column() {
        let mut buf = Vec::new();
        write_features(&[features("0xa", 576.1)], Some(&[512.5][..]), &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.lines().next().unwrap().ends_with(",predicted_score"));
        assert!(text.lines().nth(1).unwrap().ends_with(",512.5"));
    }

    #[test]
    fn prediction_count_must_match() {
        let mut buf = Vec::new();
        assert!(write_features(&[features("0xa", 1.0)], Some(&[][..]), &mut buf).is_err());
    }

    #[test]
    fn normalized_csv_reads_back() {
        let table = TransactionTable::from_rows(vec![NormalizedTransaction {
            wallet: "0xa".into(),
            action: "deposit".into(),
            amount: 2.0,
            unit_price_usd: 1.0,
            timestamp: DateTime::from_timestamp(1629178166, 0).unwrap(),
        }]);
        let mut buf = Vec::new();
        write_normalized(&table, &mut buf).unwrap();
        let text = String::from_utf8(buf.clone()).unwrap();
        assert!(text.starts_with("userWallet,action,amount,unit_price_usd,timestamp\n"));
        assert_eq!(TransactionTable::from_csv(buf.as_slice()).unwrap(), table);
    }
}
