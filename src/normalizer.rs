//! Raw lending-protocol records to a typed transaction table.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::config::ScoringConfig;
use crate::error::Result;
use crate::models::{NormalizedTransaction, TransactionTable};
use crate::schema::FieldMapping;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NormalizeReport {
    pub input_rows: usize,
    pub kept_rows: usize,
    pub dropped_rows: usize,
}

#[derive(Debug, Clone)]
pub struct Normalized {
    pub table: TransactionTable,
    pub report: NormalizeReport,
}

/// Load raw records from a file holding a JSON array or JSON lines.
pub fn read_records(path: &Path) -> Result<Vec<Value>> {
    let text = fs::read_to_string(path)?;
    parse_records(&text)
}

pub fn parse_records(text: &str) -> Result<Vec<Value>> {
    if text.trim_start().starts_with('[') {
        return Ok(serde_json::from_str(text)?);
    }
    let records = serde_json::Deserializer::from_str(text)
        .into_iter::<Value>()
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(records)
}

/// Flatten, project, coerce and filter raw records.
///
/// Fails before emitting any row when the payload field, or any canonical
/// field after flattening, is absent from every record. Rows with a missing
/// or unparsable required value are dropped and counted in the report.
pub fn normalize(records: &[Value], cfg: &ScoringConfig) -> Result<Normalized> {
    let fields = &cfg.fields;

    let top_level: BTreeSet<&str> = records
        .iter()
        .filter_map(Value::as_object)
        .flat_map(|obj| obj.keys().map(String::as_str))
        .collect();
    fields.payload_schema().check(top_level.iter().copied())?;

    let flattened: BTreeSet<&str> = records
        .iter()
        .filter_map(Value::as_object)
        .flat_map(|obj| flattened_keys(obj, fields))
        .collect();
    fields.flattened_schema().check(flattened.iter().copied())?;

    let mut rows = Vec::with_capacity(records.len());
    for (idx, record) in records.iter().enumerate() {
        match normalize_record(record, cfg, &top_level) {
            Some(tx) => rows.push(tx),
            None => debug!("Dropping record {}: missing or unparsable field", idx),
        }
    }

    let report = NormalizeReport {
        input_rows: records.len(),
        kept_rows: rows.len(),
        dropped_rows: records.len() - rows.len(),
    };
    info!(
        "Normalized {} of {} records ({} dropped)",
        report.kept_rows, report.input_rows, report.dropped_rows
    );

    Ok(Normalized {
        table: TransactionTable::from_rows(rows),
        report,
    })
}

fn payload<'a>(obj: &'a Map<String, Value>, fields: &FieldMapping) -> Option<&'a Map<String, Value>> {
    obj.get(&fields.payload).and_then(Value::as_object)
}

fn flattened_keys<'a>(
    obj: &'a Map<String, Value>,
    fields: &'a FieldMapping,
) -> impl Iterator<Item = &'a str> {
    let nested = payload(obj, fields).into_iter().flat_map(|p| p.keys());
    obj.keys()
        .filter(move |k| **k != fields.payload)
        .chain(nested)
        .map(String::as_str)
}

/// A name that is a top-level field of any record shadows the payload field
/// of that name in every record, so a record without the top-level value has
/// it missing.
fn lookup<'a>(
    obj: &'a Map<String, Value>,
    fields: &FieldMapping,
    top_level: &BTreeSet<&str>,
    name: &str,
) -> Option<&'a Value> {
    if top_level.contains(name) {
        return obj.get(name);
    }
    payload(obj, fields).and_then(|p| p.get(name))
}

fn normalize_record(
    record: &Value,
    cfg: &ScoringConfig,
    top_level: &BTreeSet<&str>,
) -> Option<NormalizedTransaction> {
    let obj = record.as_object()?;
    let fields = &cfg.fields;
    let field = |name: &str| lookup(obj, fields, top_level, name);

    let wallet = text(field(&fields.wallet)?)?;
    let action = normalize_action(text(field(&fields.action)?)?.trim());
    if action.is_empty() {
        return None;
    }
    let amount = scaled_amount(field(&fields.amount)?, cfg.amount_scale)?;
    let unit_price_usd = non_negative(field(&fields.unit_price_usd)?)?;
    let timestamp = epoch_seconds(field(&fields.timestamp)?)?;

    Some(NormalizedTransaction {
        wallet,
        action,
        amount,
        unit_price_usd,
        timestamp,
    })
}

/// Lowercases an action label; applying it twice changes nothing.
pub fn normalize_action(action: &str) -> String {
    action.to_lowercase()
}

/// Opaque text, kept verbatim; only an empty string counts as missing.
fn text(value: &Value) -> Option<String> {
    let s = match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    (!s.is_empty()).then_some(s)
}

fn numeric_text(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    }
}

fn non_negative(value: &Value) -> Option<f64> {
    let v: f64 = numeric_text(value)?.parse().ok()?;
    (v.is_finite() && v >= 0.0).then_some(v)
}

/// Raw fixed-point amount divided by the token scale. Exact decimal division
/// when the raw value fits a `Decimal`, float division otherwise.
fn scaled_amount(value: &Value, scale: f64) -> Option<f64> {
    let raw = numeric_text(value)?;
    let exact = Decimal::from_str(&raw)
        .or_else(|_| Decimal::from_scientific(&raw))
        .ok()
        .zip(Decimal::from_f64(scale))
        .and_then(|(d, s)| d.checked_div(s))
        .and_then(|q| q.to_f64());
    let scaled = match exact {
        Some(v) => v,
        None => raw.parse::<f64>().ok()? / scale,
    };
    (scaled.is_finite() && scaled >= 0.0).then_some(scaled)
}

fn epoch_seconds(value: &Value) -> Option<DateTime<Utc>> {
    let raw = numeric_text(value)?;
    let secs = match raw.parse::<i64>() {
        Ok(s) => s,
        Err(_) => {
            let f: f64 = raw.parse().ok()?;
            if !f.is_finite() {
                return None;
            }
            f.trunc() as i64
        }
    };
    DateTime::from_timestamp(secs, 0)
}
