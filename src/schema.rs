//! Declared field sets checked at the normalizer and aggregator boundaries.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{SchemaError, SchemaStage};

/// Canonical column names of the normalized transaction table.
pub const WALLET: &str = "userWallet";
pub const ACTION: &str = "action";
pub const AMOUNT: &str = "amount";
pub const UNIT_PRICE_USD: &str = "unit_price_usd";
pub const TIMESTAMP: &str = "timestamp";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Number,
    EpochSeconds,
    Object,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
}

impl FieldSpec {
    fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self { name: name.into(), kind }
    }
}

#[derive(Debug, Clone)]
pub struct Schema {
    pub stage: SchemaStage,
    pub fields: Vec<FieldSpec>,
}

impl Schema {
    /// Schema of the normalized transaction table.
    pub fn normalized() -> Self {
        Self {
            stage: SchemaStage::NormalizedTransactions,
            fields: vec![
                FieldSpec::new(WALLET, FieldKind::Text),
                FieldSpec::new(ACTION, FieldKind::Text),
                FieldSpec::new(AMOUNT, FieldKind::Number),
                FieldSpec::new(UNIT_PRICE_USD, FieldKind::Number),
                FieldSpec::new(TIMESTAMP, FieldKind::EpochSeconds),
            ],
        }
    }

    /// Names of declared fields not found in `present`.
    pub fn missing<'a, I>(&self, present: I) -> BTreeSet<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let present: BTreeSet<&str> = present.into_iter().collect();
        self.fields
            .iter()
            .filter(|f| !present.contains(f.name.as_str()))
            .map(|f| f.name.clone())
            .collect()
    }

    pub fn check<'a, I>(&self, present: I) -> Result<(), SchemaError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let missing = self.missing(present);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(SchemaError { stage: self.stage, missing })
        }
    }
}

/// Provider field names in raw transaction records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldMapping {
    pub payload: String,
    pub wallet: String,
    pub action: String,
    pub amount: String,
    pub unit_price_usd: String,
    pub timestamp: String,
}

impl Default for FieldMapping {
    fn default() -> Self {
        Self {
            payload: "actionData".to_string(),
            wallet: "userWallet".to_string(),
            action: "type".to_string(),
            amount: "amount".to_string(),
            unit_price_usd: "assetPriceUSD".to_string(),
            timestamp: "timestamp".to_string(),
        }
    }
}

impl FieldMapping {
    /// The nested payload object must appear on at least one record.
    pub fn payload_schema(&self) -> Schema {
        Schema {
            stage: SchemaStage::RawRecords,
            fields: vec![FieldSpec::new(&self.payload, FieldKind::Object)],
        }
    }

    /// Provider fields that must be present once the payload is flattened.
    pub fn flattened_schema(&self) -> Schema {
        Schema {
            stage: SchemaStage::RawRecords,
            fields: vec![
                FieldSpec::new(&self.wallet, FieldKind::Text),
                FieldSpec::new(&self.action, FieldKind::Text),
                FieldSpec::new(&self.amount, FieldKind::Number),
                FieldSpec::new(&self.unit_price_usd, FieldKind::Number),
                FieldSpec::new(&self.timestamp, FieldKind::EpochSeconds),
            ],
        }
    }
}
