use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;

use crate::error::Result;
use crate::models::WalletFeatures;

const INIT_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS scoring_runs (
  id             INTEGER PRIMARY KEY AUTOINCREMENT,
  evaluated_at   TEXT NOT NULL,  -- RFC3339, the as_of used for recency
  config_version INTEGER NOT NULL,
  wallet_count   INTEGER NOT NULL,
  model_name     TEXT,
  created_at     TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS wallet_scores (
  id              INTEGER PRIMARY KEY AUTOINCREMENT,
  run_id          INTEGER NOT NULL REFERENCES scoring_runs(id),
  wallet          TEXT NOT NULL,
  credit_score    REAL NOT NULL,
  predicted_score REAL,
  features_json   TEXT NOT NULL,
  UNIQUE(run_id, wallet)
);

CREATE INDEX IF NOT EXISTS idx_wallet_scores_wallet ON wallet_scores(wallet);
"#;

/// A scored wallet as read back from the ledger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreEntry {
    pub run_id: i64,
    pub wallet: String,
    pub evaluated_at: String,
    pub config_version: u32,
    pub credit_score: f64,
    pub predicted_score: Option<f64>,
    pub model_name: Option<String>,
}

/// Connect to SQLite (with WAL mode for performance)
pub fn connect(path: &str) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    Ok(conn)
}

/// Run schema migrations
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(INIT_SQL)?;
    Ok(())
}

/// Store one scoring run and its wallets atomically; returns the run id.
pub fn record_run(
    conn: &mut Connection,
    evaluated_at: DateTime<Utc>,
    config_version: u32,
    rows: &[WalletFeatures],
    predictions: Option<&[f64]>,
    model_name: Option<&str>,
) -> Result<i64> {
    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO scoring_runs (evaluated_at, config_version, wallet_count, model_name)
         VALUES (?1, ?2, ?3, ?4)",
        params![evaluated_at.to_rfc3339(), config_version, rows.len() as i64, model_name],
    )?;
    let run_id = tx.last_insert_rowid();

    {
        let mut stmt = tx.prepare(
            "INSERT INTO wallet_scores (run_id, wallet, credit_score, predicted_score, features_json)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for (i, row) in rows.iter().enumerate() {
            let predicted = predictions.and_then(|p| p.get(i).copied());
            stmt.execute(params![
                run_id,
                row.wallet,
                row.credit_score,
                predicted,
                serde_json::to_string(row)?
            ])?;
        }
    }

    tx.commit()?;
    Ok(run_id)
}

/// Most recent ledger entries for a wallet, newest first.
pub fn recent_scores(conn: &Connection, wallet: &str, limit: u32) -> Result<Vec<ScoreEntry>> {
    let mut stmt = conn.prepare(
        "SELECT s.run_id, s.wallet, r.evaluated_at, r.config_version,
                s.credit_score, s.predicted_score, r.model_name
         FROM wallet_scores s
         JOIN scoring_runs r ON r.id = s.run_id
         WHERE LOWER(s.wallet) = LOWER(?1)
         ORDER BY s.run_id DESC
         LIMIT ?2",
    )?;

    let rows = stmt.query_map(params![wallet, limit as i64], |r| {
        Ok(ScoreEntry {
            run_id: r.get(0)?,
            wallet: r.get(1)?,
            evaluated_at: r.get(2)?,
            config_version: r.get(3)?,
            credit_score: r.get(4)?,
            predicted_score: r.get(5)?,
            model_name: r.get(6)?,
        })
    })?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}
