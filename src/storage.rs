use anyhow::Result;
use rusqlite::{params, Connection};

use crate::ledger::LedgerEvent;
use crate::types::SubmissionRecord;

/// Append-only SQLite audit store. Submission records and guard events are
/// inserted once and never updated or deleted.
pub struct AuditStore {
    conn: Connection,
}

impl AuditStore {
    pub fn new(path: &str) -> Result<Self> {
        Ok(Self { conn: Connection::open(path)? })
    }

    pub fn init(&mut self) -> Result<()> {
        self.conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS submissions (
                ts INTEGER NOT NULL,
                decision_id TEXT NOT NULL,
                nonce INTEGER NOT NULL,
                gas_price REAL NOT NULL,
                tx_ref TEXT,
                status TEXT NOT NULL,
                attempts INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS ledger_events (
                ts INTEGER NOT NULL,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL
            );
            COMMIT;",
        )?;
        Ok(())
    }

    pub fn append_submission(&mut self, ts: u64, record: &SubmissionRecord) -> Result<()> {
        self.conn.execute(
            "INSERT INTO submissions (ts, decision_id, nonce, gas_price, tx_ref, status, attempts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                ts as i64,
                record.decision_id,
                record.nonce as i64,
                record.gas_price,
                record.tx_ref,
                record.status.as_str(),
                record.attempts as i64
            ],
        )?;
        Ok(())
    }

    pub fn append_events(&mut self, events: &[LedgerEvent]) -> Result<()> {
        let tx = self.conn.transaction()?;
        for event in events {
            let (ts, payload) = match event {
                LedgerEvent::TradeExecuted { ts, nonce, token_in, token_out, amount_in, amount_out, confidence_pct, strategy_tag } => (
                    *ts,
                    serde_json::json!({
                        "nonce": nonce,
                        "token_in": token_in,
                        "token_out": token_out,
                        "amount_in": amount_in,
                        "amount_out": amount_out,
                        "confidence_pct": confidence_pct,
                        "strategy_tag": strategy_tag,
                    }),
                ),
                LedgerEvent::SettingsUpdated { ts, field } => {
                    (*ts, serde_json::json!({ "field": field }))
                }
                LedgerEvent::EmergencyStopActivated { ts } => (*ts, serde_json::json!({})),
            };
            tx.execute(
                "INSERT INTO ledger_events (ts, kind, payload) VALUES (?1, ?2, ?3)",
                params![ts as i64, event.kind(), payload.to_string()],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn submission_count(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM submissions", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn event_count(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM ledger_events", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}
