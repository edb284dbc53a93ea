use super::{FraudSignal, LedgerStore};
use crate::{
    clock::{from_millis, to_millis},
    error::LedgerResult,
    types::ActionType,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, types::Type};

/// Identity attributes the fraud gate correlates across accounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityField {
    Ip,
    Device,
}

impl IdentityField {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Ip => "ip",
            Self::Device => "device",
        }
    }
}

impl LedgerStore {
    // ── Rate counters ─────────────────────────────────────────────

    /// Record one attempted action. These rows are the durable windowed
    /// counters; every process sharing the database sees them.
    pub fn record_action(
        &self,
        account_id: &str,
        action: ActionType,
        ip: Option<&str>,
        device_id: Option<&str>,
        at: DateTime<Utc>,
    ) -> LedgerResult<()> {
        self.conn.execute(
            "INSERT INTO fraud_actions (account_id, action_type, ip, device_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![account_id, action, ip, device_id, to_millis(at)],
        )?;
        Ok(())
    }

    /// Actions of this type by this account at or after `since`.
    pub fn count_actions_since(
        &self,
        account_id: &str,
        action: ActionType,
        since: DateTime<Utc>,
    ) -> LedgerResult<i64> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM fraud_actions
             WHERE account_id = ?1 AND action_type = ?2 AND created_at >= ?3",
            params![account_id, action, to_millis(since)],
            |r| r.get(0),
        )?)
    }

    /// Distinct accounts other than `account_id` seen with the same
    /// IP or device at or after `since`.
    pub fn count_accounts_sharing(
        &self,
        field: IdentityField,
        value: &str,
        account_id: &str,
        since: DateTime<Utc>,
    ) -> LedgerResult<i64> {
        let sql = match field {
            IdentityField::Ip => {
                "SELECT COUNT(DISTINCT account_id) FROM fraud_actions
                 WHERE ip = ?1 AND account_id <> ?2 AND created_at >= ?3"
            }
            IdentityField::Device => {
                "SELECT COUNT(DISTINCT account_id) FROM fraud_actions
                 WHERE device_id = ?1 AND account_id <> ?2 AND created_at >= ?3"
            }
        };
        Ok(self.conn.query_row(
            sql,
            params![value, account_id, to_millis(since)],
            |r| r.get(0),
        )?)
    }

    // ── Fraud signals ─────────────────────────────────────────────

    pub fn insert_fraud_signal(&self, signal: &FraudSignal) -> LedgerResult<()> {
        self.conn.execute(
            "INSERT INTO fraud_signals
             (account_id, action_type, score, risk_level, contributing_factors, blocked, flagged, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                signal.account_id,
                signal.action_type,
                signal.score,
                signal.risk_level,
                serde_json::to_string(&signal.contributing_factors)?,
                signal.blocked,
                signal.flagged,
                to_millis(signal.created_at),
            ],
        )?;
        Ok(())
    }

    /// Newest first.
    pub fn fraud_signals_for(&self, account_id: &str) -> LedgerResult<Vec<FraudSignal>> {
        let mut stmt = self.conn.prepare(
            "SELECT account_id, action_type, score, risk_level, contributing_factors,
                    blocked, flagged, created_at
             FROM fraud_signals WHERE account_id = ?1
             ORDER BY id DESC",
        )?;
        let rows = stmt.query_map(params![account_id], |row| {
            let factors: String = row.get(4)?;
            let contributing_factors = serde_json::from_str(&factors).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e))
            })?;
            Ok(FraudSignal {
                account_id: row.get(0)?,
                action_type: row.get(1)?,
                score: row.get(2)?,
                risk_level: row.get(3)?,
                contributing_factors,
                blocked: row.get(5)?,
                flagged: row.get(6)?,
                created_at: from_millis(row.get(7)?),
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }
}
