use super::{HistoryFilter, LedgerEntry, LedgerStore, LedgerTx, NewEntry};
use crate::{
    clock::{from_millis, to_millis},
    error::{is_external_key_conflict, LedgerError, LedgerResult},
    types::{Amount, EntryKind},
};
use chrono::{DateTime, Utc};
use rusqlite::{params, types::Type, Connection, OptionalExtension};
use uuid::Uuid;

const ENTRY_COLUMNS: &str = "entry_id, account_id, amount, kind, external_key, description,
                             metadata, flagged, created_at";

impl LedgerTx<'_> {
    // ── Append ────────────────────────────────────────────────────

    /// Append one entry and move the balance snapshot by its amount.
    ///
    /// Fails with `DuplicateEvent` if the external key is already present,
    /// and with `InsufficientBalance` if the balance would go negative.
    /// Either way nothing is written.
    pub fn append(&self, entry: &NewEntry, at: DateTime<Utc>) -> LedgerResult<LedgerEntry> {
        if entry.amount == 0 {
            return Err(LedgerError::InvalidAmount {
                amount: 0,
                reason: "ledger entries must be non-zero".into(),
            });
        }
        let account = self.account(&entry.account_id)?;
        if let Some(key) = entry.external_key.as_deref() {
            if external_key_exists(&self.tx, key)? {
                return Err(LedgerError::DuplicateEvent {
                    external_key: key.to_string(),
                });
            }
        }

        let new_balance =
            account
                .balance
                .checked_add(entry.amount)
                .ok_or_else(|| LedgerError::InvalidAmount {
                    amount: entry.amount,
                    reason: "balance overflow".into(),
                })?;
        if new_balance < 0 {
            return Err(LedgerError::InsufficientBalance {
                account_id: account.account_id,
                balance: account.balance,
                requested: -entry.amount,
            });
        }

        let stored = insert_entry(&self.tx, entry, at)?;
        let earned_delta = if entry.kind.affects_lifetime_earned() {
            entry.amount
        } else {
            0
        };
        self.tx.execute(
            "UPDATE accounts
             SET balance = balance + ?1,
                 lifetime_earned = MAX(0, lifetime_earned + ?2)
             WHERE account_id = ?3",
            params![entry.amount, earned_delta, entry.account_id],
        )?;
        Ok(stored)
    }

    /// Append a `balance_audit` entry WITHOUT moving the balance snapshot.
    /// Only reconciliation uses this, to bring the ledger in line with a
    /// snapshot an audit has already found to differ.
    pub fn record_correction(&self, entry: &NewEntry, at: DateTime<Utc>) -> LedgerResult<LedgerEntry> {
        if entry.kind != EntryKind::BalanceAudit {
            return Err(anyhow::anyhow!(
                "record_correction only accepts balance_audit entries, got {}",
                entry.kind
            )
            .into());
        }
        self.account(&entry.account_id)?;
        insert_entry(&self.tx, entry, at)
    }

    pub fn entry_by_external_key(&self, key: &str) -> LedgerResult<Option<LedgerEntry>> {
        entry_by_external_key(&self.tx, key)
    }

    pub fn recompute_balance(&self, account_id: &str) -> LedgerResult<Amount> {
        sum_entries(&self.tx, account_id)
    }
}

impl LedgerStore {
    // ── Ledger reads ──────────────────────────────────────────────

    /// Sum every entry for the account, ignoring the stored snapshot.
    pub fn recompute_balance(&self, account_id: &str) -> LedgerResult<Amount> {
        sum_entries(&self.conn, account_id)
    }

    pub fn history(&self, account_id: &str, filter: &HistoryFilter) -> LedgerResult<Vec<LedgerEntry>> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS}
             FROM ledger_entries
             WHERE account_id = ?1
               AND (?2 IS NULL OR kind = ?2)
               AND (?3 IS NULL OR created_at >= ?3)
               AND (?4 IS NULL OR created_at < ?4)
             ORDER BY seq DESC
             LIMIT ?5 OFFSET ?6"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![
                account_id,
                filter.kind,
                filter.since.map(to_millis),
                filter.until.map(to_millis),
                filter.limit.map(i64::from).unwrap_or(-1),
                i64::from(filter.offset),
            ],
            map_entry_row,
        )?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn entry_by_external_key(&self, key: &str) -> LedgerResult<Option<LedgerEntry>> {
        entry_by_external_key(&self.conn, key)
    }

    pub fn entry_count(&self, account_id: &str) -> LedgerResult<i64> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM ledger_entries WHERE account_id = ?1",
            params![account_id],
            |r| r.get(0),
        )?)
    }
}

fn insert_entry(conn: &Connection, entry: &NewEntry, at: DateTime<Utc>) -> LedgerResult<LedgerEntry> {
    let entry_id = Uuid::new_v4().to_string();
    let metadata = serde_json::Value::Object(entry.metadata.clone());
    let inserted = conn.execute(
        "INSERT INTO ledger_entries
         (entry_id, account_id, amount, kind, external_key, description, metadata, flagged, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            entry_id,
            entry.account_id,
            entry.amount,
            entry.kind,
            entry.external_key,
            entry.description,
            metadata.to_string(),
            entry.flagged,
            to_millis(at),
        ],
    );
    match inserted {
        Ok(_) => {}
        // Lost a race on the same key with another connection.
        Err(e) if is_external_key_conflict(&e) => {
            return Err(LedgerError::DuplicateEvent {
                external_key: entry.external_key.clone().unwrap_or_default(),
            })
        }
        Err(e) => return Err(e.into()),
    }

    Ok(LedgerEntry {
        entry_id,
        account_id: entry.account_id.clone(),
        amount: entry.amount,
        kind: entry.kind,
        external_key: entry.external_key.clone(),
        description: entry.description.clone(),
        metadata,
        flagged: entry.flagged,
        created_at: from_millis(to_millis(at)),
    })
}

fn entry_by_external_key(conn: &Connection, key: &str) -> LedgerResult<Option<LedgerEntry>> {
    let sql = format!("SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE external_key = ?1");
    Ok(conn.query_row(&sql, params![key], map_entry_row).optional()?)
}

fn external_key_exists(conn: &Connection, key: &str) -> LedgerResult<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM ledger_entries WHERE external_key = ?1",
            params![key],
            |r| r.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn sum_entries(conn: &Connection, account_id: &str) -> LedgerResult<Amount> {
    Ok(conn.query_row(
        "SELECT COALESCE(SUM(amount), 0) FROM ledger_entries WHERE account_id = ?1",
        params![account_id],
        |r| r.get(0),
    )?)
}

fn map_entry_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LedgerEntry> {
    let metadata: String = row.get(6)?;
    let metadata = serde_json::from_str(&metadata)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(e)))?;
    Ok(LedgerEntry {
        entry_id: row.get(0)?,
        account_id: row.get(1)?,
        amount: row.get(2)?,
        kind: row.get(3)?,
        external_key: row.get(4)?,
        description: row.get(5)?,
        metadata,
        flagged: row.get(7)?,
        created_at: from_millis(row.get(8)?),
    })
}
