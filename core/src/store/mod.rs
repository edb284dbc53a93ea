//! SQLite persistence layer.
//!
//! RULE: Only the store talks to the database.
//! Components call store methods; they never execute SQL directly.
//!
//! RULE: Every balance mutation happens inside `LedgerStore::atomic`,
//! which holds the database write lock from BEGIN to COMMIT. The new
//! ledger entry and the new balance snapshot commit together or not at all.

use crate::{
    clock::{from_millis, to_millis},
    error::LedgerResult,
    event::{EventLogEntry, LedgerEvent},
    types::{AccountId, AccountStatus, ActionType, Amount, EntryKind, WithdrawalStatus},
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, TransactionBehavior};
use serde::Serialize;
use std::time::Duration;

mod account;
mod audit;
mod fraud;
mod ledger;
mod task;
mod withdrawal;

pub use fraud::IdentityField;

const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

pub struct LedgerStore {
    conn: Connection,
    path: Option<String>, // None for :memory:, Some(path) for file
}

impl LedgerStore {
    pub fn open(path: &str) -> LedgerResult<Self> {
        Self::open_with_timeout(path, DEFAULT_BUSY_TIMEOUT_MS)
    }

    /// Open with an explicit busy timeout. A writer that cannot take the
    /// lock within the timeout fails with `StorageUnavailable`.
    pub fn open_with_timeout(path: &str, busy_timeout_ms: u64) -> LedgerResult<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_millis(busy_timeout_ms))?;
        // WAL mode only for real files (:memory: ignores it).
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self {
            conn,
            path: Some(path.to_string()),
        })
    }

    /// Open an in-memory database (used in tests).
    pub fn in_memory() -> LedgerResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn, path: None })
    }

    /// Reopen a new connection to the same database.
    /// For in-memory databases, this returns a new in-memory database (isolated).
    /// For file-based databases, this opens the same file.
    pub fn reopen(&self) -> LedgerResult<Self> {
        match &self.path {
            Some(p) => Self::open(p),
            None => Self::in_memory(),
        }
    }

    /// Apply all schema migrations in order. Safe to run repeatedly.
    pub fn migrate(&self) -> LedgerResult<()> {
        self.conn
            .execute_batch(include_str!("../../migrations/001_ledger.sql"))?;
        self.conn
            .execute_batch(include_str!("../../migrations/002_fraud_audit.sql"))?;
        Ok(())
    }

    /// Run `f` inside one IMMEDIATE transaction.
    /// `Ok` commits; `Err` drops the transaction, rolling everything back.
    pub fn atomic<T, F>(&mut self, f: F) -> LedgerResult<T>
    where
        F: FnOnce(&LedgerTx<'_>) -> LedgerResult<T>,
    {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let ledger_tx = LedgerTx { tx };
        let out = f(&ledger_tx)?;
        ledger_tx.tx.commit()?;
        Ok(out)
    }

    // ── Event log ──────────────────────────────────────────────

    /// Record an event outside any ledger transaction.
    pub fn append_event(&self, event: &LedgerEvent, at: DateTime<Utc>) -> LedgerResult<()> {
        insert_event(&self.conn, event, at)
    }

    pub fn events_for_account(&self, account_id: &str) -> LedgerResult<Vec<EventLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, event_type, account_id, payload, created_at
             FROM event_log WHERE account_id = ?1
             ORDER BY id ASC",
        )?;
        let entries = stmt
            .query_map(params![account_id], map_event_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn events_of_type(&self, event_type: &str) -> LedgerResult<Vec<EventLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, event_type, account_id, payload, created_at
             FROM event_log WHERE event_type = ?1
             ORDER BY id ASC",
        )?;
        let entries = stmt
            .query_map(params![event_type], map_event_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}

/// A handle on an open write transaction. Only `LedgerStore::atomic`
/// creates one; it cannot outlive the closure it is passed to.
pub struct LedgerTx<'a> {
    tx: rusqlite::Transaction<'a>,
}

impl LedgerTx<'_> {
    /// Record an event that commits with this transaction.
    pub fn append_event(&self, event: &LedgerEvent, at: DateTime<Utc>) -> LedgerResult<()> {
        insert_event(&self.tx, event, at)
    }
}

fn insert_event(conn: &Connection, event: &LedgerEvent, at: DateTime<Utc>) -> LedgerResult<()> {
    conn.execute(
        "INSERT INTO event_log (event_type, account_id, payload, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            event.type_name(),
            event.account_id(),
            serde_json::to_string(event)?,
            to_millis(at),
        ],
    )?;
    Ok(())
}

fn map_event_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EventLogEntry> {
    Ok(EventLogEntry {
        id: row.get(0)?,
        event_type: row.get(1)?,
        account_id: row.get(2)?,
        payload: row.get(3)?,
        created_at: row.get(4)?,
    })
}

// ── Row types ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Account {
    pub account_id: AccountId,
    pub balance: Amount,
    pub lifetime_earned: Amount,
    pub status: AccountStatus,
    pub referrer_id: Option<AccountId>,
    pub created_at: DateTime<Utc>,
}

/// An immutable, committed ledger row.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LedgerEntry {
    pub entry_id: String,
    pub account_id: AccountId,
    pub amount: Amount,
    pub kind: EntryKind,
    pub external_key: Option<String>,
    pub description: String,
    pub metadata: serde_json::Value,
    pub flagged: bool,
    pub created_at: DateTime<Utc>,
}

/// A ledger row about to be appended.
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub account_id: AccountId,
    pub amount: Amount,
    pub kind: EntryKind,
    pub external_key: Option<String>,
    pub description: String,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub flagged: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Withdrawal {
    pub withdrawal_id: String,
    pub account_id: AccountId,
    pub amount: Amount,
    pub method: String,
    pub destination_details: String,
    pub status: WithdrawalStatus,
    pub rejection_reason: Option<String>,
    pub hold_entry_id: String,
    pub refund_entry_id: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Task {
    pub task_id: String,
    pub reward: Amount,
    pub one_shot: bool,
    pub active: bool,
}

/// Transaction history filter. Every field is optional; results are
/// newest first.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub kind: Option<EntryKind>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
    pub offset: u32,
}

/// Advisory record of one fraud gate evaluation.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FraudSignal {
    pub account_id: AccountId,
    pub action_type: ActionType,
    pub score: f64,
    pub risk_level: String,
    pub contributing_factors: Vec<String>,
    pub blocked: bool,
    pub flagged: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AuditFinding {
    pub finding_id: String,
    pub account_id: AccountId,
    pub stored: Amount,
    pub recomputed: Amount,
    pub difference: Amount,
    pub status: String, // "open" | "resolved"
    pub detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_entry_id: Option<String>,
    pub note: Option<String>,
}

pub(crate) fn opt_millis(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.map(from_millis)
}
