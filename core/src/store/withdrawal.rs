use super::{opt_millis, LedgerStore, LedgerTx, Withdrawal};
use crate::{
    clock::{from_millis, to_millis},
    error::{LedgerError, LedgerResult},
    types::WithdrawalStatus,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

const WITHDRAWAL_COLUMNS: &str = "withdrawal_id, account_id, amount, method, destination_details,
                                  status, rejection_reason, hold_entry_id, refund_entry_id,
                                  requested_at, processed_at";

impl LedgerTx<'_> {
    // ── Withdrawal ────────────────────────────────────────────────

    pub fn insert_withdrawal(&self, w: &Withdrawal) -> LedgerResult<()> {
        self.tx.execute(
            "INSERT INTO withdrawals
             (withdrawal_id, account_id, amount, method, destination_details, status,
              rejection_reason, hold_entry_id, refund_entry_id, requested_at, processed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                w.withdrawal_id,
                w.account_id,
                w.amount,
                w.method,
                w.destination_details,
                w.status,
                w.rejection_reason,
                w.hold_entry_id,
                w.refund_entry_id,
                to_millis(w.requested_at),
                w.processed_at.map(to_millis),
            ],
        )?;
        Ok(())
    }

    pub fn withdrawal(&self, withdrawal_id: &str) -> LedgerResult<Withdrawal> {
        fetch_withdrawal(&self.tx, withdrawal_id)?.ok_or_else(|| LedgerError::WithdrawalNotFound {
            withdrawal_id: withdrawal_id.to_string(),
        })
    }

    /// Move a withdrawal out of `pending`. The WHERE clause guards the
    /// transition, so a withdrawal can leave `pending` exactly once.
    pub fn finish_withdrawal(
        &self,
        withdrawal_id: &str,
        to: WithdrawalStatus,
        rejection_reason: Option<&str>,
        refund_entry_id: Option<&str>,
        at: DateTime<Utc>,
    ) -> LedgerResult<()> {
        let changed = self.tx.execute(
            "UPDATE withdrawals
             SET status = ?1, rejection_reason = ?2, refund_entry_id = ?3, processed_at = ?4
             WHERE withdrawal_id = ?5 AND status = 'pending'",
            params![to, rejection_reason, refund_entry_id, to_millis(at), withdrawal_id],
        )?;
        if changed == 0 {
            let current = self.withdrawal(withdrawal_id)?;
            return Err(LedgerError::AlreadyProcessed {
                withdrawal_id: withdrawal_id.to_string(),
                status: current.status,
            });
        }
        Ok(())
    }
}

impl LedgerStore {
    pub fn withdrawal(&self, withdrawal_id: &str) -> LedgerResult<Option<Withdrawal>> {
        fetch_withdrawal(&self.conn, withdrawal_id)
    }

    /// Oldest first, the order an operator works the queue.
    pub fn pending_withdrawals(&self) -> LedgerResult<Vec<Withdrawal>> {
        let sql = format!(
            "SELECT {WITHDRAWAL_COLUMNS} FROM withdrawals
             WHERE status = 'pending'
             ORDER BY requested_at ASC, withdrawal_id ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], map_withdrawal_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn withdrawals_for_account(&self, account_id: &str) -> LedgerResult<Vec<Withdrawal>> {
        let sql = format!(
            "SELECT {WITHDRAWAL_COLUMNS} FROM withdrawals
             WHERE account_id = ?1
             ORDER BY requested_at DESC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![account_id], map_withdrawal_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }
}

fn fetch_withdrawal(conn: &Connection, withdrawal_id: &str) -> LedgerResult<Option<Withdrawal>> {
    let sql = format!("SELECT {WITHDRAWAL_COLUMNS} FROM withdrawals WHERE withdrawal_id = ?1");
    let w = conn
        .query_row(&sql, params![withdrawal_id], map_withdrawal_row)
        .optional()?;
    Ok(w)
}

fn map_withdrawal_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Withdrawal> {
    Ok(Withdrawal {
        withdrawal_id: row.get(0)?,
        account_id: row.get(1)?,
        amount: row.get(2)?,
        method: row.get(3)?,
        destination_details: row.get(4)?,
        status: row.get(5)?,
        rejection_reason: row.get(6)?,
        hold_entry_id: row.get(7)?,
        refund_entry_id: row.get(8)?,
        requested_at: from_millis(row.get(9)?),
        processed_at: opt_millis(row.get(10)?),
    })
}
