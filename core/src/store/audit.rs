use super::{opt_millis, AuditFinding, LedgerStore, LedgerTx};
use crate::{
    clock::{from_millis, to_millis},
    error::{LedgerError, LedgerResult},
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

const FINDING_COLUMNS: &str = "finding_id, account_id, stored, recomputed, difference, status,
                               detected_at, resolved_at, resolution_entry_id, note";

impl LedgerTx<'_> {
    // ── Reconciliation findings ───────────────────────────────────

    pub fn insert_finding(&self, f: &AuditFinding) -> LedgerResult<()> {
        self.tx.execute(
            "INSERT INTO audit_findings
             (finding_id, account_id, stored, recomputed, difference, status,
              detected_at, resolved_at, resolution_entry_id, note)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                f.finding_id,
                f.account_id,
                f.stored,
                f.recomputed,
                f.difference,
                f.status,
                to_millis(f.detected_at),
                f.resolved_at.map(to_millis),
                f.resolution_entry_id,
                f.note,
            ],
        )?;
        Ok(())
    }

    /// An open finding, or `FindingNotFound`.
    pub fn open_finding(&self, finding_id: &str) -> LedgerResult<AuditFinding> {
        fetch_finding(&self.tx, finding_id)?
            .filter(|f| f.status == "open")
            .ok_or_else(|| LedgerError::FindingNotFound {
                finding_id: finding_id.to_string(),
            })
    }

    pub fn close_finding(
        &self,
        finding_id: &str,
        entry_id: Option<&str>,
        note: &str,
        at: DateTime<Utc>,
    ) -> LedgerResult<()> {
        let changed = self.tx.execute(
            "UPDATE audit_findings
             SET status = 'resolved', resolved_at = ?1, resolution_entry_id = ?2, note = ?3
             WHERE finding_id = ?4 AND status = 'open'",
            params![to_millis(at), entry_id, note, finding_id],
        )?;
        if changed == 0 {
            return Err(LedgerError::FindingNotFound {
                finding_id: finding_id.to_string(),
            });
        }
        Ok(())
    }
}

impl LedgerStore {
    pub fn finding(&self, finding_id: &str) -> LedgerResult<Option<AuditFinding>> {
        fetch_finding(&self.conn, finding_id)
    }

    pub fn open_findings(&self) -> LedgerResult<Vec<AuditFinding>> {
        let sql = format!(
            "SELECT {FINDING_COLUMNS} FROM audit_findings
             WHERE status = 'open'
             ORDER BY detected_at ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], map_finding_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn open_finding_for_account(&self, account_id: &str) -> LedgerResult<Option<AuditFinding>> {
        let sql = format!(
            "SELECT {FINDING_COLUMNS} FROM audit_findings
             WHERE account_id = ?1 AND status = 'open'
             ORDER BY detected_at DESC LIMIT 1"
        );
        let f = self
            .conn
            .query_row(&sql, params![account_id], map_finding_row)
            .optional()?;
        Ok(f)
    }
}

fn fetch_finding(conn: &Connection, finding_id: &str) -> LedgerResult<Option<AuditFinding>> {
    let sql = format!("SELECT {FINDING_COLUMNS} FROM audit_findings WHERE finding_id = ?1");
    let f = conn
        .query_row(&sql, params![finding_id], map_finding_row)
        .optional()?;
    Ok(f)
}

fn map_finding_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditFinding> {
    Ok(AuditFinding {
        finding_id: row.get(0)?,
        account_id: row.get(1)?,
        stored: row.get(2)?,
        recomputed: row.get(3)?,
        difference: row.get(4)?,
        status: row.get(5)?,
        detected_at: from_millis(row.get(6)?),
        resolved_at: opt_millis(row.get(7)?),
        resolution_entry_id: row.get(8)?,
        note: row.get(9)?,
    })
}
