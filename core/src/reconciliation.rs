//! Reconciliation: recompute balances from the ledger and surface drift.
//!
//! RULES:
//!   - Read-only by default. `audit_all` records findings, never fixes.
//!   - Resolving a finding appends a `balance_audit` entry of the
//!     difference. That entry brings SUM(ledger) back in line with the
//!     stored balance; the stored balance itself is left untouched.

use crate::{
    error::{LedgerError, LedgerResult},
    event::LedgerEvent,
    idempotency,
    store::{AuditFinding, LedgerEntry, LedgerStore, NewEntry},
    types::{AccountId, Amount, EntryKind},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BalanceReport {
    pub account_id: AccountId,
    pub consistent: bool,
    pub stored: Amount,
    pub recomputed: Amount,
    /// stored - recomputed.
    pub difference: Amount,
}

/// Outcome of one reconciliation sweep.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditSummary {
    pub accounts_checked: usize,
    pub inconsistent: Vec<BalanceReport>,
    pub findings_recorded: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Resolution {
    pub finding: AuditFinding,
    pub entry: Option<LedgerEntry>,
}

pub fn validate_balance(store: &LedgerStore, account_id: &str) -> LedgerResult<BalanceReport> {
    let stored = store.get_balance(account_id)?;
    let recomputed = store.recompute_balance(account_id)?;
    let difference = stored - recomputed;
    Ok(BalanceReport {
        account_id: account_id.to_string(),
        consistent: difference == 0,
        stored,
        recomputed,
        difference,
    })
}

/// Check every account. Drift on an account that already has an open
/// finding is reported but not recorded twice.
pub fn audit_all(store: &mut LedgerStore, at: DateTime<Utc>) -> LedgerResult<AuditSummary> {
    let mut summary = AuditSummary::default();
    for account_id in store.account_ids()? {
        summary.accounts_checked += 1;
        let report = validate_balance(store, &account_id)?;
        if report.consistent {
            continue;
        }
        log::warn!(
            "reconciliation: {account_id} stored={} recomputed={} (diff {})",
            report.stored,
            report.recomputed,
            report.difference
        );
        if store.open_finding_for_account(&account_id)?.is_none() {
            let finding = AuditFinding {
                finding_id: uuid::Uuid::new_v4().to_string(),
                account_id: account_id.clone(),
                stored: report.stored,
                recomputed: report.recomputed,
                difference: report.difference,
                status: "open".into(),
                detected_at: at,
                resolved_at: None,
                resolution_entry_id: None,
                note: None,
            };
            store.atomic(|tx| {
                tx.insert_finding(&finding)?;
                tx.append_event(
                    &LedgerEvent::AuditFindingRecorded {
                        finding_id: finding.finding_id.clone(),
                        account_id: finding.account_id.clone(),
                        stored: finding.stored,
                        recomputed: finding.recomputed,
                    },
                    at,
                )
            })?;
            summary.findings_recorded.push(finding.finding_id);
        }
        summary.inconsistent.push(report);
    }
    log::info!(
        "reconciliation: checked {} accounts, {} inconsistent",
        summary.accounts_checked,
        summary.inconsistent.len()
    );
    Ok(summary)
}

/// Close an open finding. The difference is re-measured inside the
/// transaction; a finding whose account has since become consistent is
/// closed without an entry.
pub fn resolve_finding(
    store: &mut LedgerStore,
    finding_id: &str,
    note: &str,
    at: DateTime<Utc>,
) -> LedgerResult<Resolution> {
    let entry = store.atomic(|tx| {
        let finding = tx.open_finding(finding_id)?;
        let stored = tx.account(&finding.account_id)?.balance;
        let difference = stored - tx.recompute_balance(&finding.account_id)?;

        let entry = if difference == 0 {
            None
        } else {
            let mut metadata = Map::new();
            metadata.insert("finding_id".into(), Value::from(finding_id));
            metadata.insert("note".into(), Value::from(note));
            Some(tx.record_correction(
                &NewEntry {
                    account_id: finding.account_id.clone(),
                    amount: difference,
                    kind: EntryKind::BalanceAudit,
                    external_key: Some(idempotency::audit_key(finding_id)),
                    description: format!("Reconciliation correction: {note}"),
                    metadata,
                    flagged: false,
                },
                at,
            )?)
        };

        let entry_id = entry.as_ref().map(|e| e.entry_id.clone());
        tx.close_finding(finding_id, entry_id.as_deref(), note, at)?;
        tx.append_event(
            &LedgerEvent::AuditFindingResolved {
                finding_id: finding_id.to_string(),
                account_id: finding.account_id.clone(),
                entry_id: entry_id.unwrap_or_default(),
                amount: difference,
            },
            at,
        )?;
        Ok(entry)
    })?;

    let finding = store
        .finding(finding_id)?
        .ok_or_else(|| LedgerError::FindingNotFound {
            finding_id: finding_id.to_string(),
        })?;
    log::info!(
        "reconciliation: resolved {finding_id} on {} ({})",
        finding.account_id,
        entry
            .as_ref()
            .map(|e| format!("corrected by {}", e.amount))
            .unwrap_or_else(|| "already consistent".into())
    );
    Ok(Resolution { finding, entry })
}
