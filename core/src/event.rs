//! The audit trail. Every state transition is recorded as a LedgerEvent.
//!
//! RULE: Events that describe a committed change are written inside the
//! same transaction as that change. Rejections are written on their own.

use crate::types::{AccountId, ActionType, Amount, EntryKind};
use serde::{Deserialize, Serialize};

/// Variants are added over time, never removed or reordered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    // ── Settlement ─────────────────────────────────
    Settled {
        entry_id: String,
        account_id: AccountId,
        kind: EntryKind,
        amount: Amount,
        external_key: Option<String>,
        flagged: bool,
    },
    ReferralPaid {
        entry_id: String,
        referrer_id: AccountId,
        referee_id: AccountId,
        amount: Amount,
    },
    DuplicateIgnored {
        account_id: AccountId,
        external_key: String,
    },
    FraudBlocked {
        account_id: AccountId,
        action: ActionType,
        score: f64,
    },

    // ── Callbacks ──────────────────────────────────
    CallbackRejected {
        provider_id: String,
        reason: String,
    },

    // ── Withdrawals ────────────────────────────────
    WithdrawalRequested {
        withdrawal_id: String,
        account_id: AccountId,
        amount: Amount,
        method: String,
    },
    WithdrawalApproved {
        withdrawal_id: String,
        account_id: AccountId,
        note: Option<String>,
    },
    WithdrawalRejected {
        withdrawal_id: String,
        account_id: AccountId,
        amount: Amount,
        reason: String,
    },

    // ── Reconciliation ─────────────────────────────
    AuditFindingRecorded {
        finding_id: String,
        account_id: AccountId,
        stored: Amount,
        recomputed: Amount,
    },
    AuditFindingResolved {
        finding_id: String,
        account_id: AccountId,
        entry_id: String,
        amount: Amount,
    },
}

impl LedgerEvent {
    /// Stable name for the event_type column.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Settled { .. } => "settled",
            Self::ReferralPaid { .. } => "referral_paid",
            Self::DuplicateIgnored { .. } => "duplicate_ignored",
            Self::FraudBlocked { .. } => "fraud_blocked",
            Self::CallbackRejected { .. } => "callback_rejected",
            Self::WithdrawalRequested { .. } => "withdrawal_requested",
            Self::WithdrawalApproved { .. } => "withdrawal_approved",
            Self::WithdrawalRejected { .. } => "withdrawal_rejected",
            Self::AuditFindingRecorded { .. } => "audit_finding_recorded",
            Self::AuditFindingResolved { .. } => "audit_finding_resolved",
        }
    }

    /// The account this event concerns, if any.
    pub fn account_id(&self) -> Option<&str> {
        match self {
            Self::Settled { account_id, .. }
            | Self::DuplicateIgnored { account_id, .. }
            | Self::FraudBlocked { account_id, .. }
            | Self::WithdrawalRequested { account_id, .. }
            | Self::WithdrawalApproved { account_id, .. }
            | Self::WithdrawalRejected { account_id, .. }
            | Self::AuditFindingRecorded { account_id, .. }
            | Self::AuditFindingResolved { account_id, .. } => Some(account_id),
            Self::ReferralPaid { referrer_id, .. } => Some(referrer_id),
            Self::CallbackRejected { .. } => None,
        }
    }
}

/// The event log entry as persisted to SQLite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub id: i64,
    pub event_type: String,
    pub account_id: Option<AccountId>,
    pub payload: String, // JSON-serialized LedgerEvent
    pub created_at: i64,
}

impl EventLogEntry {
    pub fn decode(&self) -> serde_json::Result<LedgerEvent> {
        serde_json::from_str(&self.payload)
    }
}
