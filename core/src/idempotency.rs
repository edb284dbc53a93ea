//! Idempotency guard: at most one settlement per event key.
//!
//! The single source of truth is the UNIQUE constraint on
//! `ledger_entries.external_key`. There is no in-memory set: two processes
//! racing on the same key both reach the database, one commits, the other
//! gets `DuplicateEvent`. This module turns that error into a well-defined
//! "already processed" outcome and builds deterministic keys for sources
//! that do not supply one.

use crate::error::{LedgerError, LedgerResult};
use chrono::NaiveDate;

const MAX_KEY_LEN: usize = 200;
const REFERRAL_SUFFIX: &str = ":referral";
const REVERSAL_SUFFIX: &str = ":reversal";

/// Outcome of a guarded settlement.
#[derive(Debug, Clone, PartialEq)]
pub enum Settled<T> {
    Applied(T),
    AlreadyProcessed { external_key: String },
}

impl<T> Settled<T> {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }

    pub fn applied(self) -> Option<T> {
        match self {
            Self::Applied(v) => Some(v),
            Self::AlreadyProcessed { .. } => None,
        }
    }
}

/// Run `f` and translate `DuplicateEvent` into `AlreadyProcessed`.
///
/// `f` must perform the keyed append inside its own atomic transaction,
/// so a duplicate leaves nothing behind.
pub fn settle_once<T, F>(external_key: Option<&str>, f: F) -> LedgerResult<Settled<T>>
where
    F: FnOnce() -> LedgerResult<T>,
{
    match f() {
        Ok(v) => Ok(Settled::Applied(v)),
        Err(LedgerError::DuplicateEvent { external_key: hit }) => {
            let key = if hit.is_empty() {
                external_key.unwrap_or_default().to_string()
            } else {
                hit
            };
            log::debug!("idempotency: {key} already settled, ignoring");
            Ok(Settled::AlreadyProcessed { external_key: key })
        }
        Err(e) => Err(e),
    }
}

/// Validate a caller-supplied key. Keys ending in `:referral` are reserved
/// for derived commission keys.
pub fn normalize_external_key(raw: &str) -> LedgerResult<String> {
    let key = raw.trim();
    let reason = if key.is_empty() {
        Some("key is empty")
    } else if key.len() > MAX_KEY_LEN {
        Some("key is longer than 200 bytes")
    } else if key.chars().any(|c| c.is_whitespace() || c.is_control()) {
        Some("key contains whitespace or control characters")
    } else if key.ends_with(REFERRAL_SUFFIX) {
        Some("the ':referral' suffix is reserved")
    } else {
        None
    };
    match reason {
        Some(r) => Err(LedgerError::InvalidExternalKey { reason: r.into() }),
        None => Ok(key.to_string()),
    }
}

// ── Key derivation ─────────────────────────────────────────────────

pub fn provider_key(provider_id: &str, transaction_id: &str) -> String {
    format!("{provider_id}:{}", transaction_id.trim())
}

pub fn reversal_key(provider_id: &str, transaction_id: &str) -> String {
    format!("{}{REVERSAL_SUFFIX}", provider_key(provider_id, transaction_id))
}

/// Key of the credit a reversal offsets, if `key` is a reversal key.
pub fn reversed_key(key: &str) -> Option<&str> {
    key.strip_suffix(REVERSAL_SUFFIX).filter(|k| !k.is_empty())
}

pub fn task_key(account_id: &str, task_id: &str) -> String {
    format!("task:{account_id}:{task_id}")
}

pub fn daily_bonus_key(account_id: &str, day: NaiveDate) -> String {
    format!("daily_bonus:{account_id}:{}", day.format("%Y-%m-%d"))
}

/// Commission key for a parent settlement. Parents without an external
/// key are identified by their entry id.
pub fn referral_key(parent_key: Option<&str>, parent_entry_id: &str) -> String {
    match parent_key {
        Some(key) => format!("{key}{REFERRAL_SUFFIX}"),
        None => format!("entry:{parent_entry_id}{REFERRAL_SUFFIX}"),
    }
}

pub fn withdrawal_hold_key(withdrawal_id: &str) -> String {
    format!("withdrawal:{withdrawal_id}:hold")
}

pub fn withdrawal_refund_key(withdrawal_id: &str) -> String {
    format!("withdrawal:{withdrawal_id}:refund")
}

pub fn audit_key(finding_id: &str) -> String {
    format!("audit:{finding_id}")
}
