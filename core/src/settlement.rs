//! Settlement engine: turns a validated request into committed ledger rows.
//!
//! ALGORITHM (per request):
//!   1. Validate: non-zero amount, sign matches the kind, well-formed key.
//!   2. Fraud verdict is computed by the caller BEFORE the transaction opens;
//!      flagged verdicts are carried into the entry metadata for review.
//!   3. Inside one transaction: reversals are matched to the credit they
//!      offset, then keyed append + balance move, then the referral
//!      commission (own derived key) for earning kinds.
//!   4. Commit. Any error in 3 rolls back both entries.
//!
//! RULES:
//!   - This module never opens a transaction itself; it runs inside the
//!     caller's `LedgerTx` so it composes with withdrawals and callbacks.
//!   - A rejected or duplicate call has zero side effects.

use crate::{
    config::SettlementConfig,
    error::{LedgerError, LedgerResult},
    event::LedgerEvent,
    fraud_gate::FraudVerdict,
    idempotency::{self, Settled},
    store::{Account, LedgerEntry, LedgerTx, NewEntry},
    types::{AccountId, AccountStatus, Amount, EntryKind},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

/// "Credit/debit account A by M for reason K, deduplicated by key E."
/// Consumed into a ledger entry; never persisted itself.
#[derive(Debug, Clone)]
pub struct SettlementRequest {
    pub account_id: AccountId,
    pub amount: Amount,
    pub kind: EntryKind,
    pub external_key: Option<String>,
    pub description: String,
    pub metadata: Map<String, Value>,
}

impl SettlementRequest {
    pub fn new(account_id: impl Into<AccountId>, amount: Amount, kind: EntryKind) -> Self {
        Self {
            account_id: account_id.into(),
            amount,
            kind,
            external_key: None,
            description: String::new(),
            metadata: Map::new(),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.external_key = Some(key.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// What a successful settlement wrote.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SettlementReceipt {
    pub entry: LedgerEntry,
    pub referral: Option<LedgerEntry>,
    /// Balance of the settled account after commit.
    pub balance: Amount,
    pub flagged: bool,
}

pub type SettlementResult = Settled<SettlementReceipt>;

pub struct SettlementEngine {
    config: SettlementConfig,
}

impl SettlementEngine {
    pub fn new(config: SettlementConfig) -> Self {
        Self { config }
    }

    /// Reject zero amounts, sign/kind mismatches and malformed keys.
    /// Returns the request with its key normalized.
    pub fn validate(&self, mut req: SettlementRequest) -> LedgerResult<SettlementRequest> {
        if req.amount == 0 {
            return Err(LedgerError::InvalidAmount {
                amount: 0,
                reason: "settlement amount must be non-zero".into(),
            });
        }
        let direction = req.kind.direction();
        if !direction.admits(req.amount) {
            return Err(LedgerError::SignMismatch {
                kind: req.kind,
                expected: direction.label(),
                amount: req.amount,
            });
        }
        if req.kind == EntryKind::WithdrawalFinalize {
            return Err(LedgerError::InvalidAmount {
                amount: req.amount,
                reason: "withdrawal approval does not move money".into(),
            });
        }
        if let Some(key) = req.external_key.take() {
            req.external_key = Some(idempotency::normalize_external_key(&key)?);
        }
        Ok(req)
    }

    /// `round_down(amount * commission_rate)`, exact in integer basis points.
    pub fn commission_for(&self, amount: Amount) -> Amount {
        if amount <= 0 {
            return 0;
        }
        let bps = self.config.commission_rate_bps.max(0) as i128;
        (amount as i128 * bps / 10_000) as Amount
    }

    /// Append the entry (and any referral commission) inside `tx`.
    /// `req` must already have passed `validate`.
    pub fn settle_in_tx(
        &self,
        tx: &LedgerTx<'_>,
        req: &SettlementRequest,
        verdict: Option<&FraudVerdict>,
        at: DateTime<Utc>,
    ) -> LedgerResult<SettlementReceipt> {
        let account = tx.account(&req.account_id)?;
        if account.status != AccountStatus::Active && !req.kind.ignores_account_status() {
            return Err(LedgerError::AccountInactive {
                account_id: account.account_id,
                status: account.status,
            });
        }

        if req.kind == EntryKind::OfferReversal {
            check_reversal(tx, req)?;
        }

        let flagged = verdict.is_some_and(|v| v.flagged);
        let mut metadata = req.metadata.clone();
        if let Some(v) = verdict.filter(|v| v.flagged) {
            metadata.insert("review".into(), Value::Bool(true));
            metadata.insert("fraud_score".into(), Value::from(v.score));
            metadata.insert("fraud_factors".into(), Value::from(v.factors.clone()));
        }

        let entry = tx.append(
            &NewEntry {
                account_id: req.account_id.clone(),
                amount: req.amount,
                kind: req.kind,
                external_key: req.external_key.clone(),
                description: req.description.clone(),
                metadata,
                flagged,
            },
            at,
        )?;
        tx.append_event(
            &LedgerEvent::Settled {
                entry_id: entry.entry_id.clone(),
                account_id: entry.account_id.clone(),
                kind: entry.kind,
                amount: entry.amount,
                external_key: entry.external_key.clone(),
                flagged,
            },
            at,
        )?;

        let referral = self.pay_referral(tx, &account, &entry, at)?;
        let balance = tx.account(&req.account_id)?.balance;

        log::info!(
            "settled {} {} on {} (key={}, balance={balance}{})",
            entry.kind,
            entry.amount,
            entry.account_id,
            entry.external_key.as_deref().unwrap_or("-"),
            if flagged { ", flagged" } else { "" }
        );

        Ok(SettlementReceipt {
            entry,
            referral,
            balance,
            flagged,
        })
    }

    /// Commission for the referrer, in the parent's transaction.
    fn pay_referral(
        &self,
        tx: &LedgerTx<'_>,
        referee: &Account,
        parent: &LedgerEntry,
        at: DateTime<Utc>,
    ) -> LedgerResult<Option<LedgerEntry>> {
        if !parent.kind.earns_commission() {
            return Ok(None);
        }
        let Some(referrer_id) = referee.referrer_id.as_deref() else {
            return Ok(None);
        };
        let commission = self.commission_for(parent.amount);
        if commission == 0 {
            return Ok(None);
        }
        let referrer = tx.account(referrer_id)?;
        if referrer.status != AccountStatus::Active {
            log::debug!(
                "referral: skipping commission for {referrer_id} ({})",
                referrer.status
            );
            return Ok(None);
        }

        let mut metadata = Map::new();
        metadata.insert("referee_id".into(), Value::from(referee.account_id.clone()));
        metadata.insert("parent_entry_id".into(), Value::from(parent.entry_id.clone()));
        metadata.insert(
            "commission_rate_bps".into(),
            Value::from(self.config.commission_rate_bps),
        );

        let entry = tx.append(
            &NewEntry {
                account_id: referrer_id.to_string(),
                amount: commission,
                kind: EntryKind::ReferralCommission,
                external_key: Some(idempotency::referral_key(
                    parent.external_key.as_deref(),
                    &parent.entry_id,
                )),
                description: format!(
                    "Referral commission on {} by {}",
                    parent.kind, referee.account_id
                ),
                metadata,
                flagged: false,
            },
            at,
        )?;
        tx.append_event(
            &LedgerEvent::ReferralPaid {
                entry_id: entry.entry_id.clone(),
                referrer_id: referrer_id.to_string(),
                referee_id: referee.account_id.clone(),
                amount: commission,
            },
            at,
        )?;
        Ok(Some(entry))
    }
}

/// A reversal must name, by key, an `offer_completion` on the same account
/// and cannot take back more than that credit paid.
fn check_reversal(tx: &LedgerTx<'_>, req: &SettlementRequest) -> LedgerResult<()> {
    let key = req.external_key.as_deref().unwrap_or_default();
    let unmatched = |reason: String| LedgerError::UnmatchedReversal {
        external_key: key.to_string(),
        reason,
    };
    let original_key = idempotency::reversed_key(key)
        .ok_or_else(|| unmatched("reversal keys end in ':reversal'".into()))?;
    let original = tx
        .entry_by_external_key(original_key)?
        .ok_or_else(|| unmatched(format!("no entry settled under '{original_key}'")))?;
    if original.kind != EntryKind::OfferCompletion || original.account_id != req.account_id {
        return Err(unmatched(format!(
            "'{original_key}' is a {} on {}",
            original.kind, original.account_id
        )));
    }
    let reversed = req.amount.unsigned_abs();
    if reversed > original.amount.unsigned_abs() {
        return Err(unmatched(format!(
            "reversal of {reversed} exceeds the original credit of {}",
            original.amount
        )));
    }
    Ok(())
}
