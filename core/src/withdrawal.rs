//! Withdrawal state machine.
//!
//! STATES:
//!   pending ──approve──▶ completed   (hold becomes permanent, no ledger write)
//!   pending ──reject───▶ rejected    (one refund entry restores the hold)
//!
//! RULES:
//!   - Funds leave the balance at request time via a `withdrawal_hold`
//!     entry, in the same transaction that creates the withdrawal row.
//!   - Both terminal states are final. A second approve/reject returns
//!     `AlreadyProcessed` and writes nothing.

use crate::{
    clock::{from_millis, to_millis},
    config::WithdrawalConfig,
    error::{LedgerError, LedgerResult},
    event::LedgerEvent,
    fraud_gate::FraudVerdict,
    idempotency,
    settlement::{SettlementEngine, SettlementRequest},
    store::{LedgerTx, Withdrawal},
    types::{AccountStatus, Amount, EntryKind, WithdrawalStatus},
};
use chrono::{DateTime, Utc};
use serde_json::Value;

/// A withdrawal request as supplied by the account holder.
#[derive(Debug, Clone)]
pub struct WithdrawalRequest {
    pub account_id: String,
    pub amount: Amount,
    pub method: String,
    pub destination_details: String,
}

pub struct WithdrawalMachine {
    config: WithdrawalConfig,
}

impl WithdrawalMachine {
    pub fn new(config: WithdrawalConfig) -> Self {
        Self { config }
    }

    /// Checks that need no database: minimum amount and payout method.
    pub fn precheck(&self, req: &WithdrawalRequest) -> LedgerResult<()> {
        if req.amount <= 0 {
            return Err(LedgerError::InvalidAmount {
                amount: req.amount,
                reason: "withdrawal amount must be positive".into(),
            });
        }
        if req.amount < self.config.minimum_withdrawal {
            return Err(LedgerError::BelowMinimumWithdrawal {
                amount: req.amount,
                minimum: self.config.minimum_withdrawal,
            });
        }
        if !self.config.allowed_methods.iter().any(|m| *m == req.method) {
            return Err(LedgerError::UnsupportedMethod {
                method: req.method.clone(),
            });
        }
        Ok(())
    }

    /// Place the hold and create the pending withdrawal inside `tx`.
    pub fn request_in_tx(
        &self,
        tx: &LedgerTx<'_>,
        settlement: &SettlementEngine,
        req: &WithdrawalRequest,
        verdict: Option<&FraudVerdict>,
        at: DateTime<Utc>,
    ) -> LedgerResult<Withdrawal> {
        let account = tx.account(&req.account_id)?;
        if account.status != AccountStatus::Active {
            return Err(LedgerError::AccountInactive {
                account_id: account.account_id,
                status: account.status,
            });
        }
        if account.balance < req.amount {
            return Err(LedgerError::InsufficientBalance {
                account_id: account.account_id,
                balance: account.balance,
                requested: req.amount,
            });
        }

        let withdrawal_id = uuid::Uuid::new_v4().to_string();
        let hold = SettlementRequest::new(&req.account_id, -req.amount, EntryKind::WithdrawalHold)
            .with_key(idempotency::withdrawal_hold_key(&withdrawal_id))
            .with_description(format!("Withdrawal hold ({})", req.method))
            .with_metadata("withdrawal_id", Value::from(withdrawal_id.clone()));
        let hold = settlement.validate(hold)?;
        let receipt = settlement.settle_in_tx(tx, &hold, verdict, at)?;

        let withdrawal = Withdrawal {
            withdrawal_id: withdrawal_id.clone(),
            account_id: req.account_id.clone(),
            amount: req.amount,
            method: req.method.clone(),
            destination_details: req.destination_details.clone(),
            status: WithdrawalStatus::Pending,
            rejection_reason: None,
            hold_entry_id: receipt.entry.entry_id,
            refund_entry_id: None,
            requested_at: from_millis(to_millis(at)),
            processed_at: None,
        };
        tx.insert_withdrawal(&withdrawal)?;
        tx.append_event(
            &LedgerEvent::WithdrawalRequested {
                withdrawal_id,
                account_id: withdrawal.account_id.clone(),
                amount: withdrawal.amount,
                method: withdrawal.method.clone(),
            },
            at,
        )?;
        log::info!(
            "withdrawal {} requested: {} via {} for {}",
            withdrawal.withdrawal_id,
            withdrawal.amount,
            withdrawal.method,
            withdrawal.account_id
        );
        Ok(withdrawal)
    }

    /// pending → completed. The hold stays; nothing touches the balance.
    pub fn approve_in_tx(
        &self,
        tx: &LedgerTx<'_>,
        withdrawal_id: &str,
        note: Option<&str>,
        at: DateTime<Utc>,
    ) -> LedgerResult<Withdrawal> {
        let current = tx.withdrawal(withdrawal_id)?;
        tx.finish_withdrawal(withdrawal_id, WithdrawalStatus::Completed, None, None, at)?;
        tx.append_event(
            &LedgerEvent::WithdrawalApproved {
                withdrawal_id: withdrawal_id.to_string(),
                account_id: current.account_id.clone(),
                note: note.map(str::to_string),
            },
            at,
        )?;
        log::info!("withdrawal {withdrawal_id} approved");
        tx.withdrawal(withdrawal_id)
    }

    /// pending → rejected, refunding the full held amount.
    pub fn reject_in_tx(
        &self,
        tx: &LedgerTx<'_>,
        settlement: &SettlementEngine,
        withdrawal_id: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> LedgerResult<Withdrawal> {
        let current = tx.withdrawal(withdrawal_id)?;
        if current.status != WithdrawalStatus::Pending {
            return Err(LedgerError::AlreadyProcessed {
                withdrawal_id: withdrawal_id.to_string(),
                status: current.status,
            });
        }

        let refund = SettlementRequest::new(
            &current.account_id,
            current.amount,
            EntryKind::WithdrawalRefund,
        )
        .with_key(idempotency::withdrawal_refund_key(withdrawal_id))
        .with_description(format!("Withdrawal refund: {reason}"))
        .with_metadata("withdrawal_id", Value::from(withdrawal_id));
        let refund = settlement.validate(refund)?;
        let receipt = settlement.settle_in_tx(tx, &refund, None, at)?;

        tx.finish_withdrawal(
            withdrawal_id,
            WithdrawalStatus::Rejected,
            Some(reason),
            Some(&receipt.entry.entry_id),
            at,
        )?;
        tx.append_event(
            &LedgerEvent::WithdrawalRejected {
                withdrawal_id: withdrawal_id.to_string(),
                account_id: current.account_id.clone(),
                amount: current.amount,
                reason: reason.to_string(),
            },
            at,
        )?;
        log::info!(
            "withdrawal {withdrawal_id} rejected ({reason}); refunded {} to {}",
            current.amount,
            current.account_id
        );
        tx.withdrawal(withdrawal_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(amount: Amount, method: &str) -> WithdrawalRequest {
        WithdrawalRequest {
            account_id: "u1".into(),
            amount,
            method: method.into(),
            destination_details: "u1@example.com".into(),
        }
    }

    #[test]
    fn precheck_enforces_minimum_and_method() {
        let machine = WithdrawalMachine::new(WithdrawalConfig::default());
        assert!(machine.precheck(&request(500, "paypal")).is_ok());
        assert!(matches!(
            machine.precheck(&request(499, "paypal")),
            Err(LedgerError::BelowMinimumWithdrawal { minimum: 500, .. })
        ));
        assert!(matches!(
            machine.precheck(&request(500, "carrier_pigeon")),
            Err(LedgerError::UnsupportedMethod { .. })
        ));
        assert!(matches!(
            machine.precheck(&request(-5, "paypal")),
            Err(LedgerError::InvalidAmount { .. })
        ));
    }
}
