//! The rewards engine: the single entry point collaborators call.
//!
//! EXECUTION ORDER (every money-moving call):
//!   1. Validate the request (no database access)
//!   2. Callback authenticator, for provider callbacks
//!   3. Fraud & rate gate (advisory, writes only its own counters)
//!   4. One atomic ledger transaction via the idempotency guard
//!
//! RULES:
//!   - Steps 1-3 complete before the transaction opens. Nothing inside
//!     `LedgerStore::atomic` waits on anything but the database.
//!   - Duplicates are a successful no-op, returned as `AlreadyProcessed`.
//!   - Rejections are recorded in the event log after the fact.

use crate::{
    callback_auth::{AuthResult, CallbackAuthenticator, CallbackParams, ProviderCallback},
    clock::{Clock, ManualClock, SystemClock},
    config::LedgerConfig,
    error::{LedgerError, LedgerResult},
    event::LedgerEvent,
    fraud_gate::{ActionContext, FraudGate, FraudVerdict},
    idempotency::{self, settle_once, Settled},
    reconciliation::{self, AuditSummary, BalanceReport, Resolution},
    settlement::{SettlementEngine, SettlementRequest, SettlementResult},
    store::{Account, HistoryFilter, LedgerEntry, LedgerStore, Withdrawal},
    types::{ActionType, Amount, EntryKind},
    withdrawal::{WithdrawalMachine, WithdrawalRequest},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

/// What the HTTP layer sends back to a callback provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallbackResponse {
    pub accepted: bool,
    /// Provider-specific acknowledgement body.
    pub body: String,
}

pub struct RewardsEngine {
    pub store:   LedgerStore,
    config:      LedgerConfig,
    settlement:  SettlementEngine,
    withdrawals: WithdrawalMachine,
    fraud:       FraudGate,
    auth:        CallbackAuthenticator,
    clock:       Arc<dyn Clock>,
}

impl RewardsEngine {
    /// Wire every component from `config` around an already migrated store.
    pub fn build(store: LedgerStore, config: LedgerConfig) -> Self {
        Self {
            settlement:  SettlementEngine::new(config.settlement.clone()),
            withdrawals: WithdrawalMachine::new(config.withdrawal.clone()),
            fraud:       FraudGate::new(config.fraud.clone()),
            auth:        CallbackAuthenticator::new(&config.providers),
            clock:       Arc::new(SystemClock),
            store,
            config,
        }
    }

    /// Open (and migrate) a file-backed ledger.
    pub fn open(path: &str, config: LedgerConfig) -> LedgerResult<Self> {
        let store = LedgerStore::open_with_timeout(path, config.storage.busy_timeout_ms)?;
        store.migrate()?;
        Ok(Self::build(store, config))
    }

    /// In-memory store, test config, manual clock at 2026-01-01.
    pub fn build_test() -> LedgerResult<Self> {
        let store = LedgerStore::in_memory()?;
        store.migrate()?;
        Ok(Self::build(store, LedgerConfig::default_test())
            .with_clock(Arc::new(ManualClock::at_epoch())))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // ── Accounts ───────────────────────────────────────────────────

    pub fn open_account(&self, account_id: &str, referrer_id: Option<&str>) -> LedgerResult<Account> {
        let account = self.store.open_account(account_id, referrer_id, self.now())?;
        log::info!(
            "opened account {account_id}{}",
            referrer_id.map(|r| format!(" (referred by {r})")).unwrap_or_default()
        );
        Ok(account)
    }

    // ── Settlement ─────────────────────────────────────────────────

    /// Settle one request. Earning kinds pass the fraud gate first; kinds
    /// owned by internal flows are refused.
    pub fn settle(
        &mut self,
        req: SettlementRequest,
        context: &ActionContext,
    ) -> LedgerResult<SettlementResult> {
        let req = self.settlement.validate(req)?;
        if !req.kind.caller_settleable() {
            return Err(LedgerError::KindNotSettleable { kind: req.kind });
        }
        self.store.require_account(&req.account_id)?;
        let now = self.now();

        let verdict = match req.kind.gated_action() {
            Some(action) => Some(self.gate(&req.account_id, action, context, now)?),
            None => None,
        };
        self.commit(&req, verdict.as_ref(), now)
    }

    /// Idempotency-guarded atomic settlement of an already gated request.
    fn commit(
        &mut self,
        req: &SettlementRequest,
        verdict: Option<&FraudVerdict>,
        now: DateTime<Utc>,
    ) -> LedgerResult<SettlementResult> {
        let Self {
            store, settlement, ..
        } = self;
        let result = settle_once(req.external_key.as_deref(), || {
            store.atomic(|tx| settlement.settle_in_tx(tx, req, verdict, now))
        })?;
        if let Settled::AlreadyProcessed { external_key } = &result {
            store.append_event(
                &LedgerEvent::DuplicateIgnored {
                    account_id: req.account_id.clone(),
                    external_key: external_key.clone(),
                },
                now,
            )?;
        }
        Ok(result)
    }

    /// Evaluate the gate; a block is logged and returned as `FraudBlocked`.
    fn gate(
        &self,
        account_id: &str,
        action: ActionType,
        context: &ActionContext,
        now: DateTime<Utc>,
    ) -> LedgerResult<FraudVerdict> {
        let verdict = self.fraud.evaluate(&self.store, account_id, action, context, now)?;
        if verdict.blocked {
            self.store.append_event(
                &LedgerEvent::FraudBlocked {
                    account_id: account_id.to_string(),
                    action,
                    score: verdict.score,
                },
                now,
            )?;
            return Err(LedgerError::FraudBlocked {
                account_id: account_id.to_string(),
                score: verdict.score,
            });
        }
        Ok(verdict)
    }

    // ── Provider callbacks ─────────────────────────────────────────

    /// Authenticate and settle one offerwall callback.
    ///
    /// Request problems (bad signature, fraud block, malformed or unknown
    /// account) are answered with the provider's failure body. Storage
    /// failures and misconfiguration are returned as errors so the HTTP
    /// layer answers with a server error and the provider retries.
    pub fn handle_provider_callback(
        &mut self,
        provider_id: &str,
        params: &CallbackParams,
    ) -> LedgerResult<CallbackResponse> {
        let provider = self.auth.provider(provider_id)?;
        let success = provider.success_response.clone();
        let failure = provider.failure_response.clone();

        match self.settle_callback(provider_id, params) {
            Ok(_) => Ok(CallbackResponse {
                accepted: true,
                body: success,
            }),
            Err(e) if is_callback_rejection(&e) => {
                log::warn!("callback from {provider_id} rejected: {e}");
                self.store.append_event(
                    &LedgerEvent::CallbackRejected {
                        provider_id: provider_id.to_string(),
                        reason: e.to_string(),
                    },
                    self.now(),
                )?;
                Ok(CallbackResponse {
                    accepted: false,
                    body: failure,
                })
            }
            Err(e) => Err(e),
        }
    }

    fn settle_callback(
        &mut self,
        provider_id: &str,
        params: &CallbackParams,
    ) -> LedgerResult<SettlementResult> {
        if let AuthResult::Invalid { reason } = self.auth.verify(provider_id, params)? {
            log::warn!("callback from {provider_id}: {reason}");
            return Err(LedgerError::InvalidSignature {
                provider_id: provider_id.to_string(),
            });
        }
        let callback = self.auth.parse(provider_id, params)?;
        let req = callback_request(provider_id, &callback);
        self.settle(req, &ActionContext::default())
    }

    // ── User actions ───────────────────────────────────────────────

    /// Credit a task reward. One-shot tasks settle at most once per account.
    pub fn complete_task(
        &mut self,
        account_id: &str,
        task_id: &str,
        context: &ActionContext,
    ) -> LedgerResult<SettlementResult> {
        let task = self
            .store
            .task(task_id)?
            .filter(|t| t.active)
            .ok_or_else(|| LedgerError::TaskNotFound {
                task_id: task_id.to_string(),
            })?;
        let mut req = SettlementRequest::new(account_id, task.reward, EntryKind::TaskCompletion)
            .with_description(format!("Task completed: {task_id}"))
            .with_metadata("task_id", Value::from(task_id));
        if task.one_shot {
            req = req.with_key(idempotency::task_key(account_id, task_id));
        }
        self.settle(req, context)
    }

    /// Credit the daily bonus, once per account per UTC calendar day.
    pub fn claim_daily_bonus(
        &mut self,
        account_id: &str,
        context: &ActionContext,
    ) -> LedgerResult<SettlementResult> {
        let day = self.now().date_naive();
        let req = SettlementRequest::new(
            account_id,
            self.config.settlement.daily_bonus_amount,
            EntryKind::DailyBonus,
        )
        .with_key(idempotency::daily_bonus_key(account_id, day))
        .with_description(format!("Daily bonus {day}"));
        self.settle(req, context)
    }

    /// Debit `amount` immediately and queue a pending payout.
    pub fn request_withdrawal(
        &mut self,
        account_id: &str,
        amount: Amount,
        method: &str,
        destination_details: &str,
        context: &ActionContext,
    ) -> LedgerResult<Withdrawal> {
        let req = WithdrawalRequest {
            account_id: account_id.to_string(),
            amount,
            method: method.to_string(),
            destination_details: destination_details.to_string(),
        };
        self.withdrawals.precheck(&req)?;
        self.store.require_account(account_id)?;
        let now = self.now();

        let context = context.clone().with_amount(amount);
        let verdict = self.gate(account_id, ActionType::Withdrawal, &context, now)?;

        let Self {
            store,
            settlement,
            withdrawals,
            ..
        } = self;
        store.atomic(|tx| withdrawals.request_in_tx(tx, settlement, &req, Some(&verdict), now))
    }

    // ── Admin actions ──────────────────────────────────────────────

    pub fn approve_withdrawal(&mut self, withdrawal_id: &str, note: Option<&str>) -> LedgerResult<Withdrawal> {
        let now = self.now();
        let Self {
            store, withdrawals, ..
        } = self;
        store.atomic(|tx| withdrawals.approve_in_tx(tx, withdrawal_id, note, now))
    }

    pub fn reject_withdrawal(&mut self, withdrawal_id: &str, reason: &str) -> LedgerResult<Withdrawal> {
        let now = self.now();
        let Self {
            store,
            settlement,
            withdrawals,
            ..
        } = self;
        store.atomic(|tx| withdrawals.reject_in_tx(tx, settlement, withdrawal_id, reason, now))
    }

    /// Signed manual correction. Goes through the same atomic append as
    /// every other settlement, so it can never drive a balance negative.
    pub fn adjust_balance(
        &mut self,
        account_id: &str,
        amount: Amount,
        reason: &str,
    ) -> LedgerResult<LedgerEntry> {
        let req = SettlementRequest::new(account_id, amount, EntryKind::AdminAdjustment)
            .with_description(reason)
            .with_metadata("reason", Value::from(reason));
        let result = self.settle(req, &ActionContext::default())?;
        match result {
            Settled::Applied(receipt) => Ok(receipt.entry),
            Settled::AlreadyProcessed { external_key } => {
                Err(LedgerError::DuplicateEvent { external_key })
            }
        }
    }

    // ── Reads ──────────────────────────────────────────────────────

    pub fn get_balance(&self, account_id: &str) -> LedgerResult<Amount> {
        self.store.get_balance(account_id)
    }

    pub fn get_transaction_history(
        &self,
        account_id: &str,
        filter: &HistoryFilter,
    ) -> LedgerResult<Vec<LedgerEntry>> {
        self.store.require_account(account_id)?;
        self.store.history(account_id, filter)
    }

    // ── Reconciliation ─────────────────────────────────────────────

    pub fn validate_balance(&self, account_id: &str) -> LedgerResult<BalanceReport> {
        reconciliation::validate_balance(&self.store, account_id)
    }

    pub fn audit_all(&mut self) -> LedgerResult<AuditSummary> {
        let now = self.now();
        reconciliation::audit_all(&mut self.store, now)
    }

    pub fn resolve_finding(&mut self, finding_id: &str, note: &str) -> LedgerResult<Resolution> {
        let now = self.now();
        reconciliation::resolve_finding(&mut self.store, finding_id, note, now)
    }
}

/// Credit for a completed offer, or an offsetting debit for a reversal.
fn callback_request(provider_id: &str, cb: &ProviderCallback) -> SettlementRequest {
    let (amount, kind, key) = if cb.is_reversal {
        (
            -cb.amount,
            EntryKind::OfferReversal,
            idempotency::reversal_key(provider_id, &cb.transaction_id),
        )
    } else {
        (
            cb.amount,
            EntryKind::OfferCompletion,
            idempotency::provider_key(provider_id, &cb.transaction_id),
        )
    };
    let mut req = SettlementRequest::new(&cb.account_id, amount, kind)
        .with_key(key)
        .with_description(format!("{provider_id} offer {}", cb.transaction_id))
        .with_metadata("provider_id", Value::from(provider_id))
        .with_metadata("transaction_id", Value::from(cb.transaction_id.clone()));
    if let Some(status) = &cb.status {
        req = req.with_metadata("status", Value::from(status.clone()));
    }
    req
}

/// Errors that mean "this callback is bad", as opposed to "we are broken".
fn is_callback_rejection(err: &LedgerError) -> bool {
    matches!(
        err,
        LedgerError::InvalidSignature { .. }
            | LedgerError::FraudBlocked { .. }
            | LedgerError::MalformedCallback { .. }
            | LedgerError::AccountNotFound { .. }
            | LedgerError::AccountInactive { .. }
            | LedgerError::InsufficientBalance { .. }
            | LedgerError::InvalidExternalKey { .. }
            | LedgerError::InvalidAmount { .. }
            | LedgerError::UnmatchedReversal { .. }
    )
}
