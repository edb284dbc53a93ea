use crate::types::{AccountStatus, Amount, EntryKind, WithdrawalStatus};
use rusqlite::ErrorCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    /// Already settled. Callers treat this as a successful no-op.
    #[error("Duplicate event: external key '{external_key}' already settled")]
    DuplicateEvent { external_key: String },

    #[error("Insufficient balance on {account_id}: balance {balance}, debit {requested}")]
    InsufficientBalance {
        account_id: String,
        balance: Amount,
        requested: Amount,
    },

    #[error("Blocked by fraud gate: account {account_id} scored {score:.2}")]
    FraudBlocked { account_id: String, score: f64 },

    #[error("Invalid signature on callback from provider '{provider_id}'")]
    InvalidSignature { provider_id: String },

    #[error("Withdrawal {withdrawal_id} already processed (status {status})")]
    AlreadyProcessed {
        withdrawal_id: String,
        status: WithdrawalStatus,
    },

    /// Nothing was committed. Safe to retry.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Invalid amount {amount}: {reason}")]
    InvalidAmount { amount: Amount, reason: String },

    #[error("{kind} entries must be {expected}, got {amount}")]
    SignMismatch {
        kind: EntryKind,
        expected: &'static str,
        amount: Amount,
    },

    #[error("{kind} entries are written internally and cannot be settled directly")]
    KindNotSettleable { kind: EntryKind },

    #[error("Reversal '{external_key}' does not offset a settled credit: {reason}")]
    UnmatchedReversal { external_key: String, reason: String },

    #[error("Account '{account_id}' not found")]
    AccountNotFound { account_id: String },

    #[error("Account '{account_id}' already exists")]
    AccountExists { account_id: String },

    #[error("Account '{account_id}' is {status}")]
    AccountInactive {
        account_id: String,
        status: AccountStatus,
    },

    #[error("Invalid referrer '{referrer_id}' for account '{account_id}'")]
    InvalidReferrer {
        account_id: String,
        referrer_id: String,
    },

    #[error("Withdrawal '{withdrawal_id}' not found")]
    WithdrawalNotFound { withdrawal_id: String },

    #[error("Withdrawal of {amount} is below the minimum of {minimum}")]
    BelowMinimumWithdrawal { amount: Amount, minimum: Amount },

    #[error("Unsupported withdrawal method '{method}'")]
    UnsupportedMethod { method: String },

    #[error("Unknown callback provider '{provider_id}'")]
    UnknownProvider { provider_id: String },

    #[error("Provider '{provider_id}' is misconfigured: {reason}")]
    ProviderMisconfigured { provider_id: String, reason: String },

    #[error("Malformed callback from '{provider_id}': {reason}")]
    MalformedCallback { provider_id: String, reason: String },

    #[error("Task '{task_id}' not found or inactive")]
    TaskNotFound { task_id: String },

    #[error("Invalid external key: {reason}")]
    InvalidExternalKey { reason: String },

    #[error("Audit finding '{finding_id}' not found or already resolved")]
    FindingNotFound { finding_id: String },

    #[error("Database error: {0}")]
    Database(rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl LedgerError {
    /// True only when nothing committed and the same call may succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StorageUnavailable(_))
    }
}

impl From<rusqlite::Error> for LedgerError {
    fn from(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(ref failure, _) = err {
            match failure.code {
                ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::SystemIoFailure
                | ErrorCode::CannotOpen
                | ErrorCode::DiskFull => return Self::StorageUnavailable(err.to_string()),
                _ => {}
            }
        }
        Self::Database(err)
    }
}

/// True when `err` is the UNIQUE violation on `ledger_entries.external_key`.
pub(crate) fn is_external_key_conflict(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(failure, msg) => {
            failure.code == ErrorCode::ConstraintViolation
                && msg
                    .as_deref()
                    .is_some_and(|m| m.contains("ledger_entries.external_key"))
        }
        _ => false,
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;
