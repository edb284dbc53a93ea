//! Shared primitive types used across the entire ledger.

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Money in integer minor units (cents). Never a float.
pub type Amount = i64;

/// A stable, unique identifier for a user account.
pub type AccountId = String;

/// Returned when a stored or supplied tag does not name a known variant.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Which sign an entry kind is allowed to carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Credit,
    Debit,
    Either,
}

impl Direction {
    pub fn admits(&self, amount: Amount) -> bool {
        match self {
            Self::Credit => amount > 0,
            Self::Debit => amount < 0,
            Self::Either => amount != 0,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Credit => "positive",
            Self::Debit => "negative",
            Self::Either => "non-zero",
        }
    }
}

/// Closed set of balance-affecting event kinds.
/// Variants are never removed or reordered; the stored tag is `as_str()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    TaskCompletion,
    OfferCompletion,
    OfferReversal,
    DailyBonus,
    ReferralCommission,
    WithdrawalHold,
    /// Reserved. Approval leaves the hold standing and writes no entry.
    WithdrawalFinalize,
    WithdrawalRefund,
    AdminAdjustment,
    BalanceAudit,
}

impl EntryKind {
    pub const ALL: [EntryKind; 10] = [
        Self::TaskCompletion,
        Self::OfferCompletion,
        Self::OfferReversal,
        Self::DailyBonus,
        Self::ReferralCommission,
        Self::WithdrawalHold,
        Self::WithdrawalFinalize,
        Self::WithdrawalRefund,
        Self::AdminAdjustment,
        Self::BalanceAudit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskCompletion => "task_completion",
            Self::OfferCompletion => "offer_completion",
            Self::OfferReversal => "offer_reversal",
            Self::DailyBonus => "daily_bonus",
            Self::ReferralCommission => "referral_commission",
            Self::WithdrawalHold => "withdrawal_hold",
            Self::WithdrawalFinalize => "withdrawal_finalize",
            Self::WithdrawalRefund => "withdrawal_refund",
            Self::AdminAdjustment => "admin_adjustment",
            Self::BalanceAudit => "balance_audit",
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            Self::TaskCompletion
            | Self::OfferCompletion
            | Self::DailyBonus
            | Self::ReferralCommission
            | Self::WithdrawalRefund => Direction::Credit,
            Self::OfferReversal | Self::WithdrawalHold | Self::WithdrawalFinalize => {
                Direction::Debit
            }
            Self::AdminAdjustment | Self::BalanceAudit => Direction::Either,
        }
    }

    /// Kinds that pay the referrer a commission when settled.
    pub fn earns_commission(&self) -> bool {
        matches!(
            self,
            Self::TaskCompletion | Self::OfferCompletion | Self::DailyBonus
        )
    }

    /// Kinds that move `lifetime_earned` along with the balance.
    pub fn affects_lifetime_earned(&self) -> bool {
        matches!(
            self,
            Self::TaskCompletion
                | Self::OfferCompletion
                | Self::OfferReversal
                | Self::DailyBonus
                | Self::ReferralCommission
        )
    }

    /// Kinds that settle regardless of account status.
    /// Money already owed to or by the account must always land.
    pub fn ignores_account_status(&self) -> bool {
        matches!(
            self,
            Self::OfferReversal
                | Self::WithdrawalRefund
                | Self::AdminAdjustment
                | Self::BalanceAudit
        )
    }

    /// Kinds a caller may request through `RewardsEngine::settle`. Holds,
    /// refunds, commissions and audit corrections are written only by the
    /// flows that own them.
    pub fn caller_settleable(&self) -> bool {
        matches!(
            self,
            Self::TaskCompletion
                | Self::OfferCompletion
                | Self::OfferReversal
                | Self::DailyBonus
                | Self::AdminAdjustment
        )
    }

    /// The fraud gate action guarding this kind, if any.
    pub fn gated_action(&self) -> Option<ActionType> {
        match self {
            Self::TaskCompletion => Some(ActionType::TaskCompletion),
            Self::OfferCompletion => Some(ActionType::OfferCallback),
            Self::DailyBonus => Some(ActionType::DailyBonus),
            _ => None,
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| UnknownVariant {
                kind: "entry kind",
                value: s.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Suspended,
    Banned,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Suspended => "suspended",
            Self::Banned => "banned",
        }
    }
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccountStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "suspended" => Ok(Self::Suspended),
            "banned" => Ok(Self::Banned),
            other => Err(UnknownVariant {
                kind: "account status",
                value: other.to_string(),
            }),
        }
    }
}

/// Withdrawal lifecycle: `pending -> completed | rejected`, both terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalStatus {
    Pending,
    Completed,
    Rejected,
}

impl WithdrawalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Rejected => "rejected",
        }
    }
}

impl fmt::Display for WithdrawalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WithdrawalStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "rejected" => Ok(Self::Rejected),
            other => Err(UnknownVariant {
                kind: "withdrawal status",
                value: other.to_string(),
            }),
        }
    }
}

/// Actions the fraud gate counts and scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    TaskCompletion,
    OfferCallback,
    DailyBonus,
    Withdrawal,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskCompletion => "task_completion",
            Self::OfferCallback => "offer_callback",
            Self::DailyBonus => "daily_bonus",
            Self::Withdrawal => "withdrawal",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task_completion" => Ok(Self::TaskCompletion),
            "offer_callback" => Ok(Self::OfferCallback),
            "daily_bonus" => Ok(Self::DailyBonus),
            "withdrawal" => Ok(Self::Withdrawal),
            other => Err(UnknownVariant {
                kind: "action type",
                value: other.to_string(),
            }),
        }
    }
}

// ── SQLite text mapping ────────────────────────────────────────────

macro_rules! sql_text_enum {
    ($($ty:ty),+ $(,)?) => {$(
        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: UnknownVariant| FromSqlError::Other(Box::new(e)))
            }
        }
    )+};
}

sql_text_enum!(EntryKind, AccountStatus, WithdrawalStatus, ActionType);
