//! Fraud & rate gate: scores an action before any ledger transaction opens.
//!
//! This gate:
//!   1. Enforces sliding-window rate limits per account + action type
//!   2. Scores velocity of identical actions in a short window
//!   3. Scores IP / device reuse across accounts
//!   4. Scores withdrawal-specific risk (amount vs earnings, account age)
//!
//! RULE: Advisory only. It writes its own counters and signals, never a
//! ledger entry or a balance. Counters live in the database so every
//! process sharing it enforces the same limits.

use crate::{
    config::FraudConfig,
    error::LedgerResult,
    store::{FraudSignal, IdentityField, LedgerStore},
    types::{ActionType, Amount},
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

// ── Constants ────────────────────────────────────────────────────────────────

const VELOCITY_STEP: f64 = 0.10;
const VELOCITY_CAP: f64 = 0.40;
const SHARED_IDENTITY_BASE: f64 = 0.35;
const SHARED_IDENTITY_STEP: f64 = 0.10;
const SHARED_IDENTITY_CAP: f64 = 0.50;
const WITHDRAWAL_OVER_EARNINGS: f64 = 0.30;
const YOUNG_ACCOUNT: f64 = 0.20;
const MEDIUM_RISK_FLOOR: f64 = 0.30;

/// Request-side facts the session layer supplies alongside an action.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionContext {
    pub ip: Option<String>,
    pub device_id: Option<String>,
    pub amount: Option<Amount>,
}

impl ActionContext {
    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    pub fn with_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    pub fn with_amount(mut self, amount: Amount) -> Self {
        self.amount = Some(amount);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn from_score(score: f64, config: &FraudConfig) -> Self {
        if score >= config.block_threshold {
            Self::Critical
        } else if score >= config.flag_threshold {
            Self::High
        } else if score >= MEDIUM_RISK_FLOOR {
            Self::Medium
        } else {
            Self::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// `score >= block_threshold` blocks; `score >= flag_threshold` flags.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FraudVerdict {
    pub score: f64,
    pub risk_level: RiskLevel,
    pub blocked: bool,
    pub flagged: bool,
    pub factors: Vec<String>,
}

pub struct FraudGate {
    config: FraudConfig,
}

impl FraudGate {
    pub fn new(config: FraudConfig) -> Self {
        Self { config }
    }

    /// Score one action, then record it in the windowed counters and
    /// persist the signal. The current action is not part of its own count.
    pub fn evaluate(
        &self,
        store: &LedgerStore,
        account_id: &str,
        action: ActionType,
        context: &ActionContext,
        now: DateTime<Utc>,
    ) -> LedgerResult<FraudVerdict> {
        let mut score = 0.0;
        let mut factors = Vec::new();

        score += self.rate_limit_component(store, account_id, action, now, &mut factors)?;
        score += self.velocity_component(store, account_id, action, now, &mut factors)?;
        score += self.shared_identity_component(store, account_id, context, now, &mut factors)?;
        if action == ActionType::Withdrawal {
            score += self.withdrawal_component(store, account_id, context, now, &mut factors)?;
        }
        let score = score.clamp(0.0, 1.0);

        let blocked = score >= self.config.block_threshold;
        let flagged = !blocked && score >= self.config.flag_threshold;
        let risk_level = RiskLevel::from_score(score, &self.config);

        store.record_action(
            account_id,
            action,
            context.ip.as_deref(),
            context.device_id.as_deref(),
            now,
        )?;
        store.insert_fraud_signal(&FraudSignal {
            account_id: account_id.to_string(),
            action_type: action,
            score,
            risk_level: risk_level.as_str().to_string(),
            contributing_factors: factors.clone(),
            blocked,
            flagged,
            created_at: now,
        })?;

        if blocked {
            log::warn!("fraud gate: blocked {action} for {account_id} (score {score:.2}: {factors:?})");
        } else {
            log::debug!("fraud gate: {action} for {account_id} scored {score:.2}");
        }

        Ok(FraudVerdict {
            score,
            risk_level,
            blocked,
            flagged,
            factors,
        })
    }

    /// More than `max_actions` in the trailing window blocks outright.
    fn rate_limit_component(
        &self,
        store: &LedgerStore,
        account_id: &str,
        action: ActionType,
        now: DateTime<Utc>,
        factors: &mut Vec<String>,
    ) -> LedgerResult<f64> {
        let Some(rule) = self.config.rule_for(action) else {
            return Ok(0.0);
        };
        let since = now - Duration::seconds(rule.window_secs);
        let prior = store.count_actions_since(account_id, action, since)?;
        if prior >= rule.max_actions {
            factors.push(format!(
                "rate limit: {prior} {action} in {}s (max {})",
                rule.window_secs, rule.max_actions
            ));
            return Ok(1.0);
        }
        Ok(0.0)
    }

    fn velocity_component(
        &self,
        store: &LedgerStore,
        account_id: &str,
        action: ActionType,
        now: DateTime<Utc>,
        factors: &mut Vec<String>,
    ) -> LedgerResult<f64> {
        let since = now - Duration::seconds(self.config.velocity_window_secs);
        let recent = store.count_actions_since(account_id, action, since)?;
        if recent < self.config.velocity_soft_limit {
            return Ok(0.0);
        }
        let excess = recent - self.config.velocity_soft_limit + 1;
        factors.push(format!(
            "velocity: {recent} {action} in {}s",
            self.config.velocity_window_secs
        ));
        Ok((excess as f64 * VELOCITY_STEP).min(VELOCITY_CAP))
    }

    fn shared_identity_component(
        &self,
        store: &LedgerStore,
        account_id: &str,
        context: &ActionContext,
        now: DateTime<Utc>,
        factors: &mut Vec<String>,
    ) -> LedgerResult<f64> {
        let since = now - Duration::seconds(self.config.shared_identity_window_secs);
        let limit = self.config.shared_identity_account_limit;
        let mut component = 0.0;
        let probes = [
            (IdentityField::Ip, context.ip.as_deref()),
            (IdentityField::Device, context.device_id.as_deref()),
        ];
        for (field, value) in probes {
            let Some(value) = value.filter(|v| !v.is_empty()) else {
                continue;
            };
            let others = store.count_accounts_sharing(field, value, account_id, since)?;
            if others >= limit {
                let extra = (others - limit) as f64;
                component += (SHARED_IDENTITY_BASE + SHARED_IDENTITY_STEP * extra)
                    .min(SHARED_IDENTITY_CAP);
                factors.push(format!("{} shared with {others} other accounts", field.label()));
            }
        }
        Ok(component)
    }

    fn withdrawal_component(
        &self,
        store: &LedgerStore,
        account_id: &str,
        context: &ActionContext,
        now: DateTime<Utc>,
        factors: &mut Vec<String>,
    ) -> LedgerResult<f64> {
        let Some(account) = store.account(account_id)? else {
            return Ok(0.0);
        };
        let mut component = 0.0;
        if let Some(amount) = context.amount {
            if amount > account.lifetime_earned {
                component += WITHDRAWAL_OVER_EARNINGS;
                factors.push(format!(
                    "withdrawal {amount} exceeds lifetime earnings {}",
                    account.lifetime_earned
                ));
            }
        }
        let age = now - account.created_at;
        if age < Duration::seconds(self.config.min_account_age_secs) {
            component += YOUNG_ACCOUNT;
            factors.push(format!("account age {}s", age.num_seconds()));
        }
        Ok(component)
    }
}
