use crate::types::{ActionType, Amount};
use anyhow::Context;
use serde::{Deserialize, Serialize};

// ── Settlement ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementConfig {
    /// Referral commission in basis points (1000 = 10%).
    pub commission_rate_bps: i64,
    pub daily_bonus_amount: Amount,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            commission_rate_bps: 1_000,
            daily_bonus_amount: 10,
        }
    }
}

// ── Withdrawal ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawalConfig {
    pub minimum_withdrawal: Amount,
    pub allowed_methods: Vec<String>,
}

impl Default for WithdrawalConfig {
    fn default() -> Self {
        Self {
            minimum_withdrawal: 500,
            allowed_methods: vec!["paypal".into(), "bank_transfer".into(), "gift_card".into()],
        }
    }
}

// ── Fraud & rate gate ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub action: ActionType,
    pub max_actions: i64,
    pub window_secs: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FraudConfig {
    pub rate_limits: Vec<RateLimitRule>,
    pub velocity_window_secs: i64,
    pub velocity_soft_limit: i64,
    pub shared_identity_window_secs: i64,
    /// Other accounts seen on the same IP or device before it counts.
    pub shared_identity_account_limit: i64,
    pub min_account_age_secs: i64,
    pub flag_threshold: f64,
    pub block_threshold: f64,
}

impl Default for FraudConfig {
    fn default() -> Self {
        Self {
            rate_limits: vec![
                RateLimitRule {
                    action: ActionType::OfferCallback,
                    max_actions: 60,
                    window_secs: 3_600,
                },
                RateLimitRule {
                    action: ActionType::TaskCompletion,
                    max_actions: 30,
                    window_secs: 3_600,
                },
                RateLimitRule {
                    action: ActionType::DailyBonus,
                    max_actions: 3,
                    window_secs: 86_400,
                },
                RateLimitRule {
                    action: ActionType::Withdrawal,
                    max_actions: 3,
                    window_secs: 86_400,
                },
            ],
            velocity_window_secs: 60,
            velocity_soft_limit: 5,
            shared_identity_window_secs: 30 * 86_400,
            shared_identity_account_limit: 2,
            min_account_age_secs: 86_400,
            flag_threshold: 0.5,
            block_threshold: 0.8,
        }
    }
}

impl FraudConfig {
    pub fn rule_for(&self, action: ActionType) -> Option<&RateLimitRule> {
        self.rate_limits.iter().find(|r| r.action == action)
    }
}

// ── Storage ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
        }
    }
}

// ── Callback providers ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "scheme", rename_all = "snake_case")]
pub enum SignatureScheme {
    /// SHA-256 over `k1=v1&k2=v2...` (sorted, signature excluded) + secret.
    SortedParamsSha256,
    /// HMAC-SHA256 keyed by the secret over the listed field values.
    HmacSha256Fields {
        fields: Vec<String>,
        #[serde(default)]
        separator: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub provider_id: String,
    pub signing: SignatureScheme,
    #[serde(default)]
    pub secret: Option<String>,
    /// Environment variable consulted when `secret` is absent.
    #[serde(default)]
    pub secret_env: Option<String>,
    pub transaction_id_param: String,
    pub account_param: String,
    pub amount_param: String,
    #[serde(default)]
    pub status_param: Option<String>,
    pub signature_param: String,
    #[serde(default)]
    pub reversal_statuses: Vec<String>,
    #[serde(default = "default_success_response")]
    pub success_response: String,
    #[serde(default = "default_failure_response")]
    pub failure_response: String,
}

fn default_success_response() -> String {
    "1".into()
}

fn default_failure_response() -> String {
    "0".into()
}

impl ProviderConfig {
    /// The shared secret, from config or the named environment variable.
    /// Empty strings count as missing.
    pub fn resolve_secret(&self) -> Option<String> {
        self.secret
            .clone()
            .or_else(|| {
                self.secret_env
                    .as_deref()
                    .and_then(|var| std::env::var(var).ok())
            })
            .filter(|s| !s.trim().is_empty())
    }
}

// ── Top level ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default)]
    pub settlement: SettlementConfig,
    #[serde(default)]
    pub withdrawal: WithdrawalConfig,
    #[serde(default)]
    pub fraud: FraudConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

impl LedgerConfig {
    /// Load from a JSON file. Missing sections take their defaults.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read ledger config at {path}"))?;
        let config: LedgerConfig = serde_json::from_str(&content)
            .with_context(|| format!("Cannot parse ledger config at {path}"))?;
        for p in &config.providers {
            anyhow::ensure!(
                !p.provider_id.is_empty() && !p.provider_id.contains(':'),
                "provider_id '{}' must be non-empty and contain no ':'",
                p.provider_id
            );
        }
        Ok(config)
    }

    /// Config with hardcoded defaults for use in tests.
    /// Two providers with inline secrets, no account age requirement and a
    /// 100 minimum withdrawal.
    pub fn default_test() -> Self {
        let cpx = ProviderConfig {
            provider_id: "cpx".into(),
            signing: SignatureScheme::SortedParamsSha256,
            secret: Some("cpx-test-secret".into()),
            secret_env: None,
            transaction_id_param: "trans_id".into(),
            account_param: "user_id".into(),
            amount_param: "amount".into(),
            status_param: Some("status".into()),
            signature_param: "hash".into(),
            reversal_statuses: vec!["2".into()],
            success_response: "1".into(),
            failure_response: "0".into(),
        };
        let lootably = ProviderConfig {
            provider_id: "lootably".into(),
            signing: SignatureScheme::HmacSha256Fields {
                fields: vec!["user_id".into(), "tx_id".into(), "payout".into()],
                separator: String::new(),
            },
            secret: Some("lootably-test-secret".into()),
            secret_env: None,
            transaction_id_param: "tx_id".into(),
            account_param: "user_id".into(),
            amount_param: "payout".into(),
            status_param: None,
            signature_param: "signature".into(),
            reversal_statuses: Vec::new(),
            success_response: "OK".into(),
            failure_response: "ERROR".into(),
        };

        Self {
            settlement: SettlementConfig::default(),
            withdrawal: WithdrawalConfig {
                minimum_withdrawal: 100,
                ..WithdrawalConfig::default()
            },
            fraud: FraudConfig {
                min_account_age_secs: 0,
                ..FraudConfig::default()
            },
            storage: StorageConfig::default(),
            providers: vec![cpx, lootably],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_fills_missing_sections() {
        let json = r#"{ "settlement": { "commission_rate_bps": 500, "daily_bonus_amount": 25 } }"#;
        let config: LedgerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.settlement.commission_rate_bps, 500);
        assert_eq!(config.withdrawal.minimum_withdrawal, 500);
        assert!(config.providers.is_empty());
    }

    #[test]
    fn provider_scheme_is_tagged() {
        let json = r#"{
            "provider_id": "ayet",
            "signing": { "scheme": "hmac_sha256_fields", "fields": ["a", "b"], "separator": "-" },
            "transaction_id_param": "tx",
            "account_param": "uid",
            "amount_param": "amt",
            "signature_param": "sig"
        }"#;
        let p: ProviderConfig = serde_json::from_str(json).unwrap();
        assert_eq!(
            p.signing,
            SignatureScheme::HmacSha256Fields {
                fields: vec!["a".into(), "b".into()],
                separator: "-".into()
            }
        );
        assert_eq!(p.success_response, "1");
        assert!(p.resolve_secret().is_none());
    }

    #[test]
    fn blank_secret_counts_as_missing() {
        let mut p = LedgerConfig::default_test().providers.remove(0);
        p.secret = Some("   ".into());
        assert!(p.resolve_secret().is_none());
    }
}
