//! Callback authenticator: verifies provider signatures before anything
//! reaches settlement.
//!
//! RULE: A provider without a resolvable secret is a hard misconfiguration,
//! never an accept-all.

use crate::{
    config::{ProviderConfig, SignatureScheme},
    error::{LedgerError, LedgerResult},
    types::Amount,
};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Raw callback parameters, keyed by name.
pub type CallbackParams = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResult {
    Valid,
    Invalid { reason: String },
}

/// The fields settlement needs, extracted from an authenticated callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCallback {
    pub transaction_id: String,
    pub account_id: String,
    /// Minor units, always positive. Direction comes from `is_reversal`.
    pub amount: Amount,
    pub status: Option<String>,
    pub is_reversal: bool,
}

pub struct CallbackAuthenticator {
    providers: HashMap<String, ProviderConfig>,
}

impl CallbackAuthenticator {
    pub fn new(providers: &[ProviderConfig]) -> Self {
        Self {
            providers: providers
                .iter()
                .map(|p| (p.provider_id.clone(), p.clone()))
                .collect(),
        }
    }

    pub fn provider(&self, provider_id: &str) -> LedgerResult<&ProviderConfig> {
        self.providers
            .get(provider_id)
            .ok_or_else(|| LedgerError::UnknownProvider {
                provider_id: provider_id.to_string(),
            })
    }

    /// Recompute the expected signature and compare in constant time.
    pub fn verify(&self, provider_id: &str, params: &CallbackParams) -> LedgerResult<AuthResult> {
        let provider = self.provider(provider_id)?;
        let secret = provider
            .resolve_secret()
            .ok_or_else(|| LedgerError::ProviderMisconfigured {
                provider_id: provider_id.to_string(),
                reason: "no shared secret configured".into(),
            })?;

        let Some(supplied) = params.get(&provider.signature_param) else {
            return Ok(AuthResult::Invalid {
                reason: format!("missing '{}' parameter", provider.signature_param),
            });
        };
        let expected = match expected_signature(provider, &secret, params) {
            Ok(sig) => sig,
            Err(reason) => return Ok(AuthResult::Invalid { reason }),
        };

        if signatures_match(&expected, supplied) {
            Ok(AuthResult::Valid)
        } else {
            Ok(AuthResult::Invalid {
                reason: "signature mismatch".into(),
            })
        }
    }

    /// Pull transaction id, account, amount and status out of `params`.
    pub fn parse(&self, provider_id: &str, params: &CallbackParams) -> LedgerResult<ProviderCallback> {
        let provider = self.provider(provider_id)?;
        let malformed = |reason: String| LedgerError::MalformedCallback {
            provider_id: provider_id.to_string(),
            reason,
        };
        let required = |name: &str| {
            params
                .get(name)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| malformed(format!("missing '{name}' parameter")))
        };

        let transaction_id = required(&provider.transaction_id_param)?.to_string();
        let account_id = required(&provider.account_param)?.to_string();
        let raw_amount = required(&provider.amount_param)?;
        let signed = parse_minor_units(raw_amount)
            .ok_or_else(|| malformed(format!("amount '{raw_amount}' is not a decimal with at most 2 places")))?;
        if signed == 0 {
            return Err(malformed("amount is zero".into()));
        }

        let status = provider
            .status_param
            .as_deref()
            .and_then(|p| params.get(p))
            .map(|s| s.trim().to_string());
        let is_reversal = status
            .as_deref()
            .is_some_and(|s| provider.reversal_statuses.iter().any(|r| r == s));

        // Providers may send reversals signed either way; completions must be positive.
        let amount = if is_reversal {
            signed.abs()
        } else if signed < 0 {
            return Err(malformed(format!("completion amount '{raw_amount}' is negative")));
        } else {
            signed
        };

        Ok(ProviderCallback {
            transaction_id,
            account_id,
            amount,
            status,
            is_reversal,
        })
    }
}

/// The signature this provider would have sent for `params`.
/// `Err` names a field the scheme needs but the callback lacks.
pub fn expected_signature(
    provider: &ProviderConfig,
    secret: &str,
    params: &CallbackParams,
) -> Result<String, String> {
    match &provider.signing {
        SignatureScheme::SortedParamsSha256 => {
            // BTreeMap iterates in key order.
            let joined = params
                .iter()
                .filter(|(k, _)| **k != provider.signature_param)
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("&");
            let mut hasher = Sha256::new();
            hasher.update(joined.as_bytes());
            hasher.update(secret.as_bytes());
            Ok(hex::encode(hasher.finalize()))
        }
        SignatureScheme::HmacSha256Fields { fields, separator } => {
            let values = fields
                .iter()
                .map(|f| {
                    params
                        .get(f)
                        .map(String::as_str)
                        .ok_or_else(|| format!("missing signed field '{f}'"))
                })
                .collect::<Result<Vec<_>, _>>()?;
            let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
                .map_err(|e| format!("unusable secret: {e}"))?;
            mac.update(values.join(separator).as_bytes());
            Ok(hex::encode(mac.finalize().into_bytes()))
        }
    }
}

/// Constant-time comparison of lowercase hex digests.
fn signatures_match(expected: &str, supplied: &str) -> bool {
    let supplied = supplied.trim().to_ascii_lowercase();
    expected.as_bytes().ct_eq(supplied.as_bytes()).into()
}

/// Parse a decimal major-unit string ("0.75", "12", "-3.5") into minor
/// units without going through floating point.
pub fn parse_minor_units(raw: &str) -> Option<Amount> {
    let raw = raw.trim();
    let (negative, digits) = match raw.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw),
    };
    let (whole, frac) = match digits.split_once('.') {
        Some((w, f)) => (w, f),
        None => (digits, ""),
    };
    if whole.is_empty() && frac.is_empty() {
        return None;
    }
    if frac.len() > 2 || !whole.chars().chain(frac.chars()).all(|c| c.is_ascii_digit()) {
        return None;
    }
    let whole: Amount = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let cents: Amount = match frac.len() {
        0 => 0,
        1 => frac.parse::<Amount>().ok()? * 10,
        _ => frac.parse().ok()?,
    };
    let total = whole.checked_mul(100)?.checked_add(cents)?;
    Some(if negative { -total } else { total })
}
