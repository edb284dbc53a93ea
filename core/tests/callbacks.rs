//! Provider callbacks: signature checks, settlement, duplicates, reversals.

use rewards_ledger_core::{
    callback_auth::{expected_signature, AuthResult, CallbackAuthenticator, CallbackParams},
    config::LedgerConfig,
    engine::{CallbackResponse, RewardsEngine},
    error::LedgerError,
    store::LedgerStore,
    types::EntryKind,
};
use std::sync::{Arc, Barrier};
use std::thread;

fn signed(config: &LedgerConfig, provider_id: &str, pairs: &[(&str, &str)]) -> CallbackParams {
    let provider = config
        .providers
        .iter()
        .find(|p| p.provider_id == provider_id)
        .unwrap();
    let mut params: CallbackParams = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let secret = provider.resolve_secret().unwrap();
    let sig = expected_signature(provider, &secret, &params).unwrap();
    params.insert(provider.signature_param.clone(), sig);
    params
}

fn cpx(tx: &str, user: &str, amount: &str, status: &str) -> CallbackParams {
    signed(
        &LedgerConfig::default_test(),
        "cpx",
        &[("trans_id", tx), ("user_id", user), ("amount", amount), ("status", status)],
    )
}

fn engine() -> RewardsEngine {
    let engine = RewardsEngine::build_test().unwrap();
    engine.open_account("alice", None).unwrap();
    engine
}

/// A correctly signed completion credits the account once.
#[test]
fn valid_callback_is_settled() {
    let mut engine = engine();
    let response = engine
        .handle_provider_callback("cpx", &cpx("cpx_tx_987", "alice", "0.75", "1"))
        .unwrap();
    assert_eq!(
        response,
        CallbackResponse {
            accepted: true,
            body: "1".into()
        }
    );
    assert_eq!(engine.get_balance("alice").unwrap(), 75);

    let entry = engine
        .store
        .entry_by_external_key("cpx:cpx_tx_987")
        .unwrap()
        .unwrap();
    assert_eq!(entry.kind, EntryKind::OfferCompletion);
    assert_eq!(entry.metadata["provider_id"], "cpx");
}

/// A bad signature never reaches settlement.
#[test]
fn invalid_signature_is_rejected() {
    let mut engine = engine();
    let mut params = cpx("cpx_tx_1", "alice", "0.75", "1");
    params.insert("amount".into(), "75.00".into());

    let response = engine.handle_provider_callback("cpx", &params).unwrap();
    assert!(!response.accepted);
    assert_eq!(response.body, "0");
    assert_eq!(engine.get_balance("alice").unwrap(), 0);
    assert_eq!(engine.store.entry_count("alice").unwrap(), 0);
    assert_eq!(engine.store.events_of_type("callback_rejected").unwrap().len(), 1);
    assert!(engine.store.fraud_signals_for("alice").unwrap().is_empty());
}

/// A missing signature parameter is invalid, not an error.
#[test]
fn missing_signature_is_invalid() {
    let config = LedgerConfig::default_test();
    let auth = CallbackAuthenticator::new(&config.providers);
    let mut params = cpx("t", "alice", "1", "1");
    params.remove("hash");
    assert!(matches!(
        auth.verify("cpx", &params).unwrap(),
        AuthResult::Invalid { .. }
    ));
}

/// The same transaction delivered twice is acknowledged twice, paid once.
#[test]
fn duplicate_callback_is_accepted_and_ignored() {
    let mut engine = engine();
    let params = cpx("cpx_tx_987", "alice", "0.75", "1");
    assert!(engine.handle_provider_callback("cpx", &params).unwrap().accepted);
    assert!(engine.handle_provider_callback("cpx", &params).unwrap().accepted);
    assert_eq!(engine.get_balance("alice").unwrap(), 75);
    assert_eq!(engine.store.entry_count("alice").unwrap(), 1);
}

/// Two identical callbacks arriving at once: one entry of +75, not 150.
#[test]
fn concurrent_duplicate_callbacks_settle_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.db");
    let path = path.to_str().unwrap().to_string();

    let setup = RewardsEngine::open(&path, LedgerConfig::default_test()).unwrap();
    setup.open_account("alice", None).unwrap();
    let params = cpx("cpx_tx_987", "alice", "0.75", "1");

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = (0..2)
        .map(|_| {
            let mut engine = RewardsEngine::open(&path, LedgerConfig::default_test()).unwrap();
            let barrier = barrier.clone();
            let params = params.clone();
            thread::spawn(move || {
                barrier.wait();
                engine.handle_provider_callback("cpx", &params).unwrap()
            })
        })
        .collect();

    for h in handles {
        assert!(h.join().unwrap().accepted);
    }
    assert_eq!(setup.get_balance("alice").unwrap(), 75);
    assert_eq!(setup.store.entry_count("alice").unwrap(), 1);
}

/// A reversal status debits the original amount under its own key.
#[test]
fn reversal_status_offsets_the_credit() {
    let mut engine = engine();
    engine
        .handle_provider_callback("cpx", &cpx("cpx_tx_5", "alice", "1.50", "1"))
        .unwrap();
    let response = engine
        .handle_provider_callback("cpx", &cpx("cpx_tx_5", "alice", "-1.50", "2"))
        .unwrap();
    assert!(response.accepted);
    assert_eq!(engine.get_balance("alice").unwrap(), 0);

    let reversal = engine
        .store
        .entry_by_external_key("cpx:cpx_tx_5:reversal")
        .unwrap()
        .unwrap();
    assert_eq!(reversal.kind, EntryKind::OfferReversal);
    assert_eq!(reversal.amount, -150);
    assert!(engine.validate_balance("alice").unwrap().consistent);
}

/// A reversal larger than the remaining balance is refused.
#[test]
fn reversal_cannot_overdraw() {
    let mut engine = engine();
    engine
        .handle_provider_callback("cpx", &cpx("cpx_tx_6", "alice", "1.00", "1"))
        .unwrap();
    engine.request_withdrawal("alice", 100, "paypal", "x", &Default::default()).unwrap();

    let response = engine
        .handle_provider_callback("cpx", &cpx("cpx_tx_6", "alice", "1.00", "2"))
        .unwrap();
    assert!(!response.accepted);
    assert_eq!(engine.get_balance("alice").unwrap(), 0);
}

/// A negative amount on a completion status is refused, not sign-flipped.
#[test]
fn negative_completion_is_rejected() {
    let mut engine = engine();
    let response = engine
        .handle_provider_callback("cpx", &cpx("cpx_tx_neg", "alice", "-0.75", "1"))
        .unwrap();
    assert!(!response.accepted);
    assert_eq!(response.body, "0");
    assert_eq!(engine.get_balance("alice").unwrap(), 0);
    assert!(engine
        .store
        .entry_by_external_key("cpx:cpx_tx_neg")
        .unwrap()
        .is_none());
}

/// A reversal for a transaction that was never paid cannot debit
/// balance earned elsewhere.
#[test]
fn reversal_without_original_credit_is_rejected() {
    let mut engine = engine();
    engine.adjust_balance("alice", 500, "seed").unwrap();

    let response = engine
        .handle_provider_callback("cpx", &cpx("never_paid", "alice", "4.00", "2"))
        .unwrap();
    assert!(!response.accepted);
    assert_eq!(engine.get_balance("alice").unwrap(), 500);
    assert_eq!(engine.store.events_of_type("callback_rejected").unwrap().len(), 1);
}

/// A reversal cannot take back more than the credit it offsets.
#[test]
fn reversal_is_capped_at_original_credit() {
    let mut engine = engine();
    engine.adjust_balance("alice", 500, "seed").unwrap();
    engine
        .handle_provider_callback("cpx", &cpx("cpx_tx_7", "alice", "1.00", "1"))
        .unwrap();

    let response = engine
        .handle_provider_callback("cpx", &cpx("cpx_tx_7", "alice", "4.00", "2"))
        .unwrap();
    assert!(!response.accepted);
    assert_eq!(engine.get_balance("alice").unwrap(), 600);
}

/// The HMAC scheme signs a fixed field concatenation.
#[test]
fn hmac_provider_round_trip() {
    let config = LedgerConfig::default_test();
    let mut engine = engine();
    let params = signed(
        &config,
        "lootably",
        &[("user_id", "alice"), ("tx_id", "loot-1"), ("payout", "2.5")],
    );
    let response = engine.handle_provider_callback("lootably", &params).unwrap();
    assert_eq!(response.body, "OK");
    assert_eq!(engine.get_balance("alice").unwrap(), 250);

    let mut tampered = params.clone();
    tampered.insert("payout".into(), "25".into());
    tampered.insert("tx_id".into(), "loot-2".into());
    let response = engine.handle_provider_callback("lootably", &tampered).unwrap();
    assert_eq!(response.body, "ERROR");
    assert_eq!(engine.get_balance("alice").unwrap(), 250);
}

/// Signed but malformed or unroutable callbacks get the failure body.
#[test]
fn malformed_callbacks_are_rejected() {
    let mut engine = engine();
    for params in [
        cpx("t1", "alice", "0.755", "1"),
        cpx("t2", "alice", "abc", "1"),
        cpx("t3", "nobody", "1.00", "1"),
        cpx("t4", "alice", "0", "1"),
    ] {
        let response = engine.handle_provider_callback("cpx", &params).unwrap();
        assert!(!response.accepted, "{params:?}");
    }
    assert_eq!(engine.get_balance("alice").unwrap(), 0);
}

/// A provider with no secret is a configuration error, never a pass.
#[test]
fn missing_secret_is_misconfiguration() {
    let mut config = LedgerConfig::default_test();
    config.providers[0].secret = None;
    config.providers[0].secret_env = Some("LEDGER_TEST_UNSET_SECRET".into());
    let store = LedgerStore::in_memory().unwrap();
    store.migrate().unwrap();
    let mut engine = RewardsEngine::build(store, config);
    engine.open_account("alice", None).unwrap();

    let err = engine
        .handle_provider_callback("cpx", &cpx("t1", "alice", "0.75", "1"))
        .unwrap_err();
    assert!(matches!(err, LedgerError::ProviderMisconfigured { .. }));
    assert_eq!(engine.get_balance("alice").unwrap(), 0);
}

/// Callbacks for an unconfigured provider are an error.
#[test]
fn unknown_provider_is_an_error() {
    let mut engine = engine();
    assert!(matches!(
        engine.handle_provider_callback("nope", &CallbackParams::new()),
        Err(LedgerError::UnknownProvider { .. })
    ));
}
