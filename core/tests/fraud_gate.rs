//! Fraud & rate gate: durable rate limits, identity reuse, review flags.

use rewards_ledger_core::{
    config::LedgerConfig,
    engine::RewardsEngine,
    error::LedgerError,
    fraud_gate::{ActionContext, RiskLevel},
    store::LedgerStore,
    types::ActionType,
};

/// The fourth daily bonus attempt in 24h is blocked, duplicates included.
#[test]
fn rate_limit_blocks_and_leaves_ledger_untouched() {
    let mut engine = RewardsEngine::build_test().unwrap();
    engine.open_account("alice", None).unwrap();
    let ctx = ActionContext::default();

    assert!(engine.claim_daily_bonus("alice", &ctx).unwrap().is_applied());
    assert!(!engine.claim_daily_bonus("alice", &ctx).unwrap().is_applied());
    assert!(!engine.claim_daily_bonus("alice", &ctx).unwrap().is_applied());

    let err = engine.claim_daily_bonus("alice", &ctx).unwrap_err();
    assert!(matches!(err, LedgerError::FraudBlocked { ref account_id, .. } if account_id == "alice"));
    assert_eq!(engine.get_balance("alice").unwrap(), 10);
    assert_eq!(engine.store.entry_count("alice").unwrap(), 1);

    let blocked = engine.store.events_of_type("fraud_blocked").unwrap();
    assert_eq!(blocked.len(), 1);

    let signal = &engine.store.fraud_signals_for("alice").unwrap()[0];
    assert!(signal.blocked);
    assert_eq!(signal.action_type, ActionType::DailyBonus);
    assert_eq!(signal.risk_level, RiskLevel::Critical.as_str());
    assert!(signal.contributing_factors.iter().any(|f| f.starts_with("rate limit")));
}

/// Counters live in the database, so a second connection sees them.
#[test]
fn rate_limit_is_shared_across_connections() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.db");
    let path = path.to_str().unwrap();

    let mut first = RewardsEngine::open(path, LedgerConfig::default_test()).unwrap();
    first.open_account("alice", None).unwrap();
    for _ in 0..3 {
        first.claim_daily_bonus("alice", &ActionContext::default()).unwrap();
    }

    let mut second = RewardsEngine::open(path, LedgerConfig::default_test()).unwrap();
    assert!(matches!(
        second.claim_daily_bonus("alice", &ActionContext::default()),
        Err(LedgerError::FraudBlocked { .. })
    ));
}

/// A third account on one IP and device is flagged for review; a fourth
/// is blocked.
#[test]
fn shared_identity_flags_then_blocks() {
    let mut engine = RewardsEngine::build_test().unwrap();
    let ctx = ActionContext::default()
        .with_ip("203.0.113.7")
        .with_device("device-abc");
    for id in ["a1", "a2", "a3", "a4"] {
        engine.open_account(id, None).unwrap();
    }

    for id in ["a1", "a2"] {
        let receipt = engine.claim_daily_bonus(id, &ctx).unwrap().applied().unwrap();
        assert!(!receipt.flagged, "{id} should be clean");
    }

    let receipt = engine.claim_daily_bonus("a3", &ctx).unwrap().applied().unwrap();
    assert!(receipt.flagged);
    assert!(receipt.entry.flagged);
    assert_eq!(receipt.entry.metadata["review"], true);
    assert!(receipt.entry.metadata["fraud_score"].as_f64().unwrap() >= 0.5);
    assert_eq!(engine.get_balance("a3").unwrap(), 10, "flagged entries still settle");

    let err = engine.claim_daily_bonus("a4", &ctx).unwrap_err();
    assert!(matches!(err, LedgerError::FraudBlocked { .. }));
    assert_eq!(engine.get_balance("a4").unwrap(), 0);
}

/// Distinct identities do not affect each other.
#[test]
fn distinct_identities_stay_clean() {
    let mut engine = RewardsEngine::build_test().unwrap();
    for (i, id) in ["b1", "b2", "b3", "b4"].iter().enumerate() {
        engine.open_account(id, None).unwrap();
        let ctx = ActionContext::default()
            .with_ip(format!("198.51.100.{i}"))
            .with_device(format!("device-{i}"));
        let receipt = engine.claim_daily_bonus(id, &ctx).unwrap().applied().unwrap();
        assert!(!receipt.flagged);
    }
    let signals = engine.store.fraud_signals_for("b4").unwrap();
    assert_eq!(signals[0].risk_level, RiskLevel::Low.as_str());
}

/// Withdrawing more than was ever earned is a scored factor.
#[test]
fn withdrawal_over_earnings_is_scored() {
    let mut engine = RewardsEngine::build_test().unwrap();
    engine.open_account("alice", None).unwrap();
    engine.adjust_balance("alice", 1_000, "grant").unwrap();
    engine
        .request_withdrawal("alice", 500, "paypal", "alice@example.com", &ActionContext::default())
        .unwrap();

    let signal = &engine.store.fraud_signals_for("alice").unwrap()[0];
    assert_eq!(signal.action_type, ActionType::Withdrawal);
    assert!((signal.score - 0.3).abs() < 1e-9, "score {}", signal.score);
    assert!(signal
        .contributing_factors
        .iter()
        .any(|f| f.contains("exceeds lifetime earnings")));
}

/// New accounts are scored when the age minimum is configured.
#[test]
fn young_account_withdrawal_is_scored() {
    let mut config = LedgerConfig::default_test();
    config.fraud.min_account_age_secs = 86_400;
    config.fraud.flag_threshold = 0.45;
    let store = LedgerStore::in_memory().unwrap();
    store.migrate().unwrap();
    let mut engine = RewardsEngine::build(store, config);

    engine.open_account("alice", None).unwrap();
    engine.adjust_balance("alice", 1_000, "grant").unwrap();
    engine
        .request_withdrawal("alice", 500, "paypal", "alice@example.com", &ActionContext::default())
        .unwrap();

    let signal = &engine.store.fraud_signals_for("alice").unwrap()[0];
    assert!((signal.score - 0.5).abs() < 1e-9, "score {}", signal.score);
    assert!(signal.flagged);
    let hold = engine
        .get_transaction_history("alice", &Default::default())
        .unwrap()
        .remove(0);
    assert!(hold.flagged);
}
