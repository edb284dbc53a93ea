//! Withdrawal state machine: hold at request, approve, reject with refund.

use rewards_ledger_core::{
    config::LedgerConfig,
    engine::RewardsEngine,
    error::LedgerError,
    fraud_gate::ActionContext,
    types::{EntryKind, WithdrawalStatus},
};
use std::sync::{Arc, Barrier};
use std::thread;

fn funded(balance: i64) -> RewardsEngine {
    let mut engine = RewardsEngine::build_test().unwrap();
    engine.open_account("alice", None).unwrap();
    engine.adjust_balance("alice", balance, "seed").unwrap();
    engine
}

/// 500 → request 300 → 200 pending → reject → 500 with a +300 refund.
#[test]
fn request_then_reject_restores_balance() {
    let mut engine = funded(500);
    let ctx = ActionContext::default();

    let w = engine
        .request_withdrawal("alice", 300, "paypal", "alice@example.com", &ctx)
        .unwrap();
    assert_eq!(w.status, WithdrawalStatus::Pending);
    assert_eq!(engine.get_balance("alice").unwrap(), 200);

    let hold = engine
        .store
        .entry_by_external_key(&format!("withdrawal:{}:hold", w.withdrawal_id))
        .unwrap()
        .unwrap();
    assert_eq!(hold.kind, EntryKind::WithdrawalHold);
    assert_eq!(hold.amount, -300);
    assert_eq!(hold.entry_id, w.hold_entry_id);

    let rejected = engine.reject_withdrawal(&w.withdrawal_id, "invalid account").unwrap();
    assert_eq!(rejected.status, WithdrawalStatus::Rejected);
    assert_eq!(rejected.rejection_reason.as_deref(), Some("invalid account"));
    assert!(rejected.processed_at.is_some());
    assert_eq!(engine.get_balance("alice").unwrap(), 500);

    let refund = engine
        .store
        .entry_by_external_key(&format!("withdrawal:{}:refund", w.withdrawal_id))
        .unwrap()
        .unwrap();
    assert_eq!(refund.kind, EntryKind::WithdrawalRefund);
    assert_eq!(refund.amount, 300);
    assert_eq!(rejected.refund_entry_id.as_deref(), Some(refund.entry_id.as_str()));
    assert!(engine.validate_balance("alice").unwrap().consistent);
}

/// Rejecting twice is an error, not a second refund.
#[test]
fn double_reject_is_already_processed() {
    let mut engine = funded(500);
    let w = engine
        .request_withdrawal("alice", 300, "paypal", "alice@example.com", &ActionContext::default())
        .unwrap();
    engine.reject_withdrawal(&w.withdrawal_id, "invalid account").unwrap();

    let err = engine
        .reject_withdrawal(&w.withdrawal_id, "invalid account")
        .unwrap_err();
    assert!(matches!(
        err,
        LedgerError::AlreadyProcessed {
            status: WithdrawalStatus::Rejected,
            ..
        }
    ));
    assert_eq!(engine.get_balance("alice").unwrap(), 500);
    assert_eq!(engine.store.entry_count("alice").unwrap(), 3);
}

/// Approval leaves the hold standing and writes no ledger entry.
#[test]
fn approve_is_a_status_change_only() {
    let mut engine = funded(500);
    let w = engine
        .request_withdrawal("alice", 300, "gift_card", "amazon", &ActionContext::default())
        .unwrap();
    let entries_before = engine.store.entry_count("alice").unwrap();

    let done = engine.approve_withdrawal(&w.withdrawal_id, Some("paid")).unwrap();
    assert_eq!(done.status, WithdrawalStatus::Completed);
    assert_eq!(engine.get_balance("alice").unwrap(), 200);
    assert_eq!(engine.store.entry_count("alice").unwrap(), entries_before);

    let approved = engine.store.events_of_type("withdrawal_approved").unwrap();
    assert_eq!(approved.len(), 1);
    assert_eq!(approved[0].account_id.as_deref(), Some("alice"));

    assert!(matches!(
        engine.approve_withdrawal(&w.withdrawal_id, None),
        Err(LedgerError::AlreadyProcessed { status: WithdrawalStatus::Completed, .. })
    ));
    assert!(matches!(
        engine.reject_withdrawal(&w.withdrawal_id, "too late"),
        Err(LedgerError::AlreadyProcessed { .. })
    ));
    assert_eq!(engine.get_balance("alice").unwrap(), 200);
}

/// Requests below the minimum, over the balance or with an unknown
/// method are refused with no writes.
#[test]
fn invalid_requests_write_nothing() {
    let mut engine = funded(500);
    let ctx = ActionContext::default();
    assert!(matches!(
        engine.request_withdrawal("alice", 99, "paypal", "x", &ctx),
        Err(LedgerError::BelowMinimumWithdrawal { minimum: 100, .. })
    ));
    assert!(matches!(
        engine.request_withdrawal("alice", 200, "crypto", "x", &ctx),
        Err(LedgerError::UnsupportedMethod { .. })
    ));
    assert!(matches!(
        engine.request_withdrawal("alice", 501, "paypal", "x", &ctx),
        Err(LedgerError::InsufficientBalance { balance: 500, requested: 501, .. })
    ));
    assert!(matches!(
        engine.request_withdrawal("ghost", 200, "paypal", "x", &ctx),
        Err(LedgerError::AccountNotFound { .. })
    ));
    assert_eq!(engine.get_balance("alice").unwrap(), 500);
    assert!(engine.store.pending_withdrawals().unwrap().is_empty());
}

/// Held funds cannot be requested a second time.
#[test]
fn held_funds_are_not_spendable() {
    let mut engine = funded(500);
    let ctx = ActionContext::default();
    engine
        .request_withdrawal("alice", 300, "paypal", "x", &ctx)
        .unwrap();
    assert!(matches!(
        engine.request_withdrawal("alice", 300, "paypal", "x", &ctx),
        Err(LedgerError::InsufficientBalance { balance: 200, .. })
    ));
    let pending = engine.store.pending_withdrawals().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(engine.store.withdrawals_for_account("alice").unwrap().len(), 1);
}

/// The returned withdrawal is exactly what a later read sees, timestamps
/// included.
#[test]
fn returned_withdrawal_matches_stored_row() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.db");
    let mut engine = RewardsEngine::open(path.to_str().unwrap(), LedgerConfig::default_test()).unwrap();
    engine.open_account("alice", None).unwrap();
    engine.adjust_balance("alice", 500, "seed").unwrap();

    let w = engine
        .request_withdrawal("alice", 300, "paypal", "alice@example.com", &ActionContext::default())
        .unwrap();
    let stored = engine.store.withdrawal(&w.withdrawal_id).unwrap().unwrap();
    assert_eq!(stored, w);
    assert_eq!(w.requested_at.timestamp_subsec_nanos() % 1_000_000, 0);
}

/// Unknown withdrawals are reported as such.
#[test]
fn unknown_withdrawal_is_not_found() {
    let mut engine = funded(500);
    assert!(matches!(
        engine.approve_withdrawal("nope", None),
        Err(LedgerError::WithdrawalNotFound { .. })
    ));
    assert!(matches!(
        engine.reject_withdrawal("nope", "x"),
        Err(LedgerError::WithdrawalNotFound { .. })
    ));
}

/// Two concurrent 300 requests against a 500 balance: exactly one wins.
#[test]
fn concurrent_requests_cannot_overdraw() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.db");
    let path = path.to_str().unwrap().to_string();

    let mut setup = RewardsEngine::open(&path, LedgerConfig::default_test()).unwrap();
    setup.open_account("alice", None).unwrap();
    setup.adjust_balance("alice", 500, "seed").unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = (0..2)
        .map(|i| {
            let store = setup.store.reopen().unwrap();
            let mut engine = RewardsEngine::build(store, LedgerConfig::default_test());
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                engine.request_withdrawal(
                    "alice",
                    300,
                    "paypal",
                    &format!("alice+{i}@example.com"),
                    &ActionContext::default(),
                )
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let ok = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(ok, 1, "{results:?}");
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(LedgerError::InsufficientBalance { .. }))));

    assert_eq!(setup.get_balance("alice").unwrap(), 200);
    assert!(setup.validate_balance("alice").unwrap().consistent);
}
