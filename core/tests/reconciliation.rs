//! Reconciliation: recompute from the ledger, record drift, resolve explicitly.

use rewards_ledger_core::{
    config::LedgerConfig,
    engine::RewardsEngine,
    error::LedgerError,
    fraud_gate::ActionContext,
    settlement::SettlementRequest,
    types::EntryKind,
};

fn tamper(path: &str, account_id: &str, balance: i64) {
    let raw = rusqlite::Connection::open(path).unwrap();
    raw.execute(
        "UPDATE accounts SET balance = ?1 WHERE account_id = ?2",
        rusqlite::params![balance, account_id],
    )
    .unwrap();
}

/// Healthy accounts report consistent with zero difference.
#[test]
fn consistent_accounts_produce_no_findings() {
    let mut engine = RewardsEngine::build_test().unwrap();
    engine.open_account("alice", None).unwrap();
    engine.open_account("bob", Some("alice")).unwrap();
    engine
        .settle(
            SettlementRequest::new("bob", 400, EntryKind::OfferCompletion).with_key("cpx:1"),
            &ActionContext::default(),
        )
        .unwrap();

    let report = engine.validate_balance("bob").unwrap();
    assert!(report.consistent);
    assert_eq!(report.stored, 400);
    assert_eq!(report.difference, 0);

    let summary = engine.audit_all().unwrap();
    assert_eq!(summary.accounts_checked, 2);
    assert!(summary.inconsistent.is_empty());
    assert!(engine.store.open_findings().unwrap().is_empty());
}

/// A snapshot edited behind the ledger's back is reported, not fixed.
#[test]
fn tampered_balance_is_detected_and_recorded_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.db");
    let path = path.to_str().unwrap();

    let mut engine = RewardsEngine::open(path, LedgerConfig::default_test()).unwrap();
    engine.open_account("alice", None).unwrap();
    engine.adjust_balance("alice", 1_000, "seed").unwrap();
    tamper(path, "alice", 1_300);

    let report = engine.validate_balance("alice").unwrap();
    assert!(!report.consistent);
    assert_eq!(report.stored, 1_300);
    assert_eq!(report.recomputed, 1_000);
    assert_eq!(report.difference, 300);

    let summary = engine.audit_all().unwrap();
    assert_eq!(summary.inconsistent, vec![report.clone()]);
    assert_eq!(summary.findings_recorded.len(), 1);

    let again = engine.audit_all().unwrap();
    assert_eq!(again.inconsistent.len(), 1);
    assert!(again.findings_recorded.is_empty(), "open finding is not duplicated");

    assert_eq!(engine.get_balance("alice").unwrap(), 1_300, "audit never corrects");
    assert_eq!(engine.store.entry_count("alice").unwrap(), 1);
    assert_eq!(
        engine.store.events_of_type("audit_finding_recorded").unwrap().len(),
        1
    );
}

/// Resolving appends a balance_audit entry so the ledger matches the snapshot.
#[test]
fn resolving_a_finding_brings_the_ledger_in_line() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.db");
    let path = path.to_str().unwrap();

    let mut engine = RewardsEngine::open(path, LedgerConfig::default_test()).unwrap();
    engine.open_account("alice", None).unwrap();
    engine.adjust_balance("alice", 1_000, "seed").unwrap();
    tamper(path, "alice", 700);

    let summary = engine.audit_all().unwrap();
    let finding_id = summary.findings_recorded[0].clone();

    let resolution = engine.resolve_finding(&finding_id, "manual correction").unwrap();
    let entry = resolution.entry.unwrap();
    assert_eq!(entry.kind, EntryKind::BalanceAudit);
    assert_eq!(entry.amount, -300);
    assert_eq!(entry.external_key, Some(format!("audit:{finding_id}")));
    assert_eq!(resolution.finding.status, "resolved");
    assert_eq!(resolution.finding.resolution_entry_id, Some(entry.entry_id.clone()));

    assert_eq!(engine.get_balance("alice").unwrap(), 700);
    assert!(engine.validate_balance("alice").unwrap().consistent);
    assert!(engine.store.open_findings().unwrap().is_empty());

    assert!(matches!(
        engine.resolve_finding(&finding_id, "again"),
        Err(LedgerError::FindingNotFound { .. })
    ));
}

/// A finding whose drift has since disappeared closes without an entry.
#[test]
fn self_healed_finding_closes_without_entry() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.db");
    let path = path.to_str().unwrap();

    let mut engine = RewardsEngine::open(path, LedgerConfig::default_test()).unwrap();
    engine.open_account("alice", None).unwrap();
    engine.adjust_balance("alice", 500, "seed").unwrap();
    tamper(path, "alice", 900);
    let finding_id = engine.audit_all().unwrap().findings_recorded[0].clone();
    tamper(path, "alice", 500);

    let resolution = engine.resolve_finding(&finding_id, "restored from backup").unwrap();
    assert!(resolution.entry.is_none());
    assert_eq!(resolution.finding.status, "resolved");
    assert_eq!(engine.store.entry_count("alice").unwrap(), 1);
}

/// Unknown finding ids are reported.
#[test]
fn unknown_finding_is_not_found() {
    let mut engine = RewardsEngine::build_test().unwrap();
    assert!(matches!(
        engine.resolve_finding("missing", "x"),
        Err(LedgerError::FindingNotFound { .. })
    ));
}
