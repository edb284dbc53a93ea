//! ledger-admin: operator tool for the rewards ledger.
//!
//! Usage:
//!   ledger-admin --db ledger.db init
//!   ledger-admin --db ledger.db open-account alice [referrer]
//!   ledger-admin --db ledger.db balance alice
//!   ledger-admin --db ledger.db history alice --limit 20
//!   ledger-admin --db ledger.db audit [alice]
//!   ledger-admin --db ledger.db resolve <finding_id> <note>
//!   ledger-admin --db ledger.db pending
//!   ledger-admin --db ledger.db approve <withdrawal_id> [note]
//!   ledger-admin --db ledger.db reject <withdrawal_id> <reason>
//!   ledger-admin --db ledger.db adjust alice -250 "chargeback"
//!
//! Every command prints JSON on stdout.

use anyhow::{bail, Context, Result};
use rewards_ledger_core::{config::LedgerConfig, store::HistoryFilter, RewardsEngine};
use serde::Serialize;
use std::env;

/// Flags that take a value; everything else is positional.
const VALUE_FLAGS: [&str; 3] = ["--db", "--config", "--limit"];

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().skip(1).collect();
    let db = flag_value(&args, "--db").unwrap_or("ledger.db");
    let config = match flag_value(&args, "--config") {
        Some(path) => LedgerConfig::load(path)?,
        None => LedgerConfig::default(),
    };
    let limit = parse_arg(&args, "--limit", 50u32);
    let positional = positional_args(&args);

    let Some((command, rest)) = positional.split_first() else {
        bail!("missing command (init, open-account, balance, history, audit, resolve, pending, approve, reject, adjust)");
    };

    let mut engine = RewardsEngine::open(db, config)
        .with_context(|| format!("Cannot open ledger at {db}"))?;
    log::debug!("ledger-admin: {command} on {db}");

    match (command.as_str(), rest) {
        ("init", []) => print_json(&serde_json::json!({ "db": db, "migrated": true })),
        ("open-account", [account_id]) => print_json(&engine.open_account(account_id, None)?),
        ("open-account", [account_id, referrer]) => {
            print_json(&engine.open_account(account_id, Some(referrer.as_str()))?)
        }
        ("balance", [account_id]) => {
            let account = engine.store.require_account(account_id)?;
            print_json(&account)
        }
        ("history", [account_id]) => {
            let filter = HistoryFilter {
                limit: Some(limit),
                ..HistoryFilter::default()
            };
            print_json(&engine.get_transaction_history(account_id, &filter)?)
        }
        ("audit", []) => print_json(&engine.audit_all()?),
        ("audit", [account_id]) => print_json(&engine.validate_balance(account_id)?),
        ("resolve", [finding_id, note]) => print_json(&engine.resolve_finding(finding_id, note)?),
        ("pending", []) => print_json(&engine.store.pending_withdrawals()?),
        ("approve", [withdrawal_id]) => print_json(&engine.approve_withdrawal(withdrawal_id, None)?),
        ("approve", [withdrawal_id, note]) => {
            print_json(&engine.approve_withdrawal(withdrawal_id, Some(note.as_str()))?)
        }
        ("reject", [withdrawal_id, reason]) => {
            print_json(&engine.reject_withdrawal(withdrawal_id, reason)?)
        }
        ("adjust", [account_id, amount, reason]) => {
            let amount: i64 = amount
                .parse()
                .with_context(|| format!("amount '{amount}' is not an integer in minor units"))?;
            print_json(&engine.adjust_balance(account_id, amount, reason)?)
        }
        (other, rest) => bail!("unknown command or wrong arguments: {other} {}", rest.join(" ")),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.windows(2)
        .find(|w| w[0] == flag)
        .map(|w| w[1].as_str())
}

fn parse_arg<T: std::str::FromStr>(args: &[String], flag: &str, default: T) -> T {
    flag_value(args, flag)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn positional_args(args: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if VALUE_FLAGS.contains(&arg.as_str()) {
            iter.next();
        } else {
            out.push(arg.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(s: &[&str]) -> Vec<String> {
        s.iter().map(|a| a.to_string()).collect()
    }

    #[test]
    fn value_flags_are_not_positional() {
        let a = args(&["--db", "x.db", "adjust", "alice", "-250", "fix", "--limit", "5"]);
        assert_eq!(positional_args(&a), args(&["adjust", "alice", "-250", "fix"]));
        assert_eq!(flag_value(&a, "--db"), Some("x.db"));
        assert_eq!(parse_arg(&a, "--limit", 50u32), 5);
    }
}
