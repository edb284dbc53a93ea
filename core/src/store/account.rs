use super::{Account, LedgerStore, LedgerTx};
use crate::{
    clock::{from_millis, to_millis},
    error::{LedgerError, LedgerResult},
    types::{AccountStatus, Amount},
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

impl LedgerStore {
    // ── Account ───────────────────────────────────────────────────

    /// Create an account with a zero balance.
    /// The referrer must already exist and must not be the account itself.
    pub fn open_account(
        &self,
        account_id: &str,
        referrer_id: Option<&str>,
        at: DateTime<Utc>,
    ) -> LedgerResult<Account> {
        if fetch_account(&self.conn, account_id)?.is_some() {
            return Err(LedgerError::AccountExists {
                account_id: account_id.to_string(),
            });
        }
        if let Some(referrer) = referrer_id {
            let invalid = referrer == account_id || fetch_account(&self.conn, referrer)?.is_none();
            if invalid {
                return Err(LedgerError::InvalidReferrer {
                    account_id: account_id.to_string(),
                    referrer_id: referrer.to_string(),
                });
            }
        }
        self.conn.execute(
            "INSERT INTO accounts (account_id, balance, lifetime_earned, status, referrer_id, created_at)
             VALUES (?1, 0, 0, 'active', ?2, ?3)",
            params![account_id, referrer_id, to_millis(at)],
        )?;
        self.require_account(account_id)
    }

    pub fn account(&self, account_id: &str) -> LedgerResult<Option<Account>> {
        fetch_account(&self.conn, account_id)
    }

    pub fn require_account(&self, account_id: &str) -> LedgerResult<Account> {
        self.account(account_id)?
            .ok_or_else(|| LedgerError::AccountNotFound {
                account_id: account_id.to_string(),
            })
    }

    /// The stored balance snapshot.
    pub fn get_balance(&self, account_id: &str) -> LedgerResult<Amount> {
        Ok(self.require_account(account_id)?.balance)
    }

    pub fn set_account_status(&self, account_id: &str, status: AccountStatus) -> LedgerResult<()> {
        let changed = self.conn.execute(
            "UPDATE accounts SET status = ?1 WHERE account_id = ?2",
            params![status, account_id],
        )?;
        if changed == 0 {
            return Err(LedgerError::AccountNotFound {
                account_id: account_id.to_string(),
            });
        }
        Ok(())
    }

    pub fn account_ids(&self) -> LedgerResult<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT account_id FROM accounts ORDER BY account_id ASC")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }
}

impl LedgerTx<'_> {
    /// Read the account row under the transaction's write lock.
    pub fn account(&self, account_id: &str) -> LedgerResult<Account> {
        fetch_account(&self.tx, account_id)?.ok_or_else(|| LedgerError::AccountNotFound {
            account_id: account_id.to_string(),
        })
    }
}

pub(super) fn fetch_account(conn: &Connection, account_id: &str) -> LedgerResult<Option<Account>> {
    let account = conn
        .query_row(
            "SELECT account_id, balance, lifetime_earned, status, referrer_id, created_at
             FROM accounts WHERE account_id = ?1",
            params![account_id],
            |row| {
                Ok(Account {
                    account_id: row.get(0)?,
                    balance: row.get(1)?,
                    lifetime_earned: row.get(2)?,
                    status: row.get(3)?,
                    referrer_id: row.get(4)?,
                    created_at: from_millis(row.get(5)?),
                })
            },
        )
        .optional()?;
    Ok(account)
}
