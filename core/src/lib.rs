//! Balance ledger and reward settlement core.
//!
//! Every balance change is one immutable ledger entry committed in the
//! same transaction as the balance snapshot it implies.

pub mod callback_auth;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod fraud_gate;
pub mod idempotency;
pub mod reconciliation;
pub mod settlement;
pub mod store;
pub mod types;
pub mod withdrawal;

pub use engine::{CallbackResponse, RewardsEngine};
pub use error::{LedgerError, LedgerResult};
