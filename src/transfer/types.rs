//! Transfer Core Types
//!
//! Records owned by the stores plus the result shapes returned by the coordinator.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::TransactionState;

/// Transaction ID type - ULID-based unique identifier
///
/// Sortable and generated without coordination, so any coordinator
/// instance can mint ids for the shared store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransactionId(ulid::Ulid);

impl TransactionId {
    /// Generate a new unique TransactionId
    pub fn new() -> Self {
        Self(ulid::Ulid::new())
    }

    /// Get the inner ULID value
    pub fn inner(&self) -> ulid::Ulid {
        self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TransactionId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(ulid::Ulid::from_string(s)?))
    }
}

/// Account identifier. Zero is reserved as "no account".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccountId(pub u64);

impl AccountId {
    #[inline]
    pub fn is_missing(&self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl From<u64> for AccountId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Balance-holding account record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    /// Committed balance in minor units
    pub balance: i64,
    /// Transactions in PENDING, APPLIED or CANCELING that reference this account
    pub pending_transaction_ids: BTreeSet<TransactionId>,
    /// Transactions whose balance delta has already been applied to this account.
    /// Always a subset of `pending_transaction_ids`.
    pub applied_transaction_ids: BTreeSet<TransactionId>,
}

impl Account {
    pub fn new(id: AccountId, balance: i64) -> Self {
        Self {
            id,
            balance,
            pending_transaction_ids: BTreeSet::new(),
            applied_transaction_ids: BTreeSet::new(),
        }
    }

    #[inline]
    pub fn is_pending(&self, transaction_id: TransactionId) -> bool {
        self.pending_transaction_ids.contains(&transaction_id)
    }

    #[inline]
    pub fn has_applied_leg(&self, transaction_id: TransactionId) -> bool {
        self.applied_transaction_ids.contains(&transaction_id)
    }
}

/// Fields for a transaction to be created in INITIAL state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewTransaction {
    pub source_account_id: AccountId,
    pub destination_account_id: AccountId,
    pub amount: i64,
}

impl NewTransaction {
    pub fn new(source: AccountId, destination: AccountId, amount: i64) -> Self {
        Self {
            source_account_id: source,
            destination_account_id: destination,
            amount,
        }
    }

    /// Materialize the record a store persists on `create`.
    pub fn into_transaction(self, id: TransactionId, now: DateTime<Utc>) -> Transaction {
        Transaction {
            id,
            source_account_id: self.source_account_id,
            destination_account_id: self.destination_account_id,
            amount: self.amount,
            state: TransactionState::Initial,
            error: None,
            created_at: now,
            last_modified_at: now,
        }
    }
}

/// Transfer attempt record. Never deleted; terminal records are immutable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub source_account_id: AccountId,
    pub destination_account_id: AccountId,
    pub amount: i64,
    pub state: TransactionState,
    /// Failure that triggered compensation, if any
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_modified_at: DateTime<Utc>,
}

impl Transaction {
    /// Signed balance change this transaction applies to `account`.
    ///
    /// Returns `None` if the account is not a party to the transaction.
    pub fn leg_delta(&self, account: AccountId) -> Option<i64> {
        if account == self.source_account_id {
            Some(-self.amount)
        } else if account == self.destination_account_id {
            Some(self.amount)
        } else {
            None
        }
    }

    #[inline]
    pub fn involves(&self, account: AccountId) -> bool {
        self.leg_delta(account).is_some()
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Transaction[{}] {} -> {} amount={} state={}",
            self.id, self.source_account_id, self.destination_account_id, self.amount, self.state
        )
    }
}

/// Result of `execute_transfer` / `execute_existing_transaction`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOutcome {
    pub success: bool,
    pub transaction_id: TransactionId,
    pub message: String,
}

/// Advisory balance view combining committed and in-flight amounts.
///
/// Built from independent reads without locking, so a concurrent transfer
/// on the same account can yield a torn view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountBalance {
    pub account_id: AccountId,
    pub balance: i64,
    pub pending_debit: i64,
    pub pending_credit: i64,
    pub available_balance: i64,
    pub projected_balance: i64,
}

/// Per-transaction result of a recovery sweep
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryDetail {
    pub transaction_id: TransactionId,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Summary of a recovery sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub recovered: usize,
    pub failed: usize,
    pub details: Vec<RecoveryDetail>,
}

impl RecoveryReport {
    pub fn record_success(&mut self, transaction_id: TransactionId) {
        self.recovered += 1;
        self.details.push(RecoveryDetail {
            transaction_id,
            success: true,
            error: None,
        });
    }

    pub fn record_failure(&mut self, transaction_id: TransactionId, error: String) {
        self.failed += 1;
        self.details.push(RecoveryDetail {
            transaction_id,
            success: false,
            error: Some(error),
        });
    }
}
