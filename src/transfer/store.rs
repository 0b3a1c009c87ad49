//! Record Store Interfaces
//!
//! The coordinator only needs single-record atomic operations. Every mutation
//! goes through `conditional_update`, which applies the mutation only if the
//! record currently matches the filter and reports how many records matched
//! (0 or 1). That matched count is the compare-and-swap result.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::TransferError;
use super::state::TransactionState;
use super::types::{Account, AccountId, NewTransaction, Transaction, TransactionId};

/// State change applied to a transaction by a conditional update.
///
/// Stores always stamp `last_modified_at` with the current time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionMutation {
    pub state: TransactionState,
    pub error: Option<String>,
}

impl TransactionMutation {
    pub fn to(state: TransactionState) -> Self {
        Self { state, error: None }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn apply_to(&self, txn: &mut Transaction, now: DateTime<Utc>) {
        txn.state = self.state;
        if let Some(error) = &self.error {
            txn.error = Some(error.clone());
        }
        txn.last_modified_at = now;
    }
}

/// Extra conditions on an account update, all of which must hold.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccountFilter {
    /// Transaction id must be in the pending set
    pub pending: Option<TransactionId>,
    /// Transaction's leg must (true) or must not (false) be applied
    pub leg_applied: Option<(TransactionId, bool)>,
    /// Balance floor, inclusive
    pub min_balance: Option<i64>,
    /// Balance ceiling, inclusive
    pub max_balance: Option<i64>,
}

impl AccountFilter {
    /// Match the account by id only
    pub fn any() -> Self {
        Self::default()
    }

    pub fn pending(mut self, transaction_id: TransactionId) -> Self {
        self.pending = Some(transaction_id);
        self
    }

    pub fn leg_applied(mut self, transaction_id: TransactionId) -> Self {
        self.leg_applied = Some((transaction_id, true));
        self
    }

    pub fn leg_not_applied(mut self, transaction_id: TransactionId) -> Self {
        self.leg_applied = Some((transaction_id, false));
        self
    }

    pub fn min_balance(mut self, amount: i64) -> Self {
        self.min_balance = Some(amount);
        self
    }

    /// Room for a credit of `amount` without leaving the `i64` range
    pub fn credit_headroom(self, amount: i64) -> Self {
        self.max_balance(i64::MAX.saturating_sub(amount))
    }

    pub fn max_balance(mut self, amount: i64) -> Self {
        self.max_balance = Some(amount);
        self
    }

    pub fn matches(&self, account: &Account) -> bool {
        if let Some(id) = self.pending
            && !account.is_pending(id)
        {
            return false;
        }
        if let Some((id, applied)) = self.leg_applied
            && account.has_applied_leg(id) != applied
        {
            return false;
        }
        if let Some(floor) = self.min_balance
            && account.balance < floor
        {
            return false;
        }
        if let Some(ceiling) = self.max_balance
            && account.balance > ceiling
        {
            return false;
        }
        true
    }
}

/// Single-record account mutation.
///
/// Balance changes are increments and id-set changes are add/remove, so the
/// store never needs a read-modify-write in application memory. An increment
/// that leaves the `i64` range is an error and changes nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountMutation {
    /// Add the id to the pending set
    AddPending(TransactionId),
    /// Remove the id from the pending and applied sets
    ReleasePending(TransactionId),
    /// `balance += delta` and mark the leg applied
    ApplyLeg {
        transaction_id: TransactionId,
        delta: i64,
    },
    /// `balance -= delta` and clear the applied mark
    RevertLeg {
        transaction_id: TransactionId,
        delta: i64,
    },
}

impl AccountMutation {
    pub fn apply_to(&self, account: &mut Account) -> Result<(), TransferError> {
        match *self {
            AccountMutation::AddPending(id) => {
                account.pending_transaction_ids.insert(id);
            }
            AccountMutation::ReleasePending(id) => {
                account.pending_transaction_ids.remove(&id);
                account.applied_transaction_ids.remove(&id);
            }
            AccountMutation::ApplyLeg {
                transaction_id,
                delta,
            } => {
                account.balance = shifted(account, delta)?;
                account.applied_transaction_ids.insert(transaction_id);
            }
            AccountMutation::RevertLeg {
                transaction_id,
                delta,
            } => {
                let reverse = delta
                    .checked_neg()
                    .ok_or(TransferError::BalanceOverflow(account.id))?;
                account.balance = shifted(account, reverse)?;
                account.applied_transaction_ids.remove(&transaction_id);
            }
        }
        Ok(())
    }
}

fn shifted(account: &Account, delta: i64) -> Result<i64, TransferError> {
    account
        .balance
        .checked_add(delta)
        .ok_or(TransferError::BalanceOverflow(account.id))
}

/// Transaction record store
#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Persist a new transaction in INITIAL state
    async fn create(&self, fields: NewTransaction) -> Result<Transaction, TransferError>;

    async fn find_by_id(&self, id: TransactionId) -> Result<Option<Transaction>, TransferError>;

    /// Missing ids are skipped
    async fn find_many_by_id(
        &self,
        ids: &[TransactionId],
    ) -> Result<Vec<Transaction>, TransferError>;

    /// Apply `mutation` only if the transaction is currently in `expected`.
    ///
    /// Returns the matched count (0 or 1).
    async fn conditional_update(
        &self,
        id: TransactionId,
        expected: TransactionState,
        mutation: TransactionMutation,
    ) -> Result<u64, TransferError>;

    /// Transactions in one of `states` last modified strictly before
    /// `older_than`, oldest first, at most `limit`.
    async fn find_stale(
        &self,
        states: &[TransactionState],
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Transaction>, TransferError>;
}

/// Account record store
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn find_by_id(&self, id: AccountId) -> Result<Option<Account>, TransferError>;

    /// Missing ids are skipped
    async fn find_many_by_id(&self, ids: &[AccountId]) -> Result<Vec<Account>, TransferError>;

    /// Apply `mutation` only if the account matches `filter`.
    ///
    /// Returns the matched count (0 or 1).
    async fn conditional_update(
        &self,
        id: AccountId,
        filter: AccountFilter,
        mutation: AccountMutation,
    ) -> Result<u64, TransferError>;
}
