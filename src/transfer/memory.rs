//! In-memory record store
//!
//! Backs both store traits with `DashMap`. A conditional update holds the
//! record's shard lock for the whole filter-and-mutate step, which gives the
//! same single-record atomicity the coordinator relies on from a database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::error::TransferError;
use super::state::TransactionState;
use super::store::{
    AccountFilter, AccountMutation, AccountStore, TransactionMutation, TransactionStore,
};
use super::types::{Account, AccountId, NewTransaction, Transaction, TransactionId};

#[derive(Default)]
pub struct InMemoryStore {
    accounts: DashMap<AccountId, Account>,
    transactions: DashMap<TransactionId, Transaction>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an account. Replaces any existing record with the same id.
    pub fn insert_account(&self, account: Account) {
        self.accounts.insert(account.id, account);
    }

    /// Seed a transaction as-is, bypassing the INITIAL state of `create`.
    pub fn insert_transaction(&self, txn: Transaction) {
        self.transactions.insert(txn.id, txn);
    }

    /// Overwrite `last_modified_at`. Returns false if the transaction is absent.
    pub fn set_last_modified(&self, id: TransactionId, at: DateTime<Utc>) -> bool {
        match self.transactions.get_mut(&id) {
            Some(mut txn) => {
                txn.last_modified_at = at;
                true
            }
            None => false,
        }
    }

    pub fn account(&self, id: AccountId) -> Option<Account> {
        self.accounts.get(&id).map(|a| a.clone())
    }

    pub fn transaction(&self, id: TransactionId) -> Option<Transaction> {
        self.transactions.get(&id).map(|t| t.clone())
    }
}

#[async_trait]
impl TransactionStore for InMemoryStore {
    async fn create(&self, fields: NewTransaction) -> Result<Transaction, TransferError> {
        let txn = fields.into_transaction(TransactionId::new(), Utc::now());
        self.transactions.insert(txn.id, txn.clone());
        Ok(txn)
    }

    async fn find_by_id(&self, id: TransactionId) -> Result<Option<Transaction>, TransferError> {
        Ok(self.transaction(id))
    }

    async fn find_many_by_id(
        &self,
        ids: &[TransactionId],
    ) -> Result<Vec<Transaction>, TransferError> {
        Ok(ids.iter().filter_map(|id| self.transaction(*id)).collect())
    }

    async fn conditional_update(
        &self,
        id: TransactionId,
        expected: TransactionState,
        mutation: TransactionMutation,
    ) -> Result<u64, TransferError> {
        let Some(mut txn) = self.transactions.get_mut(&id) else {
            return Ok(0);
        };
        if txn.state != expected {
            return Ok(0);
        }
        mutation.apply_to(&mut txn, Utc::now());
        Ok(1)
    }

    async fn find_stale(
        &self,
        states: &[TransactionState],
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Transaction>, TransferError> {
        let mut stale: Vec<Transaction> = self
            .transactions
            .iter()
            .filter(|t| states.contains(&t.state) && t.last_modified_at < older_than)
            .map(|t| t.clone())
            .collect();
        stale.sort_by_key(|t| t.last_modified_at);
        stale.truncate(limit);
        Ok(stale)
    }
}

#[async_trait]
impl AccountStore for InMemoryStore {
    async fn find_by_id(&self, id: AccountId) -> Result<Option<Account>, TransferError> {
        Ok(self.account(id))
    }

    async fn find_many_by_id(&self, ids: &[AccountId]) -> Result<Vec<Account>, TransferError> {
        Ok(ids.iter().filter_map(|id| self.account(*id)).collect())
    }

    async fn conditional_update(
        &self,
        id: AccountId,
        filter: AccountFilter,
        mutation: AccountMutation,
    ) -> Result<u64, TransferError> {
        let Some(mut account) = self.accounts.get_mut(&id) else {
            return Ok(0);
        };
        if !filter.matches(&account) {
            return Ok(0);
        }
        mutation.apply_to(&mut account)?;
        Ok(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_transaction_cas() {
        let store = InMemoryStore::new();
        let txn = TransactionStore::create(
            &store,
            NewTransaction::new(AccountId(1), AccountId(2), 100),
        )
        .await
        .unwrap();

        let matched = TransactionStore::conditional_update(
            &store,
            txn.id,
            TransactionState::Initial,
            TransactionMutation::to(TransactionState::Pending),
        )
        .await
        .unwrap();
        assert_eq!(matched, 1);

        // Second CAS from the same expected state loses
        let matched = TransactionStore::conditional_update(
            &store,
            txn.id,
            TransactionState::Initial,
            TransactionMutation::to(TransactionState::Pending),
        )
        .await
        .unwrap();
        assert_eq!(matched, 0);
        assert_eq!(
            store.transaction(txn.id).unwrap().state,
            TransactionState::Pending
        );
    }

    #[tokio::test]
    async fn test_update_missing_records_matches_nothing() {
        let store = InMemoryStore::new();
        let matched = AccountStore::conditional_update(
            &store,
            AccountId(42),
            AccountFilter::any(),
            AccountMutation::AddPending(TransactionId::new()),
        )
        .await
        .unwrap();
        assert_eq!(matched, 0);

        let matched = TransactionStore::conditional_update(
            &store,
            TransactionId::new(),
            TransactionState::Initial,
            TransactionMutation::to(TransactionState::Pending),
        )
        .await
        .unwrap();
        assert_eq!(matched, 0);
    }

    #[tokio::test]
    async fn test_find_stale_filters_state_and_age() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let mut ids = Vec::new();

        for state in [
            TransactionState::Initial,
            TransactionState::Pending,
            TransactionState::Applied,
            TransactionState::Done,
        ] {
            let mut txn = NewTransaction::new(AccountId(1), AccountId(2), 10)
                .into_transaction(TransactionId::new(), now - Duration::minutes(10));
            txn.state = state;
            ids.push(txn.id);
            store.insert_transaction(txn);
        }

        // Fresh pending record must not be returned
        let mut fresh = NewTransaction::new(AccountId(1), AccountId(2), 10)
            .into_transaction(TransactionId::new(), now);
        fresh.state = TransactionState::Pending;
        store.insert_transaction(fresh);

        let stale = store
            .find_stale(
                &[TransactionState::Pending, TransactionState::Applied],
                now - Duration::minutes(1),
                100,
            )
            .await
            .unwrap();

        let found: Vec<_> = stale.iter().map(|t| t.id).collect();
        assert_eq!(found.len(), 2);
        assert!(found.contains(&ids[1]));
        assert!(found.contains(&ids[2]));

        let limited = store
            .find_stale(
                &[TransactionState::Pending, TransactionState::Applied],
                now - Duration::minutes(1),
                1,
            )
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }
}
