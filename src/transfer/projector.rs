//! Balance Projection
//!
//! Combines an account's committed balance with the amounts of its in-flight
//! transactions. The account and its transactions are read separately with no
//! locking, so the result is a point-in-time advisory view: a transfer that
//! moves between the two reads can be counted in the balance and the pending
//! amounts at once, or in neither. Sums saturate at the `i64` bounds.
//!
//! Ids of settled transactions still sitting in the pending set are released
//! on the way out.

use tracing::{debug, warn};

use super::coordinator::TransferCoordinator;
use super::error::TransferError;
use super::store::{AccountStore, TransactionStore};
use super::types::{Account, AccountBalance, AccountId, Transaction, TransactionId};

/// Project `account` over `transactions`.
///
/// Only transactions that are in flight and reference the account through its
/// pending set are counted; anything else in `transactions` is ignored.
pub fn project_balance(account: &Account, transactions: &[Transaction]) -> AccountBalance {
    let mut pending_debit = 0i64;
    let mut pending_credit = 0i64;

    for txn in transactions
        .iter()
        .filter(|t| t.state.is_in_flight() && account.is_pending(t.id))
    {
        if txn.source_account_id == account.id {
            pending_debit = pending_debit.saturating_add(txn.amount);
        } else if txn.destination_account_id == account.id {
            pending_credit = pending_credit.saturating_add(txn.amount);
        }
    }

    let available_balance = account.balance.saturating_sub(pending_debit);
    AccountBalance {
        account_id: account.id,
        balance: account.balance,
        pending_debit,
        pending_credit,
        available_balance,
        projected_balance: available_balance.saturating_add(pending_credit),
    }
}

impl TransferCoordinator {
    /// Advisory balance for `account_id`. Not transactional, see module docs.
    pub async fn get_account_balance(
        &self,
        account_id: AccountId,
    ) -> Result<AccountBalance, TransferError> {
        let account = self
            .call("accounts.find_by_id", self.accounts().find_by_id(account_id))
            .await?
            .ok_or_else(|| TransferError::NotFound(format!("account {}", account_id)))?;

        let ids: Vec<TransactionId> = account.pending_transaction_ids.iter().copied().collect();
        let transactions = self
            .call(
                "transactions.find_many_by_id",
                self.transactions().find_many_by_id(&ids),
            )
            .await?;

        let balance = project_balance(&account, &transactions);

        if transactions.iter().any(|t| t.state.is_terminal())
            && let Err(e) = self.release_settled(&account, &transactions).await
        {
            warn!(account = %account_id, error = %e, "Failed to release settled ids");
        }
        debug!(
            account = %account_id,
            balance = balance.balance,
            available = balance.available_balance,
            projected = balance.projected_balance,
            "Balance projected"
        );
        Ok(balance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::state::TransactionState;
    use crate::transfer::types::NewTransaction;
    use chrono::Utc;

    fn txn(source: u64, destination: u64, amount: i64, state: TransactionState) -> Transaction {
        let mut t = NewTransaction::new(AccountId(source), AccountId(destination), amount)
            .into_transaction(TransactionId::new(), Utc::now());
        t.state = state;
        t
    }

    #[test]
    fn test_pending_out_applied_in() {
        let outgoing = txn(1, 2, 200, TransactionState::Pending);
        let incoming = txn(3, 1, 150, TransactionState::Applied);

        let mut account = Account::new(AccountId(1), 1000);
        account.pending_transaction_ids.insert(outgoing.id);
        account.pending_transaction_ids.insert(incoming.id);

        let balance = project_balance(&account, &[outgoing, incoming]);
        assert_eq!(balance.pending_debit, 200);
        assert_eq!(balance.pending_credit, 150);
        assert_eq!(balance.available_balance, 800);
        assert_eq!(balance.projected_balance, 950);
    }

    #[test]
    fn test_ignores_settled_and_unreferenced() {
        let canceling = txn(1, 2, 50, TransactionState::Canceling);
        let done = txn(1, 2, 70, TransactionState::Done);
        let foreign = txn(1, 2, 90, TransactionState::Pending);

        let mut account = Account::new(AccountId(1), 500);
        account.pending_transaction_ids.insert(canceling.id);
        account.pending_transaction_ids.insert(done.id);

        let balance = project_balance(&account, &[canceling, done, foreign]);
        assert_eq!(balance.pending_debit, 0);
        assert_eq!(balance.available_balance, 500);
        assert_eq!(balance.projected_balance, 500);
    }

    #[test]
    fn test_sums_saturate() {
        let big_out = txn(1, 2, i64::MAX, TransactionState::Pending);
        let more_out = txn(1, 3, 10, TransactionState::Applied);
        let big_in = txn(4, 1, i64::MAX, TransactionState::Pending);

        let mut account = Account::new(AccountId(1), -5);
        for t in [&big_out, &more_out, &big_in] {
            account.pending_transaction_ids.insert(t.id);
        }

        let balance = project_balance(&account, &[big_out, more_out, big_in]);
        assert_eq!(balance.pending_debit, i64::MAX);
        assert_eq!(balance.pending_credit, i64::MAX);
        assert_eq!(balance.available_balance, i64::MIN);
        assert_eq!(balance.projected_balance, -1);
    }

    #[test]
    fn test_idle_account() {
        let balance = project_balance(&Account::new(AccountId(4), 42), &[]);
        assert_eq!(balance.account_id, AccountId(4));
        assert_eq!(balance.available_balance, 42);
        assert_eq!(balance.projected_balance, 42);
    }
}
