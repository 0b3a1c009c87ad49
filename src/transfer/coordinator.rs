//! Transfer Coordinator
//!
//! Drives a transaction through Reserve → Apply → Finalize, or Cancel.
//!
//! The only synchronization primitive is the store's single-record
//! conditional update. Each phase starts with a CAS on the state it expects,
//! so two drivers racing on the same transaction cannot both win a phase:
//! the loser sees zero matched records and gets `StateConflict`.
//!
//! Account balances move in "legs". A leg is applied with one atomic update
//! that changes the balance and records the transaction id in the account's
//! applied set. Cancel reverses exactly the legs whose marker is present, so
//! compensation is correct even when a crash left the transaction `PENDING`
//! after the source was already debited.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::error::TransferError;
use super::state::TransactionState;
use super::store::{
    AccountFilter, AccountMutation, AccountStore, TransactionMutation, TransactionStore,
};
use super::types::{AccountId, NewTransaction, Transaction, TransactionId, TransferOutcome};

/// A racing Apply can land at most one leg per account, so two rounds of
/// revert-then-release always converge; the third is slack.
const MAX_COMPENSATION_ROUNDS: usize = 3;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Deadline applied to every individual store call
    pub store_call_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            store_call_timeout: Duration::from_secs(5),
        }
    }
}

/// Transfer Coordinator - sole writer of transaction state and account balances
pub struct TransferCoordinator {
    transactions: Arc<dyn TransactionStore>,
    accounts: Arc<dyn AccountStore>,
    config: CoordinatorConfig,
}

impl TransferCoordinator {
    pub fn new(transactions: Arc<dyn TransactionStore>, accounts: Arc<dyn AccountStore>) -> Self {
        Self::with_config(transactions, accounts, CoordinatorConfig::default())
    }

    pub fn with_config(
        transactions: Arc<dyn TransactionStore>,
        accounts: Arc<dyn AccountStore>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            transactions,
            accounts,
            config,
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub(crate) fn transactions(&self) -> &Arc<dyn TransactionStore> {
        &self.transactions
    }

    pub(crate) fn accounts(&self) -> &Arc<dyn AccountStore> {
        &self.accounts
    }

    /// Run a store call under the per-call deadline.
    pub(crate) async fn call<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = Result<T, TransferError>>,
    ) -> Result<T, TransferError> {
        match tokio::time::timeout(self.config.store_call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    op,
                    timeout_ms = self.config.store_call_timeout.as_millis() as u64,
                    "Store call timed out"
                );
                Err(TransferError::Timeout(op))
            }
        }
    }

    // ========================================================================
    // Public operations
    // ========================================================================

    /// Check transfer parameters before anything is written.
    pub fn validate(
        source: AccountId,
        destination: AccountId,
        amount: i64,
    ) -> Result<(), TransferError> {
        if source.is_missing() || destination.is_missing() {
            return Err(TransferError::Validation(
                "source and destination account ids are required".to_string(),
            ));
        }
        if source == destination {
            return Err(TransferError::Validation(
                "source and destination accounts must differ".to_string(),
            ));
        }
        if amount <= 0 {
            return Err(TransferError::Validation(format!(
                "amount must be positive, got {}",
                amount
            )));
        }
        Ok(())
    }

    /// Validate and record a transaction in INITIAL state without running it.
    pub async fn create_transaction(
        &self,
        source: AccountId,
        destination: AccountId,
        amount: i64,
    ) -> Result<Transaction, TransferError> {
        Self::validate(source, destination, amount)?;

        let txn = self
            .call(
                "transactions.create",
                self.transactions
                    .create(NewTransaction::new(source, destination, amount)),
            )
            .await?;

        info!(
            transaction_id = %txn.id,
            source = %source,
            destination = %destination,
            amount,
            "Transaction created"
        );
        Ok(txn)
    }

    /// Move `amount` from `source` to `destination`.
    ///
    /// Validation errors are returned before any record exists. Every later
    /// failure is returned as `TransferFailed` after compensation has run.
    pub async fn execute_transfer(
        &self,
        source: AccountId,
        destination: AccountId,
        amount: i64,
    ) -> Result<TransferOutcome, TransferError> {
        let txn = self.create_transaction(source, destination, amount).await?;
        self.run_pipeline(txn.id, txn.state).await
    }

    /// Drive a transaction created out-of-band, resuming from its recorded state.
    pub async fn execute_existing_transaction(
        &self,
        id: TransactionId,
    ) -> Result<TransferOutcome, TransferError> {
        let txn = self.get_transaction(id).await?;

        match txn.state {
            TransactionState::Initial | TransactionState::Pending | TransactionState::Applied => {
                self.run_pipeline(id, txn.state).await
            }
            TransactionState::Canceling | TransactionState::Done | TransactionState::Canceled => {
                Err(TransferError::failed(
                    id,
                    TransferError::conflict(id, format!("cannot execute from {}", txn.state)),
                ))
            }
        }
    }

    /// Get full transaction record
    pub async fn get_transaction(&self, id: TransactionId) -> Result<Transaction, TransferError> {
        self.call("transactions.find_by_id", self.transactions.find_by_id(id))
            .await?
            .ok_or_else(|| TransferError::NotFound(format!("transaction {}", id)))
    }

    // ========================================================================
    // Pipeline
    // ========================================================================

    async fn run_pipeline(
        &self,
        id: TransactionId,
        from: TransactionState,
    ) -> Result<TransferOutcome, TransferError> {
        match self.drive_forward(id, from).await {
            Ok(()) => {
                info!(transaction_id = %id, "Transfer completed");
                Ok(TransferOutcome {
                    success: true,
                    transaction_id: id,
                    message: "Transfer completed".to_string(),
                })
            }
            Err(e @ TransferError::StateConflict { .. }) => {
                // Another driver moved the transaction; it owns completion or compensation.
                warn!(transaction_id = %id, error = %e, "Transfer lost race, not compensating");
                Err(TransferError::failed(id, e))
            }
            Err(e) => {
                warn!(transaction_id = %id, error = %e, "Transfer failed, compensating");
                if let Err(rollback) = self.cancel_with_reason(id, Some(e.to_string())).await {
                    let failure = TransferError::RollbackFailure(rollback.to_string());
                    error!(
                        transaction_id = %id,
                        original = %e,
                        error = %failure,
                        "Compensation failed, left for recovery sweep"
                    );
                }
                Err(TransferError::failed(id, e))
            }
        }
    }

    /// Phases run strictly in order; each awaits its predecessor's writes.
    async fn drive_forward(
        &self,
        id: TransactionId,
        from: TransactionState,
    ) -> Result<(), TransferError> {
        if from == TransactionState::Initial {
            self.reserve(id).await?;
        }
        if matches!(from, TransactionState::Initial | TransactionState::Pending) {
            self.apply(id).await?;
        }
        self.finalize(id).await
    }

    // ========================================================================
    // Phases
    // ========================================================================

    /// INITIAL → PENDING, then add the id to both pending sets.
    pub async fn reserve(&self, id: TransactionId) -> Result<(), TransferError> {
        let txn = self.get_transaction(id).await?;
        require_state(&txn, TransactionState::Initial)?;

        if !self
            .cas_state(
                id,
                TransactionState::Initial,
                TransactionMutation::to(TransactionState::Pending),
            )
            .await?
        {
            return Err(TransferError::conflict(id, "reserve lost race on INITIAL"));
        }

        // Set add is monotone, so repeating it is harmless.
        for account in [txn.source_account_id, txn.destination_account_id] {
            if !self
                .update_account(account, AccountFilter::any(), AccountMutation::AddPending(id))
                .await?
            {
                return Err(TransferError::NotFound(format!("account {}", account)));
            }
        }

        debug!(transaction_id = %id, "Reserved");
        Ok(())
    }

    /// PENDING → APPLIED: debit source, credit destination, then flip state.
    pub async fn apply(&self, id: TransactionId) -> Result<(), TransferError> {
        let txn = self.get_transaction(id).await?;
        require_state(&txn, TransactionState::Pending)?;

        // Debit must be confirmed before the credit is attempted.
        self.apply_leg(&txn, txn.source_account_id).await?;
        self.apply_leg(&txn, txn.destination_account_id).await?;

        if !self
            .cas_state(
                id,
                TransactionState::Pending,
                TransactionMutation::to(TransactionState::Applied),
            )
            .await?
        {
            return Err(TransferError::conflict(id, "apply lost race on PENDING"));
        }

        debug!(transaction_id = %id, amount = txn.amount, "Applied");
        Ok(())
    }

    /// APPLIED → DONE, then release both pending sets.
    ///
    /// The state flips first: once DONE the transfer is committed. A failed
    /// release leaves the id on the account, where projections ignore it and
    /// `release_settled_ids` (also run by balance reads) removes it.
    pub async fn finalize(&self, id: TransactionId) -> Result<(), TransferError> {
        let txn = self.get_transaction(id).await?;
        require_state(&txn, TransactionState::Applied)?;

        if !self
            .cas_state(
                id,
                TransactionState::Applied,
                TransactionMutation::to(TransactionState::Done),
            )
            .await?
        {
            return Err(TransferError::conflict(id, "finalize lost race on APPLIED"));
        }

        for account in [txn.source_account_id, txn.destination_account_id] {
            match self
                .update_account(
                    account,
                    AccountFilter::any(),
                    AccountMutation::ReleasePending(id),
                )
                .await
            {
                Ok(true) => {}
                Ok(false) => warn!(
                    transaction_id = %id,
                    account = %account,
                    "Account missing while releasing committed transfer"
                ),
                Err(e) => warn!(
                    transaction_id = %id,
                    account = %account,
                    error = %e,
                    "Release failed after commit (stale pending id left behind)"
                ),
            }
        }

        info!(transaction_id = %id, "🔒 COMMIT");
        Ok(())
    }

    /// Compensate a PENDING, APPLIED or already CANCELING transaction.
    pub async fn cancel(&self, id: TransactionId) -> Result<(), TransferError> {
        self.cancel_with_reason(id, None).await
    }

    pub(crate) async fn cancel_with_reason(
        &self,
        id: TransactionId,
        reason: Option<String>,
    ) -> Result<(), TransferError> {
        let txn = self.get_transaction(id).await?;

        match txn.state {
            TransactionState::Pending | TransactionState::Applied => {
                let mut mutation = TransactionMutation::to(TransactionState::Canceling);
                if let Some(reason) = reason {
                    mutation = mutation.with_error(reason);
                }
                if !self.cas_state(id, txn.state, mutation).await? {
                    return Err(TransferError::conflict(
                        id,
                        format!("cancel lost race on {}", txn.state),
                    ));
                }
            }
            TransactionState::Canceling => {
                debug!(transaction_id = %id, "Resuming cancel");
            }
            TransactionState::Initial | TransactionState::Done | TransactionState::Canceled => {
                return Err(TransferError::conflict(
                    id,
                    format!("cannot cancel from {}", txn.state),
                ));
            }
        }

        for account in [txn.source_account_id, txn.destination_account_id] {
            self.compensate_account(&txn, account).await?;
        }

        if !self
            .cas_state(
                id,
                TransactionState::Canceling,
                TransactionMutation::to(TransactionState::Canceled),
            )
            .await?
        {
            return Err(TransferError::conflict(id, "cancel lost race on CANCELING"));
        }

        info!(transaction_id = %id, from = %txn.state, "Transaction canceled");
        Ok(())
    }

    // ========================================================================
    // Legs
    // ========================================================================

    /// Apply this account's leg of `txn`.
    ///
    /// On a zero match the account is re-read to tell a resumed leg apart
    /// from a conflict, insufficient funds on the debit, or a credit that
    /// would overflow the destination balance.
    async fn apply_leg(&self, txn: &Transaction, account: AccountId) -> Result<(), TransferError> {
        let delta = txn.leg_delta(account).ok_or_else(|| {
            TransferError::Validation(format!("account {} is not a party to {}", account, txn.id))
        })?;
        let is_debit = delta < 0;

        let mut filter = AccountFilter::any().pending(txn.id).leg_not_applied(txn.id);
        filter = if is_debit {
            filter.min_balance(txn.amount)
        } else {
            filter.credit_headroom(txn.amount)
        };

        let mutation = AccountMutation::ApplyLeg {
            transaction_id: txn.id,
            delta,
        };
        if self.update_account(account, filter, mutation).await? {
            return Ok(());
        }

        let current = self
            .call("accounts.find_by_id", self.accounts.find_by_id(account))
            .await?
            .ok_or_else(|| TransferError::NotFound(format!("account {}", account)))?;

        if current.has_applied_leg(txn.id) {
            debug!(transaction_id = %txn.id, account = %account, "Leg already applied");
            Ok(())
        } else if !current.is_pending(txn.id) {
            Err(TransferError::conflict(
                txn.id,
                format!("not reserved on account {}", account),
            ))
        } else if is_debit {
            info!(
                transaction_id = %txn.id,
                account = %account,
                balance = current.balance,
                amount = txn.amount,
                "Insufficient funds"
            );
            Err(TransferError::InsufficientFunds)
        } else if current.balance.checked_add(delta).is_none() {
            warn!(
                transaction_id = %txn.id,
                account = %account,
                balance = current.balance,
                amount = txn.amount,
                "Credit would overflow balance"
            );
            Err(TransferError::BalanceOverflow(account))
        } else {
            Err(TransferError::conflict(
                txn.id,
                format!("credit on account {} lost race", account),
            ))
        }
    }

    /// Revert this account's leg if applied, then release the pending id.
    ///
    /// The release only matches while no leg is applied, so a debit that
    /// races in after the revert is caught on the next round instead of
    /// being released with the funds still moved.
    async fn compensate_account(
        &self,
        txn: &Transaction,
        account: AccountId,
    ) -> Result<(), TransferError> {
        let delta = txn.leg_delta(account).unwrap_or_default();

        for _ in 0..MAX_COMPENSATION_ROUNDS {
            let reverted = self
                .update_account(
                    account,
                    AccountFilter::any().leg_applied(txn.id),
                    AccountMutation::RevertLeg {
                        transaction_id: txn.id,
                        delta,
                    },
                )
                .await?;
            if reverted {
                info!(transaction_id = %txn.id, account = %account, delta, "Leg reverted");
            }

            if self
                .update_account(
                    account,
                    AccountFilter::any().leg_not_applied(txn.id),
                    AccountMutation::ReleasePending(txn.id),
                )
                .await?
            {
                return Ok(());
            }

            let exists = self
                .call("accounts.find_by_id", self.accounts.find_by_id(account))
                .await?
                .is_some();
            if !exists {
                warn!(
                    transaction_id = %txn.id,
                    account = %account,
                    "Account missing, nothing to compensate"
                );
                return Ok(());
            }
        }

        Err(TransferError::conflict(
            txn.id,
            format!("compensation on account {} did not converge", account),
        ))
    }

    // ========================================================================
    // Store helpers
    // ========================================================================

    async fn cas_state(
        &self,
        id: TransactionId,
        expected: TransactionState,
        mutation: TransactionMutation,
    ) -> Result<bool, TransferError> {
        debug_assert!(expected.can_transition_to(mutation.state));
        let matched = self
            .call(
                "transactions.conditional_update",
                self.transactions.conditional_update(id, expected, mutation),
            )
            .await?;
        Ok(matched > 0)
    }

    pub(crate) async fn update_account(
        &self,
        account: AccountId,
        filter: AccountFilter,
        mutation: AccountMutation,
    ) -> Result<bool, TransferError> {
        let matched = self
            .call(
                "accounts.conditional_update",
                self.accounts.conditional_update(account, filter, mutation),
            )
            .await?;
        Ok(matched > 0)
    }
}

fn require_state(txn: &Transaction, expected: TransactionState) -> Result<(), TransferError> {
    if txn.state == expected {
        Ok(())
    } else {
        Err(TransferError::conflict(
            txn.id,
            format!("expected {}, found {}", expected, txn.state),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::memory::InMemoryStore;
    use crate::transfer::types::Account;

    fn setup(balances: &[(u64, i64)]) -> (Arc<InMemoryStore>, TransferCoordinator) {
        let store = Arc::new(InMemoryStore::new());
        for (id, balance) in balances {
            store.insert_account(Account::new(AccountId(*id), *balance));
        }
        let coordinator = TransferCoordinator::new(store.clone(), store.clone());
        (store, coordinator)
    }

    #[test]
    fn test_validation() {
        let ok = TransferCoordinator::validate(AccountId(1), AccountId(2), 10);
        assert!(ok.is_ok());

        for (src, dst, amount) in [(1, 2, 0), (1, 2, -5), (1, 1, 10), (0, 2, 10), (1, 0, 10)] {
            let result = TransferCoordinator::validate(AccountId(src), AccountId(dst), amount);
            assert!(
                matches!(result, Err(TransferError::Validation(_))),
                "{} -> {} amount={}",
                src,
                dst,
                amount
            );
        }
    }

    #[tokio::test]
    async fn test_validation_creates_no_record() {
        let (store, coordinator) = setup(&[(1, 100), (2, 0)]);
        let result = coordinator
            .execute_transfer(AccountId(1), AccountId(1), 10)
            .await;
        assert!(matches!(result, Err(TransferError::Validation(_))));

        let stale = store
            .find_stale(
                &[TransactionState::Initial],
                chrono::Utc::now() + chrono::Duration::days(1),
                10,
            )
            .await
            .unwrap();
        assert!(stale.is_empty());
    }

    #[tokio::test]
    async fn test_reserve_adds_pending_ids() {
        let (store, coordinator) = setup(&[(1, 100), (2, 0)]);
        let txn = coordinator
            .create_transaction(AccountId(1), AccountId(2), 40)
            .await
            .unwrap();

        coordinator.reserve(txn.id).await.unwrap();

        assert_eq!(
            store.transaction(txn.id).unwrap().state,
            TransactionState::Pending
        );
        assert!(store.account(AccountId(1)).unwrap().is_pending(txn.id));
        assert!(store.account(AccountId(2)).unwrap().is_pending(txn.id));
    }

    #[tokio::test]
    async fn test_reserve_missing_destination_is_not_found() {
        let (_store, coordinator) = setup(&[(1, 100)]);
        let txn = coordinator
            .create_transaction(AccountId(1), AccountId(9), 40)
            .await
            .unwrap();

        let result = coordinator.reserve(txn.id).await;
        assert!(matches!(result, Err(TransferError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_unknown_transaction_is_not_found() {
        let (_store, coordinator) = setup(&[]);
        let result = coordinator
            .execute_existing_transaction(TransactionId::new())
            .await;
        assert!(matches!(result, Err(TransferError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_cancel_from_initial_is_conflict() {
        let (_store, coordinator) = setup(&[(1, 100), (2, 0)]);
        let txn = coordinator
            .create_transaction(AccountId(1), AccountId(2), 40)
            .await
            .unwrap();

        let result = coordinator.cancel(txn.id).await;
        assert!(matches!(result, Err(TransferError::StateConflict { .. })));
    }

    #[tokio::test]
    async fn test_cancel_records_reason() {
        let (store, coordinator) = setup(&[(1, 100), (2, 0)]);
        let txn = coordinator
            .create_transaction(AccountId(1), AccountId(2), 40)
            .await
            .unwrap();
        coordinator.reserve(txn.id).await.unwrap();

        coordinator
            .cancel_with_reason(txn.id, Some("client aborted".to_string()))
            .await
            .unwrap();

        let stored = store.transaction(txn.id).unwrap();
        assert_eq!(stored.state, TransactionState::Canceled);
        assert_eq!(stored.error.as_deref(), Some("client aborted"));
    }
}
