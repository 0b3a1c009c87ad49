//! Recovery Worker
//!
//! Finds transactions stalled in a non-terminal state and compensates them.
//! Recovery only ever moves backward through Cancel; it never tries to
//! finish an Apply or Finalize on someone else's behalf.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info};

use super::coordinator::TransferCoordinator;
use super::error::TransferError;
use super::state::TransactionState;
use super::store::{AccountFilter, AccountMutation, AccountStore, TransactionStore};
use super::types::{Account, AccountId, RecoveryReport, Transaction, TransactionId};

/// States a sweep will pick up. CANCELING is included so a Cancel that
/// failed part way through still reaches CANCELED.
pub const SWEEPABLE_STATES: [TransactionState; 3] = [
    TransactionState::Pending,
    TransactionState::Applied,
    TransactionState::Canceling,
];

pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Configuration for the recovery worker
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How often to scan for stale transactions
    pub scan_interval: Duration,
    /// How long a transaction must be idle to be considered stuck
    pub stale_threshold: Duration,
    /// Maximum transactions to process per scan
    pub batch_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(30),
            stale_threshold: Duration::from_secs(60),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl TransferCoordinator {
    /// Cancel every transaction idle for longer than `timeout`.
    ///
    /// Works through the stale set in batches of `DEFAULT_BATCH_SIZE` until
    /// none is left. A transaction whose cancel failed stays stale; it is
    /// reported once and skipped for the rest of the sweep.
    pub async fn recover_stuck_transactions(
        &self,
        timeout: Duration,
    ) -> Result<RecoveryReport, TransferError> {
        let cutoff = stale_cutoff(timeout)?;
        let mut report = RecoveryReport::default();
        let mut failed: HashSet<TransactionId> = HashSet::new();

        loop {
            // Failed records sort first, so widen the window past them.
            let limit = DEFAULT_BATCH_SIZE + failed.len();
            let batch = self.find_stale(cutoff, limit).await?;
            let exhausted = batch.len() < limit;

            let fresh: Vec<Transaction> = batch
                .into_iter()
                .filter(|t| !failed.contains(&t.id))
                .collect();
            if fresh.is_empty() {
                break;
            }

            for txn in fresh {
                let id = txn.id;
                if !self.recover_one(txn, &mut report).await {
                    failed.insert(id);
                }
            }
            if exhausted {
                break;
            }
        }

        log_sweep(&report);
        Ok(report)
    }

    /// Like `recover_stuck_transactions`, processing at most `batch_size`
    /// records, oldest first.
    ///
    /// A failure to cancel one transaction is recorded in the report and does
    /// not stop the sweep.
    pub async fn recover_stuck_batch(
        &self,
        timeout: Duration,
        batch_size: usize,
    ) -> Result<RecoveryReport, TransferError> {
        let cutoff = stale_cutoff(timeout)?;
        let mut report = RecoveryReport::default();

        for txn in self.find_stale(cutoff, batch_size).await? {
            self.recover_one(txn, &mut report).await;
        }

        log_sweep(&report);
        Ok(report)
    }

    /// Drop ids of DONE or CANCELED transactions from an account's sets.
    ///
    /// Finalize normally releases them itself; this cleans up after a
    /// release that failed once the transfer had already committed.
    pub async fn release_settled_ids(&self, account_id: AccountId) -> Result<usize, TransferError> {
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

        self.release_settled(&account, &transactions).await
    }

    pub(crate) async fn release_settled(
        &self,
        account: &Account,
        transactions: &[Transaction],
    ) -> Result<usize, TransferError> {
        let mut released = 0;

        for txn in transactions
            .iter()
            .filter(|t| t.state.is_terminal() && account.is_pending(t.id))
        {
            let mut filter = AccountFilter::any().pending(txn.id);
            if txn.state == TransactionState::Canceled {
                filter = filter.leg_not_applied(txn.id);
            }
            if self
                .update_account(account.id, filter, AccountMutation::ReleasePending(txn.id))
                .await?
            {
                released += 1;
            }
        }

        if released > 0 {
            info!(account = %account.id, released, "Released settled transaction ids");
        }
        Ok(released)
    }

    async fn find_stale(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Transaction>, TransferError> {
        self.call(
            "transactions.find_stale",
            self.transactions().find_stale(&SWEEPABLE_STATES, cutoff, limit),
        )
        .await
    }

    /// Cancel one stale transaction, recording the result. Returns whether
    /// it succeeded.
    async fn recover_one(&self, txn: Transaction, report: &mut RecoveryReport) -> bool {
        debug!(
            transaction_id = %txn.id,
            state = %txn.state,
            last_modified_at = %txn.last_modified_at,
            "Recovering transaction"
        );

        let reason = format!(
            "recovered: stale in {} since {}",
            txn.state, txn.last_modified_at
        );
        match self.cancel_with_reason(txn.id, Some(reason)).await {
            Ok(()) => {
                report.record_success(txn.id);
                true
            }
            Err(e) => {
                error!(transaction_id = %txn.id, error = %e, "Failed to recover transaction");
                report.record_failure(txn.id, e.to_string());
                false
            }
        }
    }
}

fn stale_cutoff(timeout: Duration) -> Result<DateTime<Utc>, TransferError> {
    let age = chrono::Duration::from_std(timeout).map_err(|_| {
        TransferError::Validation(format!("timeout out of range: {:?}", timeout))
    })?;
    Ok(Utc::now() - age)
}

fn log_sweep(report: &RecoveryReport) {
    if report.details.is_empty() {
        debug!("No stale transactions found");
    } else {
        info!(
            recovered = report.recovered,
            failed = report.failed,
            "Recovery sweep finished"
        );
    }
}

/// Recovery Worker
///
/// Periodically sweeps for stuck transactions. Deployments with an external
/// scheduler can call `scan_and_recover` directly instead of `run`.
pub struct RecoveryWorker {
    coordinator: Arc<TransferCoordinator>,
    config: WorkerConfig,
}

impl RecoveryWorker {
    pub fn new(coordinator: Arc<TransferCoordinator>, config: WorkerConfig) -> Self {
        Self {
            coordinator,
            config,
        }
    }

    pub fn with_defaults(coordinator: Arc<TransferCoordinator>) -> Self {
        Self::new(coordinator, WorkerConfig::default())
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Run the recovery loop forever.
    pub async fn run(&self) -> ! {
        info!(
            scan_interval_secs = self.config.scan_interval.as_secs(),
            stale_threshold_secs = self.config.stale_threshold.as_secs(),
            batch_size = self.config.batch_size,
            "Starting recovery worker"
        );

        loop {
            if let Err(e) = self.scan_and_recover().await {
                error!(error = %e, "Recovery scan failed");
            }

            tokio::time::sleep(self.config.scan_interval).await;
        }
    }

    /// Run a single sweep with the configured threshold and batch size
    pub async fn scan_and_recover(&self) -> Result<RecoveryReport, TransferError> {
        self.coordinator
            .recover_stuck_batch(self.config.stale_threshold, self.config.batch_size)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_config_default() {
        let config = WorkerConfig::default();
        assert_eq!(config.scan_interval, Duration::from_secs(30));
        assert_eq!(config.stale_threshold, Duration::from_secs(60));
        assert_eq!(config.batch_size, 100);
    }

    #[test]
    fn test_sweepable_states_exclude_initial_and_terminal() {
        assert!(!SWEEPABLE_STATES.contains(&TransactionState::Initial));
        assert!(SWEEPABLE_STATES.iter().all(|s| !s.is_terminal()));
        assert!(SWEEPABLE_STATES.iter().all(|s| s.is_cancelable()));
    }
}
