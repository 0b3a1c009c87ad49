use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tpc_transfer::transfer::{
    Account, AccountId, InMemoryStore, NewTransaction, TransactionId, TransactionState,
    TransferCoordinator, TransferError,
};

fn coordinator_with(balances: &[(u64, i64)]) -> (Arc<InMemoryStore>, TransferCoordinator) {
    let store = Arc::new(InMemoryStore::new());
    for (id, balance) in balances {
        store.insert_account(Account::new(AccountId(*id), *balance));
    }
    let coordinator = TransferCoordinator::new(store.clone(), store.clone());
    (store, coordinator)
}

#[tokio::test]
async fn qa_transfer_500_from_2500() {
    let (store, coordinator) = coordinator_with(&[(10, 2500), (20, 1000)]);

    let outcome = coordinator
        .execute_transfer(AccountId(10), AccountId(20), 500)
        .await
        .unwrap();

    assert!(outcome.success);
    assert_eq!(store.account(AccountId(10)).unwrap().balance, 2000);
    assert_eq!(store.account(AccountId(20)).unwrap().balance, 1500);

    let txn = coordinator
        .get_transaction(outcome.transaction_id)
        .await
        .unwrap();
    assert_eq!(txn.state, TransactionState::Done);
}

#[tokio::test]
async fn qa_transfer_3000_from_2500_fails() {
    let (store, coordinator) = coordinator_with(&[(10, 2500), (20, 1000)]);

    let err = coordinator
        .execute_transfer(AccountId(10), AccountId(20), 3000)
        .await
        .unwrap_err();

    let TransferError::TransferFailed { transaction_id, .. } = &err else {
        panic!("expected TransferFailed, got {:?}", err);
    };
    assert!(matches!(err.root_cause(), TransferError::InsufficientFunds));
    assert!(!err.is_retryable());

    assert_eq!(store.account(AccountId(10)).unwrap().balance, 2500);
    assert_eq!(store.account(AccountId(20)).unwrap().balance, 1000);
    assert_eq!(
        store.transaction(*transaction_id).unwrap().state,
        TransactionState::Canceled
    );
}

#[tokio::test]
async fn qa_credit_overflow_rolls_back() {
    let (store, coordinator) = coordinator_with(&[(10, i64::MAX), (20, 10)]);

    let err = coordinator
        .execute_transfer(AccountId(10), AccountId(20), i64::MAX)
        .await
        .unwrap_err();

    assert_eq!(err.root_cause().code(), "BALANCE_OVERFLOW");
    assert_eq!(store.account(AccountId(10)).unwrap().balance, i64::MAX);
    assert_eq!(store.account(AccountId(20)).unwrap().balance, 10);
}

#[tokio::test]
async fn qa_validation_fails_fast() {
    let (_store, coordinator) = coordinator_with(&[(10, 2500), (20, 0)]);

    for (src, dst, amount) in [(10, 20, 0), (10, 10, 5), (0, 20, 5)] {
        let err = coordinator
            .execute_transfer(AccountId(src), AccountId(dst), amount)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }
}

#[tokio::test]
async fn qa_projection_pending_out_applied_in() {
    let (store, coordinator) = coordinator_with(&[]);
    let now = Utc::now();

    let mut outgoing = NewTransaction::new(AccountId(1), AccountId(2), 200)
        .into_transaction(TransactionId::new(), now);
    outgoing.state = TransactionState::Pending;
    let mut incoming = NewTransaction::new(AccountId(3), AccountId(1), 150)
        .into_transaction(TransactionId::new(), now);
    incoming.state = TransactionState::Applied;

    let mut account = Account::new(AccountId(1), 1000);
    account.pending_transaction_ids.insert(outgoing.id);
    account.pending_transaction_ids.insert(incoming.id);
    store.insert_account(account);
    store.insert_transaction(outgoing);
    store.insert_transaction(incoming);

    let view = coordinator.get_account_balance(AccountId(1)).await.unwrap();
    assert_eq!(view.balance, 1000);
    assert_eq!(view.available_balance, 800);
    assert_eq!(view.projected_balance, 950);
}

#[tokio::test]
async fn qa_recovery_sweep_report() {
    let (store, coordinator) = coordinator_with(&[(10, 1000), (20, 0)]);

    let txn = coordinator
        .create_transaction(AccountId(10), AccountId(20), 100)
        .await
        .unwrap();
    coordinator.reserve(txn.id).await.unwrap();
    coordinator.apply(txn.id).await.unwrap();
    store.set_last_modified(txn.id, Utc::now() - chrono::Duration::minutes(5));

    let report = coordinator
        .recover_stuck_transactions(Duration::from_secs(60))
        .await
        .unwrap();

    assert_eq!(report.recovered, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(report.details[0].transaction_id, txn.id);
    assert!(report.details[0].success);
    assert_eq!(store.account(AccountId(10)).unwrap().balance, 1000);
    assert_eq!(store.account(AccountId(20)).unwrap().balance, 0);

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["recovered"], 1);
}
