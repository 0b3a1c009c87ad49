//! Two-Phase Transfer Coordinator
//!
//! Moves value between two accounts on a store that only offers
//! single-record atomic updates. Atomicity of the transfer as a whole comes
//! from the phase sequence plus compensation, not from the store.
//!
//! # State Machine
//!
//! ```text
//! INITIAL → PENDING → APPLIED → DONE
//!              ↓         ↓
//!              CANCELING ──→ CANCELED
//! ```
//!
//! # Safety Invariants
//!
//! 1. **CAS per phase**: every state change is a conditional update on the
//!    expected prior state; losing a race yields `StateConflict`, never a retry
//! 2. **Bounds in the filter**: the debit's `balance >= amount` floor and the
//!    credit's `balance <= i64::MAX - amount` ceiling are part of the same
//!    conditional update as the balance change itself
//! 3. **Marked legs**: each balance change records the transaction id on the
//!    account, and Cancel reverses exactly the marked legs
//! 4. **Backward recovery only**: stuck transactions are canceled, never
//!    pushed forward

pub mod coordinator;
pub mod db;
pub mod error;
pub mod memory;
pub mod projector;
pub mod state;
pub mod store;
pub mod types;
pub mod worker;


// Re-exports for convenience
pub use coordinator::{CoordinatorConfig, TransferCoordinator};
pub use db::PgStore;
pub use error::TransferError;
pub use memory::InMemoryStore;
pub use projector::project_balance;
pub use state::TransactionState;
pub use store::{
    AccountFilter, AccountMutation, AccountStore, TransactionMutation, TransactionStore,
};
pub use types::{
    Account, AccountBalance, AccountId, NewTransaction, RecoveryDetail, RecoveryReport,
    Transaction, TransactionId, TransferOutcome,
};
pub use worker::{RecoveryWorker, WorkerConfig};
