//! Two-phase transfer coordination over single-record atomic stores.
//!
//! # Modules
//!
//! - [`transfer`] - Coordinator FSM, recovery sweep, balance projection and stores
//! - [`config`] - YAML application configuration
//! - [`logging`] - `tracing` subscriber setup

pub mod config;
pub mod logging;
pub mod transfer;

// Convenient re-exports at crate root
pub use config::AppConfig;
pub use transfer::{
    Account, AccountBalance, AccountId, InMemoryStore, PgStore, RecoveryReport, RecoveryWorker,
    Transaction, TransactionId, TransactionState, TransferCoordinator, TransferError,
    TransferOutcome,
};
