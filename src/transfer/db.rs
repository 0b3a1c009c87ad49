//! Transfer Database Layer
//!
//! PostgreSQL-backed implementation of both record stores.
//! Every conditional update is a single `UPDATE ... WHERE` statement, so the
//! filter check and the mutation are atomic per row and `rows_affected()` is
//! the matched count.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use super::error::TransferError;
use super::state::TransactionState;
use super::store::{
    AccountFilter, AccountMutation, AccountStore, TransactionMutation, TransactionStore,
};
use super::types::{Account, AccountId, NewTransaction, Transaction, TransactionId};

const SCHEMA: [&str; 3] = [
    r#"
    CREATE TABLE IF NOT EXISTS accounts_tb (
        account_id              BIGINT PRIMARY KEY,
        balance                 BIGINT NOT NULL DEFAULT 0,
        pending_transaction_ids TEXT[] NOT NULL DEFAULT '{}',
        applied_transaction_ids TEXT[] NOT NULL DEFAULT '{}'
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS transactions_tb (
        transaction_id         TEXT PRIMARY KEY,
        source_account_id      BIGINT NOT NULL,
        destination_account_id BIGINT NOT NULL,
        amount                 BIGINT NOT NULL CHECK (amount > 0),
        state                  SMALLINT NOT NULL,
        error_message          TEXT,
        created_at             TIMESTAMPTZ NOT NULL,
        updated_at             TIMESTAMPTZ NOT NULL,
        CHECK (source_account_id <> destination_account_id)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_transactions_state_updated
        ON transactions_tb (state, updated_at)
    "#,
];

const TRANSACTION_COLUMNS: &str = "transaction_id, source_account_id, destination_account_id, \
     amount, state, error_message, created_at, updated_at";

/// SQLSTATE for `bigint out of range`
const NUMERIC_OUT_OF_RANGE: &str = "22003";

const ACCOUNT_COLUMNS: &str =
    "account_id, balance, pending_transaction_ids, applied_transaction_ids";

/// PostgreSQL record store
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Create a new PgStore with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create tables and indexes if they do not exist
    pub async fn ensure_schema(&self) -> Result<(), TransferError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        tracing::info!("Transfer schema ready");
        Ok(())
    }

    /// Insert or overwrite an account's balance. Id sets are left untouched
    /// on conflict.
    pub async fn upsert_account(&self, id: AccountId, balance: i64) -> Result<(), TransferError> {
        sqlx::query(
            r#"
            INSERT INTO accounts_tb (account_id, balance)
            VALUES ($1, $2)
            ON CONFLICT (account_id) DO UPDATE SET balance = EXCLUDED.balance
            "#,
        )
        .bind(id.value() as i64)
        .bind(balance)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn row_to_transaction(row: &sqlx::postgres::PgRow) -> Result<Transaction, TransferError> {
        let id_str: String = row.try_get("transaction_id")?;
        let id: TransactionId = id_str
            .parse()
            .map_err(|_| TransferError::Store(format!("Invalid transaction_id: {}", id_str)))?;

        let state_id: i16 = row.try_get("state")?;
        let state = TransactionState::from_id(state_id)
            .ok_or_else(|| TransferError::Store(format!("Invalid state ID: {}", state_id)))?;

        Ok(Transaction {
            id,
            source_account_id: AccountId(row.try_get::<i64, _>("source_account_id")? as u64),
            destination_account_id: AccountId(
                row.try_get::<i64, _>("destination_account_id")? as u64,
            ),
            amount: row.try_get("amount")?,
            state,
            error: row.try_get("error_message")?,
            created_at: row.try_get("created_at")?,
            last_modified_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_account(row: &sqlx::postgres::PgRow) -> Result<Account, TransferError> {
        let parse_ids = |column: &str| -> Result<_, TransferError> {
            let raw: Vec<String> = row.try_get(column)?;
            raw.iter()
                .map(|s| {
                    s.parse::<TransactionId>().map_err(|_| {
                        TransferError::Store(format!("Invalid id in {}: {}", column, s))
                    })
                })
                .collect()
        };

        Ok(Account {
            id: AccountId(row.try_get::<i64, _>("account_id")? as u64),
            balance: row.try_get("balance")?,
            pending_transaction_ids: parse_ids("pending_transaction_ids")?,
            applied_transaction_ids: parse_ids("applied_transaction_ids")?,
        })
    }
}

#[async_trait]
impl TransactionStore for PgStore {
    async fn create(&self, fields: NewTransaction) -> Result<Transaction, TransferError> {
        let txn = fields.into_transaction(TransactionId::new(), Utc::now());

        sqlx::query(
            r#"
            INSERT INTO transactions_tb
                (transaction_id, source_account_id, destination_account_id, amount,
                 state, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(txn.id.to_string())
        .bind(txn.source_account_id.value() as i64)
        .bind(txn.destination_account_id.value() as i64)
        .bind(txn.amount)
        .bind(txn.state.id())
        .bind(txn.created_at)
        .bind(txn.last_modified_at)
        .execute(&self.pool)
        .await?;

        Ok(txn)
    }

    async fn find_by_id(&self, id: TransactionId) -> Result<Option<Transaction>, TransferError> {
        let sql = format!(
            "SELECT {} FROM transactions_tb WHERE transaction_id = $1",
            TRANSACTION_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_transaction).transpose()
    }

    async fn find_many_by_id(
        &self,
        ids: &[TransactionId],
    ) -> Result<Vec<Transaction>, TransferError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {} FROM transactions_tb WHERE transaction_id = ANY($1)",
            TRANSACTION_COLUMNS
        );
        let keys: Vec<String> = ids.iter().map(ToString::to_string).collect();
        let rows = sqlx::query(&sql).bind(keys).fetch_all(&self.pool).await?;

        rows.iter().map(Self::row_to_transaction).collect()
    }

    async fn conditional_update(
        &self,
        id: TransactionId,
        expected: TransactionState,
        mutation: TransactionMutation,
    ) -> Result<u64, TransferError> {
        let result = sqlx::query(
            r#"
            UPDATE transactions_tb
            SET state = $1, error_message = COALESCE($2, error_message), updated_at = $3
            WHERE transaction_id = $4 AND state = $5
            "#,
        )
        .bind(mutation.state.id())
        .bind(mutation.error)
        .bind(Utc::now())
        .bind(id.to_string())
        .bind(expected.id())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn find_stale(
        &self,
        states: &[TransactionState],
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Transaction>, TransferError> {
        let sql = format!(
            r#"
            SELECT {} FROM transactions_tb
            WHERE state = ANY($1) AND updated_at < $2
            ORDER BY updated_at ASC
            LIMIT $3
            "#,
            TRANSACTION_COLUMNS
        );
        let state_ids: Vec<i16> = states.iter().map(TransactionState::id).collect();
        let rows = sqlx::query(&sql)
            .bind(state_ids)
            .bind(older_than)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::row_to_transaction).collect()
    }
}

#[async_trait]
impl AccountStore for PgStore {
    async fn find_by_id(&self, id: AccountId) -> Result<Option<Account>, TransferError> {
        let sql = format!(
            "SELECT {} FROM accounts_tb WHERE account_id = $1",
            ACCOUNT_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(id.value() as i64)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_account).transpose()
    }

    async fn find_many_by_id(&self, ids: &[AccountId]) -> Result<Vec<Account>, TransferError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {} FROM accounts_tb WHERE account_id = ANY($1)",
            ACCOUNT_COLUMNS
        );
        let keys: Vec<i64> = ids.iter().map(|id| id.value() as i64).collect();
        let rows = sqlx::query(&sql).bind(keys).fetch_all(&self.pool).await?;

        rows.iter().map(Self::row_to_account).collect()
    }

    async fn conditional_update(
        &self,
        id: AccountId,
        filter: AccountFilter,
        mutation: AccountMutation,
    ) -> Result<u64, TransferError> {
        let sql = account_update_sql(&mutation);

        let (leg_id, leg_applied) = match filter.leg_applied {
            Some((txn, applied)) => (Some(txn.to_string()), Some(applied)),
            None => (None, None),
        };

        let query = sqlx::query(&sql)
            .bind(id.value() as i64)
            .bind(filter.pending.map(|t| t.to_string()))
            .bind(leg_id)
            .bind(leg_applied)
            .bind(filter.min_balance)
            .bind(filter.max_balance);

        let query = match mutation {
            AccountMutation::AddPending(txn) | AccountMutation::ReleasePending(txn) => {
                query.bind(txn.to_string())
            }
            AccountMutation::ApplyLeg {
                transaction_id,
                delta,
            }
            | AccountMutation::RevertLeg {
                transaction_id,
                delta,
            } => query.bind(transaction_id.to_string()).bind(delta),
        };

        let result = query.execute(&self.pool).await.map_err(|e| {
            if is_out_of_range(&e) {
                TransferError::BalanceOverflow(id)
            } else {
                TransferError::from(e)
            }
        })?;
        Ok(result.rows_affected())
    }
}

fn is_out_of_range(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.code().as_deref() == Some(NUMERIC_OUT_OF_RANGE))
}

/// Build the UPDATE for an account mutation.
///
/// Filter parameters are always $1..$6; mutation parameters start at $7.
fn account_update_sql(mutation: &AccountMutation) -> String {
    let set_clause = match mutation {
        AccountMutation::AddPending(_) => {
            "pending_transaction_ids = CASE WHEN $7 = ANY(pending_transaction_ids) \
             THEN pending_transaction_ids \
             ELSE array_append(pending_transaction_ids, $7) END"
        }
        AccountMutation::ReleasePending(_) => {
            "pending_transaction_ids = array_remove(pending_transaction_ids, $7), \
             applied_transaction_ids = array_remove(applied_transaction_ids, $7)"
        }
        AccountMutation::ApplyLeg { .. } => {
            "balance = balance + $8, \
             applied_transaction_ids = CASE WHEN $7 = ANY(applied_transaction_ids) \
             THEN applied_transaction_ids \
             ELSE array_append(applied_transaction_ids, $7) END"
        }
        AccountMutation::RevertLeg { .. } => {
            "balance = balance - $8, \
             applied_transaction_ids = array_remove(applied_transaction_ids, $7)"
        }
    };

    format!(
        r#"
        UPDATE accounts_tb SET {}
        WHERE account_id = $1
          AND ($2::TEXT IS NULL OR $2 = ANY(pending_transaction_ids))
          AND ($3::TEXT IS NULL OR ($3 = ANY(applied_transaction_ids)) = $4::BOOLEAN)
          AND ($5::BIGINT IS NULL OR balance >= $5)
          AND ($6::BIGINT IS NULL OR balance <= $6)
        "#,
        set_clause
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_update_sql_parameters() {
        let txn = TransactionId::new();

        let add = account_update_sql(&AccountMutation::AddPending(txn));
        assert!(add.contains("array_append(pending_transaction_ids, $7)"));
        assert!(!add.contains("$8"));

        let apply = account_update_sql(&AccountMutation::ApplyLeg {
            transaction_id: txn,
            delta: -10,
        });
        assert!(apply.contains("balance = balance + $8"));
        assert!(apply.contains("balance >= $5"));
        assert!(apply.contains("balance <= $6"));

        let revert = account_update_sql(&AccountMutation::RevertLeg {
            transaction_id: txn,
            delta: -10,
        });
        assert!(revert.contains("balance = balance - $8"));
    }

    #[test]
    fn test_schema_has_both_tables() {
        assert!(SCHEMA[0].contains("accounts_tb"));
        assert!(SCHEMA[1].contains("transactions_tb"));
        assert!(SCHEMA[1].contains("CHECK (amount > 0)"));
    }
}
