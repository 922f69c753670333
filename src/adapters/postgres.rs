// src/adapters/postgres.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::error::StoreError;
use crate::grant::{Grant, GrantStatus};
use crate::operation::{Operation, OperationGrant, OperationType};
use crate::report::UsageTotals;
use crate::store::{Store, StoreTx};

const GRANT_COLUMNS: &str = "grant_id, license_id, asset_did, initial_amount, \
     remaining_amount, status, tx_hash, log_index, expires_at, created_at, updated_at";

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the ledger relations and their indexes. Idempotent; the
    /// embedding service calls this when it runs with migrations enabled.
    pub async fn init_schema(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::from)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_grants (
                grant_id UUID PRIMARY KEY,
                license_id TEXT NOT NULL,
                asset_did TEXT NOT NULL,
                initial_amount BIGINT NOT NULL CHECK (initial_amount >= 0),
                remaining_amount BIGINT NOT NULL CHECK (remaining_amount >= 0),
                status TEXT NOT NULL CHECK (status IN ('pending', 'confirmed', 'failed')),
                tx_hash TEXT NOT NULL,
                log_index BIGINT,
                expires_at TIMESTAMPTZ NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(StoreError::from)?;

        // FIFO consumption scan: the lock query's ORDER BY is satisfied
        // from the index alone.
        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_grants_active_fifo
            ON ledger_grants(license_id, asset_did, expires_at ASC, created_at ASC, grant_id ASC)
            WHERE remaining_amount > 0 AND status IN ('confirmed', 'pending')
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(StoreError::from)?;

        // Settlement scan over failed grants still carrying debt.
        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_grants_failed_debt
            ON ledger_grants(license_id, asset_did, created_at ASC)
            WHERE status = 'failed' AND remaining_amount < initial_amount
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(StoreError::from)?;

        // A chain log binds at most one grant; a replayed confirmation
        // conflicts here instead of inserting a second confirmed grant.
        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_grants_chain_log
            ON ledger_grants(tx_hash, log_index)
            WHERE log_index IS NOT NULL
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(StoreError::from)?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_grants_pending_tx
            ON ledger_grants(license_id, asset_did, tx_hash, created_at ASC)
            WHERE status = 'pending'
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(StoreError::from)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_operations (
                app_name TEXT NOT NULL,
                reference_id TEXT NOT NULL,
                operation_type TEXT NOT NULL CHECK (operation_type IN
                    ('deduction', 'refund', 'grant_purchase', 'grant_confirm', 'debt_settlement')),
                license_id TEXT NOT NULL,
                asset_did TEXT NOT NULL,
                total_amount BIGINT NOT NULL CHECK (total_amount >= 0),
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (app_name, reference_id, operation_type)
            )
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(StoreError::from)?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_operations_license_created
            ON ledger_operations(license_id, created_at)
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(StoreError::from)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_operation_grants (
                id UUID PRIMARY KEY,
                app_name TEXT NOT NULL,
                reference_id TEXT NOT NULL,
                operation_type TEXT NOT NULL,
                grant_id UUID NOT NULL REFERENCES ledger_grants(grant_id),
                amount_used BIGINT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                FOREIGN KEY (app_name, reference_id, operation_type)
                    REFERENCES ledger_operations(app_name, reference_id, operation_type)
            )
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(StoreError::from)?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_operation_grants_operation
            ON ledger_operation_grants(app_name, reference_id, operation_type)
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(StoreError::from)?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_operation_grants_grant
            ON ledger_operation_grants(grant_id)
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(StoreError::from)?;

        tx.commit().await.map_err(StoreError::from)?;
        Ok(())
    }
}

fn grant_from_row(row: &PgRow) -> Result<Grant, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(Grant {
        grant_id: row.try_get("grant_id")?,
        license_id: row.try_get("license_id")?,
        asset_did: row.try_get("asset_did")?,
        initial_amount: row.try_get("initial_amount")?,
        remaining_amount: row.try_get("remaining_amount")?,
        status: GrantStatus::parse(&status)
            .ok_or_else(|| StoreError::Other(format!("unknown grant status: {}", status)))?,
        tx_hash: row.try_get("tx_hash")?,
        log_index: row.try_get("log_index")?,
        expires_at: row.try_get("expires_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn operation_type_from_str(s: &str) -> Result<OperationType, StoreError> {
    OperationType::parse(s)
        .ok_or_else(|| StoreError::Other(format!("unknown operation type: {}", s)))
}

#[async_trait]
impl Store for PostgresStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        let tx = self.pool.begin().await.map_err(StoreError::from)?;
        Ok(Box::new(PostgresTx { tx }))
    }

    async fn sum_outstanding_debt(
        &self,
        license_id: &str,
        asset_did: &str,
    ) -> Result<i64, StoreError> {
        let debt: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(initial_amount - remaining_amount), 0)::BIGINT
            FROM ledger_grants
            WHERE license_id = $1 AND asset_did = $2
              AND status = 'failed' AND remaining_amount < initial_amount
            "#,
        )
        .bind(license_id)
        .bind(asset_did)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::from)?;

        Ok(debt)
    }

    async fn usage_for_license(
        &self,
        license_id: &str,
        asset_did: Option<&str>,
        from: DateTime<Utc>,
        to: Option<DateTime<Utc>>,
    ) -> Result<UsageTotals, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(DISTINCT asset_did) AS num_distinct_assets,
                COUNT(*) FILTER (WHERE operation_type = 'grant_confirm')
                    AS num_grants_confirmed,
                (COALESCE(SUM(total_amount) FILTER (WHERE operation_type = 'deduction'), 0)
               - COALESCE(SUM(total_amount) FILTER (WHERE operation_type = 'refund'), 0))::BIGINT
                    AS net_credits_used
            FROM ledger_operations
            WHERE license_id = $1
              AND ($2::TEXT IS NULL OR asset_did = $2)
              AND created_at >= $3
              AND ($4::TIMESTAMPTZ IS NULL OR created_at <= $4)
            "#,
        )
        .bind(license_id)
        .bind(asset_did)
        .bind(from)
        .bind(to)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::from)?;

        Ok(UsageTotals {
            num_distinct_assets: row.try_get("num_distinct_assets")?,
            num_grants_confirmed: row.try_get("num_grants_confirmed")?,
            net_credits_used: row.try_get("net_credits_used")?,
        })
    }
}

pub struct PostgresTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTx for PostgresTx {
    async fn list_active_grants(
        &mut self,
        license_id: &str,
        asset_did: &str,
    ) -> Result<Vec<Grant>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {GRANT_COLUMNS}
            FROM ledger_grants
            WHERE license_id = $1 AND asset_did = $2
              AND status IN ('confirmed', 'pending')
              AND remaining_amount > 0
              AND expires_at > NOW()
            ORDER BY expires_at ASC, created_at ASC, grant_id ASC
            FOR UPDATE
            "#
        ))
        .bind(license_id)
        .bind(asset_did)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(StoreError::from)?;

        rows.iter().map(grant_from_row).collect()
    }

    async fn list_failed_grants_with_debt(
        &mut self,
        license_id: &str,
        asset_did: &str,
    ) -> Result<Vec<Grant>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {GRANT_COLUMNS}
            FROM ledger_grants
            WHERE license_id = $1 AND asset_did = $2
              AND status = 'failed'
              AND remaining_amount < initial_amount
            ORDER BY created_at ASC, grant_id ASC
            FOR UPDATE
            "#
        ))
        .bind(license_id)
        .bind(asset_did)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(StoreError::from)?;

        rows.iter().map(grant_from_row).collect()
    }

    async fn sum_active_balance(
        &mut self,
        license_id: &str,
        asset_did: &str,
    ) -> Result<i64, StoreError> {
        let balance: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(remaining_amount), 0)::BIGINT
            FROM ledger_grants
            WHERE license_id = $1 AND asset_did = $2
              AND status IN ('confirmed', 'pending')
              AND remaining_amount > 0
              AND expires_at > NOW()
            "#,
        )
        .bind(license_id)
        .bind(asset_did)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(StoreError::from)?;

        Ok(balance)
    }

    async fn sum_outstanding_debt(
        &mut self,
        license_id: &str,
        asset_did: &str,
    ) -> Result<i64, StoreError> {
        let debt: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(initial_amount - remaining_amount), 0)::BIGINT
            FROM ledger_grants
            WHERE license_id = $1 AND asset_did = $2
              AND status = 'failed' AND remaining_amount < initial_amount
            "#,
        )
        .bind(license_id)
        .bind(asset_did)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(StoreError::from)?;

        Ok(debt)
    }

    async fn find_pending_grant(
        &mut self,
        license_id: &str,
        asset_did: &str,
        tx_hash: &str,
    ) -> Result<Option<Grant>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {GRANT_COLUMNS}
            FROM ledger_grants
            WHERE license_id = $1 AND asset_did = $2
              AND tx_hash = $3 AND status = 'pending'
            ORDER BY created_at ASC, grant_id ASC
            LIMIT 1
            FOR UPDATE
            "#
        ))
        .bind(license_id)
        .bind(asset_did)
        .bind(tx_hash)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(StoreError::from)?;

        row.as_ref().map(grant_from_row).transpose()
    }

    async fn insert_grant(&mut self, grant: &Grant) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO ledger_grants
                (grant_id, license_id, asset_did, initial_amount, remaining_amount,
                 status, tx_hash, log_index, expires_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(grant.grant_id)
        .bind(&grant.license_id)
        .bind(&grant.asset_did)
        .bind(grant.initial_amount)
        .bind(grant.remaining_amount)
        .bind(grant.status.as_str())
        .bind(&grant.tx_hash)
        .bind(grant.log_index)
        .bind(grant.expires_at)
        .bind(grant.created_at)
        .bind(grant.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(StoreError::from)?;

        Ok(())
    }

    async fn update_grant_remaining(
        &mut self,
        grant_id: Uuid,
        remaining_amount: i64,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE ledger_grants
            SET remaining_amount = $2, updated_at = NOW()
            WHERE grant_id = $1
            "#,
        )
        .bind(grant_id)
        .bind(remaining_amount)
        .execute(&mut *self.tx)
        .await
        .map_err(StoreError::from)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn update_grant_confirmed(
        &mut self,
        grant_id: Uuid,
        log_index: i64,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE ledger_grants
            SET status = 'confirmed', log_index = $2, updated_at = NOW()
            WHERE grant_id = $1
            "#,
        )
        .bind(grant_id)
        .bind(log_index)
        .execute(&mut *self.tx)
        .await
        .map_err(StoreError::from)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn mark_grant_failed(&mut self, grant_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE ledger_grants
            SET status = 'failed', updated_at = NOW()
            WHERE grant_id = $1
            "#,
        )
        .bind(grant_id)
        .execute(&mut *self.tx)
        .await
        .map_err(StoreError::from)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn insert_operation(&mut self, operation: &Operation) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO ledger_operations
                (app_name, reference_id, operation_type, license_id, asset_did,
                 total_amount, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&operation.app_name)
        .bind(&operation.reference_id)
        .bind(operation.operation_type.as_str())
        .bind(&operation.license_id)
        .bind(&operation.asset_did)
        .bind(operation.total_amount)
        .bind(operation.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(StoreError::from)?;

        Ok(())
    }

    async fn insert_operation_grant(&mut self, row: &OperationGrant) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO ledger_operation_grants
                (id, app_name, reference_id, operation_type, grant_id, amount_used, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(row.id)
        .bind(&row.app_name)
        .bind(&row.reference_id)
        .bind(row.operation_type.as_str())
        .bind(row.grant_id)
        .bind(row.amount_used)
        .bind(row.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(StoreError::from)?;

        Ok(())
    }

    async fn load_operation_with_grants(
        &mut self,
        app_name: &str,
        reference_id: &str,
        operation_type: OperationType,
    ) -> Result<Option<(Operation, Vec<(OperationGrant, Grant)>)>, StoreError> {
        let op_row = sqlx::query(
            r#"
            SELECT app_name, reference_id, operation_type, license_id, asset_did,
                   total_amount, created_at
            FROM ledger_operations
            WHERE app_name = $1 AND reference_id = $2 AND operation_type = $3
            "#,
        )
        .bind(app_name)
        .bind(reference_id)
        .bind(operation_type.as_str())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(StoreError::from)?;

        let Some(op_row) = op_row else {
            return Ok(None);
        };

        let op_type: String = op_row.try_get("operation_type")?;
        let operation = Operation {
            app_name: op_row.try_get("app_name")?,
            reference_id: op_row.try_get("reference_id")?,
            operation_type: operation_type_from_str(&op_type)?,
            license_id: op_row.try_get("license_id")?,
            asset_did: op_row.try_get("asset_did")?,
            total_amount: op_row.try_get("total_amount")?,
            created_at: op_row.try_get("created_at")?,
        };

        // Lock the referenced grants; the caller is about to mutate them.
        let rows = sqlx::query(
            r#"
            SELECT og.id AS og_id, og.app_name AS og_app_name,
                   og.reference_id AS og_reference_id,
                   og.operation_type AS og_operation_type,
                   og.amount_used, og.created_at AS og_created_at,
                   g.grant_id, g.license_id, g.asset_did, g.initial_amount,
                   g.remaining_amount, g.status, g.tx_hash, g.log_index,
                   g.expires_at, g.created_at, g.updated_at
            FROM ledger_operation_grants og
            JOIN ledger_grants g ON g.grant_id = og.grant_id
            WHERE og.app_name = $1 AND og.reference_id = $2 AND og.operation_type = $3
            ORDER BY og.created_at ASC, og.id ASC
            FOR UPDATE OF g
            "#,
        )
        .bind(app_name)
        .bind(reference_id)
        .bind(operation_type.as_str())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(StoreError::from)?;

        let mut pairs = Vec::with_capacity(rows.len());
        for row in &rows {
            let og_type: String = row.try_get("og_operation_type")?;
            let grant = grant_from_row(row)?;
            let operation_grant = OperationGrant {
                id: row.try_get("og_id")?,
                app_name: row.try_get("og_app_name")?,
                reference_id: row.try_get("og_reference_id")?,
                operation_type: operation_type_from_str(&og_type)?,
                grant_id: grant.grant_id,
                amount_used: row.try_get("amount_used")?,
                created_at: row.try_get("og_created_at")?,
            };
            pairs.push((operation_grant, grant));
        }

        Ok(Some((operation, pairs)))
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await.map_err(StoreError::from)
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await.map_err(StoreError::from)
    }
}
