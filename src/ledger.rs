// src/ledger.rs
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use metrics::histogram;

use crate::error::LedgerError;
use crate::grant::{self, Grant};
use crate::operation::{Operation, OperationGrant, OperationType, SYSTEM_APP_NAME};
use crate::retry::retry_on_deadlock;
use crate::store::{Store, StoreTx};

/// The credit ledger. Holds no state besides the store handle; all mutual
/// exclusion comes from the store's row locks, so any number of clones and
/// service instances may operate concurrently.
#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn Store>,
}

impl Ledger {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Signed balance for one `(license, asset)` partition: negative when
    /// there is outstanding debt, otherwise the sum of active credits.
    pub async fn get_balance(
        &self,
        license_id: &str,
        asset_did: &str,
    ) -> Result<i64, LedgerError> {
        let start = Instant::now();
        let result =
            retry_on_deadlock(|| self.get_balance_once(license_id, asset_did)).await;
        histogram!("credit_ledger.operation.duration_ms", "op" => "get_balance")
            .record(start.elapsed().as_millis() as f64);
        result
    }

    async fn get_balance_once(
        &self,
        license_id: &str,
        asset_did: &str,
    ) -> Result<i64, LedgerError> {
        let debt = self
            .store
            .sum_outstanding_debt(license_id, asset_did)
            .await?;
        if debt > 0 {
            return Ok(-debt);
        }

        let mut tx = self.store.begin().await?;
        let balance = tx.sum_active_balance(license_id, asset_did).await?;
        tx.commit().await?;
        Ok(balance)
    }

    /// Consume `amount` credits FIFO across the partition's active grants.
    pub async fn deduct(
        &self,
        license_id: &str,
        asset_did: &str,
        amount: i64,
        app_name: &str,
        reference_id: &str,
    ) -> Result<Operation, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount);
        }
        let start = Instant::now();
        let result = retry_on_deadlock(|| {
            self.deduct_once(license_id, asset_did, amount, app_name, reference_id)
        })
        .await;
        histogram!("credit_ledger.operation.duration_ms", "op" => "deduct")
            .record(start.elapsed().as_millis() as f64);
        result
    }

    async fn deduct_once(
        &self,
        license_id: &str,
        asset_did: &str,
        amount: i64,
        app_name: &str,
        reference_id: &str,
    ) -> Result<Operation, LedgerError> {
        // Debt gate outside the transaction; the authoritative consistency
        // check is the row locks taken below.
        let debt = self
            .store
            .sum_outstanding_debt(license_id, asset_did)
            .await?;
        if debt > 0 {
            return Err(LedgerError::OutstandingDebt { debt });
        }

        let mut tx = self.store.begin().await?;

        // Locks the FIFO prefix. Checked inside the lock; this is the
        // real double-spend guard.
        let grants = tx.list_active_grants(license_id, asset_did).await?;
        let available = grants
            .iter()
            .try_fold(0i64, |acc, g| acc.checked_add(g.remaining_amount))
            .ok_or(LedgerError::ArithmeticOverflow)?;
        if available < amount {
            tx.rollback().await.ok();
            return Err(LedgerError::InsufficientCredits {
                available,
                requested: amount,
            });
        }

        let operation = Operation::new(
            app_name,
            reference_id,
            OperationType::Deduction,
            license_id,
            asset_did,
            amount,
        );
        tx.insert_operation(&operation).await?;

        let mut remaining_to_deduct = amount;
        for g in &grants {
            if remaining_to_deduct == 0 {
                break;
            }
            let take = remaining_to_deduct.min(g.remaining_amount);
            tx.update_grant_remaining(g.grant_id, g.remaining_amount - take)
                .await?;
            tx.insert_operation_grant(&OperationGrant::new(&operation, g.grant_id, -take))
                .await?;
            remaining_to_deduct -= take;
        }

        tx.commit().await?;
        Ok(operation)
    }

    /// Reverse a prior deduction identified by `(app_name, reference_id)`,
    /// restoring every grant it consumed.
    pub async fn refund(
        &self,
        app_name: &str,
        reference_id: &str,
    ) -> Result<Operation, LedgerError> {
        let start = Instant::now();
        let result =
            retry_on_deadlock(|| self.refund_once(app_name, reference_id)).await;
        histogram!("credit_ledger.operation.duration_ms", "op" => "refund")
            .record(start.elapsed().as_millis() as f64);
        result
    }

    async fn refund_once(
        &self,
        app_name: &str,
        reference_id: &str,
    ) -> Result<Operation, LedgerError> {
        let mut tx = self.store.begin().await?;

        let Some((deduction, grant_rows)) = tx
            .load_operation_with_grants(app_name, reference_id, OperationType::Deduction)
            .await?
        else {
            tx.rollback().await.ok();
            return Err(LedgerError::ReferencedOperationNotFound);
        };

        let operation = Operation::new(
            app_name,
            reference_id,
            OperationType::Refund,
            &deduction.license_id,
            &deduction.asset_did,
            deduction.total_amount,
        );
        tx.insert_operation(&operation).await?;

        // Grants are restored even when they have since failed or expired;
        // the settlement below sweeps any such residue toward debt.
        for (row, g) in &grant_rows {
            let refund_amount = -row.amount_used;
            let new_remaining = g
                .remaining_amount
                .checked_add(refund_amount)
                .ok_or(LedgerError::ArithmeticOverflow)?;
            tx.update_grant_remaining(g.grant_id, new_remaining).await?;
            tx.insert_operation_grant(&OperationGrant::new(
                &operation,
                g.grant_id,
                refund_amount,
            ))
            .await?;
        }

        self.settle_debt(
            &mut *tx,
            &deduction.license_id,
            &deduction.asset_did,
            app_name,
            reference_id,
        )
        .await?;

        tx.commit().await?;
        Ok(operation)
    }

    /// Record a pending grant for an initiated burn. The grant is spendable
    /// immediately (overdraft-on-pending) and is bound to a chain log by a
    /// later `confirm_grant`.
    pub async fn create_grant(
        &self,
        license_id: &str,
        asset_did: &str,
        amount: i64,
        tx_hash: &str,
        mint_time: DateTime<Utc>,
    ) -> Result<Operation, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount);
        }
        let start = Instant::now();
        let result = retry_on_deadlock(|| {
            self.create_grant_once(license_id, asset_did, amount, tx_hash, mint_time)
        })
        .await;
        histogram!("credit_ledger.operation.duration_ms", "op" => "create_grant")
            .record(start.elapsed().as_millis() as f64);
        result
    }

    async fn create_grant_once(
        &self,
        license_id: &str,
        asset_did: &str,
        amount: i64,
        tx_hash: &str,
        mint_time: DateTime<Utc>,
    ) -> Result<Operation, LedgerError> {
        let expires_at = grant::expiry_for_mint_time(mint_time)
            .ok_or(LedgerError::ArithmeticOverflow)?;
        let grant = Grant::new_pending(license_id, asset_did, amount, tx_hash, expires_at);

        let mut tx = self.store.begin().await?;
        tx.insert_grant(&grant).await?;

        let reference_id = grant.grant_id.to_string();
        let operation = Operation::new(
            SYSTEM_APP_NAME,
            &reference_id,
            OperationType::GrantPurchase,
            license_id,
            asset_did,
            amount,
        );
        tx.insert_operation(&operation).await?;
        tx.insert_operation_grant(&OperationGrant::new(&operation, grant.grant_id, amount))
            .await?;

        self.settle_debt(&mut *tx, license_id, asset_did, SYSTEM_APP_NAME, &reference_id)
            .await?;

        tx.commit().await?;
        Ok(operation)
    }

    /// Bind a chain confirmation to the oldest pending grant with this
    /// `tx_hash`, or record a directly-confirmed grant when the burn was
    /// never initiated through us. Replays return `AlreadyPerformed`.
    pub async fn confirm_grant(
        &self,
        license_id: &str,
        asset_did: &str,
        tx_hash: &str,
        log_index: i64,
        amount: i64,
        mint_time: DateTime<Utc>,
    ) -> Result<Operation, LedgerError> {
        if amount < 0 || log_index < 0 {
            return Err(LedgerError::InvalidAmount);
        }
        let start = Instant::now();
        let result = retry_on_deadlock(|| {
            self.confirm_grant_once(license_id, asset_did, tx_hash, log_index, amount, mint_time)
        })
        .await;
        histogram!("credit_ledger.operation.duration_ms", "op" => "confirm_grant")
            .record(start.elapsed().as_millis() as f64);
        result
    }

    async fn confirm_grant_once(
        &self,
        license_id: &str,
        asset_did: &str,
        tx_hash: &str,
        log_index: i64,
        amount: i64,
        mint_time: DateTime<Utc>,
    ) -> Result<Operation, LedgerError> {
        let mut tx = self.store.begin().await?;

        let grant_id = match tx
            .find_pending_grant(license_id, asset_did, tx_hash)
            .await?
        {
            Some(pending) => {
                tx.update_grant_confirmed(pending.grant_id, log_index).await?;
                pending.grant_id
            }
            None => {
                // Chain event without a prior pending grant. The unique
                // `(tx_hash, log_index)` constraint turns a replayed
                // confirmation into `AlreadyPerformed` here.
                let expires_at = grant::expiry_for_mint_time(mint_time)
                    .ok_or(LedgerError::ArithmeticOverflow)?;
                let confirmed = Grant::new_confirmed(
                    license_id, asset_did, amount, tx_hash, log_index, expires_at,
                );
                tx.insert_grant(&confirmed).await?;
                confirmed.grant_id
            }
        };

        let reference_id = grant_id.to_string();
        let operation = Operation::new(
            SYSTEM_APP_NAME,
            &reference_id,
            OperationType::GrantConfirm,
            license_id,
            asset_did,
            amount,
        );
        tx.insert_operation(&operation).await?;
        tx.insert_operation_grant(&OperationGrant::new(&operation, grant_id, amount))
            .await?;

        self.settle_debt(&mut *tx, license_id, asset_did, SYSTEM_APP_NAME, &reference_id)
            .await?;

        tx.commit().await?;
        Ok(operation)
    }

    /// Mark the oldest pending grant with this `tx_hash` as failed (chain
    /// reverted). Spent credits become outstanding debt, settled by the
    /// next credit inflow; an unknown grant is a no-op.
    pub async fn fail_grant(
        &self,
        license_id: &str,
        asset_did: &str,
        tx_hash: &str,
    ) -> Result<(), LedgerError> {
        let start = Instant::now();
        let result = retry_on_deadlock(|| {
            self.fail_grant_once(license_id, asset_did, tx_hash)
        })
        .await;
        histogram!("credit_ledger.operation.duration_ms", "op" => "fail_grant")
            .record(start.elapsed().as_millis() as f64);
        result
    }

    async fn fail_grant_once(
        &self,
        license_id: &str,
        asset_did: &str,
        tx_hash: &str,
    ) -> Result<(), LedgerError> {
        let mut tx = self.store.begin().await?;
        match tx.find_pending_grant(license_id, asset_did, tx_hash).await? {
            Some(pending) => {
                tx.mark_grant_failed(pending.grant_id).await?;
                tx.commit().await?;
                tracing::info!(
                    grant_id = %pending.grant_id,
                    tx_hash,
                    debt = pending.debt(),
                    "grant failed on chain"
                );
            }
            None => {
                tx.rollback().await.ok();
                tracing::warn!(tx_hash, "no pending grant to fail");
            }
        }
        Ok(())
    }

    /// Move credits from active grants into failed grants that carry debt,
    /// FIFO on both sides, until the debt or the balance runs out. Runs
    /// inside the caller's transaction; both movements are recorded as
    /// positive `amount_used` rows under one `debt_settlement` operation.
    async fn settle_debt(
        &self,
        tx: &mut dyn StoreTx,
        license_id: &str,
        asset_did: &str,
        app_name: &str,
        reference_id: &str,
    ) -> Result<(), LedgerError> {
        let debt = tx.sum_outstanding_debt(license_id, asset_did).await?;
        if debt == 0 {
            return Ok(());
        }
        let balance = tx.sum_active_balance(license_id, asset_did).await?;
        if balance == 0 {
            return Ok(());
        }

        let operation = Operation::new(
            app_name,
            reference_id,
            OperationType::DebtSettlement,
            license_id,
            asset_did,
            debt.min(balance),
        );
        tx.insert_operation(&operation).await?;

        let failed = tx.list_failed_grants_with_debt(license_id, asset_did).await?;
        let mut active = tx.list_active_grants(license_id, asset_did).await?;

        for f in &failed {
            let grant_debt = f.debt();
            let mut left = grant_debt;
            let mut contributed = false;

            for a in active.iter_mut() {
                if left == 0 {
                    break;
                }
                let take = left.min(a.remaining_amount);
                if take == 0 {
                    continue;
                }
                a.remaining_amount -= take;
                tx.update_grant_remaining(a.grant_id, a.remaining_amount)
                    .await?;
                tx.insert_operation_grant(&OperationGrant::new(&operation, a.grant_id, take))
                    .await?;
                left -= take;
                contributed = true;
            }

            // Active balance exhausted; later failed grants stay in debt.
            if !contributed {
                break;
            }

            let settled = grant_debt - left;
            if settled > 0 {
                let restored = f
                    .remaining_amount
                    .checked_add(settled)
                    .ok_or(LedgerError::ArithmeticOverflow)?;
                tx.update_grant_remaining(f.grant_id, restored).await?;
                tx.insert_operation_grant(&OperationGrant::new(&operation, f.grant_id, settled))
                    .await?;
            }
        }

        Ok(())
    }
}
