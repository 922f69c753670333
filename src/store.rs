// src/store.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::grant::Grant;
use crate::operation::{Operation, OperationGrant, OperationType};
use crate::report::UsageTotals;

/// Relational persistence for grants, operations, and operation-grant
/// rows. Mutations run inside a transaction handle obtained from `begin`;
/// the two reads here are deliberately non-transactional snapshots.
#[async_trait]
pub trait Store: Send + Sync {
    /// Start a read-committed transaction.
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError>;

    /// Sum of `initial_amount - remaining_amount` over failed grants that
    /// still carry debt. Snapshot read outside any transaction.
    async fn sum_outstanding_debt(
        &self,
        license_id: &str,
        asset_did: &str,
    ) -> Result<i64, StoreError>;

    /// Operation aggregates for the usage reports, bounded to
    /// `created_at in [from, to]` (`to = None` means unbounded) and
    /// optionally to one asset.
    async fn usage_for_license(
        &self,
        license_id: &str,
        asset_did: Option<&str>,
        from: DateTime<Utc>,
        to: Option<DateTime<Utc>>,
    ) -> Result<UsageTotals, StoreError>;
}

/// One open transaction. Locking reads take exclusive row locks so that
/// mutators of the same `(license_id, asset_did)` partition serialize;
/// dropping the handle without `commit` rolls back.
#[async_trait]
pub trait StoreTx: Send {
    /// Grants eligible for FIFO consumption: pending or confirmed, with
    /// remaining credits, not expired. Ordered by
    /// `(expires_at, created_at, grant_id)` ascending. Locks the rows.
    async fn list_active_grants(
        &mut self,
        license_id: &str,
        asset_did: &str,
    ) -> Result<Vec<Grant>, StoreError>;

    /// Failed grants with `remaining_amount < initial_amount`, ordered by
    /// `(created_at, grant_id)` ascending. Locks the rows.
    async fn list_failed_grants_with_debt(
        &mut self,
        license_id: &str,
        asset_did: &str,
    ) -> Result<Vec<Grant>, StoreError>;

    /// Sum of `remaining_amount` over the active-grant predicate. No lock.
    async fn sum_active_balance(
        &mut self,
        license_id: &str,
        asset_did: &str,
    ) -> Result<i64, StoreError>;

    /// Transactional variant of the debt sum, consistent with rows written
    /// earlier in this transaction.
    async fn sum_outstanding_debt(
        &mut self,
        license_id: &str,
        asset_did: &str,
    ) -> Result<i64, StoreError>;

    /// Oldest pending grant carrying this `tx_hash`, locked.
    async fn find_pending_grant(
        &mut self,
        license_id: &str,
        asset_did: &str,
        tx_hash: &str,
    ) -> Result<Option<Grant>, StoreError>;

    async fn insert_grant(&mut self, grant: &Grant) -> Result<(), StoreError>;

    async fn update_grant_remaining(
        &mut self,
        grant_id: Uuid,
        remaining_amount: i64,
    ) -> Result<(), StoreError>;

    async fn update_grant_confirmed(
        &mut self,
        grant_id: Uuid,
        log_index: i64,
    ) -> Result<(), StoreError>;

    async fn mark_grant_failed(&mut self, grant_id: Uuid) -> Result<(), StoreError>;

    /// Fails with `StoreError::DuplicateKey` when an operation with the
    /// same `(app_name, reference_id, operation_type)` already exists.
    async fn insert_operation(&mut self, operation: &Operation) -> Result<(), StoreError>;

    async fn insert_operation_grant(&mut self, row: &OperationGrant) -> Result<(), StoreError>;

    /// The operation under the given tuple together with its grant rows
    /// and the referenced grants in their current state, grants locked.
    async fn load_operation_with_grants(
        &mut self,
        app_name: &str,
        reference_id: &str,
        operation_type: OperationType,
    ) -> Result<Option<(Operation, Vec<(OperationGrant, Grant)>)>, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}
