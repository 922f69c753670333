// src/adapters/memory.rs
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::error::StoreError;
use crate::grant::{Grant, GrantStatus};
use crate::operation::{Operation, OperationGrant, OperationType};
use crate::report::UsageTotals;
use crate::store::{Store, StoreTx};

#[derive(Default, Clone)]
struct MemoryState {
    grants: HashMap<Uuid, Grant>,
    operations: Vec<Operation>,
    operation_grants: Vec<OperationGrant>,
}

/// In-memory store for tests. The transaction handle holds the state
/// mutex for its entire lifetime (the in-memory equivalent of
/// BEGIN / FOR UPDATE / COMMIT) and restores a begin-time snapshot on
/// rollback, so transactional semantics match the SQL adapter.
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
        }
    }

    // Snapshot accessors for test assertions.

    pub async fn grants_for(&self, license_id: &str, asset_did: &str) -> Vec<Grant> {
        let state = self.state.lock().await;
        let mut grants: Vec<Grant> = state
            .grants
            .values()
            .filter(|g| g.license_id == license_id && g.asset_did == asset_did)
            .cloned()
            .collect();
        grants.sort_by_key(|g| (g.created_at, g.grant_id));
        grants
    }

    pub async fn operations(&self) -> Vec<Operation> {
        self.state.lock().await.operations.clone()
    }

    pub async fn operation_grants(&self) -> Vec<OperationGrant> {
        self.state.lock().await.operation_grants.clone()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn outstanding_debt(state: &MemoryState, license_id: &str, asset_did: &str) -> i64 {
    state
        .grants
        .values()
        .filter(|g| g.license_id == license_id && g.asset_did == asset_did && g.has_debt())
        .map(|g| g.debt())
        .sum()
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        let snapshot = guard.clone();
        Ok(Box::new(MemoryTx {
            guard,
            snapshot: Some(snapshot),
        }))
    }

    async fn sum_outstanding_debt(
        &self,
        license_id: &str,
        asset_did: &str,
    ) -> Result<i64, StoreError> {
        let state = self.state.lock().await;
        Ok(outstanding_debt(&state, license_id, asset_did))
    }

    async fn usage_for_license(
        &self,
        license_id: &str,
        asset_did: Option<&str>,
        from: DateTime<Utc>,
        to: Option<DateTime<Utc>>,
    ) -> Result<UsageTotals, StoreError> {
        let state = self.state.lock().await;

        let mut totals = UsageTotals::default();
        let mut assets: HashSet<&str> = HashSet::new();

        for op in state.operations.iter().filter(|op| {
            op.license_id == license_id
                && asset_did.is_none_or(|a| op.asset_did == a)
                && op.created_at >= from
                && to.is_none_or(|t| op.created_at <= t)
        }) {
            assets.insert(op.asset_did.as_str());
            match op.operation_type {
                OperationType::GrantConfirm => totals.num_grants_confirmed += 1,
                OperationType::Deduction => totals.net_credits_used += op.total_amount,
                OperationType::Refund => totals.net_credits_used -= op.total_amount,
                _ => {}
            }
        }

        totals.num_distinct_assets = assets.len() as i64;
        Ok(totals)
    }
}

struct MemoryTx {
    guard: OwnedMutexGuard<MemoryState>,
    // Present until commit; restored on rollback or drop.
    snapshot: Option<MemoryState>,
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        // An uncommitted transaction rolls back, same as the SQL driver.
        if let Some(snapshot) = self.snapshot.take() {
            *self.guard = snapshot;
        }
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn list_active_grants(
        &mut self,
        license_id: &str,
        asset_did: &str,
    ) -> Result<Vec<Grant>, StoreError> {
        let now = Utc::now();
        let mut grants: Vec<Grant> = self
            .guard
            .grants
            .values()
            .filter(|g| {
                g.license_id == license_id && g.asset_did == asset_did && g.is_active(now)
            })
            .cloned()
            .collect();
        grants.sort_by_key(|g| (g.expires_at, g.created_at, g.grant_id));
        Ok(grants)
    }

    async fn list_failed_grants_with_debt(
        &mut self,
        license_id: &str,
        asset_did: &str,
    ) -> Result<Vec<Grant>, StoreError> {
        let mut grants: Vec<Grant> = self
            .guard
            .grants
            .values()
            .filter(|g| g.license_id == license_id && g.asset_did == asset_did && g.has_debt())
            .cloned()
            .collect();
        grants.sort_by_key(|g| (g.created_at, g.grant_id));
        Ok(grants)
    }

    async fn sum_active_balance(
        &mut self,
        license_id: &str,
        asset_did: &str,
    ) -> Result<i64, StoreError> {
        let now = Utc::now();
        Ok(self
            .guard
            .grants
            .values()
            .filter(|g| {
                g.license_id == license_id && g.asset_did == asset_did && g.is_active(now)
            })
            .map(|g| g.remaining_amount)
            .sum())
    }

    async fn sum_outstanding_debt(
        &mut self,
        license_id: &str,
        asset_did: &str,
    ) -> Result<i64, StoreError> {
        Ok(outstanding_debt(&self.guard, license_id, asset_did))
    }

    async fn find_pending_grant(
        &mut self,
        license_id: &str,
        asset_did: &str,
        tx_hash: &str,
    ) -> Result<Option<Grant>, StoreError> {
        let mut pending: Vec<&Grant> = self
            .guard
            .grants
            .values()
            .filter(|g| {
                g.license_id == license_id
                    && g.asset_did == asset_did
                    && g.tx_hash == tx_hash
                    && g.status.is_pending()
            })
            .collect();
        pending.sort_by_key(|g| (g.created_at, g.grant_id));
        Ok(pending.first().map(|g| (*g).clone()))
    }

    async fn insert_grant(&mut self, grant: &Grant) -> Result<(), StoreError> {
        if grant.log_index.is_some()
            && self.guard.grants.values().any(|existing| {
                existing.tx_hash == grant.tx_hash && existing.log_index == grant.log_index
            })
        {
            return Err(StoreError::DuplicateKey);
        }
        self.guard.grants.insert(grant.grant_id, grant.clone());
        Ok(())
    }

    async fn update_grant_remaining(
        &mut self,
        grant_id: Uuid,
        remaining_amount: i64,
    ) -> Result<(), StoreError> {
        let grant = self
            .guard
            .grants
            .get_mut(&grant_id)
            .ok_or(StoreError::NotFound)?;
        grant.remaining_amount = remaining_amount;
        grant.updated_at = Utc::now();
        Ok(())
    }

    async fn update_grant_confirmed(
        &mut self,
        grant_id: Uuid,
        log_index: i64,
    ) -> Result<(), StoreError> {
        let tx_hash = self
            .guard
            .grants
            .get(&grant_id)
            .ok_or(StoreError::NotFound)?
            .tx_hash
            .clone();
        if self.guard.grants.values().any(|existing| {
            existing.grant_id != grant_id
                && existing.tx_hash == tx_hash
                && existing.log_index == Some(log_index)
        }) {
            return Err(StoreError::DuplicateKey);
        }

        let grant = self
            .guard
            .grants
            .get_mut(&grant_id)
            .ok_or(StoreError::NotFound)?;
        grant.status = GrantStatus::Confirmed;
        grant.log_index = Some(log_index);
        grant.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_grant_failed(&mut self, grant_id: Uuid) -> Result<(), StoreError> {
        let grant = self
            .guard
            .grants
            .get_mut(&grant_id)
            .ok_or(StoreError::NotFound)?;
        grant.status = GrantStatus::Failed;
        grant.updated_at = Utc::now();
        Ok(())
    }

    async fn insert_operation(&mut self, operation: &Operation) -> Result<(), StoreError> {
        // Duplicate check and insert are atomic while holding the mutex.
        let duplicate = self.guard.operations.iter().any(|existing| {
            existing.app_name == operation.app_name
                && existing.reference_id == operation.reference_id
                && existing.operation_type == operation.operation_type
        });
        if duplicate {
            return Err(StoreError::DuplicateKey);
        }
        self.guard.operations.push(operation.clone());
        Ok(())
    }

    async fn insert_operation_grant(&mut self, row: &OperationGrant) -> Result<(), StoreError> {
        self.guard.operation_grants.push(row.clone());
        Ok(())
    }

    async fn load_operation_with_grants(
        &mut self,
        app_name: &str,
        reference_id: &str,
        operation_type: OperationType,
    ) -> Result<Option<(Operation, Vec<(OperationGrant, Grant)>)>, StoreError> {
        let Some(operation) = self
            .guard
            .operations
            .iter()
            .find(|op| {
                op.app_name == app_name
                    && op.reference_id == reference_id
                    && op.operation_type == operation_type
            })
            .cloned()
        else {
            return Ok(None);
        };

        let rows: Vec<OperationGrant> = self
            .guard
            .operation_grants
            .iter()
            .filter(|row| {
                row.app_name == app_name
                    && row.reference_id == reference_id
                    && row.operation_type == operation_type
            })
            .cloned()
            .collect();

        let mut pairs = Vec::with_capacity(rows.len());
        for row in rows {
            let grant = self
                .guard
                .grants
                .get(&row.grant_id)
                .cloned()
                .ok_or(StoreError::NotFound)?;
            pairs.push((row, grant));
        }

        Ok(Some((operation, pairs)))
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        self.snapshot = None;
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<(), StoreError> {
        if let Some(snapshot) = self.snapshot.take() {
            *self.guard = snapshot;
        }
        Ok(())
    }
}
