// src/operation.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// `app_name` used for operations the ledger performs on its own behalf
/// (grant purchases, confirmations, and their settlements).
pub const SYSTEM_APP_NAME: &str = "credit_tracker";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Deduction,
    Refund,
    GrantPurchase,
    GrantConfirm,
    DebtSettlement,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Deduction => "deduction",
            OperationType::Refund => "refund",
            OperationType::GrantPurchase => "grant_purchase",
            OperationType::GrantConfirm => "grant_confirm",
            OperationType::DebtSettlement => "debt_settlement",
        }
    }

    pub fn parse(s: &str) -> Option<OperationType> {
        match s {
            "deduction" => Some(OperationType::Deduction),
            "refund" => Some(OperationType::Refund),
            "grant_purchase" => Some(OperationType::GrantPurchase),
            "grant_confirm" => Some(OperationType::GrantConfirm),
            "debt_settlement" => Some(OperationType::DebtSettlement),
            _ => None,
        }
    }
}

/// One caller-observed ledger action. The `(app_name, reference_id,
/// operation_type)` tuple is the idempotency key; the store rejects a
/// second insert under the same tuple.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub app_name: String,
    pub reference_id: String,
    pub operation_type: OperationType,
    pub license_id: String,
    pub asset_did: String,
    pub total_amount: i64,
    pub created_at: DateTime<Utc>,
}

impl Operation {
    pub fn new(
        app_name: &str,
        reference_id: &str,
        operation_type: OperationType,
        license_id: &str,
        asset_did: &str,
        total_amount: i64,
    ) -> Self {
        Self {
            app_name: app_name.to_string(),
            reference_id: reference_id.to_string(),
            operation_type,
            license_id: license_id.to_string(),
            asset_did: asset_did.to_string(),
            total_amount,
            created_at: Utc::now(),
        }
    }
}

/// One grant-level accounting row of an operation. `amount_used` is
/// negative for deductions and positive for every other movement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationGrant {
    pub id: Uuid,
    pub app_name: String,
    pub reference_id: String,
    pub operation_type: OperationType,
    pub grant_id: Uuid,
    pub amount_used: i64,
    pub created_at: DateTime<Utc>,
}

impl OperationGrant {
    pub fn new(operation: &Operation, grant_id: Uuid, amount_used: i64) -> Self {
        Self {
            id: Uuid::now_v7(),
            app_name: operation.app_name.clone(),
            reference_id: operation.reference_id.clone(),
            operation_type: operation.operation_type,
            grant_id,
            amount_used,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_type_round_trip() {
        for op_type in [
            OperationType::Deduction,
            OperationType::Refund,
            OperationType::GrantPurchase,
            OperationType::GrantConfirm,
            OperationType::DebtSettlement,
        ] {
            assert_eq!(OperationType::parse(op_type.as_str()), Some(op_type));
        }
        assert_eq!(OperationType::parse("transfer"), None);
    }

    #[test]
    fn test_operation_grant_carries_the_operation_tuple() {
        let op = Operation::new(
            "telemetry",
            "req-1",
            OperationType::Deduction,
            "0xlicense",
            "did:erc721:1:0xabc:7",
            100,
        );
        let row = OperationGrant::new(&op, Uuid::now_v7(), -100);
        assert_eq!(row.app_name, op.app_name);
        assert_eq!(row.reference_id, op.reference_id);
        assert_eq!(row.operation_type, op.operation_type);
        assert_eq!(row.amount_used, -100);
    }
}
