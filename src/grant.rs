// src/grant.rs
use chrono::{DateTime, Months, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GrantStatus {
    Pending,
    Confirmed,
    Failed,
}

impl GrantStatus {
    pub fn can_transition_to(&self, target: GrantStatus) -> bool {
        match (self, target) {
            (s1, s2) if s1 == &s2 => true,
            (GrantStatus::Pending, GrantStatus::Confirmed) => true,
            (GrantStatus::Pending, GrantStatus::Failed) => true,
            _ => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, GrantStatus::Pending)
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self, GrantStatus::Confirmed)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, GrantStatus::Failed)
    }

    /// Pending grants spend exactly like confirmed ones (overdraft-on-pending).
    pub fn is_spendable(&self) -> bool {
        !self.is_failed()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GrantStatus::Pending => "pending",
            GrantStatus::Confirmed => "confirmed",
            GrantStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<GrantStatus> {
        match s {
            "pending" => Some(GrantStatus::Pending),
            "confirmed" => Some(GrantStatus::Confirmed),
            "failed" => Some(GrantStatus::Failed),
            _ => None,
        }
    }
}

/// Grants live for exactly one calendar month (UTC) from the on-chain mint
/// time. `None` only when the month addition leaves the representable range.
pub fn expiry_for_mint_time(mint_time: DateTime<Utc>) -> Option<DateTime<Utc>> {
    mint_time.checked_add_months(Months::new(1))
}

/// A batch of credits acquired from one on-chain token burn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Grant {
    pub grant_id: Uuid,
    pub license_id: String,
    pub asset_did: String,
    pub initial_amount: i64,
    pub remaining_amount: i64,
    pub status: GrantStatus,
    pub tx_hash: String,
    pub log_index: Option<i64>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Grant {
    pub fn new_pending(
        license_id: &str,
        asset_did: &str,
        amount: i64,
        tx_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            grant_id: Uuid::now_v7(),
            license_id: license_id.to_string(),
            asset_did: asset_did.to_string(),
            initial_amount: amount,
            remaining_amount: amount,
            status: GrantStatus::Pending,
            tx_hash: tx_hash.to_string(),
            log_index: None,
            expires_at,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn new_confirmed(
        license_id: &str,
        asset_did: &str,
        amount: i64,
        tx_hash: &str,
        log_index: i64,
        expires_at: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            grant_id: Uuid::now_v7(),
            license_id: license_id.to_string(),
            asset_did: asset_did.to_string(),
            initial_amount: amount,
            remaining_amount: amount,
            status: GrantStatus::Confirmed,
            tx_hash: tx_hash.to_string(),
            log_index: Some(log_index),
            expires_at,
            created_at: now,
            updated_at: now,
        }
    }

    /// Credits spent against this grant that never materialized on-chain.
    /// Only meaningful for failed grants.
    pub fn debt(&self) -> i64 {
        self.initial_amount - self.remaining_amount
    }

    pub fn has_debt(&self) -> bool {
        self.status.is_failed() && self.remaining_amount < self.initial_amount
    }

    /// Whether this grant participates in FIFO consumption at `now`.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.status.is_spendable() && self.remaining_amount > 0 && self.expires_at > now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_expiry_is_one_calendar_month() {
        let mint = Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap();
        let expiry = expiry_for_mint_time(mint).unwrap();
        assert_eq!(expiry, Utc.with_ymd_and_hms(2024, 4, 15, 12, 0, 0).unwrap());
    }

    #[test]
    fn test_expiry_clamps_to_month_end() {
        // Jan 31 + 1 month lands on the last day of February.
        let mint = Utc.with_ymd_and_hms(2024, 1, 31, 8, 30, 0).unwrap();
        let expiry = expiry_for_mint_time(mint).unwrap();
        assert_eq!(expiry, Utc.with_ymd_and_hms(2024, 2, 29, 8, 30, 0).unwrap());
    }

    #[test]
    fn test_status_transitions() {
        assert!(GrantStatus::Pending.can_transition_to(GrantStatus::Confirmed));
        assert!(GrantStatus::Pending.can_transition_to(GrantStatus::Failed));
        assert!(!GrantStatus::Confirmed.can_transition_to(GrantStatus::Pending));
        assert!(!GrantStatus::Failed.can_transition_to(GrantStatus::Confirmed));
    }

    #[test]
    fn test_pending_is_spendable() {
        assert!(GrantStatus::Pending.is_spendable());
        assert!(GrantStatus::Confirmed.is_spendable());
        assert!(!GrantStatus::Failed.is_spendable());
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            GrantStatus::Pending,
            GrantStatus::Confirmed,
            GrantStatus::Failed,
        ] {
            assert_eq!(GrantStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(GrantStatus::parse("revoked"), None);
    }
}
