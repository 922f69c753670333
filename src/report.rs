// src/report.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;
use crate::ledger::Ledger;

/// Operation aggregates for one license over a time window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageTotals {
    pub num_distinct_assets: i64,
    pub num_grants_confirmed: i64,
    /// `Σ deduction.total_amount − Σ refund.total_amount` over the window.
    pub net_credits_used: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LicenseAssetUsage {
    pub usage: UsageTotals,
    /// Signed current balance of the partition; negative encodes debt.
    pub current_remaining: i64,
}

/// Usage-report queries over the same store the ledger writes to.
/// `to = None` means no upper bound.
pub struct Reports {
    ledger: Ledger,
}

impl Reports {
    pub fn new(ledger: Ledger) -> Self {
        Self { ledger }
    }

    pub async fn usage_for_license(
        &self,
        license_id: &str,
        from: DateTime<Utc>,
        to: Option<DateTime<Utc>>,
    ) -> Result<UsageTotals, LedgerError> {
        validate_window(license_id, from, to)?;
        Ok(self
            .ledger
            .store()
            .usage_for_license(license_id, None, from, to)
            .await?)
    }

    pub async fn usage_for_license_asset(
        &self,
        license_id: &str,
        asset_did: &str,
        from: DateTime<Utc>,
        to: Option<DateTime<Utc>>,
    ) -> Result<LicenseAssetUsage, LedgerError> {
        validate_window(license_id, from, to)?;
        if asset_did.is_empty() {
            return Err(LedgerError::InvalidArguments(
                "asset_did is required".to_string(),
            ));
        }

        let usage = self
            .ledger
            .store()
            .usage_for_license(license_id, Some(asset_did), from, to)
            .await?;
        let current_remaining = self.ledger.get_balance(license_id, asset_did).await?;

        Ok(LicenseAssetUsage {
            usage,
            current_remaining,
        })
    }
}

fn validate_window(
    license_id: &str,
    from: DateTime<Utc>,
    to: Option<DateTime<Utc>>,
) -> Result<(), LedgerError> {
    if license_id.is_empty() {
        return Err(LedgerError::InvalidArguments(
            "license_id is required".to_string(),
        ));
    }
    if let Some(to) = to {
        if from > to {
            return Err(LedgerError::InvalidArguments(
                "from is after to".to_string(),
            ));
        }
    }
    if from > Utc::now() {
        return Err(LedgerError::InvalidArguments(
            "from is in the future".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Days;

    #[test]
    fn test_validate_window() {
        let now = Utc::now();
        let yesterday = now.checked_sub_days(Days::new(1)).unwrap();
        let tomorrow = now.checked_add_days(Days::new(1)).unwrap();

        assert!(validate_window("0xlicense", yesterday, None).is_ok());
        assert!(validate_window("0xlicense", yesterday, Some(now)).is_ok());

        assert!(matches!(
            validate_window("", yesterday, None),
            Err(LedgerError::InvalidArguments(_))
        ));
        assert!(matches!(
            validate_window("0xlicense", now, Some(yesterday)),
            Err(LedgerError::InvalidArguments(_))
        ));
        assert!(matches!(
            validate_window("0xlicense", tomorrow, None),
            Err(LedgerError::InvalidArguments(_))
        ));
    }
}
