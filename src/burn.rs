// src/burn.rs
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::LedgerError;
use crate::ledger::Ledger;
use crate::operation::Operation;

/// Credits minted per on-demand burn when a deduction comes up short.
pub const DEFAULT_BURN_AMOUNT: i64 = 50_000;

/// Proof that a burn transaction was submitted on chain. The receipt feeds
/// straight into `Ledger::create_grant` so the pending grant is spendable
/// before the deduction is retried.
#[derive(Debug, Clone)]
pub struct GrantReceipt {
    pub tx_hash: String,
    pub amount: i64,
    pub mint_time: DateTime<Utc>,
}

/// Submits token burns on chain. Implementations signal
/// `LedgerError::GrantAlreadyInFlight` when another flow already has a
/// burn under way for the partition; the orchestrator treats that as
/// success.
#[async_trait]
pub trait BurnInitiator: Send + Sync {
    async fn initiate_burn(
        &self,
        license_id: &str,
        asset_did: &str,
        amount: i64,
    ) -> Result<GrantReceipt, LedgerError>;
}

/// Wraps `Ledger::deduct` with on-demand minting: one burn, one retry.
/// A second `InsufficientCredits` after the burn is fatal so a broken
/// burn pipeline cannot mint in a loop.
pub struct BurnOrchestrator {
    ledger: Ledger,
    initiator: Arc<dyn BurnInitiator>,
    burn_amount: i64,
}

impl BurnOrchestrator {
    pub fn new(ledger: Ledger, initiator: Arc<dyn BurnInitiator>) -> Self {
        Self {
            ledger,
            initiator,
            burn_amount: DEFAULT_BURN_AMOUNT,
        }
    }

    pub fn with_burn_amount(mut self, amount: i64) -> Self {
        self.burn_amount = amount;
        self
    }

    pub async fn deduct_with_auto_burn(
        &self,
        license_id: &str,
        asset_did: &str,
        amount: i64,
        app_name: &str,
        reference_id: &str,
    ) -> Result<Operation, LedgerError> {
        match self
            .ledger
            .deduct(license_id, asset_did, amount, app_name, reference_id)
            .await
        {
            Err(LedgerError::InsufficientCredits {
                available,
                requested,
            }) => {
                tracing::info!(
                    license_id,
                    asset_did,
                    available,
                    requested,
                    "balance short, initiating burn"
                );
            }
            other => return other,
        }

        match self
            .initiator
            .initiate_burn(license_id, asset_did, self.burn_amount)
            .await
        {
            Ok(receipt) => {
                tracing::info!(
                    license_id,
                    asset_did,
                    tx_hash = %receipt.tx_hash,
                    amount = receipt.amount,
                    "burn submitted"
                );
                match self
                    .ledger
                    .create_grant(
                        license_id,
                        asset_did,
                        receipt.amount,
                        &receipt.tx_hash,
                        receipt.mint_time,
                    )
                    .await
                {
                    Ok(_) | Err(LedgerError::AlreadyPerformed) => {}
                    Err(err) => return Err(err),
                }
            }
            Err(LedgerError::GrantAlreadyInFlight) => {
                tracing::debug!(license_id, asset_did, "burn already in flight");
            }
            Err(err) => return Err(LedgerError::BurnFailed(err.to_string())),
        }

        // Exactly one retry.
        match self
            .ledger
            .deduct(license_id, asset_did, amount, app_name, reference_id)
            .await
        {
            Err(LedgerError::InsufficientCredits { .. }) => {
                Err(LedgerError::BurnDidNotRestoreBalance)
            }
            other => other,
        }
    }
}
