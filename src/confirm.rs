// src/confirm.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::error::LedgerError;
use crate::ledger::Ledger;

/// Chain events the ledger cares about.
#[derive(Debug, Clone)]
pub enum ChainEvent {
    GrantConfirmed {
        license_id: String,
        asset_did: String,
        tx_hash: String,
        log_index: i64,
        amount: i64,
        mint_time: DateTime<Utc>,
    },
    GrantFailed {
        license_id: String,
        asset_did: String,
        tx_hash: String,
    },
}

/// A checkpointed stream of chain events. `next_event` returns `None` when
/// the stream ends; `commit_progress` is only called after the ledger has
/// durably applied the preceding event.
#[async_trait]
pub trait ConfirmationSource: Send {
    async fn next_event(&mut self) -> Result<Option<ChainEvent>, LedgerError>;
    async fn commit_progress(&mut self) -> Result<(), LedgerError>;
}

/// Drains a `ConfirmationSource` into the ledger. Replayed confirmations
/// (`AlreadyPerformed`) count as applied, so the source can always move
/// its checkpoint forward.
pub struct ConfirmationWorker {
    ledger: Ledger,
}

impl ConfirmationWorker {
    pub fn new(ledger: Ledger) -> Self {
        Self { ledger }
    }

    pub async fn run<S: ConfirmationSource>(
        &self,
        mut source: S,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), LedgerError> {
        loop {
            let event = tokio::select! {
                _ = shutdown.changed() => {
                    tracing::info!("confirmation worker shutting down");
                    return Ok(());
                }
                event = source.next_event() => event?,
            };
            let Some(event) = event else {
                return Ok(());
            };

            self.apply(&event).await?;
            source.commit_progress().await?;
        }
    }

    pub async fn apply(&self, event: &ChainEvent) -> Result<(), LedgerError> {
        match event {
            ChainEvent::GrantConfirmed {
                license_id,
                asset_did,
                tx_hash,
                log_index,
                amount,
                mint_time,
            } => {
                match self
                    .ledger
                    .confirm_grant(
                        license_id, asset_did, tx_hash, *log_index, *amount, *mint_time,
                    )
                    .await
                {
                    Ok(_) => Ok(()),
                    Err(LedgerError::AlreadyPerformed) => {
                        tracing::debug!(
                            tx_hash = %tx_hash,
                            log_index = *log_index,
                            "confirmation replayed"
                        );
                        Ok(())
                    }
                    Err(err) => Err(err),
                }
            }
            ChainEvent::GrantFailed {
                license_id,
                asset_did,
                tx_hash,
            } => self.ledger.fail_grant(license_id, asset_did, tx_hash).await,
        }
    }
}
