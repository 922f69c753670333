//! # credit-ledger
//!
//! A FIFO grant-consumption credit ledger for developer-metering
//! services. Per-`(license, asset)` balances are funded by externally
//! observed on-chain token burns and consumed by upstream API services,
//! atomically and idempotently under arbitrary concurrency.
//!
//! ## What's inside
//!
//! ### Grants
//! Credits arrive in **grants**, one per token burn. A grant is created
//! `pending` when this service initiates the burn (and is spendable
//! immediately: overdraft-on-pending), becomes `confirmed` when the
//! chain event lands, or `failed` when the chain reverts. Grants expire
//! one calendar month after their mint time and are never deleted.
//!
//! ### FIFO consumption
//! Deductions walk the partition's active grants ordered by
//! `(expires_at, created_at, grant_id)`, locking the rows `FOR UPDATE`;
//! two concurrent deductions serialize on those locks, so consumption
//! order is total within a partition.
//!
//! ### At-most-once operations
//! Every caller-visible action is an **operation** keyed by
//! `(app_name, reference_id, operation_type)`. A replay conflicts on the
//! store's unique constraint and surfaces as `AlreadyPerformed`, never a
//! silent success that could double-debit.
//!
//! ### Debt settlement
//! Credits spent against a grant that later fails become **debt**. Debt
//! blocks further deductions and is settled automatically by the next
//! credit inflow (grant purchase, confirmation, or refund), moving value
//! from active grants back into the failed ones.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use credit_ledger::{Ledger, PostgresStore};
//!
//! let store = PostgresStore::from_pool(pool);
//! store.init_schema().await?;
//!
//! let ledger = Ledger::new(Arc::new(store));
//! ledger.deduct(license, asset, 100, "telemetry", "req-1").await?;
//! ```
//!
//! The blockchain side stays behind two seams: [`BurnInitiator`] submits
//! burns when a deduction comes up short (driven by [`BurnOrchestrator`]),
//! and [`ConfirmationSource`] feeds chain events into the ledger (driven
//! by [`ConfirmationWorker`]).

pub mod adapters;
pub mod burn;
pub mod confirm;
pub mod error;
pub mod grant;
pub mod ledger;
pub mod operation;
pub mod report;
pub mod retry;
pub mod store;

pub use adapters::memory::MemoryStore;
pub use adapters::postgres::PostgresStore;
pub use burn::{BurnInitiator, BurnOrchestrator, GrantReceipt, DEFAULT_BURN_AMOUNT};
pub use confirm::{ChainEvent, ConfirmationSource, ConfirmationWorker};
pub use error::{LedgerError, StoreError};
pub use grant::{Grant, GrantStatus};
pub use ledger::Ledger;
pub use operation::{Operation, OperationGrant, OperationType, SYSTEM_APP_NAME};
pub use report::{LicenseAssetUsage, Reports, UsageTotals};
pub use store::{Store, StoreTx};
