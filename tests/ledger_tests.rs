// tests/ledger_tests.rs
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Days, Months, Utc};
use credit_ledger::{
    BurnInitiator, BurnOrchestrator, ChainEvent, ConfirmationSource, ConfirmationWorker,
    GrantReceipt, GrantStatus, Ledger, LedgerError, MemoryStore, OperationType, Reports,
};
use tokio::sync::watch;

const LICENSE: &str = "0x4De1bCf2B7E851E31216fC07989caA902A604784";
const ASSET: &str = "did:erc721:137:0x9c94C395cBcBDe662235E0A9d3bB87Ad708561BA:42";

fn setup() -> (Arc<MemoryStore>, Ledger) {
    let store = Arc::new(MemoryStore::new());
    let ledger = Ledger::new(store.clone());
    (store, ledger)
}

#[tokio::test]
async fn test_confirm_then_deduct() {
    let (store, ledger) = setup();

    ledger
        .confirm_grant(LICENSE, ASSET, "0x01", 1, 50_000, Utc::now())
        .await
        .unwrap();
    let op = ledger
        .deduct(LICENSE, ASSET, 100, "telemetry", "req-1")
        .await
        .unwrap();

    assert_eq!(op.total_amount, 100);
    assert_eq!(ledger.get_balance(LICENSE, ASSET).await.unwrap(), 49_900);

    let deductions: Vec<_> = store
        .operations()
        .await
        .into_iter()
        .filter(|op| op.operation_type == OperationType::Deduction)
        .collect();
    assert_eq!(deductions.len(), 1);
    assert_eq!(deductions[0].total_amount, 100);

    let rows: Vec<_> = store
        .operation_grants()
        .await
        .into_iter()
        .filter(|row| row.operation_type == OperationType::Deduction)
        .collect();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].amount_used, -100);
}

#[tokio::test]
async fn test_fifo_consumes_soonest_expiring_first() {
    let (store, ledger) = setup();

    // The first grant minted two days earlier expires first.
    let early_mint = Utc::now().checked_sub_days(Days::new(2)).unwrap();
    ledger
        .confirm_grant(LICENSE, ASSET, "0x01", 1, 5, early_mint)
        .await
        .unwrap();
    ledger
        .confirm_grant(LICENSE, ASSET, "0x02", 1, 50_000, Utc::now())
        .await
        .unwrap();

    ledger
        .deduct(LICENSE, ASSET, 10, "telemetry", "req-2")
        .await
        .unwrap();

    let grants = store.grants_for(LICENSE, ASSET).await;
    let g1 = grants.iter().find(|g| g.tx_hash == "0x01").unwrap();
    let g2 = grants.iter().find(|g| g.tx_hash == "0x02").unwrap();
    assert_eq!(g1.remaining_amount, 0);
    assert_eq!(g2.remaining_amount, 49_995);

    let rows: Vec<_> = store
        .operation_grants()
        .await
        .into_iter()
        .filter(|row| row.operation_type == OperationType::Deduction)
        .collect();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows.iter().map(|r| r.amount_used).sum::<i64>(), -10);
}

#[tokio::test]
async fn test_insufficient_credits() {
    let (store, ledger) = setup();

    // A zero-amount confirmation is legal and leaves nothing to spend.
    ledger
        .confirm_grant(LICENSE, ASSET, "0x02", 1, 0, Utc::now())
        .await
        .unwrap();

    let result = ledger.deduct(LICENSE, ASSET, 1, "telemetry", "req-3").await;
    assert!(matches!(
        result,
        Err(LedgerError::InsufficientCredits {
            available: 0,
            requested: 1
        })
    ));

    let deductions = store
        .operations()
        .await
        .into_iter()
        .filter(|op| op.operation_type == OperationType::Deduction)
        .count();
    assert_eq!(deductions, 0);
}

#[tokio::test]
async fn test_outstanding_debt_blocks_deduction() {
    let (_store, ledger) = setup();

    ledger
        .create_grant(LICENSE, ASSET, 50_000, "0xburn", Utc::now())
        .await
        .unwrap();
    ledger
        .deduct(LICENSE, ASSET, 500, "telemetry", "req-a")
        .await
        .unwrap();
    ledger.fail_grant(LICENSE, ASSET, "0xburn").await.unwrap();

    assert_eq!(ledger.get_balance(LICENSE, ASSET).await.unwrap(), -500);

    let result = ledger.deduct(LICENSE, ASSET, 1, "telemetry", "req-4").await;
    assert!(matches!(
        result,
        Err(LedgerError::OutstandingDebt { debt: 500 })
    ));
}

#[tokio::test]
async fn test_refund_restores_grant() {
    let (store, ledger) = setup();

    ledger
        .confirm_grant(LICENSE, ASSET, "0x01", 1, 50_000, Utc::now())
        .await
        .unwrap();
    ledger
        .deduct(LICENSE, ASSET, 100, "telemetry", "req-1")
        .await
        .unwrap();

    let refund = ledger.refund("telemetry", "req-1").await.unwrap();
    assert_eq!(refund.total_amount, 100);
    assert_eq!(ledger.get_balance(LICENSE, ASSET).await.unwrap(), 50_000);

    let rows: Vec<_> = store
        .operation_grants()
        .await
        .into_iter()
        .filter(|row| row.operation_type == OperationType::Refund)
        .collect();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].amount_used, 100);
}

#[tokio::test]
async fn test_create_grant_settles_debt() {
    let (store, ledger) = setup();

    // Build a failed grant carrying 100 of debt.
    ledger
        .create_grant(LICENSE, ASSET, 50_000, "0xburn1", Utc::now())
        .await
        .unwrap();
    ledger
        .deduct(LICENSE, ASSET, 100, "telemetry", "usage-1")
        .await
        .unwrap();
    ledger.fail_grant(LICENSE, ASSET, "0xburn1").await.unwrap();
    assert_eq!(ledger.get_balance(LICENSE, ASSET).await.unwrap(), -100);

    // The next purchase settles the debt out of the new grant.
    ledger
        .create_grant(LICENSE, ASSET, 50_000, "0xburn2", Utc::now())
        .await
        .unwrap();

    let grants = store.grants_for(LICENSE, ASSET).await;
    let failed = grants.iter().find(|g| g.tx_hash == "0xburn1").unwrap();
    let fresh = grants.iter().find(|g| g.tx_hash == "0xburn2").unwrap();
    assert_eq!(failed.remaining_amount, 50_000);
    assert_eq!(fresh.remaining_amount, 49_900);

    let settlements: Vec<_> = store
        .operations()
        .await
        .into_iter()
        .filter(|op| op.operation_type == OperationType::DebtSettlement)
        .collect();
    assert_eq!(settlements.len(), 1);
    assert_eq!(settlements[0].total_amount, 100);

    assert_eq!(ledger.get_balance(LICENSE, ASSET).await.unwrap(), 49_900);
}

#[tokio::test]
async fn test_deduction_replay_is_already_performed() {
    let (store, ledger) = setup();

    ledger
        .confirm_grant(LICENSE, ASSET, "0x01", 1, 50_000, Utc::now())
        .await
        .unwrap();
    ledger
        .deduct(LICENSE, ASSET, 100, "telemetry", "req-1")
        .await
        .unwrap();

    let replay = ledger
        .deduct(LICENSE, ASSET, 100, "telemetry", "req-1")
        .await;
    assert!(matches!(replay, Err(LedgerError::AlreadyPerformed)));

    // The replay changed nothing.
    assert_eq!(ledger.get_balance(LICENSE, ASSET).await.unwrap(), 49_900);
    let deductions = store
        .operations()
        .await
        .into_iter()
        .filter(|op| op.operation_type == OperationType::Deduction)
        .count();
    assert_eq!(deductions, 1);
}

#[tokio::test]
async fn test_concurrent_deductions() {
    let (store, ledger) = setup();

    ledger
        .confirm_grant(LICENSE, ASSET, "0x01", 1, 50_000, Utc::now())
        .await
        .unwrap();

    let l1 = ledger.clone();
    let l2 = ledger.clone();
    let h1 = tokio::spawn(async move {
        l1.deduct(LICENSE, ASSET, 300, "telemetry", "req-a").await
    });
    let h2 = tokio::spawn(async move {
        l2.deduct(LICENSE, ASSET, 400, "telemetry", "req-b").await
    });

    let (r1, r2) = tokio::join!(h1, h2);
    r1.unwrap().unwrap();
    r2.unwrap().unwrap();

    assert_eq!(ledger.get_balance(LICENSE, ASSET).await.unwrap(), 49_300);

    let rows: Vec<_> = store
        .operation_grants()
        .await
        .into_iter()
        .filter(|row| row.operation_type == OperationType::Deduction)
        .collect();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows.iter().map(|r| r.amount_used).sum::<i64>(), -700);
}

#[tokio::test]
async fn test_refund_reaches_failed_grant() {
    let (store, ledger) = setup();

    ledger
        .create_grant(LICENSE, ASSET, 1_000, "0xburn", Utc::now())
        .await
        .unwrap();
    ledger
        .deduct(LICENSE, ASSET, 200, "telemetry", "req-r")
        .await
        .unwrap();
    ledger.fail_grant(LICENSE, ASSET, "0xburn").await.unwrap();
    assert_eq!(ledger.get_balance(LICENSE, ASSET).await.unwrap(), -200);

    // The refund restores the failed grant and clears the debt with it.
    ledger.refund("telemetry", "req-r").await.unwrap();
    assert_eq!(ledger.get_balance(LICENSE, ASSET).await.unwrap(), 0);

    let grants = store.grants_for(LICENSE, ASSET).await;
    assert_eq!(grants.len(), 1);
    assert_eq!(grants[0].status, GrantStatus::Failed);
    assert_eq!(grants[0].remaining_amount, 1_000);
}

#[tokio::test]
async fn test_refund_replay_and_missing_deduction() {
    let (_store, ledger) = setup();

    assert!(matches!(
        ledger.refund("telemetry", "missing").await,
        Err(LedgerError::ReferencedOperationNotFound)
    ));

    ledger
        .confirm_grant(LICENSE, ASSET, "0x01", 1, 1_000, Utc::now())
        .await
        .unwrap();
    ledger
        .deduct(LICENSE, ASSET, 100, "telemetry", "req-1")
        .await
        .unwrap();
    ledger.refund("telemetry", "req-1").await.unwrap();

    assert!(matches!(
        ledger.refund("telemetry", "req-1").await,
        Err(LedgerError::AlreadyPerformed)
    ));
    assert_eq!(ledger.get_balance(LICENSE, ASSET).await.unwrap(), 1_000);
}

#[tokio::test]
async fn test_expired_grants_do_not_spend() {
    let (_store, ledger) = setup();

    let old_mint = Utc::now().checked_sub_months(Months::new(2)).unwrap();
    ledger
        .confirm_grant(LICENSE, ASSET, "0x01", 1, 1_000, old_mint)
        .await
        .unwrap();

    assert_eq!(ledger.get_balance(LICENSE, ASSET).await.unwrap(), 0);
    let result = ledger.deduct(LICENSE, ASSET, 1, "telemetry", "req-1").await;
    assert!(matches!(
        result,
        Err(LedgerError::InsufficientCredits { available: 0, .. })
    ));
}

#[tokio::test]
async fn test_amount_validation() {
    let (_store, ledger) = setup();

    assert!(matches!(
        ledger.deduct(LICENSE, ASSET, 0, "telemetry", "req").await,
        Err(LedgerError::InvalidAmount)
    ));
    assert!(matches!(
        ledger.deduct(LICENSE, ASSET, -5, "telemetry", "req").await,
        Err(LedgerError::InvalidAmount)
    ));
    assert!(matches!(
        ledger
            .create_grant(LICENSE, ASSET, 0, "0x01", Utc::now())
            .await,
        Err(LedgerError::InvalidAmount)
    ));
    assert!(matches!(
        ledger
            .confirm_grant(LICENSE, ASSET, "0x01", 1, -1, Utc::now())
            .await,
        Err(LedgerError::InvalidAmount)
    ));
}

#[tokio::test]
async fn test_confirm_binds_pending_grant() {
    let (store, ledger) = setup();

    ledger
        .create_grant(LICENSE, ASSET, 50_000, "0xburn", Utc::now())
        .await
        .unwrap();
    ledger
        .confirm_grant(LICENSE, ASSET, "0xburn", 3, 50_000, Utc::now())
        .await
        .unwrap();

    let grants = store.grants_for(LICENSE, ASSET).await;
    assert_eq!(grants.len(), 1, "confirmation must not mint a second grant");
    assert_eq!(grants[0].status, GrantStatus::Confirmed);
    assert_eq!(grants[0].log_index, Some(3));
    assert_eq!(ledger.get_balance(LICENSE, ASSET).await.unwrap(), 50_000);

    let types: Vec<OperationType> = store
        .operations()
        .await
        .into_iter()
        .map(|op| op.operation_type)
        .collect();
    assert!(types.contains(&OperationType::GrantPurchase));
    assert!(types.contains(&OperationType::GrantConfirm));
}

#[tokio::test]
async fn test_confirm_replay_is_already_performed() {
    let (store, ledger) = setup();

    ledger
        .confirm_grant(LICENSE, ASSET, "0x0a", 2, 1_000, Utc::now())
        .await
        .unwrap();
    let replay = ledger
        .confirm_grant(LICENSE, ASSET, "0x0a", 2, 1_000, Utc::now())
        .await;

    assert!(matches!(replay, Err(LedgerError::AlreadyPerformed)));
    assert_eq!(store.grants_for(LICENSE, ASSET).await.len(), 1);
    assert_eq!(ledger.get_balance(LICENSE, ASSET).await.unwrap(), 1_000);
}

#[tokio::test]
async fn test_amount_used_sign_conventions() {
    let (store, ledger) = setup();

    ledger
        .create_grant(LICENSE, ASSET, 1_000, "0xb1", Utc::now())
        .await
        .unwrap();
    ledger
        .deduct(LICENSE, ASSET, 100, "telemetry", "req-s")
        .await
        .unwrap();
    ledger.fail_grant(LICENSE, ASSET, "0xb1").await.unwrap();
    ledger
        .create_grant(LICENSE, ASSET, 500, "0xb2", Utc::now())
        .await
        .unwrap();
    ledger
        .confirm_grant(LICENSE, ASSET, "0xb2", 5, 500, Utc::now())
        .await
        .unwrap();
    ledger.refund("telemetry", "req-s").await.unwrap();

    let rows = store.operation_grants().await;
    assert!(!rows.is_empty());
    for row in rows {
        match row.operation_type {
            OperationType::Deduction => {
                assert!(row.amount_used < 0, "deduction rows are negative")
            }
            _ => assert!(row.amount_used > 0, "all other rows are positive"),
        }
    }
}

// ── Burn orchestrator ────────────────────────────────────────────────────

enum StubMode {
    Mint,
    InFlight,
    Broken,
}

struct StubInitiator {
    calls: AtomicU32,
    mode: StubMode,
}

impl StubInitiator {
    fn new(mode: StubMode) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            mode,
        })
    }
}

#[async_trait]
impl BurnInitiator for StubInitiator {
    async fn initiate_burn(
        &self,
        _license_id: &str,
        _asset_did: &str,
        amount: i64,
    ) -> Result<GrantReceipt, LedgerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        match self.mode {
            StubMode::Mint => Ok(GrantReceipt {
                tx_hash: format!("0xburn{}", call),
                amount,
                mint_time: Utc::now(),
            }),
            StubMode::InFlight => Err(LedgerError::GrantAlreadyInFlight),
            StubMode::Broken => Err(LedgerError::BurnFailed("rpc unreachable".to_string())),
        }
    }
}

#[tokio::test]
async fn test_auto_burn_mints_and_retries() {
    let (store, ledger) = setup();
    let initiator = StubInitiator::new(StubMode::Mint);
    let orchestrator = BurnOrchestrator::new(ledger.clone(), initiator.clone());

    let op = orchestrator
        .deduct_with_auto_burn(LICENSE, ASSET, 100, "telemetry", "req-1")
        .await
        .unwrap();

    assert_eq!(op.total_amount, 100);
    assert_eq!(initiator.calls.load(Ordering::SeqCst), 1);
    assert_eq!(ledger.get_balance(LICENSE, ASSET).await.unwrap(), 49_900);

    // The deduction consumed the freshly minted pending grant.
    let grants = store.grants_for(LICENSE, ASSET).await;
    assert_eq!(grants.len(), 1);
    assert_eq!(grants[0].status, GrantStatus::Pending);
    assert_eq!(grants[0].remaining_amount, 49_900);
}

#[tokio::test]
async fn test_auto_burn_skips_initiator_when_funded() {
    let (_store, ledger) = setup();
    ledger
        .confirm_grant(LICENSE, ASSET, "0x01", 1, 50_000, Utc::now())
        .await
        .unwrap();

    let initiator = StubInitiator::new(StubMode::Mint);
    let orchestrator = BurnOrchestrator::new(ledger.clone(), initiator.clone());
    orchestrator
        .deduct_with_auto_burn(LICENSE, ASSET, 100, "telemetry", "req-1")
        .await
        .unwrap();

    assert_eq!(initiator.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_auto_burn_bounded_retry() {
    let (_store, ledger) = setup();

    // Another flow claims a burn is in flight but no grant ever appears:
    // exactly one retry, then a fatal error.
    let initiator = StubInitiator::new(StubMode::InFlight);
    let orchestrator = BurnOrchestrator::new(ledger.clone(), initiator.clone());

    let result = orchestrator
        .deduct_with_auto_burn(LICENSE, ASSET, 100, "telemetry", "req-1")
        .await;
    assert!(matches!(result, Err(LedgerError::BurnDidNotRestoreBalance)));
    assert_eq!(initiator.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_auto_burn_surfaces_initiator_failure() {
    let (_store, ledger) = setup();
    let initiator = StubInitiator::new(StubMode::Broken);
    let orchestrator = BurnOrchestrator::new(ledger.clone(), initiator);

    let result = orchestrator
        .deduct_with_auto_burn(LICENSE, ASSET, 100, "telemetry", "req-1")
        .await;
    assert!(matches!(result, Err(LedgerError::BurnFailed(_))));
}

// ── Confirmation worker ──────────────────────────────────────────────────

struct VecSource {
    events: VecDeque<ChainEvent>,
    commits: Arc<AtomicU32>,
}

#[async_trait]
impl ConfirmationSource for VecSource {
    async fn next_event(&mut self) -> Result<Option<ChainEvent>, LedgerError> {
        Ok(self.events.pop_front())
    }

    async fn commit_progress(&mut self) -> Result<(), LedgerError> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_confirmation_worker_applies_and_commits() {
    let (store, ledger) = setup();
    let commits = Arc::new(AtomicU32::new(0));

    let confirmed = ChainEvent::GrantConfirmed {
        license_id: LICENSE.to_string(),
        asset_did: ASSET.to_string(),
        tx_hash: "0xa1".to_string(),
        log_index: 1,
        amount: 1_000,
        mint_time: Utc::now(),
    };
    let source = VecSource {
        // The duplicate replays the same log; the unknown failure is a no-op.
        events: VecDeque::from([
            confirmed.clone(),
            confirmed,
            ChainEvent::GrantFailed {
                license_id: LICENSE.to_string(),
                asset_did: ASSET.to_string(),
                tx_hash: "0xmissing".to_string(),
            },
        ]),
        commits: commits.clone(),
    };

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    ConfirmationWorker::new(ledger.clone())
        .run(source, shutdown_rx)
        .await
        .unwrap();

    assert_eq!(commits.load(Ordering::SeqCst), 3);
    assert_eq!(ledger.get_balance(LICENSE, ASSET).await.unwrap(), 1_000);
    assert_eq!(store.grants_for(LICENSE, ASSET).await.len(), 1);
}

struct IdleSource;

#[async_trait]
impl ConfirmationSource for IdleSource {
    async fn next_event(&mut self) -> Result<Option<ChainEvent>, LedgerError> {
        std::future::pending::<()>().await;
        unreachable!()
    }

    async fn commit_progress(&mut self) -> Result<(), LedgerError> {
        Ok(())
    }
}

#[tokio::test]
async fn test_confirmation_worker_shutdown() {
    let (_store, ledger) = setup();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker = tokio::spawn(async move {
        ConfirmationWorker::new(ledger).run(IdleSource, shutdown_rx).await
    });

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(std::time::Duration::from_secs(1), worker)
        .await
        .expect("worker must stop on shutdown")
        .unwrap()
        .unwrap();
}

// ── Reports ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_usage_reports() {
    let (_store, ledger) = setup();

    ledger
        .confirm_grant(LICENSE, ASSET, "0x01", 1, 50_000, Utc::now())
        .await
        .unwrap();
    ledger
        .deduct(LICENSE, ASSET, 100, "telemetry", "req-1")
        .await
        .unwrap();
    ledger
        .deduct(LICENSE, ASSET, 50, "telemetry", "req-2")
        .await
        .unwrap();
    ledger.refund("telemetry", "req-2").await.unwrap();

    let reports = Reports::new(ledger.clone());
    let from = Utc::now().checked_sub_days(Days::new(1)).unwrap();

    let totals = reports.usage_for_license(LICENSE, from, None).await.unwrap();
    assert_eq!(totals.num_distinct_assets, 1);
    assert_eq!(totals.num_grants_confirmed, 1);
    assert_eq!(totals.net_credits_used, 100);

    let asset_usage = reports
        .usage_for_license_asset(LICENSE, ASSET, from, Some(Utc::now()))
        .await
        .unwrap();
    assert_eq!(asset_usage.usage.net_credits_used, 100);
    assert_eq!(asset_usage.current_remaining, 49_900);
}

#[tokio::test]
async fn test_report_argument_validation() {
    let (_store, ledger) = setup();
    let reports = Reports::new(ledger);
    let from = Utc::now().checked_sub_days(Days::new(1)).unwrap();
    let future = Utc::now().checked_add_days(Days::new(1)).unwrap();

    assert!(matches!(
        reports.usage_for_license("", from, None).await,
        Err(LedgerError::InvalidArguments(_))
    ));
    assert!(matches!(
        reports.usage_for_license(LICENSE, future, None).await,
        Err(LedgerError::InvalidArguments(_))
    ));
    assert!(matches!(
        reports
            .usage_for_license(LICENSE, Utc::now(), Some(from))
            .await,
        Err(LedgerError::InvalidArguments(_))
    ));
    assert!(matches!(
        reports
            .usage_for_license_asset(LICENSE, "", from, None)
            .await,
        Err(LedgerError::InvalidArguments(_))
    ));
}
