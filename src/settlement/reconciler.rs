// Reconciliation jobs - close the gaps the synchronous funding path leaves
//
// Every job has the same shape: select candidates with a job-specific query,
// then for each one open a transaction, plan under the shift lock (which
// re-validates the candidate), apply the plan and commit. A failing row rolls
// back alone and is counted; the batch keeps going.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info};
use uuid::Uuid;

use super::earn_shift::{EarnShiftFunder, FundingPlan, FundingResult, SkipReason};
use crate::error::{AppError, AppResult};
use crate::ledger::{LedgerStore, LedgerTx, ShiftKey};

pub const DEFAULT_RECONCILE_LIMIT: i64 = 200;
pub const MAX_RECONCILE_LIMIT: i64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReconcileJob {
    /// Verified shifts with no earn_shift wallet credit
    BackfillWalletCredits,
    /// Receipts without a donation or with nothing funded
    ResolveUnattributedReceipts,
    /// Wallet credits funded below their amount
    ClosePoolDeficits,
}

impl ReconcileJob {
    pub const ALL: [ReconcileJob; 3] = [
        ReconcileJob::BackfillWalletCredits,
        ReconcileJob::ResolveUnattributedReceipts,
        ReconcileJob::ClosePoolDeficits,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileJob::BackfillWalletCredits => "backfill-wallet-credits",
            ReconcileJob::ResolveUnattributedReceipts => "resolve-unattributed-receipts",
            ReconcileJob::ClosePoolDeficits => "close-pool-deficits",
        }
    }
}

impl fmt::Display for ReconcileJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReconcileJob {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ReconcileJob::ALL
            .into_iter()
            .find(|job| job.as_str() == s)
            .ok_or_else(|| AppError::InvalidInput(format!("unknown reconciliation job: {}", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    pub limit: i64,
    pub dry_run: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            limit: DEFAULT_RECONCILE_LIMIT,
            dry_run: false,
        }
    }
}

/// What happened to one candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowOutcome {
    Applied(FundingResult),
    /// Dry run: what applying would have done
    Planned {
        credit_wallet: bool,
        amount: i64,
        funded_before: i64,
        drawn: i64,
        donation_id: Option<i64>,
    },
    Skipped(SkipReason),
}

impl RowOutcome {
    fn label(&self) -> &'static str {
        match self {
            RowOutcome::Applied(_) => "applied",
            RowOutcome::Planned { .. } => "planned",
            RowOutcome::Skipped(reason) => reason.as_str(),
        }
    }

    fn drawn(&self) -> i64 {
        match self {
            RowOutcome::Applied(result) => result.drawn,
            RowOutcome::Planned { drawn, .. } => *drawn,
            RowOutcome::Skipped(_) => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub job: ReconcileJob,
    pub dry_run: bool,
    pub candidates: usize,
    pub applied: usize,
    pub planned: usize,
    pub skipped: usize,
    pub failed: usize,
    pub credits_drawn: i64,
}

impl RunSummary {
    fn new(run_id: Uuid, job: ReconcileJob, dry_run: bool, candidates: usize) -> Self {
        Self {
            run_id,
            job,
            dry_run,
            candidates,
            applied: 0,
            planned: 0,
            skipped: 0,
            failed: 0,
            credits_drawn: 0,
        }
    }

    fn record(&mut self, outcome: &RowOutcome) {
        match outcome {
            RowOutcome::Applied(_) => self.applied += 1,
            RowOutcome::Planned { .. } => self.planned += 1,
            RowOutcome::Skipped(_) => self.skipped += 1,
        }
        self.credits_drawn += outcome.drawn();
    }
}

pub struct Reconciler<S: LedgerStore> {
    funder: Arc<EarnShiftFunder<S>>,
}

impl<S: LedgerStore> Reconciler<S> {
    pub fn new(funder: Arc<EarnShiftFunder<S>>) -> Self {
        Self { funder }
    }

    /// Run every job in order; a fatal error in one job stops the rest
    pub async fn run_all(&self, options: RunOptions) -> AppResult<Vec<RunSummary>> {
        let mut summaries = Vec::with_capacity(ReconcileJob::ALL.len());
        for job in ReconcileJob::ALL {
            summaries.push(self.run(job, options).await?);
        }
        Ok(summaries)
    }

    pub async fn run(&self, job: ReconcileJob, options: RunOptions) -> AppResult<RunSummary> {
        let limit = options.limit.clamp(1, MAX_RECONCILE_LIMIT);
        let run_id = Uuid::new_v4();

        let store = self.funder.store();
        let candidates = match job {
            ReconcileJob::BackfillWalletCredits => store.missing_wallet_credits(limit).await?,
            ReconcileJob::ResolveUnattributedReceipts => store.unattributed_receipts(limit).await?,
            ReconcileJob::ClosePoolDeficits => store.underfunded_credits(limit).await?,
        };

        info!(
            run_id = %run_id,
            job = job.as_str(),
            candidates = candidates.len(),
            limit,
            dry_run = options.dry_run,
            "🔄 Reconciliation run started"
        );

        let mut summary = RunSummary::new(run_id, job, options.dry_run, candidates.len());

        for key in candidates {
            match self.reconcile_row(key, options.dry_run).await {
                Ok(outcome) => {
                    info!(
                        run_id = %run_id,
                        job = job.as_str(),
                        event_id = key.event_id,
                        user_id = key.user_id,
                        outcome = outcome.label(),
                        drawn = outcome.drawn(),
                        "reconciled row"
                    );
                    summary.record(&outcome);
                }
                Err(err) => {
                    error!(
                        run_id = %run_id,
                        job = job.as_str(),
                        event_id = key.event_id,
                        user_id = key.user_id,
                        stage = err.funding_stage().map(|s| s.as_str()),
                        error = %err,
                        "❌ Reconciliation row failed"
                    );
                    summary.failed += 1;
                }
            }
        }

        info!(
            run_id = %run_id,
            job = job.as_str(),
            candidates = summary.candidates,
            applied = summary.applied,
            planned = summary.planned,
            skipped = summary.skipped,
            failed = summary.failed,
            credits_drawn = summary.credits_drawn,
            dry_run = summary.dry_run,
            "📊 Reconciliation run finished"
        );

        Ok(summary)
    }

    async fn reconcile_row(&self, key: ShiftKey, dry_run: bool) -> AppResult<RowOutcome> {
        let mut tx = self.funder.store().begin().await?;

        let funding = match self.funder.plan(&mut tx, key).await? {
            FundingPlan::Skip(reason) => {
                tx.rollback().await?;
                return Ok(RowOutcome::Skipped(reason));
            }
            FundingPlan::Fund(funding) => funding,
        };

        // The candidate may have been settled since it was selected
        if funding.is_noop() {
            tx.rollback().await?;
            return Ok(RowOutcome::Skipped(funding.noop_reason()));
        }

        if dry_run {
            tx.rollback().await?;
            return Ok(RowOutcome::Planned {
                credit_wallet: funding.wallet.is_none(),
                amount: funding.amount,
                funded_before: funding.funded_before,
                drawn: funding.drawn(),
                donation_id: funding.draw.map(|d| d.donation_id),
            });
        }

        let result = self.funder.apply(&mut tx, &funding).await?;
        tx.commit().await?;
        Ok(RowOutcome::Applied(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FundingStage;
    use crate::funding::{DonationIntake, DonationRequest, IntakeDefaults, PoolAdmin};
    use crate::ledger::memory::MemoryLedger;
    use crate::ledger::{Direction, PoolReason, PoolSlug, ShiftVerification};
    use crate::settlement::earn_shift::{FundingOutcome, VerifiedShift};

    struct Harness {
        ledger: MemoryLedger,
        funder: Arc<EarnShiftFunder<MemoryLedger>>,
        reconciler: Reconciler<MemoryLedger>,
    }

    impl Harness {
        fn new() -> Self {
            let ledger = MemoryLedger::new();
            let funder = Arc::new(EarnShiftFunder::new(Arc::new(ledger.clone()), "general"));
            let reconciler = Reconciler::new(funder.clone());
            Self {
                ledger,
                funder,
                reconciler,
            }
        }

        async fn donate(&self, id: &str, credits: i64) -> i64 {
            DonationIntake::new(Arc::new(self.ledger.clone()), IntakeDefaults::default())
                .capture(&DonationRequest {
                    donor_user_id: Some(1),
                    external_payment_id: Some(id.to_string()),
                    amount_cents: credits * 100,
                    currency: "usd".to_string(),
                    pool_slug: None,
                    credits_override: None,
                    cents_per_credit: None,
                })
                .await
                .unwrap()
                .donation_id
        }

        async fn work_shift(&self, event_id: i64, credits: i64) -> FundingOutcome {
            self.funder
                .verify_and_fund(&VerifiedShift {
                    event_id,
                    user_id: 42,
                    verified: true,
                    attended_minutes: None,
                    checked_in_at: None,
                    checked_out_at: None,
                    reward_pool_kind: credits,
                    capacity: 1,
                    pool_slug: None,
                })
                .await
                .unwrap()
        }

        async fn funded(&self, event_id: i64) -> (i64, i64) {
            let state = self.ledger.snapshot().await;
            let wallet = state.earn_credit(ShiftKey::new(event_id, 42)).unwrap();
            let funded = state.receipt(wallet.id).map_or(0, |r| r.credits_funded);
            (funded, wallet.kind_amount - funded)
        }

        async fn run(&self, job: ReconcileJob) -> RunSummary {
            self.reconciler.run(job, RunOptions::default()).await.unwrap()
        }
    }

    fn verified_record(event_id: i64, reward: i64) -> ShiftVerification {
        ShiftVerification {
            event_id,
            user_id: 42,
            verified: true,
            attended_minutes: Some(60),
            checked_in_at: None,
            checked_out_at: None,
            reward_pool_kind: reward,
            capacity: 1,
            pool_slug: None,
            verified_at: None,
        }
    }

    #[test]
    fn test_job_names_round_trip() {
        for job in ReconcileJob::ALL {
            assert_eq!(job.as_str().parse::<ReconcileJob>().unwrap(), job);
        }
        assert!("all".parse::<ReconcileJob>().is_err());
    }

    #[tokio::test]
    async fn test_backfill_creates_and_funds_missing_credit() {
        let h = Harness::new();
        h.donate("pi_1", 10).await;
        h.ledger.put_shift(verified_record(5, 8)).await;

        let summary = h.run(ReconcileJob::BackfillWalletCredits).await;
        assert_eq!((summary.candidates, summary.applied, summary.failed), (1, 1, 0));
        assert_eq!(summary.credits_drawn, 8);
        assert_eq!(h.funded(5).await, (8, 0));

        let again = h.run(ReconcileJob::BackfillWalletCredits).await;
        assert_eq!(again.candidates, 0);
    }

    #[tokio::test]
    async fn test_close_deficit_after_new_donation() {
        let h = Harness::new();
        h.donate("pi_small", 4).await;
        h.work_shift(1, 10).await;
        assert_eq!(h.funded(1).await, (4, 6));

        h.donate("pi_more", 10).await;
        let summary = h.run(ReconcileJob::ClosePoolDeficits).await;
        assert_eq!((summary.applied, summary.credits_drawn), (1, 6));
        assert_eq!(h.funded(1).await, (10, 0));

        let again = h.run(ReconcileJob::ClosePoolDeficits).await;
        assert_eq!((again.candidates, again.applied), (0, 0));
    }

    #[tokio::test]
    async fn test_deficit_shrinks_by_new_donation_remaining() {
        let h = Harness::new();
        h.donate("pi_small", 4).await;
        h.work_shift(1, 10).await;

        h.donate("pi_tiny", 3).await;
        h.run(ReconcileJob::ClosePoolDeficits).await;
        // min(previous deficit 6, new remaining 3)
        assert_eq!(h.funded(1).await, (7, 3));
    }

    #[tokio::test]
    async fn test_one_donation_per_candidate_per_pass() {
        let h = Harness::new();
        h.work_shift(1, 10).await;
        h.donate("pi_a", 3).await;
        h.donate("pi_b", 3).await;

        h.run(ReconcileJob::ClosePoolDeficits).await;
        assert_eq!(h.funded(1).await, (3, 7));

        h.run(ReconcileJob::ClosePoolDeficits).await;
        assert_eq!(h.funded(1).await, (6, 4));

        let exhausted = h.run(ReconcileJob::ClosePoolDeficits).await;
        assert_eq!((exhausted.candidates, exhausted.skipped), (1, 1));
    }

    #[tokio::test]
    async fn test_resolve_unattributed_receipt() {
        let h = Harness::new();
        h.work_shift(1, 5).await;

        let empty = h.run(ReconcileJob::ResolveUnattributedReceipts).await;
        assert_eq!((empty.candidates, empty.skipped), (1, 1));

        let donation_id = h.donate("pi_1", 20).await;
        let summary = h.run(ReconcileJob::ResolveUnattributedReceipts).await;
        assert_eq!(summary.applied, 1);

        let state = h.ledger.snapshot().await;
        let wallet = state.earn_credit(ShiftKey::new(1, 42)).unwrap();
        let receipt = state.receipt(wallet.id).unwrap();
        assert_eq!((receipt.donation_id, receipt.credits_funded), (Some(donation_id), 5));
    }

    #[tokio::test]
    async fn test_zero_credit_shifts_do_not_crowd_out_backfill() {
        let h = Harness::new();
        h.donate("pi_1", 10).await;
        for event_id in 1..=3 {
            let mut worthless = verified_record(event_id, 3);
            worthless.capacity = 5;
            h.ledger.put_shift(worthless).await;
        }
        h.ledger.put_shift(verified_record(10, 10)).await;

        let summary = h
            .reconciler
            .run(
                ReconcileJob::BackfillWalletCredits,
                RunOptions {
                    limit: 3,
                    dry_run: false,
                },
            )
            .await
            .unwrap();

        assert_eq!((summary.candidates, summary.applied, summary.skipped), (1, 1, 0));
        assert_eq!(h.funded(10).await, (10, 0));
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let h = Harness::new();
        h.donate("pi_1", 10).await;
        h.ledger.put_shift(verified_record(5, 8)).await;
        let before = h.ledger.snapshot().await;

        let summary = h
            .reconciler
            .run(
                ReconcileJob::BackfillWalletCredits,
                RunOptions {
                    limit: 10,
                    dry_run: true,
                },
            )
            .await
            .unwrap();

        assert!(summary.dry_run);
        assert_eq!((summary.planned, summary.applied, summary.credits_drawn), (1, 0, 8));
        let after = h.ledger.snapshot().await;
        assert_eq!(after.wallet_transactions, before.wallet_transactions);
        assert_eq!(after.pool_transactions, before.pool_transactions);
        assert!(after.receipts.is_empty());
    }

    #[tokio::test]
    async fn test_failing_row_does_not_abort_batch() {
        let h = Harness::new();
        h.donate("pi_1", 100).await;
        for event_id in 1..=3 {
            h.ledger.put_shift(verified_record(event_id, 5)).await;
        }
        h.ledger.fail_at(FundingStage::DonorReceipt, Some(2));

        let summary = h.run(ReconcileJob::BackfillWalletCredits).await;
        assert_eq!((summary.candidates, summary.applied, summary.failed), (3, 2, 1));

        let state = h.ledger.snapshot().await;
        assert!(state.earn_credit(ShiftKey::new(2, 42)).is_none());
        assert!(state.earn_credit(ShiftKey::new(3, 42)).is_some());

        h.ledger.clear_failures();
        let retry = h.run(ReconcileJob::BackfillWalletCredits).await;
        assert_eq!((retry.candidates, retry.applied), (1, 1));
    }

    #[tokio::test]
    async fn test_limit_is_clamped() {
        let h = Harness::new();
        for event_id in 1..=3 {
            h.ledger.put_shift(verified_record(event_id, 5)).await;
        }
        let summary = h
            .reconciler
            .run(
                ReconcileJob::BackfillWalletCredits,
                RunOptions {
                    limit: 0,
                    dry_run: false,
                },
            )
            .await
            .unwrap();
        assert_eq!(summary.candidates, 1);
    }

    #[tokio::test]
    async fn test_run_all_converges_and_conserves_credits() {
        let h = Harness::new();
        let d1 = h.donate("pi_1", 6).await;
        h.work_shift(1, 4).await;
        h.work_shift(2, 4).await;
        h.ledger.put_shift(verified_record(3, 3)).await;
        let d2 = h.donate("pi_2", 5).await;

        let admin = PoolAdmin::new(Arc::new(h.ledger.clone()));
        admin
            .adjust(&PoolSlug::general(), Direction::Credit, 2, None)
            .await
            .unwrap();

        let summaries = h.reconciler.run_all(RunOptions::default()).await.unwrap();
        assert_eq!(summaries.len(), 3);
        assert!(summaries.iter().all(|s| s.failed == 0));

        assert_eq!(h.funded(1).await, (4, 0));
        assert_eq!(h.funded(2).await, (4, 0));
        assert_eq!(h.funded(3).await, (3, 0));

        let state = h.ledger.snapshot().await;
        let pool = state.pool("general").unwrap();

        // Direct summation agrees with the balance query
        let summed: i64 = state
            .pool_transactions
            .iter()
            .filter(|t| t.pool_id == pool.id)
            .map(|t| t.signed_amount())
            .sum();
        let reported = admin.balance(&PoolSlug::general()).await.unwrap();
        assert_eq!(summed, reported.balance);
        assert_eq!(reported.balance, 6 + 5 + 2 - 11);
        assert!(reported.credits_in >= reported.credits_out);

        // No donation backs more than it was credited
        for donation_id in [d1, d2] {
            let credited: i64 = state
                .pool_transactions
                .iter()
                .filter(|t| t.reason == PoolReason::DonationIn && t.donation_id == Some(donation_id))
                .map(|t| t.amount_credits)
                .sum();
            let debited: i64 = state
                .pool_transactions
                .iter()
                .filter(|t| t.reason == PoolReason::ShiftOut && t.donation_id == Some(donation_id))
                .map(|t| t.amount_credits)
                .sum();
            assert!(state.allocated_from(donation_id) <= credited);
            assert!(debited <= credited, "donation {} debited {} of {}", donation_id, debited, credited);
        }
        assert_eq!(state.allocated_from(d1), 6);
        assert_eq!(state.allocated_from(d2), 5);

        // Funded never exceeds the credit
        for wallet in &state.wallet_transactions {
            assert!(state.receipt(wallet.id).unwrap().credits_funded <= wallet.kind_amount);
        }
    }
}
