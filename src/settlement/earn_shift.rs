// Earn-Shift Funding - credits a volunteer for a verified shift and backs the
// credit with donor money, FIFO
//
// Flow for one (event, user), all inside one transaction:
// 1. Lock the shift
// 2. Load the verification record; skip when unverified or worth nothing
// 3. Reuse or plan the earn_shift wallet credit
// 4. Lock the pool, ask the attribution resolver for the oldest donation
// 5. Write the wallet credit, the shift_out debit and the donor receipt
// 6. Report funded vs deficit from the receipt

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::{AppError, AppResult, FundingError, FundingStage};
use crate::funding::non_negative;
use crate::ledger::attribution::{attributable_credits, oldest_with_remaining};
use crate::ledger::lock::{pool_lock_key, shift_lock_key};
use crate::ledger::{
    DonorReceipt, FundingPool, LedgerStore, LedgerTx, NewEarnCredit, PoolSlug, ReceiptUpsert,
    ShiftDebit, ShiftKey, ShiftVerification, WalletTransaction,
};

/// The verification workflow's signal for one attendee
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiedShift {
    pub event_id: i64,
    pub user_id: i64,
    pub verified: bool,
    pub attended_minutes: Option<i32>,
    pub checked_in_at: Option<DateTime<Utc>>,
    pub checked_out_at: Option<DateTime<Utc>>,
    pub reward_pool_kind: i64,
    pub capacity: i64,
    pub pool_slug: Option<String>,
}

impl VerifiedShift {
    pub fn key(&self) -> ShiftKey {
        ShiftKey::new(self.event_id, self.user_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NotVerified,
    ZeroCredit,
    NoDonationAvailable,
    AlreadyFunded,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::NotVerified => "not_verified",
            SkipReason::ZeroCredit => "zero_credit",
            SkipReason::NoDonationAvailable => "no_donation_available",
            SkipReason::AlreadyFunded => "already_funded",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingResult {
    pub wallet_tx_id: i64,
    pub amount: i64,
    pub funded: i64,
    pub deficit: i64,
    /// Funded credits existed before this call
    pub already_funded: bool,
    pub donation_id: Option<i64>,
    /// Credits drawn from the pool by this call
    pub drawn: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FundingOutcome {
    Skipped { reason: SkipReason },
    Funded(FundingResult),
}

impl FundingOutcome {
    pub fn skipped(reason: SkipReason) -> Self {
        FundingOutcome::Skipped { reason }
    }
}

/// Next draw against a pool's oldest donation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedDraw {
    pub pool_id: i64,
    pub donation_id: i64,
    pub credits: i64,
}

/// Everything funding would do, computed under the locks without writing
#[derive(Debug, Clone)]
pub enum FundingPlan {
    Skip(SkipReason),
    Fund(ShiftFunding),
}

#[derive(Debug, Clone)]
pub struct ShiftFunding {
    pub shift: ShiftVerification,
    pub pool_slug: PoolSlug,
    pub pool: Option<FundingPool>,
    /// Existing earn_shift credit; None means one will be inserted
    pub wallet: Option<WalletTransaction>,
    pub receipt: Option<DonorReceipt>,
    pub amount: i64,
    pub funded_before: i64,
    pub draw: Option<PlannedDraw>,
}

impl ShiftFunding {
    pub fn key(&self) -> ShiftKey {
        self.shift.key()
    }

    pub fn outstanding(&self) -> i64 {
        (self.amount - self.funded_before).max(0)
    }

    pub fn drawn(&self) -> i64 {
        self.draw.map_or(0, |d| d.credits)
    }

    /// True when applying would change nothing
    pub fn is_noop(&self) -> bool {
        self.wallet.is_some() && self.receipt.is_some() && self.drawn() == 0
    }

    /// Why a no-op plan has nothing to do
    pub fn noop_reason(&self) -> SkipReason {
        if self.outstanding() == 0 {
            SkipReason::AlreadyFunded
        } else {
            SkipReason::NoDonationAvailable
        }
    }
}

/// Earn-Shift Funding service
pub struct EarnShiftFunder<S: LedgerStore> {
    store: Arc<S>,
    default_pool_slug: String,
}

impl<S: LedgerStore> EarnShiftFunder<S> {
    pub fn new(store: Arc<S>, default_pool_slug: impl Into<String>) -> Self {
        Self {
            store,
            default_pool_slug: default_pool_slug.into(),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    // ========== VERIFICATION ==========

    /// Mirror the verification workflow's signal into the ledger
    pub async fn record_verification(&self, shift: &VerifiedShift) -> AppResult<ShiftVerification> {
        non_negative("reward_pool_kind", shift.reward_pool_kind)?;
        non_negative("capacity", shift.capacity)?;
        if let Some(minutes) = shift.attended_minutes {
            non_negative("attended_minutes", i64::from(minutes))?;
        }
        if let Some(slug) = shift.pool_slug.as_deref() {
            PoolSlug::parse(slug)?;
        }

        let record = ShiftVerification {
            event_id: shift.event_id,
            user_id: shift.user_id,
            verified: shift.verified,
            attended_minutes: shift.attended_minutes,
            checked_in_at: shift.checked_in_at,
            checked_out_at: shift.checked_out_at,
            reward_pool_kind: shift.reward_pool_kind,
            capacity: shift.capacity,
            pool_slug: shift.pool_slug.clone(),
            verified_at: shift.verified.then(Utc::now),
        };

        let mut tx = self.store.begin().await?;
        tx.lock(shift_lock_key(shift.key())).await?;
        tx.upsert_shift(&record).await?;
        tx.commit().await?;

        debug!(
            event_id = shift.event_id,
            user_id = shift.user_id,
            verified = shift.verified,
            "shift verification recorded"
        );
        Ok(record)
    }

    /// Record a verified shift, then fund it
    pub async fn verify_and_fund(&self, shift: &VerifiedShift) -> AppResult<FundingOutcome> {
        self.record_verification(shift).await?;
        self.process_verified_earn_shift(shift.key()).await
    }

    // ========== FUNDING ==========

    /// Fund one shift in its own transaction
    pub async fn process_verified_earn_shift(&self, key: ShiftKey) -> AppResult<FundingOutcome> {
        let mut tx = self.store.begin().await?;

        let plan = self.plan(&mut tx, key).await?;
        let funding = match plan {
            FundingPlan::Skip(reason) => {
                tx.rollback().await?;
                info!(
                    event_id = key.event_id,
                    user_id = key.user_id,
                    reason = reason.as_str(),
                    "⏭️ Shift funding skipped"
                );
                return Ok(FundingOutcome::skipped(reason));
            }
            FundingPlan::Fund(funding) => funding,
        };

        // Writes are idempotent, so a no-op plan still reports the stored state
        let result = self.apply(&mut tx, &funding).await?;
        tx.commit().await?;

        Ok(FundingOutcome::Funded(result))
    }

    /// Lock the shift and work out what funding would write
    pub async fn plan(&self, tx: &mut S::Tx, key: ShiftKey) -> AppResult<FundingPlan> {
        tx.lock(shift_lock_key(key)).await?;

        let shift = match tx.load_shift(key).await? {
            Some(shift) if shift.verified => shift,
            _ => return Ok(FundingPlan::Skip(SkipReason::NotVerified)),
        };

        let wallet = tx.find_earn_credit(key).await?;
        let amount = match &wallet {
            Some(existing) => existing.kind_amount,
            None => shift.credit_amount(),
        };
        if amount <= 0 {
            return Ok(FundingPlan::Skip(SkipReason::ZeroCredit));
        }

        let (receipt, funded_before) = match &wallet {
            Some(existing) => {
                let receipt = tx.find_receipt(existing.id).await?;
                let debit = tx.find_shift_debit(existing.id).await?;
                let funded = receipt
                    .as_ref()
                    .map_or(0, |r| r.credits_funded)
                    .max(debit.map_or(0, |d| d.amount_credits));
                (receipt, funded)
            }
            None => (None, 0),
        };

        let pool_slug = PoolSlug::parse(
            shift
                .pool_slug
                .as_deref()
                .unwrap_or(&self.default_pool_slug),
        )?;
        let pool = tx.find_pool(&pool_slug).await?;

        let mut funding = ShiftFunding {
            shift,
            pool_slug,
            pool,
            wallet,
            receipt,
            amount,
            funded_before,
            draw: None,
        };

        let pool_id = funding.pool.as_ref().map(|p| p.id);
        if let (Some(pool_id), true) = (pool_id, funding.outstanding() > 0) {
            tx.lock(pool_lock_key(pool_id)).await?;
            let balance = tx.pool_balance(pool_id).await?;
            if let Some(donation) = oldest_with_remaining(tx, pool_id).await? {
                let credits = attributable_credits(
                    funding.outstanding(),
                    balance.balance(),
                    donation.remaining(),
                );
                if credits > 0 {
                    funding.draw = Some(PlannedDraw {
                        pool_id,
                        donation_id: donation.donation_id,
                        credits,
                    });
                }
            }
        }

        Ok(FundingPlan::Fund(funding))
    }

    /// Write a plan; every failure is tagged with its stage
    pub async fn apply(&self, tx: &mut S::Tx, funding: &ShiftFunding) -> AppResult<FundingResult> {
        let key = funding.key();

        let wallet = match &funding.wallet {
            Some(existing) => existing.clone(),
            None => {
                let credit = NewEarnCredit {
                    user_id: key.user_id,
                    event_id: key.event_id,
                    amount: funding.amount,
                    note: format!("Verified shift for event {}", key.event_id),
                };
                let inserted = tx.insert_earn_credit(&credit).await;
                staged(inserted, FundingStage::WalletInsert, key, None)?.row
            }
        };

        let total = funding.funded_before + funding.drawn();

        if let Some(draw) = funding.draw {
            let debit = ShiftDebit {
                pool_id: draw.pool_id,
                wallet_tx_id: wallet.id,
                event_id: key.event_id,
                donation_id: draw.donation_id,
                total_credits: total,
            };
            let written = tx.upsert_shift_debit(&debit).await;
            staged(written, FundingStage::PoolDebit, key, Some(wallet.id))?;

            let allocated = tx
                .add_allocation(draw.donation_id, wallet.id, draw.credits)
                .await;
            staged(allocated, FundingStage::PoolDebit, key, Some(wallet.id))?;
        }

        let receipt = ReceiptUpsert {
            donation_id: funding.draw.map(|d| d.donation_id),
            event_id: key.event_id,
            volunteer_user_id: key.user_id,
            wallet_tx_id: wallet.id,
            credits_funded: total,
            minutes_verified: funding.shift.audit_minutes(),
        };
        let written = tx.upsert_receipt(&receipt).await;
        let receipt = staged(written, FundingStage::DonorReceipt, key, Some(wallet.id))?;

        let funded = receipt.credits_funded;
        let deficit = wallet.kind_amount - funded;
        let result = FundingResult {
            wallet_tx_id: wallet.id,
            amount: wallet.kind_amount,
            funded,
            deficit,
            already_funded: funding.funded_before > 0,
            donation_id: funding.draw.map(|d| d.donation_id).or(receipt.donation_id),
            drawn: funding.drawn(),
        };

        if deficit > 0 {
            warn!(
                event_id = key.event_id,
                user_id = key.user_id,
                wallet_tx_id = wallet.id,
                pool = %funding.pool_slug,
                amount = result.amount,
                funded,
                deficit,
                "⚠️ Shift credit not fully backed by donations"
            );
        } else {
            info!(
                event_id = key.event_id,
                user_id = key.user_id,
                wallet_tx_id = wallet.id,
                funded,
                drawn = result.drawn,
                donation_id = ?result.donation_id,
                "✅ Shift credit funded"
            );
        }

        Ok(result)
    }
}

fn staged<T>(
    result: AppResult<T>,
    stage: FundingStage,
    key: ShiftKey,
    wallet_tx_id: Option<i64>,
) -> AppResult<T> {
    result.map_err(|source| {
        error!(
            stage = stage.as_str(),
            event_id = key.event_id,
            user_id = key.user_id,
            wallet_tx_id = ?wallet_tx_id,
            error = %source,
            "❌ Shift funding write failed"
        );
        AppError::Funding(FundingError {
            stage,
            event_id: key.event_id,
            user_id: key.user_id,
            wallet_tx_id,
            source: Box::new(source),
        })
    })
}
