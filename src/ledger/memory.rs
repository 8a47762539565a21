//! In-memory ledger store for tests.
//!
//! Transactions hold the whole store for their lifetime, so units of work are
//! serialised the way advisory locks serialise them in Postgres. Writes go to a
//! working copy that replaces the store on commit and is discarded otherwise.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::models::*;
use super::slug::PoolSlug;
use super::store::{LedgerStore, LedgerTx};
use crate::error::{AppError, AppResult, FundingStage};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub donation_id: i64,
    pub wallet_tx_id: i64,
    pub credits: i64,
}

/// Committed contents of the in-memory ledger
#[derive(Debug, Clone)]
pub struct MemoryState {
    next_id: i64,
    epoch: DateTime<Utc>,
    pub pools: Vec<FundingPool>,
    pub donations: Vec<Donation>,
    pub pool_transactions: Vec<PoolTransaction>,
    pub wallet_transactions: Vec<WalletTransaction>,
    pub receipts: Vec<DonorReceipt>,
    pub allocations: Vec<Allocation>,
    pub topups: Vec<SubscriptionTopup>,
    pub shifts: BTreeMap<ShiftKey, ShiftVerification>,
}

impl MemoryState {
    fn new() -> Self {
        Self {
            next_id: 0,
            epoch: Utc::now(),
            pools: Vec::new(),
            donations: Vec::new(),
            pool_transactions: Vec::new(),
            wallet_transactions: Vec::new(),
            receipts: Vec::new(),
            allocations: Vec::new(),
            topups: Vec::new(),
            shifts: BTreeMap::new(),
        }
    }

    /// Fresh id plus a creation time that orders strictly with it
    fn tick(&mut self) -> (i64, DateTime<Utc>) {
        self.next_id += 1;
        (self.next_id, self.epoch + Duration::seconds(self.next_id))
    }

    pub fn pool(&self, slug: &str) -> Option<&FundingPool> {
        self.pools.iter().find(|p| p.slug == slug)
    }

    pub fn balance_of(&self, pool_id: i64) -> PoolBalance {
        self.pool_transactions
            .iter()
            .filter(|t| t.pool_id == pool_id)
            .fold(PoolBalance::empty(pool_id), |mut acc, t| {
                match t.direction {
                    Direction::Credit => acc.credits_in += t.amount_credits,
                    Direction::Debit => acc.credits_out += t.amount_credits,
                }
                acc
            })
    }

    pub fn earn_credit(&self, key: ShiftKey) -> Option<&WalletTransaction> {
        self.wallet_transactions.iter().find(|w| {
            w.reason == WalletReason::EarnShift
                && w.direction == Direction::Credit
                && w.user_id == key.user_id
                && w.event_id == Some(key.event_id)
        })
    }

    pub fn shift_debit(&self, wallet_tx_id: i64) -> Option<&PoolTransaction> {
        self.pool_transactions.iter().find(|t| {
            t.reason == PoolReason::ShiftOut
                && t.direction == Direction::Debit
                && t.wallet_tx_id == Some(wallet_tx_id)
        })
    }

    pub fn receipt(&self, wallet_tx_id: i64) -> Option<&DonorReceipt> {
        self.receipts.iter().find(|r| r.wallet_tx_id == wallet_tx_id)
    }

    /// Credits allocated out of one donation across all shifts
    pub fn allocated_from(&self, donation_id: i64) -> i64 {
        self.allocations
            .iter()
            .filter(|a| a.donation_id == donation_id)
            .map(|a| a.credits)
            .sum()
    }

    fn donation_credit(&self, pool_id: i64, donation_id: i64) -> Option<&PoolTransaction> {
        self.pool_transactions.iter().find(|t| {
            t.reason == PoolReason::DonationIn
                && t.pool_id == pool_id
                && t.donation_id == Some(donation_id)
        })
    }

    fn funded_credits(&self, wallet_tx_id: i64) -> i64 {
        let receipt = self.receipt(wallet_tx_id).map_or(0, |r| r.credits_funded);
        let debit = self.shift_debit(wallet_tx_id).map_or(0, |d| d.amount_credits);
        receipt.max(debit)
    }
}

/// Shared in-memory ledger; clones see the same data
#[derive(Clone)]
pub struct MemoryLedger {
    state: Arc<Mutex<MemoryState>>,
    failures: Arc<StdMutex<Vec<(FundingStage, Option<i64>)>>>,
    locks: Arc<StdMutex<Vec<i64>>>,
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::new())),
            failures: Arc::new(StdMutex::new(Vec::new())),
            locks: Arc::new(StdMutex::new(Vec::new())),
        }
    }

    pub async fn snapshot(&self) -> MemoryState {
        self.state.lock().await.clone()
    }

    /// Make every write at `stage` fail, optionally only for one event
    pub fn fail_at(&self, stage: FundingStage, event_id: Option<i64>) {
        lock_std(&self.failures).push((stage, event_id));
    }

    pub fn clear_failures(&self) {
        lock_std(&self.failures).clear();
    }

    /// Advisory lock keys in acquisition order, including rolled-back work
    pub fn lock_log(&self) -> Vec<i64> {
        lock_std(&self.locks).clone()
    }

    /// Write a shift record directly, bypassing the verification service
    pub async fn put_shift(&self, shift: ShiftVerification) {
        self.state.lock().await.shifts.insert(shift.key(), shift);
    }
}

fn lock_std<T>(m: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    type Tx = MemoryTx;

    async fn begin(&self) -> AppResult<MemoryTx> {
        let guard = self.state.clone().lock_owned().await;
        let work = guard.clone();
        Ok(MemoryTx {
            guard,
            work,
            failures: self.failures.clone(),
            locks: self.locks.clone(),
        })
    }

    async fn missing_wallet_credits(&self, limit: i64) -> AppResult<Vec<ShiftKey>> {
        let state = self.state.lock().await;
        let mut shifts: Vec<&ShiftVerification> = state
            .shifts
            .values()
            .filter(|s| s.verified && s.credit_amount() > 0 && state.earn_credit(s.key()).is_none())
            .collect();
        shifts.sort_by_key(|s| (s.verified_at, s.event_id, s.user_id));
        Ok(shifts
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|s| s.key())
            .collect())
    }

    async fn unattributed_receipts(&self, limit: i64) -> AppResult<Vec<ShiftKey>> {
        let state = self.state.lock().await;
        Ok(state
            .receipts
            .iter()
            .filter(|r| r.donation_id.is_none() || r.credits_funded == 0)
            .take(limit.max(0) as usize)
            .map(|r| ShiftKey::new(r.event_id, r.volunteer_user_id))
            .collect())
    }

    async fn underfunded_credits(&self, limit: i64) -> AppResult<Vec<ShiftKey>> {
        let state = self.state.lock().await;
        Ok(state
            .wallet_transactions
            .iter()
            .filter(|w| w.reason == WalletReason::EarnShift && w.direction == Direction::Credit)
            .filter(|w| state.funded_credits(w.id) < w.kind_amount)
            .filter_map(|w| w.event_id.map(|event_id| ShiftKey::new(event_id, w.user_id)))
            .take(limit.max(0) as usize)
            .collect())
    }
}

pub struct MemoryTx {
    guard: OwnedMutexGuard<MemoryState>,
    work: MemoryState,
    failures: Arc<StdMutex<Vec<(FundingStage, Option<i64>)>>>,
    locks: Arc<StdMutex<Vec<i64>>>,
}

impl MemoryTx {
    fn inject(&self, stage: FundingStage, event_id: i64) -> AppResult<()> {
        let hit = lock_std(&self.failures)
            .iter()
            .any(|(s, e)| *s == stage && e.map_or(true, |e| e == event_id));
        if hit {
            return Err(AppError::Internal(format!(
                "injected failure at {} for event {}",
                stage, event_id
            )));
        }
        Ok(())
    }
}

fn check_positive(what: &str, amount: i64) -> AppResult<()> {
    if amount <= 0 {
        return Err(AppError::Internal(format!(
            "check constraint violated: {} amount {} must be positive",
            what, amount
        )));
    }
    Ok(())
}

#[async_trait]
impl LedgerTx for MemoryTx {
    async fn lock(&mut self, key: i64) -> AppResult<()> {
        lock_std(&self.locks).push(key);
        Ok(())
    }

    async fn find_pool(&mut self, slug: &PoolSlug) -> AppResult<Option<FundingPool>> {
        Ok(self.work.pool(&slug.to_string()).cloned())
    }

    async fn get_or_create_pool(&mut self, slug: &PoolSlug) -> AppResult<FundingPool> {
        if let Some(pool) = self.work.pool(&slug.to_string()) {
            return Ok(pool.clone());
        }
        let (id, created_at) = self.work.tick();
        let pool = FundingPool {
            id,
            slug: slug.to_string(),
            name: slug.display_name(),
            created_at,
        };
        self.work.pools.push(pool.clone());
        Ok(pool)
    }

    async fn pool_balance(&mut self, pool_id: i64) -> AppResult<PoolBalance> {
        Ok(self.work.balance_of(pool_id))
    }

    async fn insert_pool_transaction(
        &mut self,
        entry: &NewPoolTransaction,
    ) -> AppResult<PoolTransaction> {
        check_positive("pool transaction", entry.amount_credits)?;
        let (id, created_at) = self.work.tick();
        let row = PoolTransaction {
            id,
            pool_id: entry.pool_id,
            direction: entry.direction,
            amount_credits: entry.amount_credits,
            reason: entry.reason,
            donation_id: entry.donation_id,
            event_id: entry.event_id,
            wallet_tx_id: entry.wallet_tx_id,
            note: entry.note.clone(),
            created_at,
        };
        self.work.pool_transactions.push(row.clone());
        Ok(row)
    }

    async fn upsert_donation(&mut self, donation: &NewDonation) -> AppResult<Upserted<Donation>> {
        if let Some(external_id) = donation.external_payment_id.as_deref() {
            let existing = self
                .work
                .donations
                .iter()
                .find(|d| d.external_payment_id.as_deref() == Some(external_id));
            if let Some(existing) = existing {
                return Ok(Upserted::existing(existing.clone()));
            }
        }
        let (id, created_at) = self.work.tick();
        let row = Donation {
            id,
            donor_user_id: donation.donor_user_id,
            external_payment_id: donation.external_payment_id.clone(),
            amount_cents: donation.amount_cents,
            currency: donation.currency.clone(),
            status: DonationStatus::Captured,
            created_at,
        };
        self.work.donations.push(row.clone());
        Ok(Upserted::inserted(row))
    }

    async fn find_donation_credit(
        &mut self,
        pool_id: i64,
        donation_id: i64,
    ) -> AppResult<Option<PoolTransaction>> {
        Ok(self.work.donation_credit(pool_id, donation_id).cloned())
    }

    async fn insert_donation_credit(
        &mut self,
        pool_id: i64,
        donation_id: i64,
        credits: i64,
    ) -> AppResult<Upserted<PoolTransaction>> {
        if let Some(existing) = self.work.donation_credit(pool_id, donation_id) {
            return Ok(Upserted::existing(existing.clone()));
        }
        let row = self
            .insert_pool_transaction(&NewPoolTransaction {
                pool_id,
                direction: Direction::Credit,
                amount_credits: credits,
                reason: PoolReason::DonationIn,
                donation_id: Some(donation_id),
                event_id: None,
                wallet_tx_id: None,
                note: None,
            })
            .await?;
        Ok(Upserted::inserted(row))
    }

    async fn donation_balances(&mut self, pool_id: i64) -> AppResult<Vec<DonationBalance>> {
        let mut balances: Vec<DonationBalance> = self
            .work
            .donations
            .iter()
            .filter(|d| d.status == DonationStatus::Captured)
            .filter_map(|d| {
                let credit = self.work.donation_credit(pool_id, d.id)?;
                Some(DonationBalance {
                    donation_id: d.id,
                    created_at: d.created_at,
                    credited: credit.amount_credits,
                    allocated: self.work.allocated_from(d.id),
                })
            })
            .filter(|b| b.remaining() > 0)
            .collect();
        balances.sort_by_key(|b| (b.created_at, b.donation_id));
        Ok(balances)
    }

    async fn insert_topup(
        &mut self,
        topup: &NewSubscriptionTopup,
    ) -> AppResult<Upserted<SubscriptionTopup>> {
        let existing = self
            .work
            .topups
            .iter()
            .find(|t| t.external_payment_id == topup.external_payment_id);
        if let Some(existing) = existing {
            return Ok(Upserted::existing(existing.clone()));
        }
        let (id, created_at) = self.work.tick();
        let row = SubscriptionTopup {
            id,
            external_payment_id: topup.external_payment_id.clone(),
            owner_user_id: topup.owner_user_id,
            pool_id: topup.pool_id,
            provider_subscription_id: topup.provider_subscription_id.clone(),
            source: topup.source,
            amount_cents: topup.amount_cents,
            currency: topup.currency.clone(),
            amount_credits: topup.amount_credits,
            pool_transaction_id: None,
            created_at,
        };
        self.work.topups.push(row.clone());
        Ok(Upserted::inserted(row))
    }

    async fn link_topup_transaction(&mut self, topup_id: i64, pool_tx_id: i64) -> AppResult<()> {
        if let Some(topup) = self.work.topups.iter_mut().find(|t| t.id == topup_id) {
            topup.pool_transaction_id.get_or_insert(pool_tx_id);
        }
        Ok(())
    }

    async fn upsert_shift(&mut self, shift: &ShiftVerification) -> AppResult<()> {
        let mut next = shift.clone();
        if let Some(previous) = self.work.shifts.get(&shift.key()) {
            next.verified_at = previous.verified_at.or(shift.verified_at);
        }
        self.work.shifts.insert(next.key(), next);
        Ok(())
    }

    async fn load_shift(&mut self, key: ShiftKey) -> AppResult<Option<ShiftVerification>> {
        Ok(self.work.shifts.get(&key).cloned())
    }

    async fn find_earn_credit(&mut self, key: ShiftKey) -> AppResult<Option<WalletTransaction>> {
        Ok(self.work.earn_credit(key).cloned())
    }

    async fn insert_earn_credit(
        &mut self,
        credit: &NewEarnCredit,
    ) -> AppResult<Upserted<WalletTransaction>> {
        self.inject(FundingStage::WalletInsert, credit.event_id)?;
        let key = ShiftKey::new(credit.event_id, credit.user_id);
        if let Some(existing) = self.work.earn_credit(key) {
            return Ok(Upserted::existing(existing.clone()));
        }
        check_positive("wallet transaction", credit.amount)?;
        let (id, created_at) = self.work.tick();
        let row = WalletTransaction {
            id,
            user_id: credit.user_id,
            kind_amount: credit.amount,
            direction: Direction::Credit,
            reason: WalletReason::EarnShift,
            event_id: Some(credit.event_id),
            note: credit.note.clone(),
            created_at,
        };
        self.work.wallet_transactions.push(row.clone());
        Ok(Upserted::inserted(row))
    }

    async fn find_shift_debit(&mut self, wallet_tx_id: i64) -> AppResult<Option<PoolTransaction>> {
        Ok(self.work.shift_debit(wallet_tx_id).cloned())
    }

    async fn find_receipt(&mut self, wallet_tx_id: i64) -> AppResult<Option<DonorReceipt>> {
        Ok(self.work.receipt(wallet_tx_id).cloned())
    }

    async fn upsert_shift_debit(&mut self, debit: &ShiftDebit) -> AppResult<PoolTransaction> {
        self.inject(FundingStage::PoolDebit, debit.event_id)?;
        let existing = self.work.pool_transactions.iter_mut().find(|t| {
            t.reason == PoolReason::ShiftOut
                && t.direction == Direction::Debit
                && t.wallet_tx_id == Some(debit.wallet_tx_id)
        });
        if let Some(row) = existing {
            row.amount_credits = row.amount_credits.max(debit.total_credits);
            if row.donation_id != Some(debit.donation_id) {
                row.donation_id = None;
            }
            return Ok(row.clone());
        }
        self.insert_pool_transaction(&NewPoolTransaction {
            pool_id: debit.pool_id,
            direction: Direction::Debit,
            amount_credits: debit.total_credits,
            reason: PoolReason::ShiftOut,
            donation_id: Some(debit.donation_id),
            event_id: Some(debit.event_id),
            wallet_tx_id: Some(debit.wallet_tx_id),
            note: None,
        })
        .await
    }

    async fn add_allocation(
        &mut self,
        donation_id: i64,
        wallet_tx_id: i64,
        credits: i64,
    ) -> AppResult<()> {
        check_positive("allocation", credits)?;
        let existing = self
            .work
            .allocations
            .iter_mut()
            .find(|a| a.donation_id == donation_id && a.wallet_tx_id == wallet_tx_id);
        match existing {
            Some(allocation) => allocation.credits += credits,
            None => self.work.allocations.push(Allocation {
                donation_id,
                wallet_tx_id,
                credits,
            }),
        }
        Ok(())
    }

    async fn upsert_receipt(&mut self, receipt: &ReceiptUpsert) -> AppResult<DonorReceipt> {
        self.inject(FundingStage::DonorReceipt, receipt.event_id)?;
        let existing = self
            .work
            .receipts
            .iter_mut()
            .find(|r| r.wallet_tx_id == receipt.wallet_tx_id);
        if let Some(row) = existing {
            row.credits_funded = row.credits_funded.max(receipt.credits_funded);
            row.donation_id = row.donation_id.or(receipt.donation_id);
            row.minutes_verified = row.minutes_verified.or(receipt.minutes_verified);
            return Ok(row.clone());
        }
        let (id, created_at) = self.work.tick();
        let row = DonorReceipt {
            id,
            donation_id: receipt.donation_id,
            event_id: receipt.event_id,
            volunteer_user_id: receipt.volunteer_user_id,
            wallet_tx_id: receipt.wallet_tx_id,
            credits_funded: receipt.credits_funded,
            minutes_verified: receipt.minutes_verified,
            created_at,
        };
        self.work.receipts.push(row.clone());
        Ok(row)
    }

    async fn commit(self) -> AppResult<()> {
        let MemoryTx {
            mut guard, work, ..
        } = self;
        *guard = work;
        Ok(())
    }

    async fn rollback(self) -> AppResult<()> {
        Ok(())
    }
}
