//! Unit-of-work seam between the ledger services and persistence.
//!
//! Every ledger-affecting operation opens one [`LedgerTx`], does all of its
//! reads and writes through it, and commits or rolls back as a whole.
//! Services take the store as an injected `Arc<S>`; production wires in
//! [`super::repository::LedgerRepository`], tests use the in-memory ledger.

use async_trait::async_trait;

use super::models::*;
use super::slug::PoolSlug;
use crate::error::AppResult;

#[async_trait]
pub trait LedgerStore: Send + Sync + 'static {
    type Tx: LedgerTx;

    async fn begin(&self) -> AppResult<Self::Tx>;

    /// Verified shifts worth at least one credit that never received an
    /// earn_shift wallet credit
    async fn missing_wallet_credits(&self, limit: i64) -> AppResult<Vec<ShiftKey>>;

    /// Shifts whose receipt has no donation or zero funded credits
    async fn unattributed_receipts(&self, limit: i64) -> AppResult<Vec<ShiftKey>>;

    /// Earned credits whose funded amount is below the credited amount
    async fn underfunded_credits(&self, limit: i64) -> AppResult<Vec<ShiftKey>>;
}

#[async_trait]
pub trait LedgerTx: Send {
    /// Transaction-scoped mutual exclusion, released on commit or rollback
    async fn lock(&mut self, key: i64) -> AppResult<()>;

    // ========== POOLS ==========

    async fn find_pool(&mut self, slug: &PoolSlug) -> AppResult<Option<FundingPool>>;

    async fn get_or_create_pool(&mut self, slug: &PoolSlug) -> AppResult<FundingPool>;

    /// Sum of credits minus sum of debits, never cached
    async fn pool_balance(&mut self, pool_id: i64) -> AppResult<PoolBalance>;

    async fn insert_pool_transaction(
        &mut self,
        entry: &NewPoolTransaction,
    ) -> AppResult<PoolTransaction>;

    // ========== DONATIONS ==========

    /// Insert a captured donation, or return the one already recorded under
    /// the same external payment id
    async fn upsert_donation(&mut self, donation: &NewDonation) -> AppResult<Upserted<Donation>>;

    async fn find_donation_credit(
        &mut self,
        pool_id: i64,
        donation_id: i64,
    ) -> AppResult<Option<PoolTransaction>>;

    /// The donation_in credit for (pool, donation), at most once
    async fn insert_donation_credit(
        &mut self,
        pool_id: i64,
        donation_id: i64,
        credits: i64,
    ) -> AppResult<Upserted<PoolTransaction>>;

    /// Captured donations credited into the pool that still have credits
    /// left, oldest first
    async fn donation_balances(&mut self, pool_id: i64) -> AppResult<Vec<DonationBalance>>;

    // ========== TOP-UPS ==========

    async fn insert_topup(
        &mut self,
        topup: &NewSubscriptionTopup,
    ) -> AppResult<Upserted<SubscriptionTopup>>;

    async fn link_topup_transaction(&mut self, topup_id: i64, pool_tx_id: i64) -> AppResult<()>;

    // ========== SHIFTS ==========

    async fn upsert_shift(&mut self, shift: &ShiftVerification) -> AppResult<()>;

    async fn load_shift(&mut self, key: ShiftKey) -> AppResult<Option<ShiftVerification>>;

    async fn find_earn_credit(&mut self, key: ShiftKey) -> AppResult<Option<WalletTransaction>>;

    /// The earn_shift credit for (user, event), at most once
    async fn insert_earn_credit(
        &mut self,
        credit: &NewEarnCredit,
    ) -> AppResult<Upserted<WalletTransaction>>;

    async fn find_shift_debit(&mut self, wallet_tx_id: i64) -> AppResult<Option<PoolTransaction>>;

    async fn find_receipt(&mut self, wallet_tx_id: i64) -> AppResult<Option<DonorReceipt>>;

    /// Write the single shift_out debit; the stored amount only grows
    async fn upsert_shift_debit(&mut self, debit: &ShiftDebit) -> AppResult<PoolTransaction>;

    /// Add `credits` to the (donation, wallet tx) allocation
    async fn add_allocation(
        &mut self,
        donation_id: i64,
        wallet_tx_id: i64,
        credits: i64,
    ) -> AppResult<()>;

    /// Write the single receipt; funded credits only grow and a recorded
    /// donation is never replaced
    async fn upsert_receipt(&mut self, receipt: &ReceiptUpsert) -> AppResult<DonorReceipt>;

    async fn commit(self) -> AppResult<()>;

    async fn rollback(self) -> AppResult<()>;
}
