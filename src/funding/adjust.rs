use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{AppError, AppResult, PolicyError};
use crate::ledger::lock::pool_lock_key;
use crate::ledger::{
    Direction, LedgerStore, LedgerTx, NewPoolTransaction, PoolBalance, PoolReason, PoolSlug,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolBalanceView {
    pub pool_id: i64,
    pub credits_in: i64,
    pub credits_out: i64,
    pub balance: i64,
}

impl From<PoolBalance> for PoolBalanceView {
    fn from(b: PoolBalance) -> Self {
        Self {
            pool_id: b.pool_id,
            credits_in: b.credits_in,
            credits_out: b.credits_out,
            balance: b.balance(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustmentOutcome {
    pub pool_transaction_id: i64,
    pub balance: PoolBalanceView,
}

/// Operator access to pools: balance reads and manual adjustments
pub struct PoolAdmin<S: LedgerStore> {
    store: Arc<S>,
}

impl<S: LedgerStore> PoolAdmin<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub async fn balance(&self, slug: &PoolSlug) -> AppResult<PoolBalanceView> {
        let mut tx = self.store.begin().await?;
        let pool = tx
            .find_pool(slug)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("pool {}", slug)))?;
        let balance = tx.pool_balance(pool.id).await?;
        tx.rollback().await?;
        Ok(balance.into())
    }

    /// Credit or debit a pool by hand; a debit may not overdraw it
    pub async fn adjust(
        &self,
        slug: &PoolSlug,
        direction: Direction,
        credits: i64,
        note: Option<String>,
    ) -> AppResult<AdjustmentOutcome> {
        if credits <= 0 {
            return Err(PolicyError::NonPositiveAmount {
                field: "credits",
                value: credits,
            }
            .into());
        }

        let mut tx = self.store.begin().await?;
        let pool = tx.get_or_create_pool(slug).await?;
        tx.lock(pool_lock_key(pool.id)).await?;

        let before = tx.pool_balance(pool.id).await?;
        if direction == Direction::Debit && credits > before.balance() {
            warn!(
                pool_id = pool.id,
                requested = credits,
                available = before.balance(),
                "manual debit would overdraw pool"
            );
            return Err(PolicyError::InsufficientPoolBalance {
                requested: credits,
                available: before.balance(),
            }
            .into());
        }

        let entry = tx
            .insert_pool_transaction(&NewPoolTransaction {
                pool_id: pool.id,
                direction,
                amount_credits: credits,
                reason: PoolReason::ManualAdjust,
                donation_id: None,
                event_id: None,
                wallet_tx_id: None,
                note,
            })
            .await?;
        let after = tx.pool_balance(pool.id).await?;
        tx.commit().await?;

        info!(
            pool_id = pool.id,
            pool = %slug,
            direction = %direction,
            credits,
            balance = after.balance(),
            "🛠️ Manual pool adjustment"
        );

        Ok(AdjustmentOutcome {
            pool_transaction_id: entry.id,
            balance: after.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::memory::MemoryLedger;

    #[tokio::test]
    async fn test_credit_then_debit_within_balance() {
        let ledger = MemoryLedger::new();
        let admin = PoolAdmin::new(Arc::new(ledger.clone()));
        let slug = PoolSlug::general();

        let credited = admin
            .adjust(&slug, Direction::Credit, 12, Some("seed".into()))
            .await
            .unwrap();
        assert_eq!(credited.balance.balance, 12);

        let debited = admin.adjust(&slug, Direction::Debit, 5, None).await.unwrap();
        assert_eq!(debited.balance.credits_in, 12);
        assert_eq!(debited.balance.credits_out, 5);
        assert_eq!(admin.balance(&slug).await.unwrap().balance, 7);

        assert!(ledger.lock_log().contains(&pool_lock_key(credited.balance.pool_id)));
    }

    #[tokio::test]
    async fn test_overdraw_is_rejected_and_nothing_written() {
        let ledger = MemoryLedger::new();
        let admin = PoolAdmin::new(Arc::new(ledger.clone()));
        let slug = PoolSlug::general();
        admin.adjust(&slug, Direction::Credit, 3, None).await.unwrap();

        let err = admin.adjust(&slug, Direction::Debit, 4, None).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Policy(PolicyError::InsufficientPoolBalance {
                requested: 4,
                available: 3
            })
        ));
        assert_eq!(ledger.snapshot().await.pool_transactions.len(), 1);
    }

    #[tokio::test]
    async fn test_zero_and_unknown_pool() {
        let ledger = MemoryLedger::new();
        let admin = PoolAdmin::new(Arc::new(ledger.clone()));

        let err = admin
            .adjust(&PoolSlug::general(), Direction::Credit, 0, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Policy(PolicyError::NonPositiveAmount { .. })));

        let missing = PoolSlug::parse("nowhere").unwrap();
        assert!(matches!(admin.balance(&missing).await, Err(AppError::NotFound(_))));
    }
}
