use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{credits_for, non_negative, IntakeDefaults};
use crate::error::AppResult;
use crate::ledger::slug::resolve_target_pool;
use crate::ledger::{
    Direction, LedgerStore, LedgerTx, NewPoolTransaction, NewSubscriptionTopup, TopupSource,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopupRequest {
    pub external_payment_id: String,
    pub amount_cents: i64,
    pub currency: String,
    pub pool_slug: Option<String>,
    pub owner_user_id: Option<i64>,
    pub provider_subscription_id: Option<String>,
    pub source: TopupSource,
    pub credits_override: Option<i64>,
    pub cents_per_credit: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopupCapture {
    pub topup_id: i64,
    pub pool_id: i64,
    pub pool_slug: String,
    pub credits: i64,
    pub pool_transaction_id: Option<i64>,
    /// false when the payment id had already been recorded
    pub inserted: bool,
}

/// Subscription/Org Top-up Intake
///
/// Idempotency rests on the unique external payment id: a duplicate delivery
/// returns the recorded top-up and writes no second pool transaction.
pub struct TopupIntake<S: LedgerStore> {
    store: Arc<S>,
    defaults: IntakeDefaults,
}

impl<S: LedgerStore> TopupIntake<S> {
    pub fn new(store: Arc<S>, defaults: IntakeDefaults) -> Self {
        Self { store, defaults }
    }

    pub async fn capture(&self, request: &TopupRequest) -> AppResult<TopupCapture> {
        let cents_per_credit = request
            .cents_per_credit
            .unwrap_or(self.defaults.cents_per_credit);
        let credits = credits_for(request.amount_cents, request.credits_override, cents_per_credit)?;
        let slug = resolve_target_pool(
            request.pool_slug.as_deref(),
            request.owner_user_id,
            &self.defaults.pool_slug,
        )?;

        let mut tx = self.store.begin().await?;
        let pool = tx.get_or_create_pool(&slug).await?;

        let topup = tx
            .insert_topup(&NewSubscriptionTopup {
                external_payment_id: request.external_payment_id.clone(),
                owner_user_id: slug.owner(),
                pool_id: pool.id,
                provider_subscription_id: request.provider_subscription_id.clone(),
                source: request.source,
                amount_cents: non_negative("amount_cents", request.amount_cents)?,
                currency: request.currency.clone(),
                amount_credits: credits,
            })
            .await?;

        if !topup.inserted {
            tx.rollback().await?;
            debug!(
                topup_id = topup.row.id,
                external_payment_id = %request.external_payment_id,
                "top-up already recorded"
            );
            return Ok(TopupCapture {
                topup_id: topup.row.id,
                pool_id: topup.row.pool_id,
                pool_slug: slug.to_string(),
                credits: topup.row.amount_credits,
                pool_transaction_id: topup.row.pool_transaction_id,
                inserted: false,
            });
        }

        let mut pool_transaction_id = None;
        if credits > 0 {
            let entry = tx
                .insert_pool_transaction(&NewPoolTransaction {
                    pool_id: pool.id,
                    direction: Direction::Credit,
                    amount_credits: credits,
                    reason: request.source.pool_reason(),
                    donation_id: None,
                    event_id: None,
                    wallet_tx_id: None,
                    note: request.provider_subscription_id.clone(),
                })
                .await?;
            tx.link_topup_transaction(topup.row.id, entry.id).await?;
            pool_transaction_id = Some(entry.id);
        }

        tx.commit().await?;

        info!(
            topup_id = topup.row.id,
            pool_id = pool.id,
            pool = %slug,
            source = %request.source,
            credits,
            "🔁 Top-up credited"
        );

        Ok(TopupCapture {
            topup_id: topup.row.id,
            pool_id: pool.id,
            pool_slug: slug.to_string(),
            credits,
            pool_transaction_id,
            inserted: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AppError, PolicyError};
    use crate::ledger::memory::MemoryLedger;
    use crate::ledger::PoolReason;

    fn intake(ledger: &MemoryLedger) -> TopupIntake<MemoryLedger> {
        TopupIntake::new(Arc::new(ledger.clone()), IntakeDefaults::default())
    }

    fn request(id: &str, owner: Option<i64>, slug: Option<&str>) -> TopupRequest {
        TopupRequest {
            external_payment_id: id.to_string(),
            amount_cents: 2500,
            currency: "usd".to_string(),
            pool_slug: slug.map(str::to_string),
            owner_user_id: owner,
            provider_subscription_id: Some("sub_42".to_string()),
            source: TopupSource::Subscription,
            credits_override: None,
            cents_per_credit: None,
        }
    }

    #[tokio::test]
    async fn test_owner_routes_to_private_pool() {
        let ledger = MemoryLedger::new();
        let capture = intake(&ledger)
            .capture(&request("in_1", Some(7), Some("retreat")))
            .await
            .unwrap();

        assert_eq!(capture.pool_slug, "u7__retreat");
        assert_eq!(capture.credits, 25);

        let state = ledger.snapshot().await;
        let pool = state.pool("u7__retreat").unwrap();
        assert_eq!(state.balance_of(pool.id).balance(), 25);
        assert_eq!(state.topups[0].owner_user_id, Some(7));
        assert_eq!(state.topups[0].pool_transaction_id, capture.pool_transaction_id);
        assert_eq!(state.pool_transactions[0].reason, PoolReason::SubscriptionTopup);
    }

    #[tokio::test]
    async fn test_no_owner_defaults_to_general() {
        let ledger = MemoryLedger::new();
        let capture = intake(&ledger).capture(&request("in_2", None, None)).await.unwrap();
        assert_eq!(capture.pool_slug, "general");
    }

    #[tokio::test]
    async fn test_owner_recovered_from_scoped_slug() {
        let ledger = MemoryLedger::new();
        intake(&ledger)
            .capture(&request("in_3", None, Some("u9__camp")))
            .await
            .unwrap();
        assert_eq!(ledger.snapshot().await.topups[0].owner_user_id, Some(9));
    }

    #[tokio::test]
    async fn test_duplicate_payment_credits_once() {
        let ledger = MemoryLedger::new();
        let intake = intake(&ledger);

        let first = intake.capture(&request("in_dup", Some(7), Some("retreat"))).await.unwrap();
        let mut retry = request("in_dup", Some(7), Some("retreat"));
        retry.credits_override = Some(999);
        let second = intake.capture(&retry).await.unwrap();

        assert!(!second.inserted);
        assert_eq!(second.topup_id, first.topup_id);
        assert_eq!(second.credits, 25);
        assert_eq!(second.pool_transaction_id, first.pool_transaction_id);

        let state = ledger.snapshot().await;
        assert_eq!(state.topups.len(), 1);
        assert_eq!(state.pool_transactions.len(), 1);
    }

    #[tokio::test]
    async fn test_org_source_uses_org_reason() {
        let ledger = MemoryLedger::new();
        let mut req = request("org_1", None, None);
        req.source = TopupSource::Organization;
        intake(&ledger).capture(&req).await.unwrap();

        assert_eq!(
            ledger.snapshot().await.pool_transactions[0].reason,
            PoolReason::OrgTopup
        );
    }

    #[tokio::test]
    async fn test_conflicting_owner_is_rejected() {
        let ledger = MemoryLedger::new();
        let err = intake(&ledger)
            .capture(&request("in_4", Some(8), Some("u7__retreat")))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Policy(PolicyError::OwnerMismatch { .. })));
        assert!(ledger.snapshot().await.pools.is_empty());
    }
}
