use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{credits_for, non_negative, IntakeDefaults};
use crate::error::AppResult;
use crate::ledger::slug::resolve_target_pool;
use crate::ledger::{LedgerStore, LedgerTx, NewDonation};

/// A captured one-off payment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DonationRequest {
    pub donor_user_id: Option<i64>,
    pub external_payment_id: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
    pub pool_slug: Option<String>,
    pub credits_override: Option<i64>,
    pub cents_per_credit: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DonationCapture {
    pub donation_id: i64,
    pub pool_id: i64,
    /// Credits this donation holds in the pool, whether issued now or before
    pub credits_issued: i64,
    /// 0 when the credit already existed
    pub credits_inserted: i64,
}

/// Donation Intake: records a donation and issues its pool credit exactly once
pub struct DonationIntake<S: LedgerStore> {
    store: Arc<S>,
    defaults: IntakeDefaults,
}

impl<S: LedgerStore> DonationIntake<S> {
    pub fn new(store: Arc<S>, defaults: IntakeDefaults) -> Self {
        Self { store, defaults }
    }

    pub async fn capture(&self, request: &DonationRequest) -> AppResult<DonationCapture> {
        let cents_per_credit = request
            .cents_per_credit
            .unwrap_or(self.defaults.cents_per_credit);
        // Reject before any write
        credits_for(request.amount_cents, request.credits_override, cents_per_credit)?;
        let slug = resolve_target_pool(
            request.pool_slug.as_deref(),
            None,
            &self.defaults.pool_slug,
        )?;

        let mut tx = self.store.begin().await?;

        let donation = tx
            .upsert_donation(&NewDonation {
                donor_user_id: request.donor_user_id,
                external_payment_id: request.external_payment_id.clone(),
                amount_cents: non_negative("amount_cents", request.amount_cents)?,
                currency: request.currency.clone(),
            })
            .await?;
        if !donation.inserted {
            debug!(
                donation_id = donation.row.id,
                external_payment_id = ?request.external_payment_id,
                "reusing existing donation"
            );
        }

        let pool = tx.get_or_create_pool(&slug).await?;

        // The stored amount wins over a retried callback's
        let credits = credits_for(
            donation.row.amount_cents,
            request.credits_override,
            cents_per_credit,
        )?;

        let capture = match tx.find_donation_credit(pool.id, donation.row.id).await? {
            Some(existing) => DonationCapture {
                donation_id: donation.row.id,
                pool_id: pool.id,
                credits_issued: existing.amount_credits,
                credits_inserted: 0,
            },
            None if credits == 0 => DonationCapture {
                donation_id: donation.row.id,
                pool_id: pool.id,
                credits_issued: 0,
                credits_inserted: 0,
            },
            None => {
                let credit = tx
                    .insert_donation_credit(pool.id, donation.row.id, credits)
                    .await?;
                DonationCapture {
                    donation_id: donation.row.id,
                    pool_id: pool.id,
                    credits_issued: credit.row.amount_credits,
                    credits_inserted: if credit.inserted {
                        credit.row.amount_credits
                    } else {
                        0
                    },
                }
            }
        };

        tx.commit().await?;

        info!(
            donation_id = capture.donation_id,
            pool_id = capture.pool_id,
            pool = %slug,
            credits = capture.credits_issued,
            inserted = capture.credits_inserted,
            "💰 Donation captured"
        );

        Ok(capture)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AppError, PolicyError};
    use crate::ledger::memory::MemoryLedger;

    fn intake(ledger: &MemoryLedger) -> DonationIntake<MemoryLedger> {
        DonationIntake::new(Arc::new(ledger.clone()), IntakeDefaults::default())
    }

    fn request(external_id: Option<&str>, amount_cents: i64) -> DonationRequest {
        DonationRequest {
            donor_user_id: Some(3),
            external_payment_id: external_id.map(str::to_string),
            amount_cents,
            currency: "usd".to_string(),
            pool_slug: None,
            credits_override: None,
            cents_per_credit: None,
        }
    }

    #[tokio::test]
    async fn test_capture_issues_credits_to_general() {
        let ledger = MemoryLedger::new();
        let capture = intake(&ledger).capture(&request(Some("pi_1"), 1000)).await.unwrap();

        assert_eq!(capture.credits_issued, 10);
        assert_eq!(capture.credits_inserted, 10);

        let state = ledger.snapshot().await;
        let pool = state.pool("general").unwrap();
        assert_eq!(pool.id, capture.pool_id);
        assert_eq!(state.balance_of(pool.id).balance(), 10);
    }

    #[tokio::test]
    async fn test_redelivery_reuses_donation_and_credits_once() {
        let ledger = MemoryLedger::new();
        let intake = intake(&ledger);

        let first = intake.capture(&request(Some("pi_dup"), 1000)).await.unwrap();
        // A retried callback with a different amount does not change the record
        let second = intake.capture(&request(Some("pi_dup"), 9000)).await.unwrap();

        assert_eq!(first.donation_id, second.donation_id);
        assert_eq!(second.credits_issued, 10);
        assert_eq!(second.credits_inserted, 0);

        let state = ledger.snapshot().await;
        assert_eq!(state.donations.len(), 1);
        assert_eq!(state.pool_transactions.len(), 1);
        assert_eq!(state.balance_of(first.pool_id).balance(), 10);
    }

    #[tokio::test]
    async fn test_without_external_id_each_capture_is_new() {
        let ledger = MemoryLedger::new();
        let intake = intake(&ledger);

        let a = intake.capture(&request(None, 500)).await.unwrap();
        let b = intake.capture(&request(None, 500)).await.unwrap();
        assert_ne!(a.donation_id, b.donation_id);
        assert_eq!(ledger.snapshot().await.balance_of(a.pool_id).balance(), 10);
    }

    #[tokio::test]
    async fn test_override_and_rate() {
        let ledger = MemoryLedger::new();
        let intake = intake(&ledger);

        let mut req = request(Some("pi_o"), 1000);
        req.credits_override = Some(3);
        assert_eq!(intake.capture(&req).await.unwrap().credits_issued, 3);

        let mut req = request(Some("pi_r"), 1000);
        req.cents_per_credit = Some(250);
        assert_eq!(intake.capture(&req).await.unwrap().credits_issued, 4);
    }

    #[tokio::test]
    async fn test_sub_credit_amount_records_donation_without_credit() {
        let ledger = MemoryLedger::new();
        let capture = intake(&ledger).capture(&request(Some("pi_s"), 50)).await.unwrap();

        assert_eq!(capture.credits_issued, 0);
        let state = ledger.snapshot().await;
        assert_eq!(state.donations.len(), 1);
        assert!(state.pool_transactions.is_empty());
    }

    #[tokio::test]
    async fn test_policy_violations_write_nothing() {
        let ledger = MemoryLedger::new();
        let intake = intake(&ledger);

        let err = intake.capture(&request(Some("pi_n"), -100)).await.unwrap_err();
        assert!(matches!(err, AppError::Policy(PolicyError::NegativeAmount { .. })));

        let mut req = request(Some("pi_b"), 100);
        req.pool_slug = Some("Not A Slug".to_string());
        let err = intake.capture(&req).await.unwrap_err();
        assert!(matches!(err, AppError::Policy(PolicyError::InvalidSlug(_))));

        let state = ledger.snapshot().await;
        assert!(state.donations.is_empty());
        assert!(state.pools.is_empty());
    }
}
