use async_trait::async_trait;
use sqlx::{postgres::PgRow, PgPool, Postgres, Row, Transaction};
use tracing::debug;

use super::models::*;
use super::slug::PoolSlug;
use super::store::{LedgerStore, LedgerTx};
use crate::error::{AppError, AppResult};

const POOL_TX_COLUMNS: &str = "id, pool_id, direction, amount_credits, reason, donation_id, \
     event_id, wallet_tx_id, note, created_at";
const DONATION_COLUMNS: &str =
    "id, donor_user_id, external_payment_id, amount_cents, currency, status, created_at";
const WALLET_COLUMNS: &str =
    "id, user_id, kind_amount, direction, reason, event_id, note, created_at";
const RECEIPT_COLUMNS: &str = "id, donation_id, event_id, volunteer_user_id, wallet_tx_id, \
     credits_funded, minutes_verified, created_at";
const TOPUP_COLUMNS: &str = "id, external_payment_id, owner_user_id, pool_id, \
     provider_subscription_id, source, amount_cents, currency, amount_credits, \
     pool_transaction_id, created_at";

/// Ledger repository - THE source of truth for pools, donations and credits
#[derive(Clone)]
pub struct LedgerRepository {
    pub pool: PgPool,
}

impl LedgerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn shift_keys(&self, sql: &str, limit: i64) -> AppResult<Vec<ShiftKey>> {
        let rows = sqlx::query(sql).bind(limit).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                Ok(ShiftKey {
                    event_id: row.try_get("event_id")?,
                    user_id: row.try_get("user_id")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl LedgerStore for LedgerRepository {
    type Tx = PgLedgerTx;

    async fn begin(&self) -> AppResult<PgLedgerTx> {
        Ok(PgLedgerTx {
            tx: self.pool.begin().await?,
        })
    }

    async fn missing_wallet_credits(&self, limit: i64) -> AppResult<Vec<ShiftKey>> {
        self.shift_keys(
            r#"
            SELECT s.event_id, s.user_id
            FROM shift_verifications s
            WHERE s.verified
              AND GREATEST(s.reward_pool_kind, 0) / GREATEST(s.capacity, 1) > 0
              AND NOT EXISTS (
                  SELECT 1 FROM wallet_transactions w
                  WHERE w.user_id = s.user_id
                    AND w.event_id = s.event_id
                    AND w.reason = 'earn_shift'
                    AND w.direction = 'credit'
              )
            ORDER BY s.verified_at NULLS FIRST, s.event_id, s.user_id
            LIMIT $1
            "#,
            limit,
        )
        .await
    }

    async fn unattributed_receipts(&self, limit: i64) -> AppResult<Vec<ShiftKey>> {
        self.shift_keys(
            r#"
            SELECT r.event_id, r.volunteer_user_id AS user_id
            FROM donor_receipts r
            WHERE r.donation_id IS NULL OR r.credits_funded = 0
            ORDER BY r.created_at, r.id
            LIMIT $1
            "#,
            limit,
        )
        .await
    }

    async fn underfunded_credits(&self, limit: i64) -> AppResult<Vec<ShiftKey>> {
        self.shift_keys(
            r#"
            SELECT w.event_id, w.user_id
            FROM wallet_transactions w
            LEFT JOIN donor_receipts r ON r.wallet_tx_id = w.id
            LEFT JOIN pool_transactions p
                   ON p.wallet_tx_id = w.id
                  AND p.reason = 'shift_out'
                  AND p.direction = 'debit'
            WHERE w.reason = 'earn_shift'
              AND w.direction = 'credit'
              AND w.event_id IS NOT NULL
              AND GREATEST(COALESCE(r.credits_funded, 0), COALESCE(p.amount_credits, 0)) < w.kind_amount
            ORDER BY w.created_at, w.id
            LIMIT $1
            "#,
            limit,
        )
        .await
    }
}

/// One Postgres transaction; dropping it without commit rolls back
pub struct PgLedgerTx {
    tx: Transaction<'static, Postgres>,
}

impl PgLedgerTx {
    async fn pool_tx_where(&mut self, predicate: &str, a: i64, b: Option<i64>) -> AppResult<Option<PoolTransaction>> {
        let sql = format!(
            "SELECT {} FROM pool_transactions WHERE {} ORDER BY id LIMIT 1",
            POOL_TX_COLUMNS, predicate
        );
        let mut query = sqlx::query(&sql).bind(a);
        if let Some(b) = b {
            query = query.bind(b);
        }
        query
            .fetch_optional(&mut *self.tx)
            .await?
            .as_ref()
            .map(PoolTransaction::from_row)
            .transpose()
    }

    async fn find_donation_by_external_id(&mut self, external_id: &str) -> AppResult<Option<Donation>> {
        let sql = format!(
            "SELECT {} FROM donations WHERE external_payment_id = $1",
            DONATION_COLUMNS
        );
        sqlx::query(&sql)
            .bind(external_id)
            .fetch_optional(&mut *self.tx)
            .await?
            .as_ref()
            .map(Donation::from_row)
            .transpose()
    }
}

fn expect_row<T>(row: Option<T>, what: &str) -> AppResult<T> {
    row.ok_or_else(|| AppError::Internal(format!("{} vanished inside its own transaction", what)))
}

fn donation_balance(row: &PgRow) -> AppResult<DonationBalance> {
    Ok(DonationBalance {
        donation_id: row.try_get("donation_id")?,
        created_at: row.try_get("created_at")?,
        credited: row.try_get("credited")?,
        allocated: row.try_get("allocated")?,
    })
}

#[async_trait]
impl LedgerTx for PgLedgerTx {
    async fn lock(&mut self, key: i64) -> AppResult<()> {
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(key)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    // ========== POOLS ==========

    async fn find_pool(&mut self, slug: &PoolSlug) -> AppResult<Option<FundingPool>> {
        let pool = sqlx::query_as::<_, FundingPool>(
            "SELECT id, slug, name, created_at FROM funding_pools WHERE slug = $1",
        )
        .bind(slug.to_string())
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(pool)
    }

    async fn get_or_create_pool(&mut self, slug: &PoolSlug) -> AppResult<FundingPool> {
        let created = sqlx::query_as::<_, FundingPool>(
            r#"
            INSERT INTO funding_pools (slug, name)
            VALUES ($1, $2)
            ON CONFLICT (slug) DO NOTHING
            RETURNING id, slug, name, created_at
            "#,
        )
        .bind(slug.to_string())
        .bind(slug.display_name())
        .fetch_optional(&mut *self.tx)
        .await?;

        match created {
            Some(pool) => {
                debug!(pool_id = pool.id, slug = %pool.slug, "created funding pool");
                Ok(pool)
            }
            None => expect_row(self.find_pool(slug).await?, "funding pool"),
        }
    }

    async fn pool_balance(&mut self, pool_id: i64) -> AppResult<PoolBalance> {
        let row = sqlx::query(
            r#"
            SELECT
                COALESCE(SUM(amount_credits) FILTER (WHERE direction = 'credit'), 0)::BIGINT AS credits_in,
                COALESCE(SUM(amount_credits) FILTER (WHERE direction = 'debit'), 0)::BIGINT AS credits_out
            FROM pool_transactions
            WHERE pool_id = $1
            "#,
        )
        .bind(pool_id)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(PoolBalance {
            pool_id,
            credits_in: row.try_get("credits_in")?,
            credits_out: row.try_get("credits_out")?,
        })
    }

    async fn insert_pool_transaction(
        &mut self,
        entry: &NewPoolTransaction,
    ) -> AppResult<PoolTransaction> {
        let sql = format!(
            r#"
            INSERT INTO pool_transactions
                (pool_id, direction, amount_credits, reason, donation_id, event_id, wallet_tx_id, note)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {}
            "#,
            POOL_TX_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(entry.pool_id)
            .bind(entry.direction.as_str())
            .bind(entry.amount_credits)
            .bind(entry.reason.as_str())
            .bind(entry.donation_id)
            .bind(entry.event_id)
            .bind(entry.wallet_tx_id)
            .bind(entry.note.as_deref())
            .fetch_one(&mut *self.tx)
            .await?;

        PoolTransaction::from_row(&row)
    }

    // ========== DONATIONS ==========

    async fn upsert_donation(&mut self, donation: &NewDonation) -> AppResult<Upserted<Donation>> {
        let sql = format!(
            r#"
            INSERT INTO donations (donor_user_id, external_payment_id, amount_cents, currency, status)
            VALUES ($1, $2, $3, $4, 'captured')
            ON CONFLICT (external_payment_id) WHERE external_payment_id IS NOT NULL DO NOTHING
            RETURNING {}
            "#,
            DONATION_COLUMNS
        );
        let inserted = sqlx::query(&sql)
            .bind(donation.donor_user_id)
            .bind(donation.external_payment_id.as_deref())
            .bind(donation.amount_cents)
            .bind(&donation.currency)
            .fetch_optional(&mut *self.tx)
            .await?;

        if let Some(row) = inserted {
            return Ok(Upserted::inserted(Donation::from_row(&row)?));
        }

        // Only a conflicting external payment id can suppress the insert
        let external_id = donation
            .external_payment_id
            .as_deref()
            .ok_or_else(|| AppError::Internal("donation insert returned no row".to_string()))?;
        let existing = self.find_donation_by_external_id(external_id).await?;
        Ok(Upserted::existing(expect_row(existing, "donation")?))
    }

    async fn find_donation_credit(
        &mut self,
        pool_id: i64,
        donation_id: i64,
    ) -> AppResult<Option<PoolTransaction>> {
        self.pool_tx_where(
            "pool_id = $1 AND donation_id = $2 AND reason = 'donation_in'",
            pool_id,
            Some(donation_id),
        )
        .await
    }

    async fn insert_donation_credit(
        &mut self,
        pool_id: i64,
        donation_id: i64,
        credits: i64,
    ) -> AppResult<Upserted<PoolTransaction>> {
        let sql = format!(
            r#"
            INSERT INTO pool_transactions (pool_id, direction, amount_credits, reason, donation_id)
            VALUES ($1, 'credit', $3, 'donation_in', $2)
            ON CONFLICT (pool_id, donation_id) WHERE reason = 'donation_in' DO NOTHING
            RETURNING {}
            "#,
            POOL_TX_COLUMNS
        );
        let inserted = sqlx::query(&sql)
            .bind(pool_id)
            .bind(donation_id)
            .bind(credits)
            .fetch_optional(&mut *self.tx)
            .await?;

        match inserted {
            Some(row) => Ok(Upserted::inserted(PoolTransaction::from_row(&row)?)),
            None => {
                let existing = self.find_donation_credit(pool_id, donation_id).await?;
                Ok(Upserted::existing(expect_row(existing, "donation credit")?))
            }
        }
    }

    async fn donation_balances(&mut self, pool_id: i64) -> AppResult<Vec<DonationBalance>> {
        let rows = sqlx::query(
            r#"
            SELECT d.id AS donation_id,
                   d.created_at,
                   c.credited,
                   COALESCE(a.allocated, 0)::BIGINT AS allocated
            FROM donations d
            JOIN (
                SELECT donation_id, SUM(amount_credits)::BIGINT AS credited
                FROM pool_transactions
                WHERE pool_id = $1 AND reason = 'donation_in' AND direction = 'credit'
                GROUP BY donation_id
            ) c ON c.donation_id = d.id
            LEFT JOIN (
                SELECT donation_id, SUM(credits)::BIGINT AS allocated
                FROM donation_allocations
                GROUP BY donation_id
            ) a ON a.donation_id = d.id
            WHERE d.status = 'captured'
              AND c.credited - COALESCE(a.allocated, 0) > 0
            ORDER BY d.created_at ASC, d.id ASC
            "#,
        )
        .bind(pool_id)
        .fetch_all(&mut *self.tx)
        .await?;

        rows.iter().map(donation_balance).collect()
    }

    // ========== TOP-UPS ==========

    async fn insert_topup(
        &mut self,
        topup: &NewSubscriptionTopup,
    ) -> AppResult<Upserted<SubscriptionTopup>> {
        let sql = format!(
            r#"
            INSERT INTO subscription_topups (
                external_payment_id, owner_user_id, pool_id, provider_subscription_id,
                source, amount_cents, currency, amount_credits
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (external_payment_id) DO NOTHING
            RETURNING {}
            "#,
            TOPUP_COLUMNS
        );
        let inserted = sqlx::query(&sql)
            .bind(&topup.external_payment_id)
            .bind(topup.owner_user_id)
            .bind(topup.pool_id)
            .bind(topup.provider_subscription_id.as_deref())
            .bind(topup.source.as_str())
            .bind(topup.amount_cents)
            .bind(&topup.currency)
            .bind(topup.amount_credits)
            .fetch_optional(&mut *self.tx)
            .await?;

        if let Some(row) = inserted {
            return Ok(Upserted::inserted(SubscriptionTopup::from_row(&row)?));
        }

        let sql = format!(
            "SELECT {} FROM subscription_topups WHERE external_payment_id = $1",
            TOPUP_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(&topup.external_payment_id)
            .fetch_optional(&mut *self.tx)
            .await?;
        let row = expect_row(row, "subscription top-up")?;
        Ok(Upserted::existing(SubscriptionTopup::from_row(&row)?))
    }

    async fn link_topup_transaction(&mut self, topup_id: i64, pool_tx_id: i64) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE subscription_topups
            SET pool_transaction_id = $2
            WHERE id = $1 AND pool_transaction_id IS NULL
            "#,
        )
        .bind(topup_id)
        .bind(pool_tx_id)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    // ========== SHIFTS ==========

    async fn upsert_shift(&mut self, shift: &ShiftVerification) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO shift_verifications (
                event_id, user_id, verified, attended_minutes, checked_in_at, checked_out_at,
                reward_pool_kind, capacity, pool_slug, verified_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (event_id, user_id) DO UPDATE SET
                verified = EXCLUDED.verified,
                attended_minutes = EXCLUDED.attended_minutes,
                checked_in_at = EXCLUDED.checked_in_at,
                checked_out_at = EXCLUDED.checked_out_at,
                reward_pool_kind = EXCLUDED.reward_pool_kind,
                capacity = EXCLUDED.capacity,
                pool_slug = EXCLUDED.pool_slug,
                verified_at = COALESCE(shift_verifications.verified_at, EXCLUDED.verified_at)
            "#,
        )
        .bind(shift.event_id)
        .bind(shift.user_id)
        .bind(shift.verified)
        .bind(shift.attended_minutes)
        .bind(shift.checked_in_at)
        .bind(shift.checked_out_at)
        .bind(shift.reward_pool_kind)
        .bind(shift.capacity)
        .bind(shift.pool_slug.as_deref())
        .bind(shift.verified_at)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn load_shift(&mut self, key: ShiftKey) -> AppResult<Option<ShiftVerification>> {
        let shift = sqlx::query_as::<_, ShiftVerification>(
            r#"
            SELECT event_id, user_id, verified, attended_minutes, checked_in_at, checked_out_at,
                   reward_pool_kind, capacity, pool_slug, verified_at
            FROM shift_verifications
            WHERE event_id = $1 AND user_id = $2
            "#,
        )
        .bind(key.event_id)
        .bind(key.user_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(shift)
    }

    async fn find_earn_credit(&mut self, key: ShiftKey) -> AppResult<Option<WalletTransaction>> {
        let sql = format!(
            r#"
            SELECT {}
            FROM wallet_transactions
            WHERE user_id = $1 AND event_id = $2
              AND reason = 'earn_shift' AND direction = 'credit'
            "#,
            WALLET_COLUMNS
        );
        sqlx::query(&sql)
            .bind(key.user_id)
            .bind(key.event_id)
            .fetch_optional(&mut *self.tx)
            .await?
            .as_ref()
            .map(WalletTransaction::from_row)
            .transpose()
    }

    async fn insert_earn_credit(
        &mut self,
        credit: &NewEarnCredit,
    ) -> AppResult<Upserted<WalletTransaction>> {
        let sql = format!(
            r#"
            INSERT INTO wallet_transactions (user_id, kind_amount, direction, reason, event_id, note)
            VALUES ($1, $2, 'credit', 'earn_shift', $3, $4)
            ON CONFLICT (user_id, event_id) WHERE reason = 'earn_shift' AND direction = 'credit'
            DO NOTHING
            RETURNING {}
            "#,
            WALLET_COLUMNS
        );
        let inserted = sqlx::query(&sql)
            .bind(credit.user_id)
            .bind(credit.amount)
            .bind(credit.event_id)
            .bind(&credit.note)
            .fetch_optional(&mut *self.tx)
            .await?;

        match inserted {
            Some(row) => Ok(Upserted::inserted(WalletTransaction::from_row(&row)?)),
            None => {
                let key = ShiftKey::new(credit.event_id, credit.user_id);
                let existing = self.find_earn_credit(key).await?;
                Ok(Upserted::existing(expect_row(existing, "earn_shift credit")?))
            }
        }
    }

    async fn find_shift_debit(&mut self, wallet_tx_id: i64) -> AppResult<Option<PoolTransaction>> {
        self.pool_tx_where(
            "wallet_tx_id = $1 AND reason = 'shift_out' AND direction = 'debit'",
            wallet_tx_id,
            None,
        )
        .await
    }

    async fn find_receipt(&mut self, wallet_tx_id: i64) -> AppResult<Option<DonorReceipt>> {
        let sql = format!(
            "SELECT {} FROM donor_receipts WHERE wallet_tx_id = $1",
            RECEIPT_COLUMNS
        );
        let receipt = sqlx::query_as::<_, DonorReceipt>(&sql)
            .bind(wallet_tx_id)
            .fetch_optional(&mut *self.tx)
            .await?;

        Ok(receipt)
    }

    async fn upsert_shift_debit(&mut self, debit: &ShiftDebit) -> AppResult<PoolTransaction> {
        let sql = format!(
            r#"
            INSERT INTO pool_transactions
                (pool_id, direction, amount_credits, reason, donation_id, event_id, wallet_tx_id)
            VALUES ($1, 'debit', $2, 'shift_out', $3, $4, $5)
            ON CONFLICT (wallet_tx_id) WHERE reason = 'shift_out' AND direction = 'debit'
            DO UPDATE SET
                amount_credits = GREATEST(pool_transactions.amount_credits, EXCLUDED.amount_credits),
                donation_id = CASE
                    WHEN pool_transactions.donation_id = EXCLUDED.donation_id
                    THEN pool_transactions.donation_id
                END
            RETURNING {}
            "#,
            POOL_TX_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(debit.pool_id)
            .bind(debit.total_credits)
            .bind(debit.donation_id)
            .bind(debit.event_id)
            .bind(debit.wallet_tx_id)
            .fetch_one(&mut *self.tx)
            .await?;

        PoolTransaction::from_row(&row)
    }

    async fn add_allocation(
        &mut self,
        donation_id: i64,
        wallet_tx_id: i64,
        credits: i64,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO donation_allocations (donation_id, wallet_tx_id, credits)
            VALUES ($1, $2, $3)
            ON CONFLICT (wallet_tx_id, donation_id)
            DO UPDATE SET credits = donation_allocations.credits + EXCLUDED.credits
            "#,
        )
        .bind(donation_id)
        .bind(wallet_tx_id)
        .bind(credits)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn upsert_receipt(&mut self, receipt: &ReceiptUpsert) -> AppResult<DonorReceipt> {
        let sql = format!(
            r#"
            INSERT INTO donor_receipts
                (donation_id, event_id, volunteer_user_id, wallet_tx_id, credits_funded, minutes_verified)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (wallet_tx_id) DO UPDATE SET
                credits_funded = GREATEST(donor_receipts.credits_funded, EXCLUDED.credits_funded),
                donation_id = COALESCE(donor_receipts.donation_id, EXCLUDED.donation_id),
                minutes_verified = COALESCE(donor_receipts.minutes_verified, EXCLUDED.minutes_verified)
            RETURNING {}
            "#,
            RECEIPT_COLUMNS
        );
        let receipt = sqlx::query_as::<_, DonorReceipt>(&sql)
            .bind(receipt.donation_id)
            .bind(receipt.event_id)
            .bind(receipt.volunteer_user_id)
            .bind(receipt.wallet_tx_id)
            .bind(receipt.credits_funded)
            .bind(receipt.minutes_verified)
            .fetch_one(&mut *self.tx)
            .await?;

        Ok(receipt)
    }

    async fn commit(self) -> AppResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> AppResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
