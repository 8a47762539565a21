//! FIFO attribution: the only allocation policy in the ledger.
//!
//! Volunteer credits are funded from the oldest captured donation in the pool
//! that still has unallocated credits. The synchronous funding path and every
//! reconciliation job go through [`oldest_with_remaining`].

use super::models::DonationBalance;
use super::store::LedgerTx;
use crate::error::AppResult;

/// Oldest donation in `pool_id` with remaining credits, if any
pub async fn oldest_with_remaining<T: LedgerTx>(
    tx: &mut T,
    pool_id: i64,
) -> AppResult<Option<DonationBalance>> {
    let balances = tx.donation_balances(pool_id).await?;
    Ok(pick_fifo(balances))
}

/// Pick by creation time, then id, skipping exhausted donations
pub fn pick_fifo(balances: Vec<DonationBalance>) -> Option<DonationBalance> {
    balances
        .into_iter()
        .filter(|b| b.remaining() > 0)
        .min_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.donation_id.cmp(&b.donation_id))
        })
}

/// Credits one pass may draw: bounded by what is still owed, what the pool
/// holds and what the chosen donation can back
pub fn attributable_credits(outstanding: i64, pool_balance: i64, donation_remaining: i64) -> i64 {
    outstanding.min(pool_balance).min(donation_remaining).max(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn balance(id: i64, minutes_after: i64, credited: i64, allocated: i64) -> DonationBalance {
        DonationBalance {
            donation_id: id,
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
                + Duration::minutes(minutes_after),
            credited,
            allocated,
        }
    }

    #[test]
    fn test_oldest_with_remaining_wins() {
        let picked = pick_fifo(vec![
            balance(2, 10, 100, 0),
            balance(1, 0, 50, 0),
            balance(3, 20, 10, 0),
        ])
        .unwrap();
        assert_eq!(picked.donation_id, 1);
    }

    #[test]
    fn test_exhausted_donations_are_skipped() {
        let picked = pick_fifo(vec![balance(1, 0, 50, 50), balance(2, 10, 100, 20)]).unwrap();
        assert_eq!(picked.donation_id, 2);
        assert_eq!(picked.remaining(), 80);

        assert!(pick_fifo(vec![balance(1, 0, 5, 5)]).is_none());
        assert!(pick_fifo(Vec::new()).is_none());
    }

    #[test]
    fn test_creation_ties_break_on_id() {
        let picked = pick_fifo(vec![balance(9, 0, 5, 0), balance(4, 0, 5, 0)]).unwrap();
        assert_eq!(picked.donation_id, 4);
    }

    #[test]
    fn test_attributable_credits_takes_the_tightest_bound() {
        assert_eq!(attributable_credits(10, 4, 100), 4);
        assert_eq!(attributable_credits(10, 100, 6), 6);
        assert_eq!(attributable_credits(3, 100, 100), 3);
        assert_eq!(attributable_credits(10, -2, 5), 0);
    }
}
