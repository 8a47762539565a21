// Funding intake - turns captured payments into pool credits
//
// Donations credit a pool once per (pool, donation); subscription and org
// top-ups credit a pool once per external payment id. Both are safe against
// webhook redelivery.

pub mod adjust;
pub mod classify;
pub mod donation;
pub mod topup;

pub use adjust::{AdjustmentOutcome, PoolAdmin, PoolBalanceView};
pub use classify::{classify_payment, PaymentKind, PaymentStatusClass};
pub use donation::{DonationCapture, DonationIntake, DonationRequest};
pub use topup::{TopupCapture, TopupIntake, TopupRequest};

use crate::config::Config;
use crate::error::PolicyError;
use crate::ledger::slug::GENERAL_POOL;

pub const DEFAULT_CENTS_PER_CREDIT: i64 = 100;

/// Fallbacks applied when a payment names no rate or pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntakeDefaults {
    pub cents_per_credit: i64,
    pub pool_slug: String,
}

impl Default for IntakeDefaults {
    fn default() -> Self {
        Self {
            cents_per_credit: DEFAULT_CENTS_PER_CREDIT,
            pool_slug: GENERAL_POOL.to_string(),
        }
    }
}

impl From<&Config> for IntakeDefaults {
    fn from(config: &Config) -> Self {
        Self {
            cents_per_credit: config.cents_per_credit,
            pool_slug: config.default_pool_slug.clone(),
        }
    }
}

pub(crate) fn non_negative(field: &'static str, value: i64) -> Result<i64, PolicyError> {
    if value < 0 {
        return Err(PolicyError::NegativeAmount { field, value });
    }
    Ok(value)
}

/// Credits a payment issues: an explicit override, else whole credits of cents
pub fn credits_for(
    amount_cents: i64,
    credits_override: Option<i64>,
    cents_per_credit: i64,
) -> Result<i64, PolicyError> {
    if cents_per_credit <= 0 {
        return Err(PolicyError::InvalidCentsPerCredit(cents_per_credit));
    }
    non_negative("amount_cents", amount_cents)?;
    match credits_override {
        Some(credits) => non_negative("credits_override", credits),
        None => Ok(amount_cents / cents_per_credit),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credits_floor_whole_credits() {
        assert_eq!(credits_for(1000, None, 100).unwrap(), 10);
        assert_eq!(credits_for(1099, None, 100).unwrap(), 10);
        assert_eq!(credits_for(99, None, 100).unwrap(), 0);
        assert_eq!(credits_for(1000, None, 250).unwrap(), 4);
    }

    #[test]
    fn test_override_wins() {
        assert_eq!(credits_for(1000, Some(3), 100).unwrap(), 3);
        assert_eq!(credits_for(0, Some(0), 100).unwrap(), 0);
    }

    #[test]
    fn test_rejects_bad_amounts() {
        assert_eq!(
            credits_for(-1, None, 100),
            Err(PolicyError::NegativeAmount {
                field: "amount_cents",
                value: -1
            })
        );
        assert!(credits_for(100, Some(-5), 100).is_err());
        assert_eq!(credits_for(100, None, 0), Err(PolicyError::InvalidCentsPerCredit(0)));
    }
}
