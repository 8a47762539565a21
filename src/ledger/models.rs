use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgRow, prelude::FromRow, Row};
use std::fmt;
use std::str::FromStr;

use crate::error::{AppError, AppResult};

/// Clamp applied to attended minutes before they are written to a receipt
pub const MIN_AUDIT_MINUTES: i32 = 15;
pub const MAX_AUDIT_MINUTES: i32 = 480;

macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = AppError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(AppError::Internal(format!(
                        "unknown {} value: {:?}",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

/// Side of a ledger entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Credit,
    Debit,
}

text_enum!(Direction {
    Credit => "credit",
    Debit => "debit",
});

/// Why credits entered or left a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolReason {
    DonationIn,
    ShiftOut,
    ManualAdjust,
    OrgTopup,
    SubscriptionTopup,
}

text_enum!(PoolReason {
    DonationIn => "donation_in",
    ShiftOut => "shift_out",
    ManualAdjust => "manual_adjust",
    OrgTopup => "org_topup",
    SubscriptionTopup => "subscription_topup",
});

impl PoolReason {
    /// Direction every entry with this reason must carry, if fixed
    pub fn required_direction(&self) -> Option<Direction> {
        match self {
            PoolReason::DonationIn | PoolReason::OrgTopup | PoolReason::SubscriptionTopup => {
                Some(Direction::Credit)
            }
            PoolReason::ShiftOut => Some(Direction::Debit),
            PoolReason::ManualAdjust => None,
        }
    }
}

/// Why credits entered or left a volunteer wallet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletReason {
    EarnShift,
    Redeem,
    Donate,
}

text_enum!(WalletReason {
    EarnShift => "earn_shift",
    Redeem => "redeem",
    Donate => "donate",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DonationStatus {
    Captured,
    Refunded,
    Failed,
}

text_enum!(DonationStatus {
    Captured => "captured",
    Refunded => "refunded",
    Failed => "failed",
});

/// Recurring or organisational origin of a top-up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopupSource {
    Subscription,
    Organization,
}

text_enum!(TopupSource {
    Subscription => "subscription",
    Organization => "organization",
});

impl TopupSource {
    pub fn pool_reason(&self) -> PoolReason {
        match self {
            TopupSource::Subscription => PoolReason::SubscriptionTopup,
            TopupSource::Organization => PoolReason::OrgTopup,
        }
    }
}

fn parse_col<T: FromStr<Err = AppError>>(row: &PgRow, column: &str) -> AppResult<T> {
    let raw: String = row.try_get(column)?;
    raw.parse()
}

/// Named bucket of donor-funded credits. Balance is always derived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct FundingPool {
    pub id: i64,
    pub slug: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Donation {
    pub id: i64,
    pub donor_user_id: Option<i64>,
    /// Payment provider id, the idempotency key for provider retries
    pub external_payment_id: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
    pub status: DonationStatus,
    pub created_at: DateTime<Utc>,
}

impl Donation {
    pub fn from_row(row: &PgRow) -> AppResult<Self> {
        Ok(Donation {
            id: row.try_get("id")?,
            donor_user_id: row.try_get("donor_user_id")?,
            external_payment_id: row.try_get("external_payment_id")?,
            amount_cents: row.try_get("amount_cents")?,
            currency: row.try_get("currency")?,
            status: parse_col(row, "status")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDonation {
    pub donor_user_id: Option<i64>,
    pub external_payment_id: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolTransaction {
    pub id: i64,
    pub pool_id: i64,
    pub direction: Direction,
    pub amount_credits: i64,
    pub reason: PoolReason,
    pub donation_id: Option<i64>,
    pub event_id: Option<i64>,
    pub wallet_tx_id: Option<i64>,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl PoolTransaction {
    pub fn from_row(row: &PgRow) -> AppResult<Self> {
        Ok(PoolTransaction {
            id: row.try_get("id")?,
            pool_id: row.try_get("pool_id")?,
            direction: parse_col(row, "direction")?,
            amount_credits: row.try_get("amount_credits")?,
            reason: parse_col(row, "reason")?,
            donation_id: row.try_get("donation_id")?,
            event_id: row.try_get("event_id")?,
            wallet_tx_id: row.try_get("wallet_tx_id")?,
            note: row.try_get("note")?,
            created_at: row.try_get("created_at")?,
        })
    }

    /// Signed effect on the pool balance
    pub fn signed_amount(&self) -> i64 {
        match self.direction {
            Direction::Credit => self.amount_credits,
            Direction::Debit => -self.amount_credits,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPoolTransaction {
    pub pool_id: i64,
    pub direction: Direction,
    pub amount_credits: i64,
    pub reason: PoolReason,
    pub donation_id: Option<i64>,
    pub event_id: Option<i64>,
    pub wallet_tx_id: Option<i64>,
    pub note: Option<String>,
}

/// The single shift_out debit for a wallet transaction, written as a monotonic upsert
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShiftDebit {
    pub pool_id: i64,
    pub wallet_tx_id: i64,
    pub event_id: i64,
    /// Donation drawn this pass. The stored row keeps it only while every
    /// allocation came from that one donation, otherwise it is cleared.
    pub donation_id: i64,
    /// Total funded credits after this pass, not the increment
    pub total_credits: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletTransaction {
    pub id: i64,
    pub user_id: i64,
    pub kind_amount: i64,
    pub direction: Direction,
    pub reason: WalletReason,
    pub event_id: Option<i64>,
    pub note: String,
    pub created_at: DateTime<Utc>,
}

impl WalletTransaction {
    pub fn from_row(row: &PgRow) -> AppResult<Self> {
        Ok(WalletTransaction {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            kind_amount: row.try_get("kind_amount")?,
            direction: parse_col(row, "direction")?,
            reason: parse_col(row, "reason")?,
            event_id: row.try_get("event_id")?,
            note: row.try_get("note")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEarnCredit {
    pub user_id: i64,
    pub event_id: i64,
    pub amount: i64,
    pub note: String,
}

/// Audit link between one volunteer shift and the donation that funded it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct DonorReceipt {
    pub id: i64,
    pub donation_id: Option<i64>,
    pub event_id: i64,
    pub volunteer_user_id: i64,
    pub wallet_tx_id: i64,
    pub credits_funded: i64,
    pub minutes_verified: Option<i32>,
    pub created_at: DateTime<Utc>,
}

/// Receipt write; `credits_funded` only ever raises the stored value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptUpsert {
    pub donation_id: Option<i64>,
    pub event_id: i64,
    pub volunteer_user_id: i64,
    pub wallet_tx_id: i64,
    pub credits_funded: i64,
    pub minutes_verified: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionTopup {
    pub id: i64,
    pub external_payment_id: String,
    pub owner_user_id: Option<i64>,
    pub pool_id: i64,
    pub provider_subscription_id: Option<String>,
    pub source: TopupSource,
    pub amount_cents: i64,
    pub currency: String,
    pub amount_credits: i64,
    pub pool_transaction_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl SubscriptionTopup {
    pub fn from_row(row: &PgRow) -> AppResult<Self> {
        Ok(SubscriptionTopup {
            id: row.try_get("id")?,
            external_payment_id: row.try_get("external_payment_id")?,
            owner_user_id: row.try_get("owner_user_id")?,
            pool_id: row.try_get("pool_id")?,
            provider_subscription_id: row.try_get("provider_subscription_id")?,
            source: parse_col(row, "source")?,
            amount_cents: row.try_get("amount_cents")?,
            currency: row.try_get("currency")?,
            amount_credits: row.try_get("amount_credits")?,
            pool_transaction_id: row.try_get("pool_transaction_id")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSubscriptionTopup {
    pub external_payment_id: String,
    pub owner_user_id: Option<i64>,
    pub pool_id: i64,
    pub provider_subscription_id: Option<String>,
    pub source: TopupSource,
    pub amount_cents: i64,
    pub currency: String,
    pub amount_credits: i64,
}

/// Identity of one volunteer shift: (event, attendee)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShiftKey {
    pub event_id: i64,
    pub user_id: i64,
}

impl ShiftKey {
    pub fn new(event_id: i64, user_id: i64) -> Self {
        Self { event_id, user_id }
    }
}

impl fmt::Display for ShiftKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "event={} user={}", self.event_id, self.user_id)
    }
}

/// Verification workflow's view of a shift, mirrored into the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct ShiftVerification {
    pub event_id: i64,
    pub user_id: i64,
    pub verified: bool,
    pub attended_minutes: Option<i32>,
    pub checked_in_at: Option<DateTime<Utc>>,
    pub checked_out_at: Option<DateTime<Utc>>,
    pub reward_pool_kind: i64,
    pub capacity: i64,
    pub pool_slug: Option<String>,
    pub verified_at: Option<DateTime<Utc>>,
}

impl ShiftVerification {
    pub fn key(&self) -> ShiftKey {
        ShiftKey::new(self.event_id, self.user_id)
    }

    /// Credits earned by one attendee: the reward pool split evenly by capacity
    pub fn credit_amount(&self) -> i64 {
        self.reward_pool_kind.max(0) / self.capacity.max(1)
    }

    /// Minutes recorded on the receipt. Audit only, never affects credits.
    pub fn audit_minutes(&self) -> Option<i32> {
        let minutes = match (self.attended_minutes, self.checked_in_at, self.checked_out_at) {
            (Some(explicit), _, _) => explicit,
            (None, Some(start), Some(end)) if end > start => {
                let derived = (end - start).num_minutes();
                derived.min(i64::from(i32::MAX)) as i32
            }
            _ => return None,
        };
        Some(minutes.clamp(MIN_AUDIT_MINUTES, MAX_AUDIT_MINUTES))
    }
}

/// Derived pool balance; never stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolBalance {
    pub pool_id: i64,
    pub credits_in: i64,
    pub credits_out: i64,
}

impl PoolBalance {
    pub fn empty(pool_id: i64) -> Self {
        Self {
            pool_id,
            credits_in: 0,
            credits_out: 0,
        }
    }

    pub fn balance(&self) -> i64 {
        self.credits_in - self.credits_out
    }
}

/// How much of one donation's pool credit is still unallocated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DonationBalance {
    pub donation_id: i64,
    pub created_at: DateTime<Utc>,
    pub credited: i64,
    pub allocated: i64,
}

impl DonationBalance {
    pub fn remaining(&self) -> i64 {
        self.credited - self.allocated
    }
}

/// Result of an insert guarded by a uniqueness constraint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upserted<T> {
    pub row: T,
    /// false when an existing row was returned instead
    pub inserted: bool,
}

impl<T> Upserted<T> {
    pub fn inserted(row: T) -> Self {
        Self {
            row,
            inserted: true,
        }
    }

    pub fn existing(row: T) -> Self {
        Self {
            row,
            inserted: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn shift(reward: i64, capacity: i64) -> ShiftVerification {
        ShiftVerification {
            event_id: 1,
            user_id: 2,
            verified: true,
            attended_minutes: None,
            checked_in_at: None,
            checked_out_at: None,
            reward_pool_kind: reward,
            capacity,
            pool_slug: None,
            verified_at: None,
        }
    }

    #[test]
    fn test_credit_amount_floors_and_guards_capacity() {
        assert_eq!(shift(50, 5).credit_amount(), 10);
        assert_eq!(shift(7, 2).credit_amount(), 3);
        assert_eq!(shift(7, 0).credit_amount(), 7);
        assert_eq!(shift(3, 5).credit_amount(), 0);
    }

    #[test]
    fn test_audit_minutes_prefers_explicit_and_clamps() {
        let mut s = shift(10, 1);
        assert_eq!(s.audit_minutes(), None);

        s.checked_in_at = Some(Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap());
        s.checked_out_at = Some(Utc.with_ymd_and_hms(2024, 5, 1, 11, 30, 0).unwrap());
        assert_eq!(s.audit_minutes(), Some(150));

        s.checked_out_at = Some(Utc.with_ymd_and_hms(2024, 5, 2, 9, 0, 0).unwrap());
        assert_eq!(s.audit_minutes(), Some(MAX_AUDIT_MINUTES));

        s.attended_minutes = Some(5);
        assert_eq!(s.audit_minutes(), Some(MIN_AUDIT_MINUTES));
    }

    #[test]
    fn test_enum_text_round_trip_rejects_unknown() {
        assert_eq!("shift_out".parse::<PoolReason>().unwrap(), PoolReason::ShiftOut);
        assert_eq!(PoolReason::OrgTopup.as_str(), "org_topup");
        assert!("refund".parse::<PoolReason>().is_err());
        assert_eq!(TopupSource::Organization.pool_reason(), PoolReason::OrgTopup);
        assert_eq!(PoolReason::ShiftOut.required_direction(), Some(Direction::Debit));
    }
}
