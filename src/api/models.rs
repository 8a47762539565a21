use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::funding::{DonationCapture, PaymentKind, PaymentStatusClass, TopupCapture};
use crate::ledger::Direction;
use crate::settlement::VerifiedShift;

// ========== REQUEST MODELS ==========

/// Captured-payment signal, forwarded after provider authenticity checks
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct PaymentWebhookRequest {
    #[validate(length(min = 1, max = 255))]
    pub payment_id: String,
    #[validate(length(min = 1, max = 64))]
    pub status: String,
    #[validate(range(min = 0))]
    pub amount_cents: i64,
    #[validate(length(min = 3, max = 8))]
    pub currency: String,
    #[validate(length(min = 1, max = 96))]
    pub pool_slug: Option<String>,
    pub owner_user_id: Option<i64>,
    pub donor_user_id: Option<i64>,
    #[validate(length(min = 1, max = 255))]
    pub subscription_id: Option<String>,
    /// Explicit classification hint: donation, subscription or org
    pub kind: Option<String>,
    pub event_type: Option<String>,
    #[validate(range(min = 0))]
    pub credits_override: Option<i64>,
}

/// Verified-shift signal from the verification workflow
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct VerifiedShiftRequest {
    pub event_id: i64,
    pub attendee_user_id: i64,
    #[validate(range(min = 0))]
    pub attended_minutes: Option<i32>,
    pub checked_in_at: Option<DateTime<Utc>>,
    pub checked_out_at: Option<DateTime<Utc>>,
    #[validate(range(min = 0))]
    pub reward_pool_kind: i64,
    #[validate(range(min = 0))]
    pub capacity: i64,
    #[validate(length(min = 1, max = 96))]
    pub pool_slug: Option<String>,
}

impl From<VerifiedShiftRequest> for VerifiedShift {
    fn from(req: VerifiedShiftRequest) -> Self {
        VerifiedShift {
            event_id: req.event_id,
            user_id: req.attendee_user_id,
            verified: true,
            attended_minutes: req.attended_minutes,
            checked_in_at: req.checked_in_at,
            checked_out_at: req.checked_out_at,
            reward_pool_kind: req.reward_pool_kind,
            capacity: req.capacity,
            pool_slug: req.pool_slug,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct PoolAdjustRequest {
    pub direction: Direction,
    #[validate(range(min = 1))]
    pub credits: i64,
    #[validate(length(max = 500))]
    pub note: Option<String>,
}

// ========== RESPONSE MODELS ==========

#[derive(Debug, Serialize)]
pub struct PaymentWebhookResponse {
    /// false when the status was acknowledged without crediting
    pub accepted: bool,
    pub payment_id: String,
    pub kind: PaymentKind,
    pub status_class: PaymentStatusClass,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub donation: Option<DonationCapture>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topup: Option<TopupCapture>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub timestamp: DateTime<Utc>,
}
