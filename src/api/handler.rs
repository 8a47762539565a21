use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Json,
};
use chrono::Utc;
use tracing::info;

use super::models::*;
use crate::{
    error::AppResult,
    funding::{
        classify_payment, AdjustmentOutcome, DonationIntake, DonationRequest, IntakeDefaults,
        PaymentStatusClass, PoolAdmin, PoolBalanceView, TopupIntake, TopupRequest,
    },
    ledger::{LedgerStore, PoolSlug},
    middleware::ValidatedJson,
    settlement::{EarnShiftFunder, FundingOutcome, VerifiedShift},
};

pub struct AppState<S: LedgerStore> {
    pub donations: Arc<DonationIntake<S>>,
    pub topups: Arc<TopupIntake<S>>,
    pub funder: Arc<EarnShiftFunder<S>>,
    pub pools: Arc<PoolAdmin<S>>,
}

impl<S: LedgerStore> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            donations: self.donations.clone(),
            topups: self.topups.clone(),
            funder: self.funder.clone(),
            pools: self.pools.clone(),
        }
    }
}

impl<S: LedgerStore> AppState<S> {
    pub fn new(store: Arc<S>, funder: Arc<EarnShiftFunder<S>>, defaults: IntakeDefaults) -> Self {
        Self {
            donations: Arc::new(DonationIntake::new(store.clone(), defaults.clone())),
            topups: Arc::new(TopupIntake::new(store.clone(), defaults)),
            funder,
            pools: Arc::new(PoolAdmin::new(store)),
        }
    }
}

/// GET /health
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "volunteer-ledger".to_string(),
        timestamp: Utc::now(),
    })
}

/// Classify a captured payment and credit the matching pool
/// POST /webhook/payment
///
/// Non-completed statuses are acknowledged without writing anything.
pub async fn payment_webhook<S: LedgerStore>(
    State(state): State<AppState<S>>,
    ValidatedJson(request): ValidatedJson<PaymentWebhookRequest>,
) -> AppResult<Json<PaymentWebhookResponse>> {
    let kind = classify_payment(
        request.kind.as_deref(),
        Some(&request.payment_id),
        request.event_type.as_deref(),
    );
    let status_class = PaymentStatusClass::from_status(&request.status);

    info!(
        payment_id = %request.payment_id,
        kind = ?kind,
        status = %request.status,
        "📥 Payment webhook received"
    );

    let mut response = PaymentWebhookResponse {
        accepted: false,
        payment_id: request.payment_id.clone(),
        kind,
        status_class,
        donation: None,
        topup: None,
    };

    if !status_class.credits() {
        info!(payment_id = %request.payment_id, status_class = ?status_class, "payment not completed, nothing credited");
        return Ok(Json(response));
    }

    match kind.topup_source() {
        Some(source) => {
            let capture = state
                .topups
                .capture(&TopupRequest {
                    external_payment_id: request.payment_id,
                    amount_cents: request.amount_cents,
                    currency: request.currency,
                    pool_slug: request.pool_slug,
                    owner_user_id: request.owner_user_id,
                    provider_subscription_id: request.subscription_id,
                    source,
                    credits_override: request.credits_override,
                    cents_per_credit: None,
                })
                .await?;
            response.topup = Some(capture);
        }
        None => {
            let capture = state
                .donations
                .capture(&DonationRequest {
                    donor_user_id: request.donor_user_id,
                    external_payment_id: Some(request.payment_id),
                    amount_cents: request.amount_cents,
                    currency: request.currency,
                    pool_slug: request.pool_slug,
                    credits_override: request.credits_override,
                    cents_per_credit: None,
                })
                .await?;
            response.donation = Some(capture);
        }
    }

    response.accepted = true;
    Ok(Json(response))
}

/// Record a verified shift and fund its credit
/// POST /shifts/verified
pub async fn shift_verified<S: LedgerStore>(
    State(state): State<AppState<S>>,
    ValidatedJson(request): ValidatedJson<VerifiedShiftRequest>,
) -> AppResult<Json<FundingOutcome>> {
    let shift = VerifiedShift::from(request);
    let outcome = state.funder.verify_and_fund(&shift).await?;
    Ok(Json(outcome))
}

/// GET /pools/:slug/balance
pub async fn pool_balance<S: LedgerStore>(
    State(state): State<AppState<S>>,
    Path(slug): Path<String>,
) -> AppResult<Json<PoolBalanceView>> {
    let slug = PoolSlug::parse(&slug)?;
    Ok(Json(state.pools.balance(&slug).await?))
}

/// POST /admin/pools/:slug/adjust
pub async fn adjust_pool<S: LedgerStore>(
    State(state): State<AppState<S>>,
    Path(slug): Path<String>,
    ValidatedJson(request): ValidatedJson<PoolAdjustRequest>,
) -> AppResult<Json<AdjustmentOutcome>> {
    let slug = PoolSlug::parse(&slug)?;
    let outcome = state
        .pools
        .adjust(&slug, request.direction, request.credits, request.note)
        .await?;
    Ok(Json(outcome))
}
