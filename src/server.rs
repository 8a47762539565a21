use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::{
    api::handler::{adjust_pool, health_check, payment_webhook, pool_balance, shift_verified, AppState},
    ledger::LedgerStore,
};

pub fn create_app<S: LedgerStore>(state: AppState<S>) -> Router {
    info!("⚙️ Setting up HTTP routes...");

    let app = Router::new()
        // Public health check endpoint
        .route("/health", get(health_check))
        .nest(
            "/api/v1",
            Router::new()
                // Collaborator signals
                .route("/webhook/payment", post(payment_webhook::<S>))
                .route("/shifts/verified", post(shift_verified::<S>))
                // Pools
                .route("/pools/:slug/balance", get(pool_balance::<S>))
                // Admin endpoints
                .route("/admin/pools/:slug/adjust", post(adjust_pool::<S>)),
        )
        .layer(CorsLayer::very_permissive())
        // Add request tracing
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!("✓ HTTP routes configured");
    app
}

pub async fn run_server(app: Router, bind_address: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    info!("🌐 Server listening on: {}", bind_address);

    axum::serve(listener, app).await?;
    Ok(())
}
