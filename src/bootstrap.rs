use std::{sync::Arc, time::Duration};

use sqlx::{postgres::PgPoolOptions, PgPool};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::{
    api::handler::AppState,
    config::Config,
    error::AppResult,
    funding::IntakeDefaults,
    ledger::LedgerRepository,
    settlement::{
        EarnShiftFunder, ReconcileScheduleConfig, ReconcileScheduler, Reconciler, RunOptions,
    },
};

/// Everything the server process wires together
pub struct Services {
    pub state: AppState<LedgerRepository>,
    pub reconciler: Arc<Reconciler<LedgerRepository>>,
}

pub async fn initialize_app_state(config: &Config) -> AppResult<Services> {
    info!("Initializing application components ...");

    // Database pool
    let pool = initialize_database(config).await?;

    // Core components
    let ledger = Arc::new(LedgerRepository::new(pool));
    let funder = Arc::new(EarnShiftFunder::new(
        ledger.clone(),
        config.default_pool_slug.clone(),
    ));
    info!("✅ Earn-shift funder initialized (default pool: {})", config.default_pool_slug);

    let reconciler = Arc::new(Reconciler::new(funder.clone()));
    info!("✅ Reconciler initialized");

    let state = AppState::new(ledger, funder, IntakeDefaults::from(config));
    info!(
        "✅ Payment intake initialized ({} cents per credit)",
        config.cents_per_credit
    );

    Ok(Services { state, reconciler })
}

/// Spawn the in-process reconciliation schedule, unless it is switched off
pub fn start_scheduler(
    config: &Config,
    reconciler: Arc<Reconciler<LedgerRepository>>,
) -> AppResult<Option<JoinHandle<()>>> {
    let Some(frequency) = config.frequency()? else {
        warn!("⚠️  RECONCILE_SCHEDULE is off - reconciliation runs only via the reconcile binary");
        return Ok(None);
    };

    let scheduler = ReconcileScheduler::new(
        ReconcileScheduleConfig {
            frequency,
            execution_hour: config.reconcile_hour_utc,
            options: RunOptions {
                limit: config.reconcile_limit(),
                dry_run: false,
            },
        },
        reconciler,
    );

    info!("✅ Reconciliation scheduler started ({:?})", frequency);
    Ok(Some(scheduler.start()))
}

pub async fn initialize_database(config: &Config) -> AppResult<PgPool> {
    info!("📊 Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(&config.database_url)
        .await?;

    info!(
        "✓ Database pool configured: {} max connections",
        config.db_max_connections
    );

    // Run migrations
    info!("🔄 Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("✓ Database initialized");
    Ok(pool)
}
