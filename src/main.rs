use tracing::info;

use volunteer_ledger::{bootstrap, server, telemetry, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    dotenv::dotenv().ok();

    // Initialize tracing
    telemetry::init_tracing();

    info!("🚀 Starting Volunteer Funding Ledger");

    let config = Config::from_env()?;

    let services = bootstrap::initialize_app_state(&config).await?;
    let _scheduler = bootstrap::start_scheduler(&config, services.reconciler.clone())?;

    // Create HTTP server
    let app = server::create_app(services.state);

    // Run the Server
    server::run_server(app, &config.bind_address).await?;

    info!("👋 Server stopped");

    Ok(())
}
