//! # warden-api: Binary Entry Point
//!
//! Starts the Warden policy engine service. Configuration comes from the
//! environment (see [`warden_api::config`]); logs are human-readable unless
//! `WARDEN_LOG_FORMAT=json`.

use warden_api::config::AppConfig;
use warden_api::state::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = AppConfig::from_env().map_err(|e| {
        tracing::error!("Invalid configuration: {e}");
        e
    })?;
    tracing::info!(?config, "configuration loaded");

    // Initialize database pool (optional; absent means in-memory only).
    let db_pool = warden_api::db::init_pool(config.database_url.as_deref())
        .await
        .map_err(|e| {
            tracing::error!("Database initialization failed: {e}");
            e
        })?;

    let port = config.port;
    let state = AppState::new(config, db_pool)?;

    // Hydrate in-memory stores from database (if connected).
    state.hydrate_from_db(chrono::Utc::now()).await.map_err(|e| {
        tracing::error!("Database hydration failed: {e}");
        e
    })?;

    let seeded = warden_api::bootstrap::seed_policies(&state)
        .await
        .map_err(|e| {
            tracing::error!("Policy bootstrap failed: {e}");
            e
        })?;
    if seeded > 0 {
        tracing::info!(seeded, "policies loaded from file");
    }

    warden_api::worker::spawn(state.clone());
    let app = warden_api::app(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Warden API listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let json = std::env::var("WARDEN_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
