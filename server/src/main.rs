use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;

use bazaar_relay::auth::{self, JwtIdentityProvider};
use bazaar_relay::config::{generate_config_template, Config, PumpSettings};
use bazaar_relay::store::SqliteMessageStore;
use bazaar_relay::ws::{Hub, HubHandle};
use bazaar_relay::{db, routes, state};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load config with layered precedence: defaults < TOML < env < CLI
    let config = Config::load()?;

    // Handle --generate-config: print template and exit
    if config.generate_config {
        print!("{}", generate_config_template());
        return Ok(());
    }

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("bazaar_relay=info"));
    if config.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().pretty().with_env_filter(filter).init();
    }

    tracing::info!("Bazaar relay v{} starting", env!("CARGO_PKG_VERSION"));

    let db = db::init_db(&config.data_dir)?;

    // Tokens are minted by the account service; share its secret when configured
    let jwt_secret = match &config.jwt_secret {
        Some(secret) if !secret.is_empty() => secret.as_bytes().to_vec(),
        _ => auth::jwt::load_or_generate_jwt_secret(&config.data_dir)?,
    };

    let pump = PumpSettings::from(&config.relay);
    tracing::info!(
        queue_capacity = pump.queue_capacity,
        max_message_size = pump.max_message_size,
        pong_wait_secs = pump.pong_wait.as_secs(),
        "Relay settings"
    );

    let (hub, hub_task) = Hub::spawn();

    let app_state = state::AppState {
        hub: hub.clone(),
        store: Arc::new(SqliteMessageStore::new(db)),
        identity: Arc::new(JwtIdentityProvider::new(jwt_secret)),
        pump,
    };

    let app = routes::build_router(app_state);

    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(hub))
    .await?;

    if let Err(e) = hub_task.await {
        tracing::error!(error = %e, "Hub task failed");
    }
    tracing::info!("Bazaar relay stopped");

    Ok(())
}

/// Wait for Ctrl-C, then close every live connection through the hub.
async fn shutdown_signal(hub: HubHandle) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }

    tracing::info!("Shutdown signal received, closing connections");
    if hub.shutdown().await.is_err() {
        tracing::warn!("Hub already stopped");
    }
}
