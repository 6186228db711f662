//! Gatekeeper service
//!
//! Entry point for the Gatehouse join-verification platform. Wires the
//! database pool, the Redis-backed rate limiter, the orchestrator, the
//! expiry sweep and the HTTP surface, then serves until shutdown.

use common::secret::ExposeSecret;
use common::token::TokenCodec;
use gk_service::config::Config;
use gk_service::redis::RateLimiter;
use gk_service::routes::{self, AppState};
use gk_service::services::{HttpChatApi, TurnstileVerifier, VerificationService};
use gk_service::tasks::{start_expiry_sweep, ExpirySweepConfig};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gk_service=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Gatekeeper");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        bind_address = %config.bind_address,
        public_base_url = %config.public_base_url,
        "Configuration loaded successfully"
    );

    // Install the Prometheus recorder before anything records a metric
    let metrics_handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
        error!("Failed to install metrics recorder: {}", e);
        e
    })?;

    // Database pool with query timeout
    info!("Connecting to database...");
    let db_url_with_timeout = add_query_timeout(&config.database_url, 5);
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(5))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(&db_url_with_timeout)
        .await
        .map_err(|e| {
            error!("Failed to connect to database: {}", e);
            e
        })?;

    info!("Database connection established");

    sqlx::migrate!("../../migrations").run(&pool).await.map_err(|e| {
        error!("Failed to run migrations: {}", e);
        e
    })?;

    // Redis-backed sliding-window limiter
    let limiter = RateLimiter::new(config.redis_url.expose_secret())
        .await
        .map_err(|e| {
            error!("Failed to connect to Redis: {}", e);
            e
        })?;

    info!("Redis connection established");

    // Collaborators and the orchestrator
    let chat = Arc::new(HttpChatApi::new(
        config.chat_api_base_url.clone(),
        config.chat_api_token.clone(),
    ));
    let challenge = Arc::new(TurnstileVerifier::new(
        config.challenge_verify_url.clone(),
        config.challenge_secret_key.clone(),
    ));
    let codec = TokenCodec::new(&config.token_secret);

    let verification = Arc::new(VerificationService::new(
        pool.clone(),
        chat,
        challenge,
        codec,
        config.public_base_url.clone(),
        config.challenge_site_key.clone(),
    ));

    // Reconciliation sweep with graceful shutdown
    let cancel_token = CancellationToken::new();
    let sweep_handle = tokio::spawn(start_expiry_sweep(
        Arc::clone(&verification),
        ExpirySweepConfig::from_env(),
        cancel_token.clone(),
    ));

    // Parse bind address before moving config
    let bind_address = config.bind_address.clone();

    let state = Arc::new(AppState {
        pool,
        config,
        limiter,
        verification,
    });

    let app = routes::build_routes(state, metrics_handle);

    let addr: SocketAddr = bind_address.parse().map_err(|e| {
        error!("Invalid bind address: {}", e);
        e
    })?;

    info!("Gatekeeper listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Stop the sweep and wait for its current iteration
    cancel_token.cancel();
    if let Err(e) = sweep_handle.await {
        warn!("Expiry sweep did not stop cleanly: {}", e);
    }

    info!("Gatekeeper shutdown complete");

    Ok(())
}

/// Listens for shutdown signals (SIGTERM, SIGINT).
async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received SIGINT, starting graceful shutdown..."),
            Err(e) => error!("Failed to listen for SIGINT: {}", e),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received SIGTERM, starting graceful shutdown...");
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Adds statement_timeout to the database URL so queries don't hang
/// indefinitely.
fn add_query_timeout(url: &str, timeout_secs: u32) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!(
        "{}{}options=-c%20statement_timeout%3D{}s",
        url, separator, timeout_secs
    )
}
