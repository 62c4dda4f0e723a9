//! Parley Server - Main entry point.
//!
//! This binary starts the Parley chat hub with:
//! - Structured JSON logging for production
//! - Graceful shutdown handling (SIGTERM/SIGINT)
//! - Background session-store cleanup
//!
//! # Configuration
//!
//! See [`parley_server::config`] for environment variable configuration.
//!
//! # Example
//!
//! ```bash
//! PARLEY_SECRET_KEY="change-me" \
//! PORT=8080 \
//! cargo run --release --bin parley-server
//! ```

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use parley_server::config::Config;
use parley_server::directory::{
    ConnectionHistory, MemoryConnectionHistory, MemoryUserDirectory, UserDirectory,
};
use parley_server::hub::ConnectionHub;
use parley_server::routes::{create_router, AppState};
use parley_server::session::SessionValidator;
use parley_server::store::{MemoryMessageLog, MemorySessionStore, MessageLog, SessionStore};
use parley_server::token::TokenCodec;

/// Cleanup interval for expired session-store entries (30 seconds).
const SESSION_CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize structured logging
    init_logging();

    // Load configuration
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Failed to load configuration");
            eprintln!("Error: {err}");
            eprintln!();
            eprintln!("Required environment variables:");
            eprintln!("  PARLEY_SECRET_KEY            - Symmetric signing secret (HMAC algorithms)");
            eprintln!();
            eprintln!("Optional environment variables:");
            eprintln!("  PARLEY_TOKEN_ALGORITHM       - HS256 (default), HS384, HS512, or RS256");
            eprintln!("  PARLEY_RSA_PRIVATE_KEY_PEM   - RSA private key PEM (RS256 only)");
            eprintln!("  PARLEY_RSA_PUBLIC_KEY_PEM    - RSA public key PEM (RS256 only)");
            eprintln!("  PARLEY_TOKEN_TTL_SECS        - Session lifetime (default: 1800)");
            eprintln!("  PARLEY_MESSAGE_WINDOW        - Retained message window (default: 100)");
            eprintln!("  PARLEY_PAGE_SIZE             - Initial/load-more page size (default: 20)");
            eprintln!("  PARLEY_KEEPALIVE_SECS        - Session re-check interval (default: 10)");
            eprintln!("  PORT                         - HTTP server port (default: 8080)");
            eprintln!("  RUST_LOG                     - Log level filter (default: info)");
            return ExitCode::from(1);
        }
    };

    // Build the token codec from the configured algorithm and keys
    let codec = match TokenCodec::from_config(&config) {
        Ok(codec) => codec,
        Err(err) => {
            error!(error = %err, "Failed to build token codec");
            eprintln!("Error: {err}");
            return ExitCode::from(1);
        }
    };

    info!(
        port = config.port,
        algorithm = ?config.algorithm,
        message_window = config.message_window,
        page_size = config.page_size,
        keepalive_secs = config.keepalive_interval.as_secs(),
        "Parley server starting"
    );

    // Wire up collaborators
    let session_store = Arc::new(MemorySessionStore::new());
    let validator = Arc::new(SessionValidator::new(
        codec,
        Arc::clone(&session_store) as Arc<dyn SessionStore>,
    ));

    let log = Arc::new(MemoryMessageLog::new(config.message_window)) as Arc<dyn MessageLog>;
    let history = Arc::new(MemoryConnectionHistory::new()) as Arc<dyn ConnectionHistory>;
    let hub = Arc::new(
        ConnectionHub::new(log, history, config.page_size)
            .with_broadcast_include_sender(config.broadcast_include_sender),
    );

    let directory = Arc::new(MemoryUserDirectory::new());
    for (user_id, username) in &config.users {
        directory.insert(parley_server::types::Identity::new(*user_id, username.clone()));
    }
    if !config.users.is_empty() {
        info!(user_count = config.users.len(), "Seeded user directory");
    }
    let directory = directory as Arc<dyn UserDirectory>;

    // Spawn session cleanup task
    let cleanup_handle = Arc::clone(&session_store).spawn_cleanup_task(SESSION_CLEANUP_INTERVAL);
    info!(
        interval_secs = SESSION_CLEANUP_INTERVAL.as_secs(),
        "Session cleanup task started"
    );

    // Create router
    let state = AppState::new(config.clone(), hub, validator, directory);
    let app = create_router(state);

    // Bind to address
    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = match TcpListener::bind(&bind_addr).await {
        Ok(listener) => {
            info!(
                port = config.port,
                address = %bind_addr,
                "Server listening"
            );
            listener
        }
        Err(err) => {
            error!(
                error = %err,
                address = %bind_addr,
                "Failed to bind to address"
            );
            return ExitCode::from(1);
        }
    };

    // Start server with graceful shutdown
    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());

    info!("Server ready to accept connections");

    // Run the server
    if let Err(err) = server.await {
        error!(error = %err, "Server error");
        return ExitCode::from(1);
    }

    // Shutdown cleanup
    info!("Server shutting down gracefully");

    cleanup_handle.abort();
    info!("Session cleanup task stopped");

    info!("Server shutdown complete");
    ExitCode::SUCCESS
}

/// Initialize structured logging with tracing.
///
/// Configures JSON-formatted output for production use with:
/// - Environment-based log level filtering via RUST_LOG
/// - Default log level of `info`
/// - Target and level information
fn init_logging() {
    // Build env filter from RUST_LOG or use default
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        // Default: info level for our crates, warn for dependencies
        EnvFilter::new("info,tower_http=debug,axum::rejection=trace")
    });

    // JSON format layer for production logging
    let json_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_level(true)
        .with_file(false)
        .with_line_number(false);

    // Initialize the subscriber
    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .init();
}

/// Creates a future that resolves when a shutdown signal is received.
///
/// Listens for:
/// - SIGTERM (container orchestrator shutdown)
/// - SIGINT (Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
