//! # Vox Relay - Main Application Entry Point
//!
//! Actix-web server that relays browser voice sessions to an upstream realtime
//! speech model.
//!
//! ## Application Architecture:
//! - **config**: Application configuration (config file + environment variables)
//! - **state**: Shared application state, session accounting and metrics
//! - **store**: Conversation persistence
//! - **prompt**: System prompt loading and date/time stamping
//! - **voice**: The per-connection voice session coordinator and upstream client
//! - **websocket**: The `/ws` gateway actor that owns one coordinator per browser
//! - **handlers**: Config and conversation history endpoints
//! - **health**, **middleware**: Operational HTTP surface
//! - **error**: Error types and HTTP error responses

mod config;
mod error;
mod handlers;
mod health;
mod middleware;
mod prompt;
mod state;
mod store;
mod voice;
mod websocket;

use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Set once SIGINT or SIGTERM arrives.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// ## Startup order:
/// 1. `.env` and tracing
/// 2. Configuration, validated, with upstream credentials required
/// 3. System prompt from disk (or the built-in default)
/// 4. HTTP server with the `/ws` voice gateway and the operational API
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;
    config.require_credentials()?;

    info!("Starting vox-relay v{}", env!("CARGO_PKG_VERSION"));
    info!(
        model = %config.realtime.model,
        voice = %config.realtime.voice,
        "Configuration loaded: {}:{}",
        config.server.host,
        config.server.port
    );

    let system_prompt = prompt::load_base_prompt(&config.prompt);
    let app_state = AppState::new(config.clone(), system_prompt);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(Logger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .route("/ws", web::get().to(websocket::voice_websocket))
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/conversations", web::get().to(handlers::list_conversations))
                    .route("/conversations/{id}", web::get().to(handlers::get_conversation))
                    .route("/conversations/{id}", web::patch().to(handlers::rename_conversation))
                    .route("/conversations/{id}", web::delete().to(handlers::delete_conversation)),
            )
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// `RUST_LOG` wins when set; otherwise `vox_relay=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vox_relay=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

fn setup_signal_handlers() {
    tokio::spawn(async {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to install signal handlers: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
